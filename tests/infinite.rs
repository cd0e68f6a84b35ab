mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_query::{
    query_key, InfiniteFnContext, InfiniteQueryOptions, QueryClient, QueryOptions,
};
use common::{run_local, sleep_ms};

fn page_options() -> InfiniteQueryOptions<String, u32> {
    InfiniteQueryOptions::new(0u32, |data: &async_query::InfiniteData<String, u32>| {
        let last = data.page_params.last().copied()?;
        if data.len() < 3 {
            Some(last + 1)
        } else {
            None
        }
    })
    .query_options(
        QueryOptions::default()
            .stale_time(Duration::from_secs(60))
            .retry(false),
    )
}

#[tokio::test]
async fn pagination_walks_forward_until_exhausted() {
    run_local(async {
        let client = QueryClient::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let fetcher = {
            let log = log.clone();
            move |ctx: InfiniteFnContext<u32>| {
                log.borrow_mut().push(ctx.page_param);
                async move { Ok(format!("page-{}", ctx.page_param)) }
            }
        };

        let pages = client.watch_infinite_query(query_key!["list"], fetcher, page_options());
        sleep_ms(30).await;

        let result = pages.current_result();
        assert_eq!(result.result.data.as_ref().unwrap().len(), 1);
        assert!(result.has_next_page);

        pages.fetch_next_page().await.unwrap();
        pages.fetch_next_page().await.unwrap();
        sleep_ms(30).await;

        let result = pages.current_result();
        let data = result.result.data.as_ref().unwrap();
        assert_eq!(data.pages, vec!["page-0", "page-1", "page-2"]);
        assert_eq!(data.page_params, vec![0, 1, 2]);
        assert!(!result.has_next_page);

        // The builder reports exhaustion: a further call is a no-op.
        pages.fetch_next_page().await.unwrap();
        sleep_ms(30).await;
        assert_eq!(log.borrow().len(), 3);
    })
    .await;
}

#[tokio::test]
async fn backward_fetches_prepend() {
    run_local(async {
        let client = QueryClient::new();

        let options = InfiniteQueryOptions::new(10u32, |data: &async_query::InfiniteData<String, u32>| {
            data.page_params.last().map(|last| last + 1)
        })
        .previous_page_param(|data| {
            let first = data.page_params.first().copied()?;
            (first > 8).then(|| first - 1)
        })
        .query_options(QueryOptions::default().stale_time(Duration::from_secs(60)));

        let pages = client.watch_infinite_query(
            query_key!["rev"],
            |ctx: InfiniteFnContext<u32>| async move { Ok(format!("p{}", ctx.page_param)) },
            options,
        );
        sleep_ms(30).await;

        pages.fetch_previous_page().await.unwrap();
        sleep_ms(30).await;

        let result = pages.current_result();
        let data = result.result.data.as_ref().unwrap();
        assert_eq!(data.pages, vec!["p9", "p10"]);
        assert_eq!(data.page_params, vec![9, 10]);
        assert!(result.has_previous_page, "builder still yields 8");

        pages.fetch_previous_page().await.unwrap();
        sleep_ms(30).await;
        let result = pages.current_result();
        assert!(!result.has_previous_page);
        assert_eq!(result.result.data.unwrap().page_params, vec![8, 9, 10]);
    })
    .await;
}

#[tokio::test]
async fn full_refetch_replays_every_page_in_order() {
    run_local(async {
        let client = QueryClient::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let generation = Rc::new(Cell::new(0u32));

        let fetcher = {
            let log = log.clone();
            let generation = generation.clone();
            move |ctx: InfiniteFnContext<u32>| {
                log.borrow_mut().push(ctx.page_param);
                let generation = generation.get();
                async move { Ok(format!("g{generation}-p{}", ctx.page_param)) }
            }
        };

        let pages = client.watch_infinite_query(query_key!["replay"], fetcher, page_options());
        sleep_ms(30).await;
        pages.fetch_next_page().await.unwrap();
        sleep_ms(30).await;

        generation.set(1);
        log.borrow_mut().clear();
        pages.refetch().await.unwrap();
        sleep_ms(30).await;

        assert_eq!(*log.borrow(), vec![0, 1], "original params, in order");
        let data = pages.current_result().result.data.unwrap();
        assert_eq!(data.pages, vec!["g1-p0", "g1-p1"]);
        assert_eq!(data.page_params, vec![0, 1]);
    })
    .await;
}

#[tokio::test]
async fn failed_refetch_keeps_previous_pages() {
    run_local(async {
        let client = QueryClient::new();
        let fail = Rc::new(Cell::new(false));

        let fetcher = {
            let fail = fail.clone();
            move |ctx: InfiniteFnContext<u32>| {
                let fail = fail.get();
                async move {
                    if fail {
                        Err("backend down".into())
                    } else {
                        Ok(format!("p{}", ctx.page_param))
                    }
                }
            }
        };

        let pages = client.watch_infinite_query(query_key!["revert"], fetcher, page_options());
        sleep_ms(30).await;
        pages.fetch_next_page().await.unwrap();
        sleep_ms(30).await;

        fail.set(true);
        assert!(pages.refetch().await.is_err());
        sleep_ms(30).await;

        let result = pages.current_result();
        let data = result.result.data.as_ref().unwrap();
        assert_eq!(data.pages, vec!["p0", "p1"], "failure reverts to the old pages");
        assert!(result.result.error.is_some());
        assert!(result.result.is_success());
    })
    .await;
}

#[tokio::test]
async fn max_pages_bounds_memory() {
    run_local(async {
        let client = QueryClient::new();

        let options = InfiniteQueryOptions::new(0u32, |data: &async_query::InfiniteData<String, u32>| {
            data.page_params.last().map(|last| last + 1)
        })
        .max_pages(2)
        .query_options(QueryOptions::default().stale_time(Duration::from_secs(60)));

        let pages = client.watch_infinite_query(
            query_key!["window"],
            |ctx: InfiniteFnContext<u32>| async move { Ok(format!("p{}", ctx.page_param)) },
            options,
        );
        sleep_ms(30).await;
        pages.fetch_next_page().await.unwrap();
        pages.fetch_next_page().await.unwrap();
        sleep_ms(30).await;

        let data = pages.current_result().result.data.unwrap();
        assert_eq!(data.page_params, vec![1, 2], "oldest page trimmed");
    })
    .await;
}
