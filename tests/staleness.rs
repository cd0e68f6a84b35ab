mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_query::{query_key, QueryClient, QueryOptions, RefetchPolicy, StaleTime};
use common::{run_local, sleep_ms, Counter};

fn counting_fetcher(counter: &Counter) -> impl Fn(async_query::QueryFnContext) -> futures::future::Ready<Result<u32, async_query::QueryError>> + Clone {
    let counter = counter.clone();
    move |_ctx| futures::future::ready(Ok(counter.bump()))
}

#[tokio::test]
async fn fresh_mounts_do_not_refetch_stale_mounts_do() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = || {
            QueryOptions::default()
                .stale_time(Duration::from_millis(200))
                .refetch_on_mount(RefetchPolicy::Stale)
        };

        let first = client.watch_query(query_key!["feed"], counting_fetcher(&counter), options());
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);

        // Still fresh: a second mount reuses the cached value.
        let second = client.watch_query(query_key!["feed"], counting_fetcher(&counter), options());
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);
        assert_eq!(second.current_result().data, Some(1));

        // Past the stale window: a third mount refetches in the background
        // and existing observers see the refetch.
        sleep_ms(250).await;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let _listener = first.listen({
            let seen = seen.clone();
            move |result| seen.borrow_mut().push((result.is_refetching(), result.data))
        });

        let third = client.watch_query(query_key!["feed"], counting_fetcher(&counter), options());
        sleep_ms(50).await;

        assert_eq!(counter.get(), 2);
        assert_eq!(third.current_result().data, Some(2));
        assert_eq!(first.current_result().data, Some(2));

        let seen = seen.borrow();
        assert!(
            seen.iter().any(|(refetching, _)| *refetching),
            "existing observer reports is_refetching during the background refetch"
        );
        assert!(seen.iter().any(|(_, data)| *data == Some(2)));
        drop(first);
        drop(second);
    })
    .await;
}

#[tokio::test]
async fn staleness_is_monotonic_until_refetch() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = QueryOptions::default().stale_time(Duration::from_millis(100));

        let observer = client.watch_query(query_key!["mono"], counting_fetcher(&counter), options);
        sleep_ms(20).await;
        assert!(!observer.current_result().is_stale);

        sleep_ms(150).await;
        let state = client
            .get_query_state::<u32>(query_key!["mono"])
            .unwrap()
            .unwrap();
        assert!(state.is_stale(StaleTime::After(Duration::from_millis(100))));
        // Stays stale until something fetches.
        sleep_ms(50).await;
        let state = client
            .get_query_state::<u32>(query_key!["mono"])
            .unwrap()
            .unwrap();
        assert!(state.is_stale(StaleTime::After(Duration::from_millis(100))));
    })
    .await;
}

#[tokio::test]
async fn static_queries_never_refetch_from_observer_events() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = || {
            QueryOptions::default()
                .stale_time(StaleTime::Static)
                .refetch_on_mount(RefetchPolicy::Always)
                .refetch_on_focus(RefetchPolicy::Always)
        };

        let _first = client.watch_query(query_key!["s"], counting_fetcher(&counter), options());
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1, "the initial load still runs");

        let _second = client.watch_query(query_key!["s"], counting_fetcher(&counter), options());
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1, "remounts never refetch a static query");

        client.focus_manager().set_focused(false);
        client.focus_manager().set_focused(true);
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1, "focus never refetches a static query");
    })
    .await;
}

#[tokio::test]
async fn infinite_stale_time_blocks_time_based_refetch_only() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = || QueryOptions::default().stale_time(StaleTime::Infinite);

        let _observer = client.watch_query(query_key!["inf"], counting_fetcher(&counter), options());
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);

        let _second = client.watch_query(query_key!["inf"], counting_fetcher(&counter), options());
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1, "never stale by time");

        // Invalidation still marks it stale and refetches.
        client.invalidate_queries(
            &async_query::QueryFilters::exact(query_key!["inf"]),
            async_query::RefetchType::Active,
        );
        sleep_ms(20).await;
        assert_eq!(counter.get(), 2);
    })
    .await;
}
