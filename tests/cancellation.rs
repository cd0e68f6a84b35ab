mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use async_query::{query_key, GcTime, QueryClient, QueryFilters, QueryOptions};
use common::{run_local, sleep_ms, Counter};

#[tokio::test]
async fn unmount_with_zero_gc_aborts_and_disposes() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let aborted = Rc::new(Cell::new(false));

        let fetcher = {
            let counter = counter.clone();
            let aborted = aborted.clone();
            move |ctx: async_query::QueryFnContext| {
                counter.bump();
                let aborted = aborted.clone();
                async move {
                    let work = std::pin::pin!(sleep_ms(200));
                    let abort = std::pin::pin!(ctx.signal.aborted());
                    match futures::future::select(work, abort).await {
                        futures::future::Either::Left(_) => Ok(1u32),
                        futures::future::Either::Right(_) => {
                            aborted.set(true);
                            Err("aborted".into())
                        }
                    }
                }
            }
        };

        let options = || QueryOptions::default().gc_time(GcTime::After(Duration::ZERO));
        let observer = client.watch_query(query_key!["doomed"], fetcher.clone(), options());
        sleep_ms(50).await;
        assert_eq!(counter.get(), 1);
        assert!(observer.current_result().is_loading());

        // Unmount mid-fetch: the entry is disposed on the next tick and the
        // fetcher sees the abort.
        drop(observer);
        sleep_ms(50).await;

        assert!(aborted.get(), "dispose aborts the in-flight signal");
        assert!(client.query_cache().is_empty(), "zero gc disposes the entry");

        // A fresh mount starts over.
        let observer = client.watch_query(query_key!["doomed"], fetcher, options());
        sleep_ms(250).await;
        assert_eq!(counter.get(), 2);
        assert_eq!(observer.current_result().data, Some(1));
    })
    .await;
}

#[tokio::test]
async fn cancel_rolls_back_to_the_pre_fetch_snapshot() {
    run_local(async {
        let client = QueryClient::new();

        client
            .set_query_data::<u32>(query_key!["snap"], |_| Some(41), None)
            .unwrap();
        let before = client
            .get_query_state::<u32>(query_key!["snap"])
            .unwrap()
            .unwrap();

        // Start a slow refetch, then cancel it mid-flight.
        let observer = client.watch_query(
            query_key!["snap"],
            |_ctx| async {
                sleep_ms(200).await;
                Ok(42u32)
            },
            QueryOptions::default()
                .stale_time(Duration::from_secs(60))
                .refetch_on_mount(async_query::RefetchPolicy::Never),
        );

        let refetch = observer.refetch();
        sleep_ms(50).await;
        assert_eq!(client.is_fetching(&QueryFilters::exact(query_key!["snap"])), 1);

        let cancelled = client.cancel_queries(&QueryFilters::exact(query_key!["snap"]));
        assert_eq!(cancelled, 1);

        let result = refetch.await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_cancelled());

        sleep_ms(20).await;
        let after = client
            .get_query_state::<u32>(query_key!["snap"])
            .unwrap()
            .unwrap();
        assert_eq!(after, before, "state equals the snapshot taken before the fetch");
    })
    .await;
}

#[tokio::test]
async fn cancel_then_fetch_starts_fresh() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();

        let fetcher = {
            let counter = counter.clone();
            move |_ctx| {
                let n = counter.bump();
                async move {
                    sleep_ms(80).await;
                    Ok(n)
                }
            }
        };

        let observer = client.watch_query(query_key!["again"], fetcher, QueryOptions::default());
        sleep_ms(20).await;
        client.cancel_queries(&QueryFilters::exact(query_key!["again"]));
        sleep_ms(20).await;

        let second = observer.refetch().await;
        assert_eq!(second.unwrap(), 2, "a fetch after cancel runs the fetcher anew");
    })
    .await;
}
