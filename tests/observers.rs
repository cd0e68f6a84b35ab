mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_query::{
    query_key, GcTime, QueryClient, QueryObserver, QueryOptions, RefetchPolicy, ResultProp,
    StaleTime,
};
use common::{run_local, sleep_ms, Counter};

#[tokio::test]
async fn placeholder_data_is_observer_local() {
    run_local(async {
        let client = QueryClient::new();

        let observer = client.watch_query(
            query_key!["ph"],
            |_ctx| async {
                sleep_ms(60).await;
                Ok(10u32)
            },
            QueryOptions::default().placeholder_data(0u32),
        );

        let result = observer.current_result();
        assert_eq!(result.data, Some(0));
        assert!(result.is_placeholder_data);
        assert!(result.is_success(), "placeholder renders as success");
        assert_eq!(
            client.get_query_data::<u32>(query_key!["ph"]).unwrap(),
            None,
            "placeholder never enters the cache"
        );

        sleep_ms(100).await;
        let result = observer.current_result();
        assert_eq!(result.data, Some(10));
        assert!(!result.is_placeholder_data);
    })
    .await;
}

#[tokio::test]
async fn initial_data_enters_the_cache_and_suppresses_the_mount_fetch() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();

        let observer = client.watch_query(
            query_key!["seed"],
            {
                let counter = counter.clone();
                move |_ctx| {
                    counter.bump();
                    async move { Ok(1u32) }
                }
            },
            QueryOptions::default()
                .initial_data(99u32)
                .stale_time(Duration::from_secs(60)),
        );
        sleep_ms(20).await;

        assert_eq!(counter.get(), 0, "fresh initial data needs no fetch");
        let result = observer.current_result();
        assert_eq!(result.data, Some(99));
        assert!(!result.is_placeholder_data);
        assert!(result.data_updated_at.is_some());
        assert_eq!(
            client.get_query_data::<u32>(query_key!["seed"]).unwrap(),
            Some(99),
            "initial data persists in the cache"
        );
    })
    .await;
}

#[tokio::test]
async fn select_projects_and_suppresses_equal_output() {
    run_local(async {
        let client = QueryClient::new();
        let generation = Rc::new(std::cell::Cell::new(0u32));

        let observer = QueryObserver::with_select(
            &client,
            query_key!["names"],
            {
                let generation = generation.clone();
                move |_ctx| {
                    let g = generation.get();
                    async move { Ok(vec![format!("user-{g}")]) }
                }
            },
            QueryOptions::default()
                .stale_time(StaleTime::Infinite)
                .notify_on(vec![ResultProp::Data]),
            |names: &Vec<String>| names.len(),
        );
        sleep_ms(20).await;
        assert_eq!(observer.current_result().data, Some(1));

        let notifications = Rc::new(RefCell::new(0u32));
        let _listener = observer.listen({
            let notifications = notifications.clone();
            move |_result| *notifications.borrow_mut() += 1
        });

        // The raw value changes, the projection does not: listeners watching
        // only `data` stay quiet.
        generation.set(1);
        observer.refetch().await.unwrap();
        sleep_ms(20).await;
        assert_eq!(*notifications.borrow(), 0, "equal projections are suppressed");
    })
    .await;
}

#[tokio::test]
async fn gc_disposal_waits_for_the_window_and_reattachment_cancels_it() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = || {
            QueryOptions::default()
                .gc_time(GcTime::After(Duration::from_millis(80)))
                .stale_time(Duration::from_secs(60))
        };
        let fetcher = {
            let counter = counter.clone();
            move |_ctx| {
                let n = counter.bump();
                async move { Ok(n) }
            }
        };

        let observer = client.watch_query(query_key!["gc"], fetcher.clone(), options());
        sleep_ms(20).await;
        drop(observer);

        // Re-attach inside the gc window: the entry survives.
        sleep_ms(30).await;
        assert_eq!(client.query_cache().len(), 1);
        let observer = client.watch_query(query_key!["gc"], fetcher.clone(), options());
        sleep_ms(100).await;
        assert_eq!(client.query_cache().len(), 1, "attachment cancelled the timer");
        assert_eq!(counter.get(), 1, "cached data was reused");

        // Detach and let the window expire.
        drop(observer);
        sleep_ms(150).await;
        assert!(client.query_cache().is_empty(), "idle entry disposed after gc_time");
    })
    .await;
}

#[tokio::test]
async fn focus_and_reconnect_refetch_stale_queries() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let fetcher = {
            let counter = counter.clone();
            move |_ctx| {
                let n = counter.bump();
                async move { Ok(n) }
            }
        };

        let _observer = client.watch_query(
            query_key!["focus"],
            fetcher,
            QueryOptions::default()
                .stale_time(Duration::ZERO)
                .refetch_on_focus(RefetchPolicy::Stale)
                .refetch_on_reconnect(RefetchPolicy::Stale),
        );
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);

        client.focus_manager().set_focused(false);
        client.focus_manager().set_focused(true);
        sleep_ms(20).await;
        assert_eq!(counter.get(), 2, "focus regain refetched the stale query");

        client.online_manager().set_online(false);
        client.online_manager().set_online(true);
        sleep_ms(20).await;
        assert_eq!(counter.get(), 3, "reconnect refetched the stale query");
    })
    .await;
}

#[tokio::test]
async fn disabled_observers_never_fetch() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();

        let observer = client.watch_query(
            query_key!["off"],
            {
                let counter = counter.clone();
                move |_ctx| {
                    counter.bump();
                    async move { Ok(1u32) }
                }
            },
            QueryOptions::default().enabled(false),
        );
        sleep_ms(20).await;

        assert_eq!(counter.get(), 0);
        assert!(observer.current_result().is_pending());

        // Flipping `enabled` through set_options triggers the fetch.
        observer.set_options(QueryOptions::default().enabled(true));
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);
    })
    .await;
}

#[tokio::test]
async fn interval_refetches_periodically() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();

        let _observer = client.watch_query(
            query_key!["tick"],
            {
                let counter = counter.clone();
                move |_ctx| {
                    let n = counter.bump();
                    async move { Ok(n) }
                }
            },
            QueryOptions::default()
                .stale_time(Duration::from_secs(60))
                .refetch_interval(Duration::from_millis(50)),
        );

        sleep_ms(240).await;
        assert!(
            counter.get() >= 3,
            "interval kept refetching, saw {} fetches",
            counter.get()
        );
    })
    .await;
}

#[tokio::test]
async fn key_change_retargets_the_observer() {
    run_local(async {
        let client = QueryClient::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let observer = client.watch_query(
            query_key!["item", 1],
            {
                let log = log.clone();
                move |ctx: async_query::QueryFnContext| {
                    log.borrow_mut().push(ctx.key.clone());
                    async move { Ok(0u32) }
                }
            },
            QueryOptions::default().stale_time(Duration::from_secs(60)),
        );
        sleep_ms(20).await;

        observer.set_key(query_key!["item", 2]);
        sleep_ms(20).await;

        assert_eq!(*log.borrow(), vec![query_key!["item", 1], query_key!["item", 2]]);
        assert_eq!(observer.key(), query_key!["item", 2]);
        assert_eq!(client.query_cache().len(), 2);
    })
    .await;
}
