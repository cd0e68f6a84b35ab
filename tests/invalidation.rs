mod common;

use std::time::Duration;

use async_query::{
    query_key, QueryClient, QueryFilters, QueryOptions, QueryTypeFilter, RefetchType,
};
use common::{run_local, sleep_ms, Counter};

fn slow_fetcher(
    counter: &Counter,
    delay_ms: u64,
) -> impl Fn(async_query::QueryFnContext) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32, async_query::QueryError>>>> + Clone {
    let counter = counter.clone();
    move |_ctx| {
        let n = counter.bump();
        Box::pin(async move {
            if delay_ms > 0 {
                sleep_ms(delay_ms).await;
            }
            Ok(n)
        })
    }
}

#[tokio::test]
async fn prefix_invalidation_targets_the_subtree() {
    run_local(async {
        let client = QueryClient::new();
        let t_root = Counter::new();
        let t_child = Counter::new();
        let u_root = Counter::new();
        let options = || QueryOptions::default().stale_time(Duration::from_secs(60));

        let _a = client.watch_query(query_key!["t"], slow_fetcher(&t_root, 0), options());
        let _b = client.watch_query(query_key!["t", 1], slow_fetcher(&t_child, 0), options());
        let _c = client.watch_query(query_key!["u"], slow_fetcher(&u_root, 0), options());
        sleep_ms(30).await;
        assert_eq!((t_root.get(), t_child.get(), u_root.get()), (1, 1, 1));

        client.invalidate_queries(&QueryFilters::prefix(query_key!["t"]), RefetchType::Active);
        sleep_ms(30).await;

        assert_eq!(t_root.get(), 2, "[\"t\"] refetched");
        assert_eq!(t_child.get(), 2, "[\"t\", 1] refetched");
        assert_eq!(u_root.get(), 1, "[\"u\"] untouched");
    })
    .await;
}

#[tokio::test]
async fn find_all_prefix_matches_exactly() {
    run_local(async {
        let client = QueryClient::new();
        for key in [query_key!["t"], query_key!["t", 1], query_key!["t", 1, "x"], query_key!["u"]] {
            client
                .set_query_data::<u32>(key, |_| Some(0), None)
                .unwrap();
        }

        let matched = client
            .query_cache()
            .summaries(&QueryFilters::prefix(query_key!["t"]));
        let keys: Vec<async_query::QueryKey> = matched.iter().map(|s| s.key.clone()).collect();
        assert_eq!(keys.len(), 3);
        for expected in [query_key!["t"], query_key!["t", 1], query_key!["t", 1, "x"]] {
            assert!(keys.contains(&expected), "missing {expected}");
        }

        let exact = client
            .query_cache()
            .summaries(&QueryFilters::exact(query_key!["t"]));
        assert_eq!(exact.len(), 1);
    })
    .await;
}

#[tokio::test]
async fn repeated_invalidation_coalesces_to_one_extra_fetch() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = QueryOptions::default().stale_time(Duration::from_secs(60));

        let _observer = client.watch_query(query_key!["co"], slow_fetcher(&counter, 80), options);
        sleep_ms(120).await;
        assert_eq!(counter.get(), 1);

        let filters = QueryFilters::exact(query_key!["co"]);
        client.invalidate_queries(&filters, RefetchType::Active);
        sleep_ms(10).await; // refetch now in flight
        client.invalidate_queries(&filters, RefetchType::Active);
        client.invalidate_queries(&filters, RefetchType::Active);

        sleep_ms(400).await;
        assert_eq!(
            counter.get(),
            3,
            "one refetch plus at most one coalesced follow-up"
        );
    })
    .await;
}

#[tokio::test]
async fn refetch_type_none_only_marks() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();
        let options = QueryOptions::default().stale_time(Duration::from_secs(60));

        let _observer = client.watch_query(query_key!["mark"], slow_fetcher(&counter, 0), options);
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1);

        client.invalidate_queries(&QueryFilters::exact(query_key!["mark"]), RefetchType::None);
        sleep_ms(20).await;

        assert_eq!(counter.get(), 1, "no refetch requested");
        let state = client
            .get_query_state::<u32>(query_key!["mark"])
            .unwrap()
            .unwrap();
        assert!(state.is_invalidated);
    })
    .await;
}

#[tokio::test]
async fn refetch_type_all_reaches_observer_less_queries() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();

        // Imperative fetch leaves a cached entry with a stored fetcher but
        // no observers.
        client
            .fetch_query(
                query_key!["bg"],
                slow_fetcher(&counter, 0),
                QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(counter.get(), 1);

        client.invalidate_queries(&QueryFilters::exact(query_key!["bg"]), RefetchType::Active);
        sleep_ms(20).await;
        assert_eq!(counter.get(), 1, "inactive queries skipped under Active");

        client.invalidate_queries(&QueryFilters::exact(query_key!["bg"]), RefetchType::All);
        sleep_ms(20).await;
        assert_eq!(counter.get(), 2, "All refetches observer-less queries too");
    })
    .await;
}

#[tokio::test]
async fn kind_filter_separates_active_and_inactive() {
    run_local(async {
        let client = QueryClient::new();
        let counter = Counter::new();

        let _active = client.watch_query(
            query_key!["act"],
            slow_fetcher(&counter, 0),
            QueryOptions::default(),
        );
        client
            .set_query_data::<u32>(query_key!["idle"], |_| Some(9), None)
            .unwrap();
        sleep_ms(20).await;

        let active = client
            .query_cache()
            .summaries(&QueryFilters::default().kind(QueryTypeFilter::Active));
        let inactive = client
            .query_cache()
            .summaries(&QueryFilters::default().kind(QueryTypeFilter::Inactive));

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, query_key!["act"]);
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].key, query_key!["idle"]);
    })
    .await;
}
