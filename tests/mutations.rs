mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_query::{
    query_key, CoreError, MutationCacheConfig, MutationOptions, MutationScope, QueryClient,
    QueryFilters, QueryOptions, RefetchType,
};
use common::{run_local, sleep_ms, Counter};

type Log = Rc<RefCell<Vec<&'static str>>>;

#[tokio::test]
async fn mutation_then_invalidation_refetches_the_query() {
    run_local(async {
        let client = QueryClient::new();
        let fetches = Counter::new();

        let todos = client.watch_query(
            query_key!["todos"],
            {
                let fetches = fetches.clone();
                move |_ctx| {
                    let n = fetches.bump();
                    async move { Ok(vec![format!("todo-{n}")]) }
                }
            },
            QueryOptions::default().stale_time(Duration::from_secs(60)),
        );
        sleep_ms(20).await;
        assert_eq!(fetches.get(), 1);

        let settled = Rc::new(Cell::new(0u32));
        let options = MutationOptions::<String, String>::new(|vars, _ctx| async move {
            Ok(format!("created-{vars}"))
        })
        .on_success({
            let client = client.clone();
            move |_data, _vars, _ctx| {
                client.invalidate_queries(&QueryFilters::prefix(query_key!["todos"]), RefetchType::Active);
            }
        })
        .on_settled({
            let settled = settled.clone();
            move |data, error, _vars, _ctx| {
                assert!(data.is_some());
                assert!(error.is_none());
                settled.set(settled.get() + 1);
            }
        });

        let mutation = client.watch_mutation(options);
        let result = mutation.mutate("x".to_string()).await.unwrap();
        assert_eq!(result, "created-x");

        sleep_ms(30).await;
        assert_eq!(fetches.get(), 2, "invalidation refetched the active query");
        assert_eq!(todos.current_result().data, Some(vec!["todo-2".to_string()]));
        assert_eq!(settled.get(), 1, "on_settled fired exactly once");
    })
    .await;
}

#[tokio::test]
async fn callback_order_is_strict_on_success() {
    run_local(async {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let push = |log: &Log, tag: &'static str| log.borrow_mut().push(tag);

        let cache_config = MutationCacheConfig::new()
            .on_success({
                let log = log.clone();
                move |_| push(&log, "cache:success")
            })
            .on_settled({
                let log = log.clone();
                move |_| push(&log, "cache:settled")
            });
        let client = QueryClient::with_config(Default::default(), cache_config);

        let options = MutationOptions::<u32, u32, &'static str>::new({
            let log = log.clone();
            move |vars, _ctx| {
                push(&log, "mutation_fn");
                async move { Ok(vars * 2) }
            }
        })
        .on_mutate({
            let log = log.clone();
            move |_vars| {
                push(&log, "on_mutate");
                Ok("context")
            }
        })
        .on_success({
            let log = log.clone();
            move |_data, _vars, ctx| {
                assert_eq!(ctx, Some(&"context"));
                push(&log, "on_success");
            }
        })
        .on_settled({
            let log = log.clone();
            move |_data, _error, _vars, _ctx| push(&log, "on_settled")
        });

        let mutation = client.watch_mutation(options);
        assert_eq!(mutation.mutate(21).await.unwrap(), 42);

        assert_eq!(
            *log.borrow(),
            vec![
                "on_mutate",
                "mutation_fn",
                "on_success",
                "cache:success",
                "on_settled",
                "cache:settled",
            ],
            "observer callbacks complete before cache hooks of the same phase"
        );
    })
    .await;
}

#[tokio::test]
async fn on_mutate_error_skips_the_mutation_fn() {
    run_local(async {
        let client = QueryClient::new();
        let ran = Rc::new(Cell::new(false));
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        let options = MutationOptions::<u32, u32, ()>::new({
            let ran = ran.clone();
            move |_vars, _ctx| {
                ran.set(true);
                async move { Ok(1) }
            }
        })
        .on_mutate(|_vars| Err("precheck failed".into()))
        .on_error({
            let log = log.clone();
            move |_error, _vars, ctx| {
                assert!(ctx.is_none(), "a failed on_mutate leaves no context");
                log.borrow_mut().push("on_error");
            }
        })
        .on_settled({
            let log = log.clone();
            move |data, error, _vars, _ctx| {
                assert!(data.is_none());
                assert!(error.is_some());
                log.borrow_mut().push("on_settled");
            }
        });

        let mutation = client.watch_mutation(options);
        let result = mutation.mutate(1).await;

        assert!(result.is_err());
        assert!(!ran.get(), "mutation_fn never ran");
        assert_eq!(*log.borrow(), vec!["on_error", "on_settled"]);
        assert!(mutation.current_state().is_error());
    })
    .await;
}

#[tokio::test]
async fn single_scope_queues_concurrent_calls() {
    run_local(async {
        let client = QueryClient::new();
        let in_flight = Rc::new(Cell::new(0u32));
        let max_in_flight = Rc::new(Cell::new(0u32));
        let order: Log = Rc::new(RefCell::new(Vec::new()));

        let options = MutationOptions::<u32, &'static str>::new({
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let order = order.clone();
            move |vars, _ctx| {
                order.borrow_mut().push(vars);
                in_flight.set(in_flight.get() + 1);
                max_in_flight.set(max_in_flight.get().max(in_flight.get()));
                let in_flight = in_flight.clone();
                async move {
                    sleep_ms(40).await;
                    in_flight.set(in_flight.get() - 1);
                    Ok(0)
                }
            }
        });

        let mutation = client.watch_mutation(options);
        let first = mutation.mutate("first");
        let second = mutation.mutate("second");

        let (a, b) = futures::join!(first, second);
        a.unwrap();
        b.unwrap();

        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert_eq!(max_in_flight.get(), 1, "single scope runs one at a time");
    })
    .await;
}

#[tokio::test]
async fn parallel_scope_overlaps_calls() {
    run_local(async {
        let client = QueryClient::new();
        let in_flight = Rc::new(Cell::new(0u32));
        let max_in_flight = Rc::new(Cell::new(0u32));

        let options = MutationOptions::<u32, u32>::new({
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            move |vars, _ctx| {
                in_flight.set(in_flight.get() + 1);
                max_in_flight.set(max_in_flight.get().max(in_flight.get()));
                let in_flight = in_flight.clone();
                async move {
                    sleep_ms(40).await;
                    in_flight.set(in_flight.get() - 1);
                    Ok(vars)
                }
            }
        })
        .scope(MutationScope::Parallel);

        let mutation = client.watch_mutation(options);
        let (a, b) = futures::join!(mutation.mutate(1), mutation.mutate(2));

        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
        assert_eq!(max_in_flight.get(), 2, "parallel scope overlaps");
        assert_eq!(
            mutation.current_state().variables,
            Some(2),
            "state tracks the most recently submitted call"
        );
    })
    .await;
}

#[tokio::test]
async fn reset_is_rejected_while_pending() {
    run_local(async {
        let client = QueryClient::new();

        let options = MutationOptions::<u32, u32>::new(|vars, _ctx| async move {
            sleep_ms(60).await;
            Ok(vars)
        });
        let mutation = client.watch_mutation(options);

        let pending = mutation.mutate(5);
        let rejected = mutation.reset().unwrap_err();
        assert!(matches!(
            rejected.downcast_ref::<CoreError>(),
            Some(CoreError::MutationPending)
        ));

        pending.await.unwrap();
        mutation.reset().unwrap();
        assert!(mutation.current_state().is_idle());
    })
    .await;
}

#[tokio::test]
async fn failed_callback_shorts_to_the_error_state() {
    run_local(async {
        let client = QueryClient::new();
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        let options = MutationOptions::<u32, u32>::new(|vars, _ctx| async move { Ok(vars) })
            .on_success_fallible(|_data, _vars, _ctx| Err("side effect failed".into()))
            .on_error({
                let log = log.clone();
                move |_error, _vars, _ctx| log.borrow_mut().push("on_error")
            })
            .on_settled({
                let log = log.clone();
                move |_data, error, _vars, _ctx| {
                    assert!(error.is_some());
                    log.borrow_mut().push("on_settled");
                }
            });

        let mutation = client.watch_mutation(options);
        let result = mutation.mutate(1).await;

        assert!(result.is_err());
        assert!(mutation.current_state().is_error());
        assert_eq!(*log.borrow(), vec!["on_error", "on_settled"]);
    })
    .await;
}
