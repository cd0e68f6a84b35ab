use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// Runs a test body on a `LocalSet`, which the crate's `spawn_local`-based
/// background work requires.
pub async fn run_local<F: Future>(f: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(f).await
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Shared invocation counter for fetchers.
#[derive(Clone, Default)]
pub struct Counter(Rc<Cell<u32>>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) -> u32 {
        let next = self.0.get() + 1;
        self.0.set(next);
        next
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}
