//! Runtime shims shared by the native (tokio) and wasm builds.
//!
//! The whole crate runs single-threaded and cooperative: background work is
//! spawned onto the current thread's executor, never onto a thread pool. On
//! native targets the caller is expected to run inside a
//! [`tokio::task::LocalSet`].

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{select, Either};
use futures_channel::oneshot;

pub(crate) fn spawn_local<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            wasm_bindgen_futures::spawn_local(fut);
        } else {
            tokio::task::spawn_local(fut);
        }
    }
}

pub(crate) async fn sleep(duration: Duration) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            gloo_timers::future::sleep(duration).await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }
}

/// A one-shot timer. The callback runs after `duration` unless the handle is
/// cleared or dropped first.
pub(crate) struct Timeout {
    signal: Option<oneshot::Sender<()>>,
}

impl Timeout {
    pub(crate) fn new<F>(duration: Duration, f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        let (sx, rx) = oneshot::channel();

        spawn_local(async move {
            let timer = std::pin::pin!(sleep(duration));
            if let Either::Left(_) = select(timer, rx).await {
                f();
            }
        });

        Timeout { signal: Some(sx) }
    }

    fn clear_timeout(&mut self) {
        if let Some(sx) = self.signal.take() {
            // The receiver is gone once the timer fired; nothing to cancel.
            let _ = sx.send(());
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.clear_timeout();
    }
}

/// A repeating timer. Ticks until cancelled or dropped.
pub(crate) struct Interval {
    cancel: Rc<Cell<bool>>,
}

impl Interval {
    pub(crate) fn new<F>(duration: Duration, f: F) -> Self
    where
        F: Fn() + 'static,
    {
        let cancel = Rc::new(Cell::new(false));

        spawn_local({
            let cancel = cancel.clone();
            async move {
                while !cancel.get() {
                    sleep(duration).await;
                    if !cancel.get() {
                        f();
                    }
                }
            }
        });

        Interval { cancel }
    }

    fn clear_interval(&mut self) {
        self.cancel.set(true);
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        self.clear_interval();
    }
}
