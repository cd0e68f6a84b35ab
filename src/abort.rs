//! Cooperative cancellation.
//!
//! Every fetch owns an [`AbortController`]; its [`AbortSignal`] is handed to
//! the user fetcher through the fetch context. Cancelling a query aborts the
//! signal, and the fetcher is expected to honor it. The core also races its
//! own futures against [`AbortSignal::aborted`], so an uncooperative fetcher
//! is abandoned rather than awaited.

use std::cell::RefCell;
use std::rc::Rc;

use futures_channel::oneshot;

use crate::QueryError;

#[derive(Default)]
struct AbortInner {
    aborted: bool,
    reason: Option<QueryError>,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Owner side of a cancellation token.
pub struct AbortController {
    inner: Rc<RefCell<AbortInner>>,
}

impl AbortController {
    /// Creates a controller with an un-aborted signal.
    pub fn new() -> Self {
        AbortController {
            inner: Rc::new(RefCell::new(AbortInner::default())),
        }
    }

    /// The signal observed by cancellable work.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: self.inner.clone(),
        }
    }

    /// Aborts the signal. Idempotent; only the first reason is kept.
    pub fn abort(&self, reason: QueryError) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.reason = Some(reason);
            std::mem::take(&mut inner.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation token.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<RefCell<AbortInner>>,
}

impl AbortSignal {
    /// Returns `true` once the controller has aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<QueryError> {
        self.inner.borrow().reason.clone()
    }

    /// Resolves once the signal is aborted. Pending forever otherwise.
    pub fn aborted(&self) -> impl std::future::Future<Output = ()> {
        let receiver = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                None
            } else {
                let (sx, rx) = oneshot::channel();
                inner.waiters.push(sx);
                Some(rx)
            }
        };

        async move {
            match receiver {
                None => {}
                Some(rx) => {
                    // The sender lives for the signal's lifetime; a dropped
                    // sender means the fetch slot was discarded, which only
                    // happens on abort or teardown. Either way, stop waiting.
                    let _ = rx.await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn abort_flips_signal_once() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());

        controller.abort(QueryError::cancelled());
        controller.abort(QueryError::msg("second"));

        assert!(signal.is_aborted());
        assert!(signal.reason().unwrap().is_cancelled());
    }

    #[test]
    fn aborted_future_resolves_on_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();

        let mut pending = Box::pin(signal.aborted());
        assert!(pending.as_mut().now_or_never().is_none());

        controller.abort(QueryError::cancelled());
        assert!(pending.now_or_never().is_some());

        // Already aborted: resolves immediately.
        assert!(signal.aborted().now_or_never().is_some());
    }
}
