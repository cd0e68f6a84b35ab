//! Host-connectivity events.
//!
//! Mirrors [`FocusManager`](crate::FocusManager): the host forwards network
//! state into [`OnlineManager::set_online`]. Queries additionally await
//! [`OnlineManager::until_online`] while paused, so reconnecting resumes
//! every paused fetch.

use std::cell::RefCell;
use std::rc::Rc;

use futures_channel::oneshot;
use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle for removing an online subscription.
    pub struct OnlineSubscription;
}

struct OnlineInner {
    online: bool,
    listeners: SlotMap<OnlineSubscription, Rc<dyn Fn(bool)>>,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Process-wide connectivity subject.
#[derive(Clone)]
pub struct OnlineManager {
    inner: Rc<RefCell<OnlineInner>>,
}

impl OnlineManager {
    pub(crate) fn new() -> Self {
        OnlineManager {
            inner: Rc::new(RefCell::new(OnlineInner {
                online: true,
                listeners: SlotMap::with_key(),
                waiters: Vec::new(),
            })),
        }
    }

    /// Current connectivity. Starts online.
    pub fn is_online(&self) -> bool {
        self.inner.borrow().online
    }

    /// Reports a connectivity change. Listeners run only on transitions;
    /// paused fetches wake when the transition is to online.
    pub fn set_online(&self, online: bool) {
        let (listeners, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.online == online {
                return;
            }
            inner.online = online;
            let listeners: Vec<Rc<dyn Fn(bool)>> = inner.listeners.values().cloned().collect();
            let waiters = if online {
                std::mem::take(&mut inner.waiters)
            } else {
                Vec::new()
            };
            (listeners, waiters)
        };

        for listener in listeners {
            listener(online);
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Subscribes to connectivity transitions.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> OnlineSubscription {
        self.inner.borrow_mut().listeners.insert(Rc::new(listener))
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, key: OnlineSubscription) {
        self.inner.borrow_mut().listeners.remove(key);
    }

    /// Resolves once the manager reports online. Immediate when already
    /// online.
    pub fn until_online(&self) -> impl std::future::Future<Output = ()> {
        let receiver = {
            let mut inner = self.inner.borrow_mut();
            if inner.online {
                None
            } else {
                let (sx, rx) = oneshot::channel();
                inner.waiters.push(sx);
                Some(rx)
            }
        };

        async move {
            if let Some(rx) = receiver {
                let _ = rx.await;
            }
        }
    }
}
