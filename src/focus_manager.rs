//! Host-focus events.
//!
//! The core does not watch window focus itself; the host forwards its
//! platform events into [`FocusManager::set_focused`] and observers react
//! per their `refetch_on_focus` option. Tests drive the manager directly.

use std::cell::RefCell;
use std::rc::Rc;

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle for removing a focus subscription.
    pub struct FocusSubscription;
}

struct FocusInner {
    focused: bool,
    listeners: SlotMap<FocusSubscription, Rc<dyn Fn(bool)>>,
}

/// Process-wide focus subject.
#[derive(Clone)]
pub struct FocusManager {
    inner: Rc<RefCell<FocusInner>>,
}

impl FocusManager {
    pub(crate) fn new() -> Self {
        FocusManager {
            inner: Rc::new(RefCell::new(FocusInner {
                focused: true,
                listeners: SlotMap::with_key(),
            })),
        }
    }

    /// Current focus state. Starts focused.
    pub fn is_focused(&self) -> bool {
        self.inner.borrow().focused
    }

    /// Reports a focus change. Listeners run only on actual transitions.
    pub fn set_focused(&self, focused: bool) {
        // Listeners may re-enter the manager, so the borrow is released
        // before any of them runs.
        let listeners: Vec<Rc<dyn Fn(bool)>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.focused == focused {
                return;
            }
            inner.focused = focused;
            inner.listeners.values().cloned().collect()
        };

        for listener in listeners {
            listener(focused);
        }
    }

    /// Subscribes to focus transitions.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> FocusSubscription {
        self.inner.borrow_mut().listeners.insert(Rc::new(listener))
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, key: FocusSubscription) {
        self.inner.borrow_mut().listeners.remove(key);
    }
}
