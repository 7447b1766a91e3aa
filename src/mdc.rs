//! Per-thread diagnostic context.
//!
//! Values put here are attached to every record the current thread logs until
//! they are removed. The logger takes a [`snapshot`] at call time, so later
//! changes never affect records already published.

use std::cell::RefCell;
use std::sync::Arc;

use crate::record::Context;

thread_local! {
    static CONTEXT: RefCell<Context> = RefCell::new(Context::new());
}

pub fn put(key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) {
    CONTEXT.with(|c| c.borrow_mut().insert(key, value));
}

pub fn get(key: &str) -> Option<Arc<str>> {
    CONTEXT.with(|c| c.borrow().get(key).cloned())
}

pub fn remove(key: &str) -> Option<Arc<str>> {
    CONTEXT.with(|c| c.borrow_mut().remove(key))
}

pub fn clear() {
    CONTEXT.with(|c| c.borrow_mut().clear());
}

/// Copy of the current thread's context, `None` when it is empty.
pub fn snapshot() -> Option<Context> {
    CONTEXT.with(|c| {
        let context = c.borrow();
        (!context.is_empty()).then(|| context.clone())
    })
}
