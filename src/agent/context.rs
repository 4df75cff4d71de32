use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Point-in-time copy of the diagnostic context, stamped onto every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub user_class: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Process-wide diagnostic context (user class plus key/value metadata).
///
/// Owned by the agent; readers always get a consistent snapshot, never a
/// mix of two writes.
#[derive(Debug, Default)]
pub struct ContextStore {
    inner: RwLock<ContextSnapshot>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ContextSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContextSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_user_class(&self, name: &str) {
        self.write().user_class = Some(name.to_string());
    }

    pub fn clear_user_class(&self) {
        self.write().user_class = None;
    }

    /// Inserts or replaces `key`.
    pub fn put_user_metadata(&self, key: &str, value: &str) {
        self.write().metadata.insert(key.to_string(), value.to_string());
    }

    /// Removes `key`; unknown keys are ignored.
    pub fn clear_user_metadata(&self, key: &str) {
        self.write().metadata.remove(key);
    }

    pub fn clear_all_user_metadata(&self) {
        self.write().metadata.clear();
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.read().clone()
    }
}
