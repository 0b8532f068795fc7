use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError};

/// Per-business mutexes serializing token refresh and sync for one connection.
///
/// Xero refresh tokens are single-use, so two overlapping refreshes for the same
/// business would leave one side holding a dead token.
#[derive(Clone, Default)]
pub struct BusinessLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl BusinessLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, business_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(business_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `work` with the business lock held, or returns `None` if someone else holds it.
    pub fn try_with<T>(&self, business_id: &str, work: impl FnOnce() -> T) -> Option<T> {
        let handle = self.handle(business_id);
        let _guard = match handle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(work())
    }

    /// Runs `work` with the business lock held, waiting for it if necessary.
    pub fn with<T>(&self, business_id: &str, work: impl FnOnce() -> T) -> T {
        let handle = self.handle(business_id);
        let _guard = match handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        work()
    }
}

#[cfg(test)]
mod tests {
    use super::BusinessLocks;

    #[test]
    fn same_business_shares_one_lock() {
        let locks = BusinessLocks::new();
        let a = locks.handle("biz-1");
        let b = locks.handle("biz-1");
        let c = locks.handle("biz-2");
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert!(!std::sync::Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn try_with_skips_while_held() {
        let locks = BusinessLocks::new();
        let outer = locks.with("biz-1", || {
            let inner = locks.try_with("biz-1", || 1);
            let other = locks.try_with("biz-2", || 2);
            (inner, other)
        });
        assert_eq!(outer, (None, Some(2)));
        assert_eq!(locks.try_with("biz-1", || 3), Some(3));
    }
}
