use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub type HolderId = Uuid;

/// Advisory per-url lock shared by every fetcher that should not overlap.
///
/// Cloning shares the same table. Locks live only in memory, so a crashed
/// process never leaves one behind.
#[derive(Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<HashMap<String, HolderId>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, url: &str) -> CoreResult<UrlLock> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| CoreError::Storage("lock table poisoned".to_string()))?;
        if let Some(holder) = held.get(url) {
            return Err(CoreError::LockHeld(format!("{} (holder {})", url, holder)));
        }
        let holder = Uuid::new_v4();
        held.insert(url.to_string(), holder);
        Ok(UrlLock {
            url: url.to_string(),
            holder,
            table: self.clone(),
        })
    }

    pub fn is_locked(&self, url: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains_key(url))
            .unwrap_or(false)
    }

    pub fn holder(&self, url: &str) -> Option<HolderId> {
        self.held.lock().ok().and_then(|held| held.get(url).copied())
    }

    fn release(&self, url: &str, holder: HolderId) {
        if let Ok(mut held) = self.held.lock() {
            if held.get(url) == Some(&holder) {
                held.remove(url);
            }
        }
    }
}

/// Released on drop.
pub struct UrlLock {
    url: String,
    holder: HolderId,
    table: LockTable,
}

impl UrlLock {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }
}

impl Drop for UrlLock {
    fn drop(&mut self) {
        self.table.release(&self.url, self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let table = LockTable::new();
        let url = "https://example.com/video.mp4";
        let guard = table.acquire(url).unwrap();
        assert!(table.is_locked(url));
        assert_eq!(table.holder(url), Some(guard.holder()));
        assert!(matches!(table.acquire(url), Err(CoreError::LockHeld(_))));

        // other urls are independent
        let other = table.acquire("https://example.com/other.mp4").unwrap();
        drop(other);

        drop(guard);
        assert!(!table.is_locked(url));
        assert!(table.acquire(url).is_ok());
    }

    #[test]
    fn clones_share_the_table() {
        let table = LockTable::new();
        let clone = table.clone();
        let _guard = table.acquire("u").unwrap();
        assert!(clone.is_locked("u"));
    }
}
