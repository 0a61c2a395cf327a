//! Write-once cell holding the torrent's metadata once it is known

use tokio::sync::watch;

use crate::torrent::{CachedInfoDict, TorrentError};

/// Single-assignment cell that many tasks can wait on.
///
/// The value is published through a watch channel, so every waiter observes
/// the same completed value and any read after `set` returns sees it.
pub struct MetadataCell {
    sender: watch::Sender<Option<CachedInfoDict>>,
}

impl MetadataCell {
    /// Creates a cell, already filled when `initial` is given.
    pub fn new(initial: Option<CachedInfoDict>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Current value, if set.
    pub fn get(&self) -> Option<CachedInfoDict> {
        self.sender.borrow().clone()
    }

    /// True once a value was stored.
    pub fn is_set(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Stores `value` unless the cell is already filled.
    ///
    /// Returns true when this call filled the cell and woke the waiters.
    pub fn set(&self, value: CachedInfoDict) -> bool {
        let mut value = Some(value);
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = value.take();
            true
        })
    }

    /// Waits until the cell is filled.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SessionClosed` - Cell was dropped before being filled
    pub async fn wait(&self) -> Result<CachedInfoDict, TorrentError> {
        let mut receiver = self.sender.subscribe();
        let value = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TorrentError::SessionClosed)?;
        value.clone().ok_or(TorrentError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::storage::test_fixtures::create_test_torrent;

    #[tokio::test]
    async fn test_wait_all_waiters_observe_same_value() {
        let cell = Arc::new(MetadataCell::new(None));
        let torrent = create_test_torrent(16, 64);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cell.set(torrent.cached.clone()));

        for waiter in futures::future::join_all(waiters).await {
            let value = waiter.unwrap().unwrap();
            assert_eq!(value.bytes(), torrent.cached.bytes());
        }
    }

    #[test]
    fn test_set_second_value_ignored() {
        let first = create_test_torrent(16, 64);
        let second = create_test_torrent(16, 80);
        let cell = MetadataCell::new(None);

        assert!(cell.set(first.cached.clone()));
        assert!(!cell.set(second.cached));
        assert_eq!(cell.get().unwrap().bytes(), first.cached.bytes());
    }

    #[tokio::test]
    async fn test_wait_prefilled_returns_immediately() {
        let torrent = create_test_torrent(16, 64);
        let cell = MetadataCell::new(Some(torrent.cached.clone()));
        assert!(cell.is_set());
        let value = tokio_test::assert_ok!(cell.wait().await);
        assert_eq!(value.info().info_hash, torrent.info().info_hash);
    }
}
