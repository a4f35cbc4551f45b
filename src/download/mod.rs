//! In-flight download de-duplication.
//!
//! At most one task downloads a given image id at a time. Concurrent
//! requesters for the same id wait for the owner to finish and then re-check
//! disk state: the only guarantee on release is "the file now exists or the
//! attempt failed".

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

/// Outcome of [`DownloadCoordinator::acquire`].
pub enum DownloadSlot {
    /// Caller performs the download and must call `release` when done,
    /// success or failure.
    Owner,
    /// Another task is already downloading this image; wait on the handle.
    Waiter(WaitHandle),
}

impl DownloadSlot {
    pub fn is_owner(&self) -> bool {
        matches!(self, DownloadSlot::Owner)
    }
}

pub struct WaitHandle {
    rx: watch::Receiver<bool>,
}

impl WaitHandle {
    /// Resolves once the owning download releases, whether it succeeded or
    /// not.
    pub async fn wait(mut self) {
        while !*self.rx.borrow() {
            // A closed channel means the owner released (and the registry
            // entry was dropped) before we started waiting.
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[derive(Default)]
pub struct DownloadCoordinator {
    in_flight: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl DownloadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in downloading `image_id`. The first caller becomes
    /// the owner; everyone else gets a wait handle. A blank id has nothing
    /// to de-duplicate, so the caller is always the owner.
    pub fn acquire(&self, image_id: &str) -> DownloadSlot {
        if image_id.is_empty() {
            return DownloadSlot::Owner;
        }

        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(tx) = in_flight.get(image_id) {
            return DownloadSlot::Waiter(WaitHandle { rx: tx.subscribe() });
        }

        let (tx, _rx) = watch::channel(false);
        in_flight.insert(image_id.to_string(), tx);
        DownloadSlot::Owner
    }

    /// Mark the end of the guarded download and wake all waiters. Always
    /// clears the registration so a later request can retry.
    pub fn release(&self, image_id: &str) {
        if image_id.is_empty() {
            return;
        }

        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(tx) = in_flight.remove(image_id) {
            let _ = tx.send(true);
        }
    }
}
