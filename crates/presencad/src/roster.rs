//! Out-of-band roster refresh.
//!
//! Profiles are reloaded from the store on an interval and pushed to the
//! kiosk loop as a wholesale snapshot swap over a `watch` channel. The loop
//! never mutates a snapshot; on a refresh failure the previous snapshot
//! stays in place.

use presenca_core::enroll::ProfileStore;
use presenca_core::FaceProfile;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::store::KioskStore;

pub fn spawn_roster_refresh(
    store: KioskStore,
    interval: Duration,
) -> watch::Receiver<Arc<Vec<FaceProfile>>> {
    let (tx, rx) = watch::channel(Arc::new(Vec::new()));

    tokio::spawn(async move {
        loop {
            match store.load_profiles().await {
                Ok(profiles) => {
                    let eligible = profiles.iter().filter(|p| p.match_eligible()).count();
                    tracing::debug!(total = profiles.len(), eligible, "roster refreshed");
                    if tx.send(Arc::new(profiles)).is_err() {
                        // All receivers gone; the kiosk has shut down.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "roster refresh failed; keeping last snapshot");
                }
            }
            tokio::time::sleep(interval).await;
        }
    });

    rx
}
