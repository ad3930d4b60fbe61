//! Pull fallback for when the push feed is down.
//!
//! Each tick fetches recent rows and compares their signature with the
//! previous tick's. Only a changed signature is merged, so an idle remote
//! costs one fetch per interval and no notifications.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{RemoteError, RemoteStore};
use crate::sync::{Collection, Origin, Record, Synchronizer};

/// State carried between polls of one table.
#[derive(Debug, Default)]
pub struct PollState {
    last_signature: Option<String>,
}

impl PollState {
    /// Signature of the last fetched batch, if any.
    #[must_use]
    pub fn last_signature(&self) -> Option<&str> {
        self.last_signature.as_deref()
    }
}

/// Fetches recent rows of `T` and merges them if they changed.
///
/// Returns `true` if the merge changed the canonical collection.
///
/// # Errors
///
/// Returns [`RemoteError`] if the fetch fails.
pub async fn poll_once<T: Record, R: RemoteStore>(
    remote: &R,
    sync: &Synchronizer<T>,
    state: &mut PollState,
    limit: u32,
) -> Result<bool, RemoteError> {
    let now = Utc::now();
    let since = sync.policy().retention.archive_cutoff(now);
    let rows = remote
        .fetch_since(T::KIND.table(), Some(since), limit)
        .await?;
    let records: Vec<T> = rows
        .iter()
        .filter_map(|row| {
            let record = T::from_row(row, now);
            if record.is_none() {
                tracing::debug!(kind = %T::KIND, "dropping malformed remote row");
            }
            record
        })
        .collect();

    let signature = Collection::from_records(records.iter().cloned()).signature();
    if state.last_signature.as_deref() == Some(signature.as_str()) {
        return Ok(false);
    }
    state.last_signature = Some(signature);
    Ok(sync.merge_batch(records, Origin::Remote))
}

/// Polls every `period` while the remote's push feed is down.
pub fn spawn_poller<T: Record, R: RemoteStore>(
    remote: Arc<R>,
    sync: Arc<Synchronizer<T>>,
    period: Duration,
    limit: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = PollState::default();
        loop {
            ticker.tick().await;
            if remote.feed_live() {
                continue;
            }
            match poll_once(remote.as_ref(), &sync, &mut state, limit).await {
                Ok(changed) => tracing::debug!(kind = %T::KIND, changed, "poll tick"),
                Err(e) => tracing::debug!(kind = %T::KIND, error = %e, "poll failed"),
            }
        }
    })
}
