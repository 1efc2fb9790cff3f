use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::tracker::{Event, Tracker, Transfer};

/// Fan-out of the `stopped` announce on torrent shutdown.
///
/// All trackers are announced to concurrently under a single wall-clock
/// deadline; whatever has not finished by then is cancelled. The result
/// signal is delivered at most once. Dropping the future returned by
/// [`StopAnnouncer::run`] cancels all in-flight announces.
pub struct StopAnnouncer {
    trackers: Vec<Arc<Tracker>>,
    transfer: Arc<Transfer>,
    deadline: Duration,
    result_tx: oneshot::Sender<()>,
}

impl StopAnnouncer {
    pub fn new(
        trackers: Vec<Arc<Tracker>>,
        transfer: Arc<Transfer>,
        deadline: Duration,
        result_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            trackers,
            transfer,
            deadline,
            result_tx,
        }
    }

    pub async fn run(self) {
        let announces = self.trackers.iter().map(|tracker| {
            let params = self.transfer.announce_params(Some(Event::Stopped));
            async move {
                if let Err(e) = tracker.announce(params).await {
                    // shutdown announces are best-effort
                    log::debug!(
                        "stopped announce to {} failed: {}",
                        tracker.url(),
                        e
                    );
                }
            }
        });

        if timeout(self.deadline, futures::future::join_all(announces))
            .await
            .is_err()
        {
            log::debug!("stopped announce fan-out hit its deadline");
        }

        let _ = self.result_tx.send(());
    }
}
