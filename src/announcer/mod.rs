//! The per-tracker announce loop and the shutdown fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::peer::PeerSource;
use crate::tracker::{Event, Tracker, Transfer};

mod backoff;
pub mod stop;

use backoff::ExponentialBackoff;
pub use stop::StopAnnouncer;

/// One announcer per tracker URL.
///
/// The announcer publishes the torrent's transfer state on the tracker's
/// schedule and feeds any returned peer addresses to the torrent; it never
/// dials peers itself. Announce failures are retried with randomized
/// exponential back-off and are never fatal.
pub struct Announcer {
    tracker: Arc<Tracker>,
    transfer: Arc<Transfer>,
    /// The interval used when the tracker's response does not carry one.
    default_interval: Duration,
    peer_list_tx: UnboundedSender<(Vec<SocketAddr>, PeerSource)>,
    /// Set by the torrent once all pieces are verified; announced as
    /// `completed` at most once.
    completed_rx: watch::Receiver<bool>,
    /// Raised by the dialer when the address pool runs dry. A raised flag
    /// lets the announcer ignore the tracker's minimum interval and
    /// re-announce early.
    need_peers_rx: watch::Receiver<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Announcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<Tracker>,
        transfer: Arc<Transfer>,
        default_interval: Duration,
        peer_list_tx: UnboundedSender<(Vec<SocketAddr>, PeerSource)>,
        completed_rx: watch::Receiver<bool>,
        need_peers_rx: watch::Receiver<bool>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tracker,
            transfer,
            default_interval,
            peer_list_tx,
            completed_rx,
            need_peers_rx,
            stop_rx,
        }
    }

    /// Runs until the stop signal fires.
    ///
    /// A `started` announce is sent on entry. The `stopped` announce is
    /// not sent here: shutdown announces for all trackers are fanned out
    /// by [`StopAnnouncer`] under a single deadline, after the periodic
    /// announcers have exited.
    pub async fn run(mut self) {
        log::info!("announcer for {} starting", self.tracker.url());

        let mut backoff = ExponentialBackoff::for_announces();
        // a torrent that starts out complete must not announce `completed`
        let mut completed_sent = *self.completed_rx.borrow();
        let mut completed_open = true;
        let mut need_peers_open = true;

        let mut next_announce =
            self.announce(Some(Event::Started), &mut backoff).await;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = self.stop_rx.changed() => break,
                _ = tokio::time::sleep(next_announce) => {
                    next_announce = self.announce(None, &mut backoff).await;
                }
                res = self.completed_rx.changed(), if completed_open && !completed_sent => {
                    if res.is_err() {
                        completed_open = false;
                        continue;
                    }
                    if *self.completed_rx.borrow() {
                        completed_sent = true;
                        next_announce =
                            self.announce(Some(Event::Completed), &mut backoff).await;
                    }
                }
                res = self.need_peers_rx.changed(), if need_peers_open => {
                    if res.is_err() {
                        need_peers_open = false;
                        continue;
                    }
                    if *self.need_peers_rx.borrow() {
                        next_announce = self.announce(None, &mut backoff).await;
                    }
                }
            }
        }

        log::info!("announcer for {} exiting", self.tracker.url());
    }

    /// One announce, cancellable by the stop signal. Returns the duration
    /// to sleep until the next announce.
    async fn announce(
        &self,
        event: Option<Event>,
        backoff: &mut ExponentialBackoff,
    ) -> Duration {
        let params = self.transfer.announce_params(event);
        let mut stop_rx = self.stop_rx.clone();

        let result = tokio::select! {
            res = self.tracker.announce(params) => res,
            _ = stop_rx.changed() => {
                // the outer loop observes the signal and exits
                return self.default_interval;
            }
        };

        match result {
            Ok(resp) => {
                backoff.reset();
                if let Some(warning) = &resp.warning_message {
                    log::warn!("tracker {} warning: {}", self.tracker.url(), warning);
                }
                log::debug!(
                    "tracker {} returned {} peers",
                    self.tracker.url(),
                    resp.peers.len()
                );
                if !resp.peers.is_empty() {
                    let _ = self
                        .peer_list_tx
                        .send((resp.peers, PeerSource::Tracker));
                }
                resp.interval.unwrap_or(self.default_interval)
            }
            Err(e) => {
                log::warn!("announce to {} failed: {}", self.tracker.url(), e);
                backoff.next_interval()
            }
        }
    }
}
