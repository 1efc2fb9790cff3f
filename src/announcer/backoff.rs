use std::cmp;
use std::time::Duration;

use rand::Rng;

/// Randomized exponential back-off for announce retries.
///
/// Intervals start at `initial`, grow by `multiplier` per failure up to
/// `max`, and each drawn interval is jittered by up to `randomization` in
/// either direction so that a tracker coming back does not get hammered by
/// every client at once. There is no overall deadline: announcing is
/// retried for as long as the torrent runs.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    randomization: f64,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(
        initial: Duration,
        multiplier: f64,
        randomization: f64,
        max: Duration,
    ) -> Self {
        Self {
            initial,
            multiplier,
            randomization,
            max,
            current: initial,
        }
    }

    /// The policy used for tracker announces: 5 s initial, doubling, ±50%
    /// jitter, capped at 30 minutes.
    pub fn for_announces() -> Self {
        Self::new(
            Duration::from_secs(5),
            2.0,
            0.5,
            Duration::from_secs(30 * 60),
        )
    }

    /// Draws the next retry interval and advances the back-off.
    pub fn next_interval(&mut self) -> Duration {
        let jitter = 1.0
            + self.randomization * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        let next = self.current.mul_f64(jitter);
        self.current = cmp::min(self.current.mul_f64(self.multiplier), self.max);
        next
    }

    /// Resets the back-off after a successful announce.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
