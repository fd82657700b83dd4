//! Connection reclamation (liveness) tracking.
//!
//! Every client connection owns a deadline that moves forward whenever the
//! client shows signs of life: any inbound request, or a liveness callback
//! from the media layer while delivery is running (RTCP receiver reports
//! arriving on the media path count as liveness even when the control
//! connection is quiet). When the deadline passes, the connection is
//! reclaimed.
//!
//! The monitor is shared between the connection thread (which checks it
//! between socket reads) and the media layer (which receives a clone as the
//! liveness callback handle in
//! [`Subsession::start_stream`](crate::media::Subsession::start_stream)).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Cloneable handle passed to the media layer as the liveness callback.
pub type LivenessHandle = Arc<LivenessMonitor>;

/// A per-connection reclamation deadline.
pub struct LivenessMonitor {
    /// `None` disables reclamation entirely (interval 0).
    interval: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
}

impl LivenessMonitor {
    /// Create a monitor with the given reclamation interval in seconds.
    /// An interval of 0 disables reclamation; the deadline never expires.
    pub fn new(interval_secs: u64) -> Self {
        let interval = (interval_secs > 0).then(|| Duration::from_secs(interval_secs));
        LivenessMonitor {
            interval,
            deadline: Mutex::new(interval.map(|i| Instant::now() + i)),
        }
    }

    /// Push the deadline to now + interval. Called for every inbound request
    /// and from the media layer's liveness callback.
    pub fn note_liveness(&self) {
        if let Some(interval) = self.interval {
            *self.deadline.lock() = Some(Instant::now() + interval);
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.deadline
            .lock()
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}
