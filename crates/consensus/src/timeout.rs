use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{Hrs, Step};

/// A timeout for the step it is meant to end.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: Step,
}

impl TimeoutInfo {
    pub fn hrs(&self) -> Hrs {
        Hrs {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} at {}", self.duration, self.hrs())
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug)]
struct ScheduledTimeout {
    timeout: TimeoutInfo,
    due: Instant,
}

/// Holds the timeout the state machine scheduled last until it is due.
///
/// Only one timeout is pending at a time: scheduling a timeout for a later
/// position replaces the pending one, while a timeout for the latest
/// scheduled position or an earlier one is ignored. Once stopped, nothing
/// fires and nothing new is scheduled.
#[derive(Debug, Default)]
pub struct TimeoutTicker {
    pending: Option<ScheduledTimeout>,
    latest: Option<Hrs>,
    stopped: bool,
}

impl TimeoutTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a new timeout.
    pub fn schedule(&mut self, timeout: TimeoutInfo) {
        if self.stopped {
            return;
        }
        let hrs = timeout.hrs();
        if let Some(latest) = self.latest {
            if hrs <= latest {
                tracing::trace!(%timeout, %latest, "Ignoring stale timeout");
                return;
            }
        }
        self.latest = Some(hrs);

        let due = Instant::now() + timeout.duration;
        self.pending = Some(ScheduledTimeout { timeout, due });

        tracing::debug!(
            %timeout,
            due = ?due,
            "Scheduled timeout"
        );
    }

    /// When the pending timeout is due.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.as_ref().map(|st| st.due)
    }

    /// Takes the pending timeout if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimeoutInfo> {
        match &self.pending {
            Some(st) if st.due <= now => self.pop_next(),
            _ => None,
        }
    }

    /// Takes the pending timeout whether it is due or not.
    pub fn pop_next(&mut self) -> Option<TimeoutInfo> {
        self.pending.take().map(|st| st.timeout)
    }

    pub fn pending(&self) -> Option<TimeoutInfo> {
        self.pending.as_ref().map(|st| st.timeout)
    }

    /// Cancel the pending timeout and refuse new ones.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.pending = None;

        tracing::debug!("Stopped timeout ticker");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(millis: u64, height: u64, round: u32, step: Step) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(millis),
            height,
            round,
            step,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_due() {
        let mut ticker = TimeoutTicker::new();
        ticker.schedule(timeout(100, 1, 0, Step::Propose));
        assert_eq!(ticker.pop_due(Instant::now()), None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            ticker.pop_due(Instant::now()),
            Some(timeout(100, 1, 0, Step::Propose))
        );
        assert_eq!(ticker.pop_due(Instant::now()), None);
        assert_eq!(ticker.next_due(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn later_positions_replace_earlier_ones() {
        let mut ticker = TimeoutTicker::new();
        ticker.schedule(timeout(300, 1, 0, Step::Propose));
        ticker.schedule(timeout(100, 1, 0, Step::PrevoteWait));
        assert_eq!(ticker.pending(), Some(timeout(100, 1, 0, Step::PrevoteWait)));

        // Earlier positions and exact repeats are ignored.
        ticker.schedule(timeout(10, 1, 0, Step::Propose));
        ticker.schedule(timeout(10, 1, 0, Step::PrevoteWait));
        assert_eq!(ticker.pending(), Some(timeout(100, 1, 0, Step::PrevoteWait)));

        // Firing does not reopen the position.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ticker.pop_due(Instant::now()).is_some());
        ticker.schedule(timeout(10, 1, 0, Step::PrevoteWait));
        assert_eq!(ticker.pending(), None);

        ticker.schedule(timeout(20, 2, 0, Step::NewHeight));
        ticker.schedule(timeout(10, 2, 0, Step::NewRound));
        assert_eq!(ticker.pending(), Some(timeout(10, 2, 0, Step::NewRound)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_ticker_never_fires() {
        let mut ticker = TimeoutTicker::new();
        ticker.schedule(timeout(10, 1, 0, Step::Propose));
        ticker.stop();
        assert_eq!(ticker.pending(), None);
        assert_eq!(ticker.next_due(), None);

        ticker.schedule(timeout(10, 1, 1, Step::Propose));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticker.pop_due(Instant::now()), None);
    }
}
