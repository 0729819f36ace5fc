use std::path::PathBuf;
use std::time::Duration;

use replica_wal::{DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_MSG_SIZE};

use crate::Step;

/// The configuration for the consensus engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Location of the consensus write-ahead log. `None` disables the log,
    /// which is only sensible in tests.
    pub wal_path: Option<PathBuf>,
    /// The timeout configuration.
    pub timeout_values: TimeoutValues,
    /// Start the next height as soon as all precommits for the last block
    /// are in, instead of waiting for the commit timeout.
    pub skip_timeout_commit: bool,
    /// Propose blocks even when the mempool is empty.
    pub create_empty_blocks: bool,
    /// With `create_empty_blocks` off, still propose an empty block after
    /// this long. Zero waits for transactions indefinitely.
    pub create_empty_blocks_interval: Duration,
    /// Back-off of the consensus reactor when a peer cannot take more
    /// messages.
    pub peer_gossip_sleep: Duration,
    /// The largest single WAL entry.
    pub wal_max_msg_size: usize,
    /// How often the WAL head is flushed to disk.
    pub wal_flush_interval: Duration,
    /// Parts blocks are split into when proposed.
    pub block_part_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_path: None,
            timeout_values: TimeoutValues::default(),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            peer_gossip_sleep: Duration::from_millis(100),
            wal_max_msg_size: DEFAULT_MAX_MSG_SIZE,
            wal_flush_interval: DEFAULT_FLUSH_INTERVAL,
            block_part_size: replica_common::BLOCK_PART_SIZE,
        }
    }
}

impl Config {
    /// Set the WAL location.
    pub fn with_wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = Some(path.into());
        self
    }

    /// Set the timeout values.
    pub fn with_timeout_values(mut self, timeout_values: TimeoutValues) -> Self {
        self.timeout_values = timeout_values;
        self
    }

    pub fn with_skip_timeout_commit(mut self, skip: bool) -> Self {
        self.skip_timeout_commit = skip;
        self
    }

    /// Set whether empty blocks are proposed, and how long to wait for
    /// transactions before proposing one anyway.
    pub fn with_create_empty_blocks(mut self, create: bool, interval: Duration) -> Self {
        self.create_empty_blocks = create;
        self.create_empty_blocks_interval = interval;
        self
    }

    pub fn with_peer_gossip_sleep(mut self, sleep: Duration) -> Self {
        self.peer_gossip_sleep = sleep;
        self
    }

    /// Set the largest WAL entry.
    pub fn with_wal_max_msg_size(mut self, size: usize) -> Self {
        self.wal_max_msg_size = size;
        self
    }

    pub fn with_wal_flush_interval(mut self, interval: Duration) -> Self {
        self.wal_flush_interval = interval;
        self
    }

    /// Set the block part size. Small parts make tests exercise multi-part
    /// blocks.
    pub fn with_block_part_size(mut self, size: usize) -> Self {
        self.block_part_size = size;
        self
    }

    /// Whether round 0 of a height has to wait for transactions.
    pub(crate) fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || !self.create_empty_blocks_interval.is_zero()
    }
}

/// The timeout values for the consensus engine. Timeouts grow linearly with
/// the round: round `r` waits `base + r * delta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutValues {
    /// Waiting for a proposal.
    pub propose: Duration,
    pub propose_delta: Duration,
    /// Waiting after 2/3+ prevotes for anything.
    pub prevote: Duration,
    pub prevote_delta: Duration,
    /// Waiting after 2/3+ precommits for anything.
    pub precommit: Duration,
    pub precommit_delta: Duration,
    /// Pause between a commit and round 0 of the next height, so that late
    /// precommits make it into the last commit.
    pub commit: Duration,
}

impl Default for TimeoutValues {
    fn default() -> Self {
        Self {
            propose: Duration::from_millis(3000),
            propose_delta: Duration::from_millis(500),
            prevote: Duration::from_millis(1000),
            prevote_delta: Duration::from_millis(500),
            precommit: Duration::from_millis(1000),
            precommit_delta: Duration::from_millis(500),
            commit: Duration::from_millis(1000),
        }
    }
}

impl TimeoutValues {
    /// Short timeouts for tests and local networks.
    pub fn fast() -> Self {
        Self {
            propose: Duration::from_millis(40),
            propose_delta: Duration::from_millis(1),
            prevote: Duration::from_millis(10),
            prevote_delta: Duration::from_millis(1),
            precommit: Duration::from_millis(10),
            precommit_delta: Duration::from_millis(1),
            commit: Duration::from_millis(10),
        }
    }

    pub fn propose(&self, round: u32) -> Duration {
        self.propose + self.propose_delta * round
    }

    pub fn prevote(&self, round: u32) -> Duration {
        self.prevote + self.prevote_delta * round
    }

    pub fn precommit(&self, round: u32) -> Duration {
        self.precommit + self.precommit_delta * round
    }

    /// The timeout that ends `step` in `round`, for the steps that have one.
    pub fn get(&self, step: Step, round: u32) -> Option<Duration> {
        match step {
            Step::NewHeight => Some(self.commit),
            Step::Propose => Some(self.propose(round)),
            Step::PrevoteWait => Some(self.prevote(round)),
            Step::PrecommitWait => Some(self.precommit(round)),
            Step::NewRound | Step::Prevote | Step::Precommit | Step::Commit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::first_round(0, 3000)]
    #[case::second_round(1, 3500)]
    #[case::tenth_round(10, 8000)]
    fn propose_timeout_grows_with_the_round(#[case] round: u32, #[case] millis: u64) {
        let values = TimeoutValues::default();
        assert_eq!(values.propose(round), Duration::from_millis(millis));
        assert_eq!(values.get(Step::Propose, round), Some(Duration::from_millis(millis)));
    }

    #[test]
    fn only_wait_steps_have_timeouts() {
        let values = TimeoutValues::default();
        assert_eq!(values.get(Step::Prevote, 3), None);
        assert_eq!(values.get(Step::Commit, 0), None);
        assert_eq!(values.get(Step::PrecommitWait, 2), Some(Duration::from_millis(2000)));
        assert_eq!(values.get(Step::NewHeight, 5), Some(values.commit));
    }
}
