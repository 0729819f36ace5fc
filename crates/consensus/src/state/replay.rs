//! Crash recovery: re-feeding what was logged for the current height.
use replica_wal::{SearchOptions, WalFrame};

use super::ConsensusState;
use crate::{ConsensusError, WalMessage};

impl ConsensusState {
    /// Re-processes every message and timeout logged after the marker for
    /// `height`, bringing the machine back to where it was before a crash.
    ///
    /// Votes and proposals signed before the crash come back from the log,
    /// so the signer refusing to sign them again is expected here.
    pub(super) fn catchup_replay(&mut self, height: u64) -> Result<(), ConsensusError> {
        self.replay_mode = true;
        let result = self.replay_height(height);
        self.replay_mode = false;
        result
    }

    fn replay_height(&mut self, height: u64) -> Result<(), ConsensusError> {
        let options = SearchOptions::default();

        // A marker past this height means the block was decided and logged
        // as final, yet the chain state never got there.
        if self
            .wal
            .search_for_height(height + 1, options)
            .map_err(ConsensusError::wal_recovery)?
            .is_some()
        {
            return Err(ConsensusError::wal_recovery(anyhow::anyhow!(
                "WAL holds a marker for height {}, which has not been committed",
                height + 1
            )));
        }

        let Some(mut reader) = self
            .wal
            .search_for_height(height, options)
            .map_err(ConsensusError::wal_recovery)?
        else {
            tracing::info!(height, "No WAL entries for height, starting fresh");
            self.wal
                .write_meta_sync(height)
                .map_err(ConsensusError::wal_write)?;
            return Ok(());
        };

        tracing::info!(height, "Replaying WAL");
        let mut replayed = 0usize;
        while let Some(frame) = reader
            .read_frame::<WalMessage>()
            .map_err(|e| ConsensusError::wal_recovery(anyhow::Error::from(e).context("reading WAL")))?
        {
            let timed = match frame {
                WalFrame::Meta(_) => continue,
                WalFrame::Message(timed) => timed,
            };
            match timed.msg {
                WalMessage::MsgInfo(mi) => {
                    let result = self.process_msg(mi);
                    self.log_recoverable(result)?;
                }
                WalMessage::TimeoutInfo(ti) => self.process_timeout(ti)?,
                WalMessage::NewRoundStep(hrs) => {
                    tracing::trace!(%hrs, "Replayed step marker");
                }
            }
            replayed += 1;
        }

        // Peers catch up through gossip. Own messages signed during replay
        // stay queued: they were lost if the crash hit before logging them.
        self.outbound.clear();
        tracing::info!(height, replayed, position = %self.rs.hrs(), "Replayed WAL");
        Ok(())
    }
}
