//! What the state machine writes ahead of acting on it.
use std::path::PathBuf;
use std::sync::Arc;

use replica_common::p2p::PeerId;
use replica_wal::{SearchOptions, SearchReader, Wal, WalConfig, WalError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{ConsensusMessage, Hrs, TimeoutInfo};

/// A message for the state machine and who sent it. `peer_id` is `None`
/// for messages the node produced itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: Option<PeerId>,
}

impl MsgInfo {
    pub fn internal(msg: ConsensusMessage) -> Self {
        Self { msg, peer_id: None }
    }

    pub fn from_peer(msg: ConsensusMessage, peer_id: PeerId) -> Self {
        Self {
            msg,
            peer_id: Some(peer_id),
        }
    }
}

/// A write-ahead log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalMessage {
    MsgInfo(MsgInfo),
    TimeoutInfo(TimeoutInfo),
    /// Marks a step change. Not replayed.
    NewRoundStep(Hrs),
}

/// A trait for types that can append to the consensus write-ahead log.
pub trait ConsensusWal: Send {
    fn write(&self, msg: &WalMessage) -> Result<(), WalError>;

    /// Returns once the entry is durable.
    fn write_sync(&self, msg: &WalMessage) -> Result<(), WalError>;

    /// Marks that everything before `height` is final.
    fn write_meta_sync(&self, height: u64) -> Result<(), WalError>;

    fn flush_and_sync(&self) -> Result<(), WalError>;

    fn search_for_height(
        &self,
        height: u64,
        options: SearchOptions,
    ) -> Result<Option<SearchReader>, WalError>;

    /// Starts flushing in the background until `cancel` fires.
    fn spawn_flush_task(&self, _cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        None
    }
}

/// The consensus log on disk.
#[derive(Clone, Debug)]
pub struct FileWal {
    inner: Arc<Wal<WalMessage>>,
    path: PathBuf,
}

impl FileWal {
    pub fn open(path: impl Into<PathBuf>, config: WalConfig) -> Result<Self, WalError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let inner = Wal::open(path.clone(), config)?;
        tracing::debug!(path = %path.display(), "Opened consensus WAL");
        Ok(Self {
            inner: Arc::new(inner),
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ConsensusWal for FileWal {
    fn write(&self, msg: &WalMessage) -> Result<(), WalError> {
        self.inner.write(msg)
    }

    fn write_sync(&self, msg: &WalMessage) -> Result<(), WalError> {
        self.inner.write_sync(msg)
    }

    fn write_meta_sync(&self, height: u64) -> Result<(), WalError> {
        self.inner.write_meta_sync(height)
    }

    fn flush_and_sync(&self) -> Result<(), WalError> {
        self.inner.flush_and_sync()
    }

    fn search_for_height(
        &self,
        height: u64,
        options: SearchOptions,
    ) -> Result<Option<SearchReader>, WalError> {
        self.inner.search_for_height(height, options)
    }

    fn spawn_flush_task(&self, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        Some(self.inner.spawn_flush_task(cancel))
    }
}

/// Discards everything; replay finds nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopWal;

impl ConsensusWal for NopWal {
    fn write(&self, _msg: &WalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn write_sync(&self, _msg: &WalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn write_meta_sync(&self, _height: u64) -> Result<(), WalError> {
        Ok(())
    }

    fn flush_and_sync(&self) -> Result<(), WalError> {
        Ok(())
    }

    fn search_for_height(
        &self,
        _height: u64,
        _options: SearchOptions,
    ) -> Result<Option<SearchReader>, WalError> {
        Ok(None)
    }
}
