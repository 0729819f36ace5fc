//! Write-ahead log on top of a rotating [Group] of files.
//!
//! Every entry is one line of text. Regular entries are
//! `base64(checksum ++ length ++ payload)` where the checksum is the first
//! four bytes of the payload's SHA-256 and the length is a big-endian `u32`.
//! Height markers are `#` followed by JSON, e.g. `#{"h":12}`. `#` is not part
//! of the base64 alphabet, so the two never collide, and line framing lets a
//! reader start at any segment.
//!
//! A marker for height `h` is written once everything belonging to height
//! `h - 1` is durable, so [Wal::search_for_height] positions a reader right
//! at the first entry of `h`.
use std::io::{self, BufRead, BufReader};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use replica_common::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

mod group;

pub use group::{Group, GroupConfig, GroupInfo, GroupReader};

pub const DEFAULT_MAX_MSG_SIZE: usize = 1024 * 1024;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

const META_PREFIX: u8 = b'#';
const CHECKSUM_LEN: usize = 4;
const LENGTH_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaMessage {
    #[serde(rename = "h")]
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedWalMessage<M> {
    pub time: Timestamp,
    pub msg: M,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalFrame<M> {
    Meta(MetaMessage),
    Message(TimedWalMessage<M>),
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("msg is too big: {size} bytes, max: {max} bytes")]
    MessageTooBig { size: usize, max: usize },
    #[error("data corruption: {0}")]
    DataCorruption(String),
    #[error("wal io: {0}")]
    Io(#[from] io::Error),
    #[error("wal encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl WalError {
    pub fn is_data_corruption(&self) -> bool {
        matches!(self, WalError::DataCorruption(_))
    }

    fn corruption(msg: impl Into<String>) -> Self {
        WalError::DataCorruption(msg.into())
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encodes one entry line, without the trailing newline.
pub fn encode_message<M: Serialize>(
    msg: &TimedWalMessage<M>,
    max_msg_size: usize,
) -> Result<Vec<u8>, WalError> {
    let payload = serde_json::to_vec(msg)?;
    if max_msg_size > 0 && payload.len() > max_msg_size {
        return Err(WalError::MessageTooBig {
            size: payload.len(),
            max: max_msg_size,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| WalError::MessageTooBig {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(CHECKSUM_LEN + LENGTH_LEN + payload.len());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(base64::encode_config(frame, base64::STANDARD_NO_PAD).into_bytes())
}

pub fn encode_meta(meta: &MetaMessage) -> Result<Vec<u8>, WalError> {
    let mut line = vec![META_PREFIX];
    line.extend(serde_json::to_vec(meta)?);
    Ok(line)
}

/// A decoded line whose payload has been checked but not deserialized.
enum RawFrame {
    Meta(MetaMessage),
    Message(Vec<u8>),
}

/// Reads entries back, validating checksums and lengths.
pub struct WalReader<R> {
    reader: R,
    max_msg_size: usize,
    line: Vec<u8>,
}

pub type SearchReader = WalReader<Box<dyn BufRead + Send>>;

impl<R: BufRead> WalReader<R> {
    pub fn new(reader: R, max_msg_size: usize) -> Self {
        Self {
            reader,
            max_msg_size,
            line: Vec::new(),
        }
    }

    fn read_raw(&mut self) -> Result<Option<RawFrame>, WalError> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Ok(None);
        }
        if self.line.last() != Some(&b'\n') {
            // Torn tail from a crash mid-write; nothing after it is readable.
            tracing::warn!(bytes = n, "Ignoring incomplete trailing WAL line");
            return Ok(None);
        }
        self.line.pop();
        let line = self.line.as_slice();

        if line.is_empty() {
            return Err(WalError::corruption("found empty line"));
        }
        if line[0] == META_PREFIX {
            let meta = serde_json::from_slice(&line[1..])
                .map_err(|e| WalError::corruption(format!("failed to decode meta line: {e}")))?;
            return Ok(Some(RawFrame::Meta(meta)));
        }

        let frame = base64::decode_config(line, base64::STANDARD_NO_PAD)
            .map_err(|e| WalError::corruption(format!("failed to decode base64: {e}")))?;
        if frame.len() < CHECKSUM_LEN + LENGTH_LEN {
            return Err(WalError::corruption(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let (crc, rest) = frame.split_at(CHECKSUM_LEN);
        let (len, payload) = rest.split_at(LENGTH_LEN);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if self.max_msg_size > 0 && len > self.max_msg_size {
            return Err(WalError::corruption(format!(
                "length {len} exceeded maximum possible value of {} bytes",
                self.max_msg_size
            )));
        }
        if len != payload.len() {
            return Err(WalError::corruption(format!(
                "length mismatch: header says {len}, read {}",
                payload.len()
            )));
        }
        let actual = checksum(payload);
        if crc != actual {
            return Err(WalError::corruption(format!(
                "checksums do not match: read {}, actual {}",
                hex_string(crc),
                hex_string(&actual)
            )));
        }
        Ok(Some(RawFrame::Message(payload.to_vec())))
    }

    /// Next frame, or `None` at the end of the log.
    pub fn read_frame<M: DeserializeOwned>(&mut self) -> Result<Option<WalFrame<M>>, WalError> {
        match self.read_raw()? {
            None => Ok(None),
            Some(RawFrame::Meta(meta)) => Ok(Some(WalFrame::Meta(meta))),
            Some(RawFrame::Message(payload)) => {
                let msg = serde_json::from_slice(&payload)
                    .map_err(|e| WalError::corruption(format!("failed to decode message: {e}")))?;
                Ok(Some(WalFrame::Message(msg)))
            }
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchMode {
    /// Exponential backwards steps from the newest segment, switching to a
    /// binary search once the target is bracketed.
    #[default]
    Backwards,
    Binary,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    /// Skip corrupted lines instead of failing the search.
    pub ignore_data_corruption: bool,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub group: GroupConfig,
    pub max_msg_size: usize,
    pub flush_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            group: GroupConfig::default(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl WalConfig {
    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.group = group;
        self
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}

/// A write-ahead log of `M` messages with height markers.
pub struct Wal<M> {
    group: Arc<Mutex<Group>>,
    config: WalConfig,
    _msg: PhantomData<fn(M)>,
}

impl<M> std::fmt::Debug for Wal<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("group", &self.group).finish()
    }
}

impl<M: Serialize + DeserializeOwned> Wal<M> {
    /// Opens the log at `path`. A brand new log starts with a marker for
    /// height 0.
    pub fn open(path: impl Into<PathBuf>, config: WalConfig) -> Result<Self, WalError> {
        let group = Group::open(path, config.group.clone())?;
        let fresh = group.total_size() == 0;
        let wal = Self {
            group: Arc::new(Mutex::new(group)),
            config,
            _msg: PhantomData,
        };
        if fresh {
            wal.write_meta_sync(0)?;
        }
        Ok(wal)
    }

    fn lock(&self) -> MutexGuard<'_, Group> {
        self.group.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn group_info(&self) -> GroupInfo {
        self.lock().info()
    }

    /// Buffered append. Use [Wal::write_sync] when the entry must be durable
    /// before returning.
    pub fn write(&self, msg: &M) -> Result<(), WalError> {
        let timed = TimedWalMessage {
            time: Timestamp::now(),
            msg,
        };
        let line = encode_message(&timed, self.config.max_msg_size)?;
        self.lock().write_line(&line)?;
        Ok(())
    }

    pub fn write_sync(&self, msg: &M) -> Result<(), WalError> {
        self.write(msg)?;
        self.flush_and_sync()
    }

    /// Records that everything before `height` is final.
    pub fn write_meta_sync(&self, height: u64) -> Result<(), WalError> {
        let line = encode_meta(&MetaMessage { height })?;
        let mut group = self.lock();
        group.write_line(&line)?;
        group.flush_and_sync()?;
        Ok(())
    }

    pub fn flush_and_sync(&self) -> Result<(), WalError> {
        self.lock().flush_and_sync()?;
        Ok(())
    }

    /// Finds the marker for `height` and returns a reader positioned right
    /// after it.
    pub fn search_for_height(
        &self,
        height: u64,
        options: SearchOptions,
    ) -> Result<Option<SearchReader>, WalError> {
        let mut group = self.lock();
        group.flush()?;

        let mut min = i64::from(group.min_index());
        let mut max = i64::from(group.max_index());
        let mut mode = options.mode;
        // Backwards offset from max: 0, -1, -2, -4, ...
        let mut backoff: i64 = 0;
        // Forward offset for segments without any marker.
        let mut idxoff: i64 = 0;

        tracing::debug!(height, min, max, "Searching WAL for height");

        'outer: while min <= max {
            let index = match mode {
                SearchMode::Backwards => {
                    let index = max + backoff + idxoff;
                    if index > max {
                        idxoff = 0;
                        max = max + backoff - 1;
                        backoff = if backoff == 0 { -1 } else { backoff * 2 };
                        continue;
                    }
                    if index < min {
                        backoff = 0;
                        idxoff = 0;
                        mode = SearchMode::Binary;
                        continue;
                    }
                    index
                }
                SearchMode::Binary => {
                    let mid = (min + max + 1) / 2;
                    let index = mid + idxoff;
                    if index > max {
                        idxoff = 0;
                        max = mid - 1;
                        continue;
                    }
                    index
                }
            };

            let segment = index as u32;
            let reader: Box<dyn BufRead + Send> =
                Box::new(BufReader::new(group.reader(segment, Some(segment + 1))?));
            let mut dec = WalReader::new(reader, self.config.max_msg_size);

            loop {
                let meta = match dec.read_raw() {
                    Ok(None) => {
                        idxoff += 1;
                        continue 'outer;
                    }
                    Ok(Some(RawFrame::Meta(meta))) => meta,
                    Ok(Some(RawFrame::Message(_))) => continue,
                    Err(e) if options.ignore_data_corruption && e.is_data_corruption() => {
                        tracing::warn!(error = %e, segment, "Skipping corrupted WAL entry");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if height < meta.height {
                    // Target is in an earlier segment.
                    idxoff = 0;
                    match mode {
                        SearchMode::Backwards => {
                            if backoff == 0 {
                                max -= 1;
                                backoff = -1;
                            } else {
                                max += backoff;
                                backoff *= 2;
                            }
                            if max + backoff * 2 <= min {
                                backoff = 0;
                                mode = SearchMode::Binary;
                            }
                        }
                        SearchMode::Binary => max = (min + max + 1) / 2 - 1,
                    }
                    continue 'outer;
                } else if height == meta.height {
                    tracing::debug!(height, segment, "Found WAL height marker");
                    // Reopen over the remaining segments, positioned after
                    // the marker.
                    drop(dec);
                    return self.reader_after_marker(&group, segment, height).map(Some);
                } else {
                    match mode {
                        SearchMode::Backwards if backoff != 0 => {
                            idxoff = 0;
                            backoff = 0;
                            min = index;
                            mode = SearchMode::Binary;
                            continue 'outer;
                        }
                        SearchMode::Binary if index < max => {
                            idxoff = 0;
                            min = index;
                            continue 'outer;
                        }
                        // Later in this segment.
                        _ => continue,
                    }
                }
            }
        }
        Ok(None)
    }

    /// Reader over `segment..` positioned just after the marker for `height`.
    fn reader_after_marker(
        &self,
        group: &Group,
        segment: u32,
        height: u64,
    ) -> Result<SearchReader, WalError> {
        let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(group.reader(segment, None)?));
        let mut dec = WalReader::new(reader, self.config.max_msg_size);
        loop {
            match dec.read_raw() {
                Ok(Some(RawFrame::Meta(meta))) if meta.height == height => return Ok(dec),
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(WalError::corruption(format!(
                        "height marker {height} vanished from segment {segment}"
                    )))
                }
                // Already reported during the search.
                Err(e) if e.is_data_corruption() => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawns the periodic flush, which also rotates and trims segments.
    /// Runs until `cancel` fires, then flushes one last time.
    pub fn spawn_flush_task(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let group = Arc::clone(&self.group);
        let period = self.config.flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let mut group = group.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Err(error) = group.check_limits().and_then(|_| group.flush_and_sync()) {
                            tracing::error!(%error, "Periodic WAL flush failed");
                        }
                    }
                }
            }
            let mut group = group.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(error) = group.flush_and_sync() {
                tracing::error!(%error, "Final WAL flush failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn reader(bytes: Vec<u8>) -> WalReader<Cursor<Vec<u8>>> {
        WalReader::new(Cursor::new(bytes), DEFAULT_MAX_MSG_SIZE)
    }

    fn line(msg: &str) -> Vec<u8> {
        let timed = TimedWalMessage {
            time: Timestamp(7),
            msg: msg.to_string(),
        };
        let mut line = encode_message(&timed, DEFAULT_MAX_MSG_SIZE).unwrap();
        line.push(b'\n');
        line
    }

    #[test]
    fn frames_decode_in_order() {
        let mut bytes = encode_meta(&MetaMessage { height: 3 }).unwrap();
        bytes.push(b'\n');
        bytes.extend(line("hello"));
        assert_eq!(&bytes[..8], b"#{\"h\":3}");

        let mut rd = reader(bytes);
        assert_matches!(
            rd.read_frame::<String>().unwrap(),
            Some(WalFrame::Meta(MetaMessage { height: 3 }))
        );
        assert_matches!(
            rd.read_frame::<String>().unwrap(),
            Some(WalFrame::Message(TimedWalMessage { time: Timestamp(7), msg })) if msg == "hello"
        );
        assert_matches!(rd.read_frame::<String>().unwrap(), None);
    }

    #[rstest::rstest]
    #[case::empty_line(b"\n".to_vec())]
    #[case::not_base64(b"!!!!\n".to_vec())]
    #[case::too_short(b"AAAA\n".to_vec())]
    fn malformed_lines_are_corruption(#[case] bytes: Vec<u8>) {
        let err = reader(bytes).read_frame::<String>().unwrap_err();
        assert!(err.is_data_corruption(), "{err}");
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut raw = base64::decode_config(
            line("payload").strip_suffix(b"\n").unwrap(),
            base64::STANDARD_NO_PAD,
        )
        .unwrap();
        let last = raw.len() - 2;
        raw[last] ^= 0x01;
        let mut bytes = base64::encode_config(raw, base64::STANDARD_NO_PAD).into_bytes();
        bytes.push(b'\n');

        let err = reader(bytes).read_frame::<String>().unwrap_err();
        assert_matches!(err, WalError::DataCorruption(msg) if msg.contains("checksums"));
    }

    #[test]
    fn torn_tail_reads_as_end_of_log() {
        let mut bytes = line("complete");
        let torn = line("torn");
        bytes.extend_from_slice(&torn[..torn.len() / 2]);

        let mut rd = reader(bytes);
        assert_matches!(rd.read_frame::<String>().unwrap(), Some(WalFrame::Message(_)));
        assert_matches!(rd.read_frame::<String>().unwrap(), None);
    }

    #[test]
    fn oversized_message_is_refused() {
        let timed = TimedWalMessage {
            time: Timestamp(0),
            msg: "x".repeat(100),
        };
        assert_matches!(
            encode_message(&timed, 50),
            Err(WalError::MessageTooBig { max: 50, .. })
        );
    }
}
