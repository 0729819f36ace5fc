//! A group of append-only files behind a single head path.
//!
//! ```text
//! dir/
//!   wal.000   first rotated segment
//!   wal.001   second rotated segment
//!   wal       head, written to
//! ```
//!
//! The head is rotated into the next index once it grows past
//! [GroupConfig::head_size_limit]. Segments are never rewritten. Once the
//! group grows past [GroupConfig::total_size_limit] the oldest segments are
//! removed, a few at a time.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound on segments removed per size check.
const MAX_FILES_TO_REMOVE: u32 = 4;
const HEAD_BUFFER_SIZE: usize = 40 * 1024;

#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Rotate the head once it reaches this many bytes. Zero disables
    /// rotation.
    pub head_size_limit: u64,
    /// Remove old segments once the group exceeds this many bytes. Zero
    /// disables removal.
    pub total_size_limit: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            head_size_limit: 10 * 1024 * 1024,
            total_size_limit: 1024 * 1024 * 1024,
        }
    }
}

impl GroupConfig {
    pub fn with_head_size_limit(mut self, limit: u64) -> Self {
        self.head_size_limit = limit;
        self
    }

    pub fn with_total_size_limit(mut self, limit: u64) -> Self {
        self.total_size_limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Index of the oldest segment, including the head.
    pub min_index: u32,
    /// Index of the head.
    pub max_index: u32,
    pub total_size: u64,
    pub head_size: u64,
}

pub struct Group {
    head_path: PathBuf,
    head: BufWriter<File>,
    info: GroupInfo,
    config: GroupConfig,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("head_path", &self.head_path)
            .field("info", &self.info)
            .finish()
    }
}

fn open_head(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::with_capacity(HEAD_BUFFER_SIZE, file))
}

pub(crate) fn path_for_index(head_path: &Path, index: u32, max_index: u32) -> PathBuf {
    if index == max_index {
        return head_path.to_path_buf();
    }
    let mut name = head_path.as_os_str().to_owned();
    name.push(format!(".{index:03}"));
    PathBuf::from(name)
}

impl Group {
    pub fn open(head_path: impl Into<PathBuf>, config: GroupConfig) -> io::Result<Self> {
        let head_path = head_path.into();
        if let Some(dir) = head_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let head = open_head(&head_path)?;
        let info = read_group_info(&head_path)?;
        tracing::debug!(path = %head_path.display(), ?info, "Opened file group");
        Ok(Self {
            head_path,
            head,
            info,
            config,
        })
    }

    pub fn head_path(&self) -> &Path {
        &self.head_path
    }

    pub fn info(&self) -> GroupInfo {
        self.info
    }

    pub fn min_index(&self) -> u32 {
        self.info.min_index
    }

    pub fn max_index(&self) -> u32 {
        self.info.max_index
    }

    pub fn total_size(&self) -> u64 {
        self.info.total_size
    }

    pub fn head_size(&self) -> u64 {
        self.info.head_size
    }

    /// Buffered write of `line` plus a newline. The head is rotated afterwards
    /// if it crossed the size limit, so a line never spans two segments.
    pub fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.head.write_all(line)?;
        self.head.write_all(b"\n")?;
        let written = line.len() as u64 + 1;
        self.info.total_size += written;
        self.info.head_size += written;

        if self.config.head_size_limit > 0 && self.info.head_size >= self.config.head_size_limit {
            self.rotate()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.head.flush()
    }

    pub fn flush_and_sync(&mut self) -> io::Result<()> {
        self.head.flush()?;
        self.head.get_ref().sync_all()
    }

    /// Moves the head to the next segment index and starts a fresh head.
    pub fn rotate(&mut self) -> io::Result<()> {
        self.flush_and_sync()?;
        let rotated = path_for_index(&self.head_path, self.info.max_index, self.info.max_index + 1);
        fs::rename(&self.head_path, &rotated)?;
        self.head = open_head(&self.head_path)?;
        self.info.head_size = 0;
        self.info.max_index += 1;
        tracing::debug!(segment = %rotated.display(), "Rotated file group head");
        self.ensure_total_size_limit();
        Ok(())
    }

    fn ensure_total_size_limit(&mut self) {
        let limit = self.config.total_size_limit;
        if limit == 0 {
            return;
        }
        for _ in 0..MAX_FILES_TO_REMOVE {
            let index = self.info.min_index;
            if self.info.total_size < limit || index == self.info.max_index {
                return;
            }
            let path = path_for_index(&self.head_path, index, self.info.max_index);
            match fs::metadata(&path).and_then(|m| fs::remove_file(&path).map(|_| m.len())) {
                Ok(size) => {
                    self.info.total_size = self.info.total_size.saturating_sub(size);
                    tracing::debug!(segment = %path.display(), "Removed old segment");
                }
                Err(error) => {
                    tracing::warn!(segment = %path.display(), %error, "Failed to remove old segment");
                }
            }
            self.info.min_index = index + 1;
        }
    }

    /// Periodic housekeeping: flush, rotate an oversized head and enforce the
    /// total size limit.
    pub fn check_limits(&mut self) -> io::Result<()> {
        self.flush()?;
        if self.config.head_size_limit > 0 && self.info.head_size >= self.config.head_size_limit {
            self.rotate()?;
        }
        self.ensure_total_size_limit();
        Ok(())
    }

    /// Reader over segments `start..end`, or `start..=max_index` when `end`
    /// is `None`. Buffered head data is not visible until flushed.
    pub fn reader(&self, start: u32, end: Option<u32>) -> io::Result<GroupReader> {
        GroupReader::new(self.head_path.clone(), start, end, self.info.max_index)
    }
}

fn read_group_info(head_path: &Path) -> io::Result<GroupInfo> {
    let dir = match head_path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let head_name = head_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut min: Option<u32> = None;
    let mut max: Option<u32> = None;
    let mut total_size = 0;
    let mut head_size = 0;

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == head_name {
            head_size = entry.metadata()?.len();
            total_size += head_size;
            continue;
        }
        let Some(suffix) = name
            .strip_prefix(&head_name)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        if suffix.len() < 3 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(index) = suffix.parse::<u32>() else {
            continue;
        };
        total_size += entry.metadata()?.len();
        min = Some(min.map_or(index, |m| m.min(index)));
        max = Some(max.map_or(index, |m| m.max(index)));
    }

    let (min_index, max_index) = match (min, max) {
        (Some(min), Some(max)) => (min, max + 1),
        _ => (0, 0),
    };
    Ok(GroupInfo {
        min_index,
        max_index,
        total_size,
        head_size,
    })
}

/// Reads a range of segments as one continuous byte stream.
pub struct GroupReader {
    head_path: PathBuf,
    cur_index: u32,
    end_index: u32,
    max_index: u32,
    cur: Option<BufReader<File>>,
}

impl GroupReader {
    fn new(head_path: PathBuf, start: u32, end: Option<u32>, max_index: u32) -> io::Result<Self> {
        let end_index = end.unwrap_or(max_index + 1).min(max_index + 1);
        let mut reader = Self {
            head_path,
            cur_index: start,
            end_index,
            max_index,
            cur: None,
        };
        if start < end_index {
            reader.open_current()?;
        }
        Ok(reader)
    }

    pub fn cur_index(&self) -> u32 {
        self.cur_index
    }

    fn open_current(&mut self) -> io::Result<()> {
        let path = path_for_index(&self.head_path, self.cur_index, self.max_index);
        self.cur = Some(BufReader::new(File::open(path)?));
        Ok(())
    }
}

impl Read for GroupReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let Some(cur) = self.cur.as_mut() else {
                return Ok(0);
            };
            let n = cur.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.cur = None;
            if self.cur_index + 1 >= self.end_index {
                return Ok(0);
            }
            self.cur_index += 1;
            self.open_current()?;
        }
    }
}
