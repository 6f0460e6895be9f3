use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::entry::EpochEntry;
use crate::error::CheckpointError;

/// Current version of the on-disk checkpoint format.
///
/// Bumped whenever the line-oriented layout in [`CheckpointStore`] changes
/// in a way that is not backwards compatible.
const CURRENT_VERSION: u32 = 0;

/// Reads and atomically rewrites the text checkpoint file that backs an
/// [`crate::EpochCache`]'s epoch history.
///
/// The store itself holds no state beyond the target path: all ordering and
/// write-serialization is the caller's ([`crate::EpochCache`]'s)
/// responsibility.
///
/// File format, LF-terminated ASCII:
///
/// ```text
/// <version>
/// <count>
/// <epoch_0> <start_offset_0>
/// ...
/// ```
#[derive(Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore").field("path", &self.path).finish()
    }
}

impl CheckpointStore {
    /// Create a store rooted at `path`. Does not touch the filesystem; the
    /// file is created lazily on first [`Self::write`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path this store reads from and writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted epoch history.
    ///
    /// A missing file is treated as an empty history. A present but
    /// malformed file fails loudly with [`CheckpointError::CorruptCheckpoint`].
    pub fn read(&self) -> Result<Vec<EpochEntry>, CheckpointError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no checkpoint at {}, starting with empty history", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        self.parse(&contents)
    }

    fn parse(&self, contents: &str) -> Result<Vec<EpochEntry>, CheckpointError> {
        let mut lines = contents.lines();

        let version: u32 = lines
            .next()
            .ok_or_else(|| self.corrupt("missing version line"))?
            .trim()
            .parse()
            .map_err(|_| self.corrupt("version line is not an integer"))?;
        if version != CURRENT_VERSION {
            return Err(self.corrupt(format!("unsupported checkpoint version {version}")));
        }

        let count: usize = lines
            .next()
            .ok_or_else(|| self.corrupt("missing count line"))?
            .trim()
            .parse()
            .map_err(|_| self.corrupt("count line is not an integer"))?;

        let mut entries = Vec::with_capacity(count);
        for (i, line) in lines.by_ref().take(count).enumerate() {
            let mut fields = line.split(' ');
            let epoch = fields
                .next()
                .ok_or_else(|| self.corrupt(format!("entry {i}: missing epoch field")))?;
            let start_offset = fields
                .next()
                .ok_or_else(|| self.corrupt(format!("entry {i}: missing start-offset field")))?;
            if fields.next().is_some() {
                return Err(self.corrupt(format!("entry {i}: expected exactly two fields")));
            }
            let epoch: i32 = epoch
                .parse()
                .map_err(|_| self.corrupt(format!("entry {i}: epoch is not an integer")))?;
            let start_offset: i64 = start_offset
                .parse()
                .map_err(|_| self.corrupt(format!("entry {i}: start offset is not an integer")))?;
            if epoch < 0 {
                return Err(self.corrupt(format!("entry {i}: epoch must be non-negative, got {epoch}")));
            }
            if start_offset < 0 {
                return Err(self.corrupt(format!(
                    "entry {i}: start offset must be non-negative, got {start_offset}"
                )));
            }
            entries.push(EpochEntry::new(epoch, start_offset));
        }

        if entries.len() != count {
            return Err(self.corrupt(format!(
                "declared count {count} but found {} entries",
                entries.len()
            )));
        }
        if lines.next().is_some() {
            return Err(self.corrupt("trailing data after declared entries"));
        }

        Ok(entries)
    }

    /// Atomically replace the checkpoint file with `entries`.
    ///
    /// Serializes to a temporary sibling file, flushes it, then renames it
    /// over the target. Readers observe either the old or the new contents,
    /// never a torn write.
    pub fn write(&self, entries: &[EpochEntry]) -> Result<(), CheckpointError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| self.io_err(e))?;
        {
            let file = tmp.as_file_mut();
            writeln!(file, "{CURRENT_VERSION}").map_err(|e| self.io_err(e))?;
            writeln!(file, "{}", entries.len()).map_err(|e| self.io_err(e))?;
            for entry in entries {
                writeln!(file, "{} {}", entry.epoch, entry.start_offset).map_err(|e| self.io_err(e))?;
            }
            file.flush().map_err(|e| self.io_err(e))?;
            file.sync_all().map_err(|e| self.io_err(e))?;
        }
        tmp.persist(&self.path).map_err(|e| {
            warn!("failed to persist checkpoint to {}: {}", self.path.display(), e.error);
            self.io_err(e.error)
        })?;
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> CheckpointError {
        CheckpointError::CorruptCheckpoint {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn io_err(&self, source: io::Error) -> CheckpointError {
        CheckpointError::IoFailure {
            path: self.path.display().to_string(),
            source,
        }
    }
}
