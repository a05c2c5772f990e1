//! Write-ahead log and snapshots for a single consensus node.
//!
//! Three files in a node-owned directory:
//!
//! ```text
//! {wal_dir}/
//! ├── state.json      # latest (current_term, voted_for), atomic replace
//! ├── log.jsonl       # log suffix, one framed entry per line
//! └── snapshot.json   # latest registry image + last included index/term
//! ```
//!
//! Atomic replacement uses the temp-file + fsync + rename idiom, with a
//! final fsync of the directory so the rename itself is durable. The log is
//! line-framed with self-describing entries so recovery can tail-read it:
//! a torn final write is expected after a crash and is skipped with a
//! warning, and a corrupt line anywhere never terminates recovery of the
//! lines before (or after) it. Unknown command tags decode as `noop` but
//! still consume their index.
//!
//! The directory is exclusively owned by one node process; concurrent use
//! of the same directory by two nodes is undefined.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{now_ms, Command, LogEntry};
use crate::errors::PersistenceError;
use crate::registry::Registry;

const STATE_FILE: &str = "state.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";

// ── On-disk records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DurableState {
    current_term: u64,
    voted_for: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotImage {
    registry: Registry,
    last_included_index: u64,
    last_included_term: u64,
    timestamp_ms: u64,
}

/// Log line with the command kept raw so unknown tags can degrade to noop
/// instead of poisoning the whole entry.
#[derive(Debug, Deserialize)]
struct RawLogEntry {
    term: u64,
    index: u64,
    command: serde_json::Value,
    timestamp_ms: u64,
}

// ── Recovery bundle ───────────────────────────────────────────────────────────

/// Everything a node needs to resume after a crash. `Default` is the fresh
/// node: term 0, no vote, empty log, empty registry.
#[derive(Debug, Default)]
pub struct Recovered {
    pub current_term: u64,
    pub voted_for: Option<String>,
    /// Log suffix with index > `snapshot_index`, in index order.
    pub entries: Vec<LogEntry>,
    pub registry: Registry,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
}

// ── The WAL ───────────────────────────────────────────────────────────────────

/// Handle to one node's persistence directory.
pub struct Wal {
    dir: PathBuf,
    /// Open append handle for the log suffix; reopened after compaction.
    log_file: File,
}

impl Wal {
    /// Open (creating if needed) the node's WAL directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::from_io(display(&dir), e))?;
        let log_file = open_append(&dir.join(LOG_FILE))?;
        Ok(Self { dir, log_file })
    }

    // ── Durable state ─────────────────────────────────────────────────────────

    /// Atomically replace `(current_term, voted_for)`. Returns only once the
    /// bytes are durable; the caller must not send any RPC response that
    /// depends on this state until then.
    pub fn persist_durable_state(
        &self,
        current_term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let record = DurableState {
            current_term,
            voted_for: voted_for.map(|s| s.to_string()),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| malformed(self.dir.join(STATE_FILE), e.to_string()))?;
        atomic_replace(&self.dir, STATE_FILE, &bytes)
    }

    // ── Log suffix ────────────────────────────────────────────────────────────

    /// Append one framed entry with an end-of-write durability boundary.
    pub fn append_entry(&mut self, entry: &LogEntry) -> Result<(), PersistenceError> {
        self.append_entries(std::slice::from_ref(entry))
    }

    /// Append entries as consecutive framed lines, then sync once. On error
    /// nothing may be assumed persisted and the caller must not advance
    /// volatile state that claims otherwise.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), PersistenceError> {
        if entries.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(LOG_FILE);
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| malformed(&path, e.to_string()))?;
            buf.push(b'\n');
        }
        self.log_file
            .write_all(&buf)
            .map_err(|e| PersistenceError::from_io(display(&path), e))?;
        self.log_file
            .sync_data()
            .map_err(|e| PersistenceError::from_io(display(&path), e))?;
        Ok(())
    }

    /// Drop all entries with index greater than `index`, rewriting the
    /// suffix file atomically. Used when a follower must discard a
    /// conflicting suffix before appending the leader's entries.
    pub fn truncate_after(&mut self, index: u64) -> Result<(), PersistenceError> {
        let kept: Vec<LogEntry> = self
            .read_log_lines()?
            .into_iter()
            .filter(|e| e.index <= index)
            .collect();
        self.rewrite_log(&kept)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Persist a self-contained registry image, then compact the log suffix
    /// to entries with index > `last_included_index`.
    ///
    /// Failure is recoverable: on error the prior snapshot and the full log
    /// remain usable.
    pub fn snapshot(
        &mut self,
        registry: &Registry,
        last_included_index: u64,
        last_included_term: u64,
    ) -> Result<(), PersistenceError> {
        let image = SnapshotImage {
            registry: registry.clone(),
            last_included_index,
            last_included_term,
            timestamp_ms: now_ms(),
        };
        let bytes = serde_json::to_vec(&image)
            .map_err(|e| malformed(self.dir.join(SNAPSHOT_FILE), e.to_string()))?;
        atomic_replace(&self.dir, SNAPSHOT_FILE, &bytes)?;

        let kept: Vec<LogEntry> = self
            .read_log_lines()?
            .into_iter()
            .filter(|e| e.index > last_included_index)
            .collect();
        self.rewrite_log(&kept)?;
        debug!(
            last_included_index,
            last_included_term,
            remaining = kept.len(),
            "Snapshot persisted and log compacted"
        );
        Ok(())
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    /// Rebuild node state from disk. Missing files mean a fresh node.
    pub fn recover(&self) -> Result<Recovered, PersistenceError> {
        let mut recovered = Recovered::default();

        let state_path = self.dir.join(STATE_FILE);
        if state_path.exists() {
            let bytes = fs::read(&state_path)
                .map_err(|e| PersistenceError::from_io(display(&state_path), e))?;
            match serde_json::from_slice::<DurableState>(&bytes) {
                Ok(state) => {
                    recovered.current_term = state.current_term;
                    recovered.voted_for = state.voted_for;
                }
                Err(e) => {
                    // A torn state replace means the rename never happened,
                    // so a partial file is unexpected; refuse to guess.
                    return Err(malformed(&state_path, e.to_string()));
                }
            }
        }

        let snapshot_path = self.dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let bytes = fs::read(&snapshot_path)
                .map_err(|e| PersistenceError::from_io(display(&snapshot_path), e))?;
            match serde_json::from_slice::<SnapshotImage>(&bytes) {
                Ok(image) => {
                    recovered.registry = image.registry;
                    recovered.snapshot_index = image.last_included_index;
                    recovered.snapshot_term = image.last_included_term;
                }
                Err(e) => return Err(malformed(&snapshot_path, e.to_string())),
            }
        }

        let snapshot_index = recovered.snapshot_index;
        recovered.entries = self
            .read_log_lines()?
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        Ok(recovered)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Scan the log file line by line. Corrupt lines are skipped with a
    /// warning; a torn final write is expected and never terminates the
    /// scan of earlier lines.
    fn read_log_lines(&self) -> Result<Vec<LogEntry>, PersistenceError> {
        let path = self.dir.join(LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file =
            File::open(&path).map_err(|e| PersistenceError::from_io(display(&path), e))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(path = %path.display(), line = line_no + 1, error = %e,
                        "Unreadable log line; stopping scan");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawLogEntry>(&line) {
                Ok(raw) => entries.push(LogEntry {
                    term: raw.term,
                    index: raw.index,
                    command: Command::from_value_lenient(raw.command),
                    timestamp_ms: raw.timestamp_ms,
                }),
                Err(e) => {
                    warn!(path = %path.display(), line = line_no + 1, error = %e,
                        "Skipping corrupt log line");
                }
            }
        }
        Ok(entries)
    }

    /// Atomically replace the log suffix file and reopen the append handle.
    fn rewrite_log(&mut self, entries: &[LogEntry]) -> Result<(), PersistenceError> {
        let path = self.dir.join(LOG_FILE);
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| malformed(&path, e.to_string()))?;
            buf.push(b'\n');
        }
        atomic_replace(&self.dir, LOG_FILE, &buf)?;
        self.log_file = open_append(&path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, PersistenceError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistenceError::from_io(display(path), e))
}

/// Write `bytes` to `{dir}/{name}` via temp file + fsync + rename + fsync of
/// the directory. The rename-on-success semantic means readers only ever see
/// the old or the new complete file.
fn atomic_replace(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
    let final_path = dir.join(name);
    let tmp_path = dir.join(format!("{}.tmp", name));

    let mut tmp = File::create(&tmp_path)
        .map_err(|e| PersistenceError::from_io(display(&tmp_path), e))?;
    tmp.write_all(bytes)
        .map_err(|e| PersistenceError::from_io(display(&tmp_path), e))?;
    tmp.sync_all()
        .map_err(|e| PersistenceError::from_io(display(&tmp_path), e))?;
    drop(tmp);

    fs::rename(&tmp_path, &final_path)
        .map_err(|e| PersistenceError::from_io(display(&final_path), e))?;

    // Make the rename itself durable.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn malformed(path: impl AsRef<Path>, message: String) -> PersistenceError {
    PersistenceError::Io {
        path: display(path.as_ref()),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, message),
    }
}
