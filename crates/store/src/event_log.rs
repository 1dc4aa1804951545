//! Append-only per-run event log.
//!
//! Each run gets an `events.ndjson` file: one JSON event per line,
//! append-only, flushed per record. Appends are serialized by a file
//! lock; a failed append is retried once before the error is surfaced
//! (the run store reacts by pausing the run).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use ag_domain::error::{Error, Result};
use ag_domain::Event;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pagination
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One page of events, oldest first. `before` of the next request is
/// the `cursor` of this page.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Position of the first returned event; pass as `before` to fetch
    /// the preceding page.
    pub cursor: u64,
    /// True iff entries older than this page exist.
    pub has_more: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventLog {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl EventLog {
    /// Open (or create) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Retries once on a write failure with a fresh
    /// file handle before giving up.
    pub fn append(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;

        let mut guard = self.writer.lock();
        match Self::write_line(&mut guard, &self.path, &line) {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %first,
                    "event log append failed; retrying once"
                );
                *guard = None; // force reopen
                Self::write_line(&mut guard, &self.path, &line).map_err(|e| {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %e,
                        "event log append failed after retry"
                    );
                    Error::Io(e)
                })
            }
        }
    }

    fn write_line(
        writer: &mut Option<File>,
        path: &Path,
        line: &str,
    ) -> std::io::Result<()> {
        if writer.is_none() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *writer = Some(OpenOptions::new().create(true).append(true).open(path)?);
        }
        let file = writer.as_mut().unwrap();
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }

    /// Fsync the log to disk (used at shutdown).
    pub fn sync(&self) {
        if let Some(file) = self.writer.lock().as_ref() {
            let _ = file.sync_data();
        }
    }

    /// Read the full log, oldest first. Malformed lines are skipped
    /// with a warning so a torn final write cannot poison replay.
    pub fn read_all(&self) -> Result<Vec<Event>> {
        read_events(&self.path)
    }

    /// Read up to `limit` events ending just before `before`
    /// (a position cursor; `None` = from the tail). Events in the page
    /// are oldest first.
    pub fn read_before(&self, before: Option<u64>, limit: usize) -> Result<EventPage> {
        let all = self.read_all()?;
        let end = match before {
            Some(pos) => (pos as usize).min(all.len()),
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(EventPage {
            events: all[start..end].to_vec(),
            cursor: start as u64,
            has_more: start > 0,
        })
    }
}

/// Read events from an NDJSON file, skipping malformed lines.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed event line");
            }
        }
    }
    Ok(events)
}
