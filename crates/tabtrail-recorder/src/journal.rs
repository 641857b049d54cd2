//! Append-only journal of session mode transitions
//!
//! The coordinator writes one line per transition. On startup the last line
//! per tab tells it which sessions were interrupted.

use crate::protocol::SessionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tabtrail_bus::TabId;
use tabtrail_core::Result;

pub const JOURNAL_FILE: &str = "sessions.journal";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tab: TabId,
    pub mode: SessionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub cursor: usize,
    pub at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(tab: TabId, mode: SessionMode, workflow_id: Option<String>, cursor: usize) -> Self {
        Self {
            tab,
            mode,
            workflow_id,
            cursor,
            at: Utc::now(),
        }
    }
}

pub struct SessionJournal {
    path: PathBuf,
}

impl SessionJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Journal kept next to the workflows
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(dir.as_ref().join(JOURNAL_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &JournalEntry) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        tracing::debug!(tab = %entry.tab, mode = %entry.mode, "journaled");
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read(&self.path)?;
        let mut out = Vec::new();
        for (i, line) in content.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(entry) => out.push(entry),
                Err(e) => tracing::warn!(line = i + 1, error = %e, "skipping torn journal line"),
            }
        }
        Ok(out)
    }

    /// Most recent entry per tab
    pub fn latest(&self) -> Result<BTreeMap<TabId, JournalEntry>> {
        let mut out = BTreeMap::new();
        for entry in self.entries()? {
            out.insert(entry.tab, entry);
        }
        Ok(out)
    }

    /// Replace the history with one line per session still live. The new
    /// journal is written aside and renamed over the old one.
    pub fn compact(&self, live: &[JournalEntry]) -> Result<()> {
        if live.is_empty() && !self.path.exists() {
            return Ok(());
        }
        let tmp = self.path.with_extension("journal.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        for entry in live {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_data()?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(live = live.len(), "journal compacted");
        Ok(())
    }
}
