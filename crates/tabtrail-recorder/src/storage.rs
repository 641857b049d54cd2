//! Workflow storage - one JSON lines file per workflow
//!
//! ```text
//! {"type":"header","id":"…","name":"login","origin":"https://app.test","created_at":"…","version":1}
//! {"type":"step","index":1,"action":"click","locators":[…],"captured_at":"…"}
//! {"type":"step","index":2,…}
//! {"type":"sealed","steps":2,"at":"…"}
//! ```
//!
//! Files are append-only while recording and read-only once sealed. A crash
//! mid-write leaves at most one torn trailing line, which loading skips and the
//! next append truncates away.

use crate::events::{ActionRecord, Workflow, WORKFLOW_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tabtrail_core::config::StorageConfig;
use tabtrail_core::{Error, ErrorCode, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    id: String,
    name: String,
    origin: String,
    created_at: DateTime<Utc>,
    /// Files written before versioning carry no version
    #[serde(default)]
    version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Line {
    Header(Header),
    Step(ActionRecord),
    Sealed { steps: usize, at: DateTime<Utc> },
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub steps: usize,
    pub sealed: bool,
}

/// A workflow as found on disk
#[derive(Debug, Clone)]
pub struct StoredWorkflow {
    pub workflow: Workflow,
    pub sealed: bool,
}

impl StoredWorkflow {
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.workflow.id.clone(),
            name: self.workflow.name.clone(),
            origin: self.workflow.origin.clone(),
            created_at: self.workflow.created_at,
            steps: self.workflow.steps.len(),
            sealed: self.sealed,
        }
    }
}

pub struct WorkflowStore {
    dir: PathBuf,
}

impl WorkflowStore {
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::with_dir(config.resolve_dir()?)
    }

    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize(id)))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.file(id).exists()
    }

    /// Write the header (and any steps the workflow already has)
    pub fn create(&self, workflow: &Workflow) -> Result<PathBuf> {
        let path = self.file(&workflow.id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("cannot create {}: {}", path.display(), e)))?;
        let mut w = BufWriter::new(file);

        write_line(
            &mut w,
            &Line::Header(Header {
                id: workflow.id.clone(),
                name: workflow.name.clone(),
                origin: workflow.origin.clone(),
                created_at: workflow.created_at,
                version: workflow.version,
            }),
        )?;
        for step in &workflow.steps {
            write_line(&mut w, &Line::Step(step.clone()))?;
        }
        w.flush()?;
        w.get_ref().sync_data()?;

        tracing::info!(id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(path)
    }

    /// Append one record. Fails on a sealed workflow.
    pub fn append(&self, id: &str, record: &ActionRecord) -> Result<()> {
        let path = self.writable(id)?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        let mut line = serde_json::to_vec(&Line::Step(record.clone()))?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        tracing::debug!(id, index = record.index, action = %record.action, "step appended");
        Ok(())
    }

    /// Mark the workflow complete. Sealing twice is a no-op.
    pub fn seal(&self, id: &str) -> Result<WorkflowSummary> {
        let stored = self.load_stored(id)?;
        if stored.sealed {
            return Ok(stored.summary());
        }
        let path = self.writable(id)?;
        let mut file = OpenOptions::new().append(true).open(&path)?;
        let steps = stored.workflow.steps.len();
        let mut line = serde_json::to_vec(&Line::Sealed { steps, at: Utc::now() })?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;

        tracing::info!(id, steps, "workflow sealed");
        Ok(StoredWorkflow {
            sealed: true,
            ..stored
        }
        .summary())
    }

    pub fn load(&self, id: &str) -> Result<Workflow> {
        Ok(self.load_stored(id)?.workflow)
    }

    pub fn load_stored(&self, id: &str) -> Result<StoredWorkflow> {
        let path = self.file(id);
        if !path.exists() {
            return Err(Error::workflow_not_found(id));
        }
        read_workflow(&path)
    }

    /// Summaries of every readable workflow, oldest first
    pub fn list(&self) -> Result<Vec<WorkflowSummary>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            match read_workflow(&path) {
                Ok(stored) => out.push(stored.summary()),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable workflow"
                ),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.file(id);
        if !path.exists() {
            return Err(Error::workflow_not_found(id));
        }
        fs::remove_file(path)?;
        tracing::info!(id, "workflow deleted");
        Ok(())
    }

    /// Path of an unsealed workflow, with any torn trailing line cut off
    fn writable(&self, id: &str) -> Result<PathBuf> {
        let path = self.file(id);
        if !path.exists() {
            return Err(Error::workflow_not_found(id));
        }
        let content = fs::read(&path)?;
        let keep = content.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
        if keep < content.len() {
            tracing::warn!(id, dropped = content.len() - keep, "truncating torn trailing line");
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(keep as u64)?;
            file.sync_data()?;
        }
        let last = content[..keep]
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .last()
            .and_then(|l| serde_json::from_slice::<Line>(l).ok());
        if let Some(Line::Sealed { .. }) = last {
            return Err(Error::invalid_state(format!("workflow {} is sealed", id)));
        }
        Ok(path)
    }
}

fn write_line<W: Write>(w: &mut W, line: &Line) -> Result<()> {
    serde_json::to_writer(&mut *w, line)?;
    writeln!(w)?;
    Ok(())
}

fn read_workflow(path: &Path) -> Result<StoredWorkflow> {
    let content = fs::read(path)?;
    let complete = content.last() == Some(&b'\n');
    let lines: Vec<&[u8]> = content
        .split(|b| *b == b'\n')
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        .collect();

    let mut parsed = Vec::with_capacity(lines.len());
    for (i, raw) in lines.iter().enumerate() {
        match serde_json::from_slice::<Line>(raw) {
            Ok(line) => parsed.push(line),
            Err(_) if i + 1 == lines.len() && !complete => {
                tracing::warn!(path = %path.display(), "ignoring torn trailing line");
            }
            Err(e) => {
                return Err(Error::storage(format!("{}:{}: {}", path.display(), i + 1, e)));
            }
        }
    }

    let mut parsed = parsed.into_iter();
    let header = match parsed.next() {
        Some(Line::Header(h)) => migrate(h)?,
        _ => return Err(Error::storage(format!("{}: missing header", path.display()))),
    };

    let mut workflow = Workflow {
        id: header.id,
        name: header.name,
        created_at: header.created_at,
        origin: header.origin,
        version: header.version,
        steps: Vec::new(),
    };
    let mut sealed = false;
    for line in parsed {
        match line {
            Line::Step(record) if !sealed => workflow.push(record)?,
            Line::Sealed { .. } => sealed = true,
            _ => {
                return Err(Error::storage(format!(
                    "{}: unexpected line after seal",
                    path.display()
                )))
            }
        }
    }
    Ok(StoredWorkflow { workflow, sealed })
}

/// Bring an older header up to the current schema
fn migrate(mut header: Header) -> Result<Header> {
    if header.version > WORKFLOW_VERSION {
        return Err(Error::new(
            ErrorCode::UnsupportedVersion,
            format!(
                "workflow {} has schema version {}, newest supported is {}",
                header.id, header.version, WORKFLOW_VERSION
            ),
        )
        .with_suggestions(vec!["Upgrade tabtrail to read this workflow".to_string()]));
    }
    if header.version == 0 {
        // unversioned files share the v1 layout
        header.version = 1;
    }
    Ok(header)
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Modifiers;
    use tempfile::TempDir;

    fn store() -> (TempDir, WorkflowStore) {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::with_dir(dir.path()).unwrap();
        (dir, store)
    }

    fn sample() -> Workflow {
        let mut wf = Workflow::new("checkout", "https://shop.test");
        wf.push(ActionRecord::navigate(1, "https://shop.test/cart")).unwrap();
        wf.push(ActionRecord::keypress(2, vec![], "Enter", Modifiers::NONE)).unwrap();
        wf
    }

    #[test]
    fn round_trip_keeps_order() {
        let (_dir, store) = store();
        let mut wf = sample();
        store.create(&wf).unwrap();
        let third = ActionRecord::input(3, vec![], "42");
        store.append(&wf.id, &third).unwrap();
        wf.push(third).unwrap();
        store.seal(&wf.id).unwrap();

        let stored = store.load_stored(&wf.id).unwrap();
        assert!(stored.sealed);
        assert_eq!(stored.workflow, wf);
    }

    #[test]
    fn sealed_is_read_only() {
        let (_dir, store) = store();
        let wf = sample();
        store.create(&wf).unwrap();
        let summary = store.seal(&wf.id).unwrap();
        assert!(summary.sealed);
        assert_eq!(summary.steps, 2);
        assert!(store.seal(&wf.id).unwrap().sealed);

        let err = store.append(&wf.id, &ActionRecord::wait(3, 10)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
    }

    #[test]
    fn torn_trailing_line_is_dropped() {
        let (_dir, store) = store();
        let wf = sample();
        let path = store.create(&wf).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"type":"step","index":3,"act"#).unwrap();

        assert_eq!(store.load(&wf.id).unwrap().steps.len(), 2);

        store.append(&wf.id, &ActionRecord::wait(3, 5)).unwrap();
        let loaded = store.load(&wf.id).unwrap();
        assert_eq!(loaded.steps.len(), 3);
        assert_eq!(loaded.steps[2].index, 3);
    }

    #[test]
    fn torn_multibyte_character_is_dropped() {
        let (_dir, store) = store();
        let wf = sample();
        let path = store.create(&wf).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        // first byte of "é", cut before its continuation byte
        f.write_all(b"{\"type\":\"step\",\"v\":\"caf\xC3").unwrap();
        drop(f);

        assert_eq!(store.load(&wf.id).unwrap().steps.len(), 2);
        assert_eq!(store.list().unwrap().len(), 1);

        let summary = store.seal(&wf.id).unwrap();
        assert!(summary.sealed);
        assert_eq!(summary.steps, 2);
        assert!(store.load_stored(&wf.id).unwrap().sealed);
    }

    #[test]
    fn non_ascii_values_survive() {
        let (_dir, store) = store();
        let wf = sample();
        store.create(&wf).unwrap();
        let typed = ActionRecord::input(3, vec![], "Zoë über café");
        store.append(&wf.id, &typed).unwrap();
        let loaded = store.load(&wf.id).unwrap();
        assert_eq!(loaded.steps[2], typed);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let (_dir, store) = store();
        let wf = sample();
        let path = store.create(&wf).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"garbage\n").unwrap();
        drop(f);
        store.append(&wf.id, &ActionRecord::wait(3, 5)).unwrap();

        let err = store.load(&wf.id).unwrap_err();
        assert_eq!(err.code, ErrorCode::Storage);
    }

    #[test]
    fn newer_versions_are_rejected() {
        let (_dir, store) = store();
        let mut wf = sample();
        wf.version = WORKFLOW_VERSION + 1;
        store.create(&wf).unwrap();
        let err = store.load(&wf.id).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedVersion);
    }

    #[test]
    fn unversioned_files_migrate() {
        let (_dir, store) = store();
        let mut wf = sample();
        wf.version = 0;
        store.create(&wf).unwrap();
        assert_eq!(store.load(&wf.id).unwrap().version, 1);
    }

    #[test]
    fn list_and_delete() {
        let (_dir, store) = store();
        let a = sample();
        let b = Workflow::new("empty", "https://shop.test");
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        fs::write(store.path().join("notes.txt"), "ignored").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|s| s.id == a.id && s.steps == 2 && !s.sealed));

        store.delete(&a.id).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.delete(&a.id).unwrap_err().code, ErrorCode::WorkflowNotFound);
        assert_eq!(store.load("missing").unwrap_err().code, ErrorCode::WorkflowNotFound);
    }
}
