//! driftlog persistence: append-only, per-resource audit files.
//!
//! Each watched resource gets one file, `<root>/<namespace>_<lowercase kind>_<name>`,
//! opened in append mode per entry. An entry is a header line
//! `====<namespace>/<name>==<local timestamp>========` followed by the rendered
//! diff, both terminated by CRLF. Files are never rotated or truncated.

#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local};
use driftlog_core::ResourceIdentity;
use metrics::{counter, histogram};
use tracing::debug;

pub const OUT_DIR_ENV: &str = "DRIFTLOG_OUT_DIR";

/// One detected change, ready to be appended.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub identity: ResourceIdentity,
    pub timestamp: DateTime<Local>,
    pub body: String,
}

impl AuditEntry {
    pub fn new(identity: ResourceIdentity, body: String) -> Self {
        Self { identity, timestamp: Local::now(), body }
    }

    /// `====<namespace>/<name>==<timestamp>========\r\n`
    pub fn header(&self) -> String {
        format!(
            "===={}=={}========\r\n",
            self.identity.namespaced_name(),
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.9f %z")
        )
    }

    /// Header followed by the rendered diff and a trailing CRLF.
    pub fn to_block(&self) -> String {
        let mut s = self.header();
        s.push_str(&self.body);
        s.push_str("\r\n");
        s
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("opening audit file {}", .path.display())]
    Open { path: PathBuf, #[source] source: std::io::Error },
    #[error("appending to audit file {}", .path.display())]
    Write { path: PathBuf, #[source] source: std::io::Error },
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditWriteError>;
}

/// `<root>/<namespace>_<lowercase kind>_<name>`
pub fn audit_path(root: &Path, id: &ResourceIdentity) -> PathBuf {
    root.join(format!("{}_{}_{}", id.namespace, id.kind.to_lowercase(), id.name))
}

/// Audit root from `DRIFTLOG_OUT_DIR`, falling back to the OS temp directory.
pub fn default_root() -> PathBuf {
    match std::env::var_os(OUT_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}

/// Appends each entry to its resource's file, opening and closing per write.
pub struct FileAuditSink {
    root: PathBuf,
}

impl FileAuditSink {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn open_default() -> Self { Self::new(default_root()) }

    pub fn root(&self) -> &Path { &self.root }

    pub fn path_for(&self, id: &ResourceIdentity) -> PathBuf { audit_path(&self.root, id) }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let started = std::time::Instant::now();
        let path = self.path_for(&entry.identity);
        let res = write_block(&path, entry);
        match &res {
            Ok(()) => {
                counter!("audit_write_total", 1u64);
                debug!(path = %path.display(), bytes = entry.body.len(), "audit entry appended");
            }
            Err(_) => { counter!("audit_write_err", 1u64); }
        }
        histogram!("audit_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        res
    }
}

fn write_block(path: &Path, entry: &AuditEntry) -> Result<(), AuditWriteError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AuditWriteError::Open { path: path.to_path_buf(), source })?;
    let wrap = |source: std::io::Error| AuditWriteError::Write { path: path.to_path_buf(), source };
    let mut w = BufWriter::new(file);
    w.write_all(entry.to_block().as_bytes()).map_err(wrap)?;
    w.flush().map_err(wrap)
}

/// Collects entries in memory; handy for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize { self.entries.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl AuditSink for MemorySink {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lowercases_kind_only() {
        let id = ResourceIdentity::new("prod", "Es-Main", "EsCluster");
        let p = audit_path(Path::new("/var/audit"), &id);
        assert_eq!(p, PathBuf::from("/var/audit/prod_escluster_Es-Main"));
    }

    #[test]
    fn header_layout() {
        let entry = AuditEntry::new(ResourceIdentity::new("prod", "es-1", "EsCluster"), "body".into());
        let h = entry.header();
        assert!(h.starts_with("====prod/es-1=="), "h={}", h);
        assert!(h.ends_with("========\r\n"), "h={}", h);
        assert_eq!(entry.to_block(), format!("{}body\r\n", h));
    }

    #[test]
    fn file_sink_appends_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path());
        let id = ResourceIdentity::new("ns", "a", "Redis");
        let first = AuditEntry::new(id.clone(), "one".into());
        let second = AuditEntry::new(id.clone(), "two".into());
        sink.append(&first).unwrap();
        sink.append(&second).unwrap();
        let text = std::fs::read_to_string(sink.path_for(&id)).unwrap();
        assert_eq!(text, format!("{}{}", first.to_block(), second.to_block()));
    }

    #[test]
    fn open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileAuditSink::new(dir.path().join("missing-subdir"));
        let err = sink.append(&AuditEntry::new(ResourceIdentity::new("ns", "a", "K"), "x".into())).unwrap_err();
        assert!(matches!(err, AuditWriteError::Open { .. }));
    }
}
