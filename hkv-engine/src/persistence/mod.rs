//! Durable persistence: an append log of mutations plus periodic snapshots
//! (spec §4.6). Both are pluggable at this module boundary; only the
//! `Memory`-backend append log and snapshot implementations described here
//! ship in the core (`storage.backend` values other than `memory` are
//! accepted by configuration and rejected at engine construction, per
//! SPEC_FULL.md §2.3).

pub mod append_log;
pub mod manager;
pub mod snapshot;

pub use append_log::{AppendLogWriter, LogOp, LogRecord};
pub use manager::PersistenceManager;
pub use snapshot::{SnapshotHeader, SnapshotReader, SnapshotWriter};

use std::fs;
use std::path::{Path, PathBuf};

use hkv_common::config::FsyncPolicy;
use hkv_common::HkvResult;

/// Parses the numeric suffix out of `<prefix>-<N>.<ext>`, used to find the
/// newest snapshot and the active append-log segment.
fn newest_numbered_file(dir: &Path, prefix: &str, ext: &str) -> HkvResult<Option<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let rest = match name.strip_prefix(prefix).and_then(|r| r.strip_prefix('-')) {
            Some(r) => r,
            None => continue,
        };
        let rest = match rest.strip_suffix(ext) {
            Some(r) => r,
            None => continue,
        };
        if let Ok(n) = rest.parse::<u64>() {
            if best.as_ref().map(|(best_n, _)| n > *best_n).unwrap_or(true) {
                best = Some((n, entry.path()));
            }
        }
    }
    Ok(best)
}

pub fn latest_snapshot(data_dir: &Path) -> HkvResult<Option<(u64, PathBuf)>> {
    newest_numbered_file(data_dir, "snapshot", ".snap")
}

pub fn latest_append_log(data_dir: &Path) -> HkvResult<Option<(u64, PathBuf)>> {
    newest_numbered_file(data_dir, "appendlog", ".log")
}

pub fn snapshot_path(data_dir: &Path, seq: u64) -> PathBuf {
    data_dir.join(format!("snapshot-{seq}.snap"))
}

pub fn append_log_path(data_dir: &Path, seq: u64) -> PathBuf {
    data_dir.join(format!("appendlog-{seq}.log"))
}

/// Writes `contents` to `final_path` via a temporary file that is then
/// renamed atomically into place (spec §4.6 "Persisted state layout").
pub fn write_atomic(final_path: &Path, contents: &[u8]) -> HkvResult<()> {
    let tmp_path = final_path.with_extension(format!(
        "{}.tmp",
        final_path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, final_path)?;
    Ok(())
}

/// Reconciles a directory's durability policy name with the engine's fsync
/// behavior; kept here rather than in `hkv-common` since only the
/// persistence layer acts on it.
pub fn fsync_every_write(policy: FsyncPolicy) -> bool {
    matches!(policy, FsyncPolicy::Always)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn finds_newest_numbered_snapshot() {
        let dir = tempfile_dir();
        File::create(dir.join("snapshot-1.snap")).unwrap();
        File::create(dir.join("snapshot-7.snap")).unwrap();
        File::create(dir.join("snapshot-3.snap")).unwrap();
        let (seq, path) = latest_snapshot(&dir).unwrap().unwrap();
        assert_eq!(seq, 7);
        assert_eq!(path, dir.join("snapshot-7.snap"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_dir_yields_none() {
        let dir = PathBuf::from("/nonexistent/hyperkv-test-dir-xyz");
        assert!(latest_snapshot(&dir).unwrap().is_none());
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "hyperkv-test-{}-{}",
            std::process::id(),
            dir_nonce()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn dir_nonce() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NONCE: AtomicU64 = AtomicU64::new(0);
        NONCE.fetch_add(1, Ordering::Relaxed)
    }
}
