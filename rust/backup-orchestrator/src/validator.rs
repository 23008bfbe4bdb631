//! Post-hoc validation of completed backups.
//!
//! A validation never touches the backup record it checks. Its outcome is a
//! separate [`BackupValidation`] record; overall pass requires the snapshot
//! to exist, sane metadata, a file count within margin of the source, zero
//! failed spot checks, and a passing integrity check when one is requested.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_adapter::{BackupTool, CheckOptions, NodeType, ResticConfig, Snapshot, SnapshotFile};
use chrono::{DateTime, Duration, Utc};

use crate::config::ValidationConfig;
use crate::database::ValidationStore;
use crate::domain::{Backup, BackupValidation, BackupValidationDetails, SpotCheckResult};
use crate::error::{OrchestratorError, Result, StoreResultExt};

/// Tolerated clock skew for snapshot timestamps, in hours.
const MAX_FUTURE_SKEW_HOURS: i64 = 1;
/// A fresh backup's snapshot cannot be older than this many hours.
const MAX_SNAPSHOT_AGE_HOURS: i64 = 24;
/// With no source baseline, this many incidental files still pass.
const EMPTY_SOURCE_TOLERANCE: u64 = 10;

/// Validates snapshots against their source paths.
pub struct BackupValidator {
    tool: Arc<dyn BackupTool>,
    store: Arc<dyn ValidationStore>,
    config: ValidationConfig,
}

impl std::fmt::Debug for BackupValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackupValidator {
    #[must_use]
    pub fn new(
        tool: Arc<dyn BackupTool>,
        store: Arc<dyn ValidationStore>,
        config: ValidationConfig,
    ) -> Self {
        Self { tool, store, config }
    }

    /// Validate `backup` (which must have a snapshot) against `source_paths`.
    ///
    /// Check failures and backup tool errors are recorded on the returned
    /// validation.
    ///
    /// # Errors
    ///
    /// Store failures, or a backup without a snapshot id.
    pub async fn validate_backup(
        &self,
        backup: &Backup,
        repo: &ResticConfig,
        source_paths: &[String],
    ) -> Result<BackupValidation> {
        let snapshot_id = backup.snapshot_id.clone().ok_or_else(|| {
            OrchestratorError::Internal(format!("backup {} has no snapshot to validate", backup.id))
        })?;

        let mut validation = BackupValidation::start(backup.id, backup.repository_id, &snapshot_id);
        self.store.create_validation(&validation).await.store_err()?;

        let mut details = BackupValidationDetails::default();
        let error = self
            .run_checks(repo, &snapshot_id, source_paths, &mut details)
            .await
            .err()
            .map(|e| e.to_string());
        validation.finish(details, error);

        self.store.update_validation(&validation).await.store_err()?;

        if validation.passed() {
            tracing::info!(backup_id = %backup.id, snapshot_id = %snapshot_id, "Backup validation passed");
        } else {
            tracing::warn!(
                backup_id = %backup.id,
                snapshot_id = %snapshot_id,
                error = validation.error_message.as_deref().unwrap_or("checks failed"),
                "Backup validation failed"
            );
        }
        Ok(validation)
    }

    async fn run_checks(
        &self,
        repo: &ResticConfig,
        snapshot_id: &str,
        source_paths: &[String],
        details: &mut BackupValidationDetails,
    ) -> Result<()> {
        let snapshots = self.tool.snapshots(repo).await?;
        let Some(snapshot) = snapshots.iter().find(|s| s.matches_id(snapshot_id)) else {
            return Ok(());
        };
        details.snapshot_found = true;

        details.metadata_issues = metadata_issues(snapshot, Utc::now());
        details.metadata_valid = details.metadata_issues.is_empty();

        let files: Vec<SnapshotFile> = self
            .tool
            .list_files(repo, snapshot_id, None)
            .await?
            .into_iter()
            .filter(|f| f.node_type == NodeType::File)
            .collect();

        let sources: Vec<PathBuf> = source_paths.iter().map(PathBuf::from).collect();
        let walk_roots = sources.clone();
        details.expected_file_count = tokio::task::spawn_blocking(move || count_source_files(&walk_roots))
            .await
            .map_err(|e| OrchestratorError::Internal(format!("source walk failed: {e}")))?;
        details.actual_file_count = files.len() as u64;
        details.file_count_within_margin = file_count_within_margin(
            details.expected_file_count,
            details.actual_file_count,
            self.config.file_count_margin,
        );

        for file in pick_spot_checks(&files, self.config.spot_check_count) {
            let result = spot_check(file, &sources).await;
            if result.passed {
                details.spot_checks_passed += 1;
            } else {
                details.spot_checks_failed += 1;
            }
            details.spot_checks.push(result);
        }

        if self.config.run_integrity_check {
            details.integrity_passed = Some(match self.tool.check(repo, &CheckOptions::default()).await {
                Ok(result) => result.success,
                Err(e) => {
                    tracing::warn!(snapshot_id, error = %e, "Integrity check could not run");
                    false
                }
            });
        }
        Ok(())
    }
}

/// Problems with a snapshot's recorded metadata, relative to `now`.
#[must_use]
pub fn metadata_issues(snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<String> {
    let mut issues = Vec::new();
    if snapshot.time.timestamp() == 0 {
        issues.push("snapshot has no timestamp".to_string());
    } else if snapshot.time > now + Duration::hours(MAX_FUTURE_SKEW_HOURS) {
        issues.push(format!("snapshot time {} is in the future", snapshot.time));
    } else if snapshot.time < now - Duration::hours(MAX_SNAPSHOT_AGE_HOURS) {
        issues.push(format!("snapshot time {} is older than 24 hours", snapshot.time));
    }
    if snapshot.paths.is_empty() {
        issues.push("snapshot records no paths".to_string());
    }
    issues
}

/// Whether `actual` is within `margin` (a fraction) of `expected`.
///
/// With nothing expected, a handful of incidental files still pass.
#[must_use]
pub fn file_count_within_margin(expected: u64, actual: u64, margin: f64) -> bool {
    if expected == 0 {
        return actual <= EMPTY_SOURCE_TOLERANCE;
    }
    #[allow(clippy::cast_precision_loss, reason = "file counts are far below 2^52")]
    let deviation = actual.abs_diff(expected) as f64 / expected as f64;
    deviation <= margin
}

/// Regular files under `roots`, symlinks not followed. Unreadable entries are skipped.
///
/// A root nested inside another root is walked once, as part of the outer one.
#[must_use]
pub fn count_source_files(roots: &[PathBuf]) -> u64 {
    outermost_roots(roots)
        .into_iter()
        .flat_map(|root| walkdir::WalkDir::new(root).follow_links(false))
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count() as u64
}

/// `roots` without duplicates and without roots nested inside another.
fn outermost_roots(roots: &[PathBuf]) -> Vec<&Path> {
    let mut sorted: Vec<&Path> = roots.iter().map(PathBuf::as_path).collect();
    sorted.sort_by_key(|root| root.components().count());

    let mut kept: Vec<&Path> = Vec::with_capacity(sorted.len());
    for root in sorted {
        if !kept.iter().any(|outer| root.starts_with(outer)) {
            kept.push(root);
        }
    }
    kept
}

/// Up to `count` distinct files, sampled without replacement.
fn pick_spot_checks(files: &[SnapshotFile], count: usize) -> Vec<&SnapshotFile> {
    let amount = count.min(files.len());
    let mut rng = rand::rng();
    rand::seq::index::sample(&mut rng, files.len(), amount)
        .into_iter()
        .map(|i| &files[i])
        .collect()
}

/// Compare a snapshot file with its source. A file whose source cannot be
/// found passes: there is nothing to compare against.
async fn spot_check(file: &SnapshotFile, sources: &[PathBuf]) -> SpotCheckResult {
    let source_size = match locate_source(&file.path, sources) {
        Some(path) => tokio::fs::metadata(path)
            .await
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|m| m.len()),
        None => None,
    };
    SpotCheckResult {
        path: file.path.clone(),
        snapshot_size: file.size,
        source_size,
        passed: source_size.is_none_or(|size| size == file.size),
    }
}

fn locate_source<'a>(snapshot_path: &'a str, sources: &[PathBuf]) -> Option<&'a Path> {
    let path = Path::new(snapshot_path);
    sources.iter().any(|root| path.starts_with(root)).then_some(path)
}

/// Bytes not stored thanks to deduplication and compression; never negative.
#[must_use]
pub fn calculate_space_saved(raw_bytes: u64, stored_bytes: u64) -> u64 {
    raw_bytes.saturating_sub(stored_bytes)
}

/// Stored bytes per raw byte; 0 when nothing was read.
#[must_use]
#[allow(clippy::cast_precision_loss, reason = "ratio only needs a few significant digits")]
pub fn calculate_dedup_ratio(raw_bytes: u64, stored_bytes: u64) -> f64 {
    if raw_bytes == 0 {
        return 0.0;
    }
    stored_bytes as f64 / raw_bytes as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(time: DateTime<Utc>, paths: &[&str]) -> Snapshot {
        Snapshot {
            id: "abc123def456".into(),
            short_id: "abc123de".into(),
            time,
            hostname: "files-1".into(),
            username: "root".into(),
            paths: paths.iter().map(ToString::to_string).collect(),
            tags: vec![],
        }
    }

    fn file(path: &str, size: u64) -> SnapshotFile {
        SnapshotFile {
            name: Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            node_type: NodeType::File,
            path: path.to_string(),
            size,
            mtime: None,
        }
    }

    #[test]
    fn test_metadata_freshness_window() {
        let now = Utc::now();
        assert!(metadata_issues(&snapshot(now, &["/etc"]), now).is_empty());
        assert!(metadata_issues(&snapshot(now + Duration::minutes(30), &["/etc"]), now).is_empty());
        assert_eq!(metadata_issues(&snapshot(now + Duration::hours(2), &["/etc"]), now).len(), 1);
        assert_eq!(metadata_issues(&snapshot(now - Duration::hours(25), &["/etc"]), now).len(), 1);
        assert_eq!(metadata_issues(&snapshot(now, &[]), now), vec!["snapshot records no paths"]);
        assert_eq!(
            metadata_issues(&snapshot(DateTime::UNIX_EPOCH, &["/etc"]), now),
            vec!["snapshot has no timestamp"]
        );
    }

    #[test]
    fn test_file_count_margin() {
        assert!(file_count_within_margin(1000, 1010, 0.01));
        assert!(!file_count_within_margin(1000, 1011, 0.01));
        assert!(file_count_within_margin(1000, 990, 0.01));
        assert!(file_count_within_margin(0, 10, 0.01));
        assert!(!file_count_within_margin(0, 11, 0.01));
    }

    #[test]
    fn test_space_metrics() {
        assert_eq!(calculate_space_saved(1000, 400), 600);
        assert_eq!(calculate_space_saved(400, 1000), 0);
        assert!((calculate_dedup_ratio(1000, 400) - 0.4).abs() < f64::EPSILON);
        assert!(calculate_dedup_ratio(0, 400).abs() < f64::EPSILON);
    }

    #[test]
    fn test_count_source_files_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("a/two.txt"), "2").unwrap();
        std::fs::write(dir.path().join("a/b/three.txt"), "3").unwrap();

        assert_eq!(count_source_files(&[dir.path().to_path_buf()]), 3);
        assert_eq!(count_source_files(&[dir.path().join("missing")]), 0);
    }

    #[test]
    fn test_count_source_files_counts_overlapping_roots_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/nested")).unwrap();
        std::fs::create_dir_all(dir.path().join("data2")).unwrap();
        std::fs::write(dir.path().join("data/one.txt"), "1").unwrap();
        std::fs::write(dir.path().join("data/nested/two.txt"), "2").unwrap();
        std::fs::write(dir.path().join("data2/three.txt"), "3").unwrap();

        let roots = [
            dir.path().join("data/nested"),
            dir.path().join("data"),
            dir.path().join("data"),
            dir.path().join("data2"),
        ];
        assert_eq!(count_source_files(&roots), 3);
        assert_eq!(count_source_files(&roots[..1]), 1);
    }

    #[test]
    fn test_spot_check_sample_is_distinct() {
        let files: Vec<_> = (0..20).map(|i| file(&format!("/data/{i}"), i)).collect();
        let picked = pick_spot_checks(&files, 10);
        assert_eq!(picked.len(), 10);
        let mut paths: Vec<_> = picked.iter().map(|f| f.path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        assert_eq!(paths.len(), 10);

        assert_eq!(pick_spot_checks(&files[..3], 10).len(), 3);
    }

    #[tokio::test]
    async fn test_spot_check_compares_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let sources = vec![dir.path().to_path_buf()];
        let path = path.to_string_lossy().into_owned();

        assert!(spot_check(&file(&path, 64), &sources).await.passed);

        let mismatch = spot_check(&file(&path, 65), &sources).await;
        assert!(!mismatch.passed);
        assert_eq!(mismatch.source_size, Some(64));

        // No source to compare against: passes.
        let gone = spot_check(&file("/elsewhere/x", 1), &sources).await;
        assert!(gone.passed);
        assert_eq!(gone.source_size, None);
    }
}
