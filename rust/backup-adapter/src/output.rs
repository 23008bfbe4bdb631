//! Decoding of restic's `--json` output.
//!
//! Streaming commands (`backup`, `restore`, `diff`, `ls`) print one JSON
//! object per line; listing commands (`snapshots`, `forget`, `stats`) print
//! a single JSON document, sometimes followed by plain text.

use serde::Deserialize;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    BackupStats, ChangeKind, DiffChange, DiffResult, ForgetResult, NodeType, RestoreSummary,
    Snapshot, SnapshotFile,
};

#[derive(Debug, Deserialize)]
struct MessageType {
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    struct_type: Option<String>,
}

fn json_lines(output: &str) -> impl Iterator<Item = &str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
}

/// Extract the summary line from `restic backup --json`.
pub fn parse_backup_summary(output: &str) -> AdapterResult<BackupStats> {
    let mut errors = Vec::new();

    for line in json_lines(output) {
        let Ok(kind) = serde_json::from_str::<MessageType>(line) else {
            continue;
        };
        match kind.message_type.as_deref() {
            Some("summary") => {
                let stats: BackupStats = serde_json::from_str(line)?;
                if stats.snapshot_id.is_empty() {
                    return Err(AdapterError::Parse(
                        "backup summary does not carry a snapshot id".into(),
                    ));
                }
                return Ok(stats);
            }
            Some("error") => errors.push(line.to_string()),
            _ => {}
        }
    }

    if errors.is_empty() {
        Err(AdapterError::Parse("no summary in backup output".into()))
    } else {
        Err(AdapterError::Parse(format!(
            "backup reported errors without a summary: {}",
            errors.join("; ")
        )))
    }
}

/// Decode `restic snapshots --json`.
pub fn parse_snapshots(output: &str) -> AdapterResult<Vec<Snapshot>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let document = first_document(trimmed, '[')?;
    let mut snapshots: Vec<Snapshot> = serde_json::from_str(document)?;
    snapshots.sort_by_key(|s| s.time);
    Ok(snapshots)
}

#[derive(Debug, Deserialize)]
struct LsNode {
    name: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mtime: Option<chrono::DateTime<chrono::Utc>>,
}

/// Decode `restic ls --json <snapshot>`; the leading snapshot line is skipped.
pub fn parse_ls(output: &str) -> AdapterResult<Vec<SnapshotFile>> {
    let mut files = Vec::new();
    for line in json_lines(output) {
        let kind: MessageType = serde_json::from_str(line)?;
        let tag = kind.struct_type.or(kind.message_type);
        if tag.as_deref() == Some("snapshot") {
            continue;
        }
        let node: LsNode = serde_json::from_str(line)?;
        files.push(SnapshotFile {
            name: node.name,
            node_type: node.node_type,
            path: node.path,
            size: node.size,
            mtime: node.mtime,
        });
    }
    Ok(files)
}

#[derive(Debug, Deserialize)]
struct ForgetGroup {
    #[serde(default)]
    keep: Option<Vec<Snapshot>>,
    #[serde(default)]
    remove: Option<Vec<Snapshot>>,
}

/// Decode `restic forget --json`.
pub fn parse_forget(output: &str, pruned: bool) -> AdapterResult<ForgetResult> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(ForgetResult {
            pruned,
            ..Default::default()
        });
    }
    let document = first_document(trimmed, '[')?;
    let groups: Vec<ForgetGroup> = serde_json::from_str(document)?;

    let mut result = ForgetResult {
        pruned,
        ..Default::default()
    };
    for group in groups {
        result.snapshots_kept += group.keep.as_ref().map_or(0, Vec::len);
        if let Some(removed) = group.remove {
            result.snapshots_removed += removed.len();
            result.removed_ids.extend(removed.into_iter().map(|s| s.id));
        }
    }
    Ok(result)
}

/// Decode the restore summary, if the tool printed one.
pub fn parse_restore_summary(output: &str) -> RestoreSummary {
    json_lines(output)
        .filter(|line| {
            serde_json::from_str::<MessageType>(line)
                .is_ok_and(|k| k.message_type.as_deref() == Some("summary"))
        })
        .filter_map(|line| serde_json::from_str::<RestoreSummary>(line).ok())
        .last()
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct DiffLine {
    path: String,
    modifier: String,
}

/// Decode `restic diff --json`.
pub fn parse_diff(output: &str) -> AdapterResult<DiffResult> {
    let mut result = DiffResult::default();
    for line in json_lines(output) {
        let kind: MessageType = serde_json::from_str(line)?;
        if kind.message_type.as_deref() != Some("change") {
            continue;
        }
        let change: DiffLine = serde_json::from_str(line)?;
        let kind = match change.modifier.chars().next() {
            Some('+') => ChangeKind::Added,
            Some('-') => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        };
        match kind {
            ChangeKind::Added => result.added += 1,
            ChangeKind::Removed => result.removed += 1,
            ChangeKind::Modified => result.modified += 1,
        }
        result.changes.push(DiffChange {
            path: change.path,
            kind,
        });
    }
    Ok(result)
}

/// Collect the error lines printed by a failed `restic check`.
pub fn parse_check_errors(stdout: &str, stderr: &str) -> Vec<String> {
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter(|line| {
            let lowered = line.to_lowercase();
            lowered.starts_with("error")
                || lowered.starts_with("fatal")
                || (lowered.contains("pack ") && lowered.contains("not found"))
                || lowered.contains("is damaged")
        })
        .map(ToString::to_string)
        .collect()
}

/// Slice the first JSON document starting with `open` out of mixed output.
fn first_document(output: &str, open: char) -> AdapterResult<&str> {
    let start = output
        .find(open)
        .ok_or_else(|| AdapterError::Parse(format!("expected JSON starting with '{open}'")))?;
    let candidate = &output[start..];
    match candidate.lines().next() {
        Some(line) if serde_json::from_str::<serde_json::Value>(line).is_ok() => Ok(line),
        _ => Ok(candidate),
    }
}
