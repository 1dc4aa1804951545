//! File tools — read/write/list/delete constrained to the run's
//! working directory.
//!
//! Paths are validated before any I/O: absolute paths and `..`
//! components are rejected up front, then the resolved target is
//! checked for containment inside the canonicalized root (walking up
//! to the nearest existing ancestor for not-yet-created files).
//!
//! Results are structured JSON so the executor can hand them straight
//! back to the assistant.

use std::path::{Component, Path, PathBuf};

use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve `requested` inside `root`, rejecting escapes.
pub fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, String> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(format!(
            "absolute paths are not allowed; use a path relative to the working directory (got '{requested}')"
        ));
    }
    if requested_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err("path must not contain '..' components".into());
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| format!("cannot resolve working directory '{}': {e}", root.display()))?;
    let candidate = canonical_root.join(requested_path);

    // Canonicalize the longest existing prefix, then re-append the
    // missing tail, so new files validate too.
    let resolved = if candidate.exists() {
        candidate
            .canonicalize()
            .map_err(|e| format!("cannot resolve '{}': {e}", candidate.display()))?
    } else {
        let mut existing = candidate.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name);
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| format!("cannot resolve ancestor of '{}': {e}", candidate.display()))?;
        for part in tail.into_iter().rev() {
            resolved.push(part);
        }
        resolved
    };

    if !resolved.starts_with(&canonical_root) {
        return Err(format!(
            "path '{requested}' resolves outside the working directory"
        ));
    }
    Ok(resolved)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `read_file` — contents with optional line window.
pub async fn read_file(
    root: &Path,
    path: &str,
    offset: Option<usize>,
    limit: Option<usize>,
) -> Result<Value, String> {
    let resolved = resolve_in_root(root, path)?;
    let content = fs::read_to_string(&resolved)
        .await
        .map_err(|e| format!("failed to read '{path}': {e}"))?;

    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    let offset = offset.unwrap_or(0);
    let limit = limit.unwrap_or(total_lines.saturating_sub(offset));
    let window: Vec<&str> = lines.into_iter().skip(offset).take(limit).collect();

    Ok(json!({
        "path": path,
        "content": window.join("\n"),
        "totalLines": total_lines,
        "offset": offset,
        "linesReturned": window.len(),
    }))
}

/// `write_file` — create or replace, atomically (temp sibling +
/// rename).
pub async fn write_file(root: &Path, path: &str, content: &str) -> Result<Value, String> {
    let resolved = resolve_in_root(root, path)?;
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("failed to create parent directory: {e}"))?;
    }

    let tmp = resolved.with_file_name(format!(
        ".{}.{}.tmp",
        resolved.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().as_simple()
    ));
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| format!("failed to create temp file: {e}"))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| format!("failed to write: {e}"))?;
    file.flush().await.map_err(|e| format!("failed to flush: {e}"))?;
    file.sync_data().await.map_err(|e| format!("failed to sync: {e}"))?;
    fs::rename(&tmp, &resolved).await.map_err(|e| {
        let tmp = tmp.clone();
        tokio::spawn(async move {
            let _ = fs::remove_file(&tmp).await;
        });
        format!("failed to move file into place: {e}")
    })?;

    Ok(json!({
        "path": path,
        "bytesWritten": content.len(),
    }))
}

/// `list_files` — directory entries with metadata, sorted by name.
pub async fn list_files(root: &Path, path: &str) -> Result<Value, String> {
    let resolved = resolve_in_root(root, path)?;
    let mut read_dir = fs::read_dir(&resolved)
        .await
        .map_err(|e| format!("failed to read directory '{path}': {e}"))?;

    let mut entries: Vec<Value> = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| format!("failed to read directory entry: {e}"))?
    {
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| format!("failed to stat '{}': {e}", entry.path().display()))?;
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "size": metadata.len(),
            "isDir": metadata.is_dir(),
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Ok(json!({
        "path": path,
        "entries": entries,
        "count": entries.len(),
    }))
}

/// `delete_file` — remove a file or an empty directory.
pub async fn delete_file(root: &Path, path: &str) -> Result<Value, String> {
    let resolved = resolve_in_root(root, path)?;
    let metadata = fs::metadata(&resolved)
        .await
        .map_err(|e| format!("failed to stat '{path}': {e}"))?;

    if metadata.is_dir() {
        fs::remove_dir(&resolved)
            .await
            .map_err(|e| format!("failed to remove directory '{path}' (must be empty): {e}"))?;
    } else {
        fs::remove_file(&resolved)
            .await
            .map_err(|e| format!("failed to remove '{path}': {e}"))?;
    }
    Ok(json!({ "path": path, "deleted": true }))
}
