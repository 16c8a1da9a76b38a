use std::{
    io::Write,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{bail, Context, Result};
use serde::Serialize;

// Distinguishes swap files written by concurrent lanes of this process.
static SWAP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Commits a whole-file document (talk metadata, context, host config) so
/// readers only ever observe the previous or the new content.
///
/// The content lands in a `.swap` sibling first, is flushed to disk, and the
/// rename is the commit point. A failed rename removes the swap file so
/// aborted commits leave nothing behind in the talk directory.
pub fn commit_text(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("cannot commit '{}': missing file name", path.display());
    };
    if path.is_dir() {
        bail!("cannot commit '{}': target is a directory", path.display());
    }
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let seq = SWAP_SEQ.fetch_add(1, Ordering::Relaxed);
    let swap_path = dir.join(format!("{file_name}.{}.{seq}.swap", std::process::id()));
    let write_result = (|| -> Result<()> {
        let mut swap = std::fs::File::create(&swap_path)
            .with_context(|| format!("failed to create {}", swap_path.display()))?;
        swap.write_all(content.as_bytes())
            .with_context(|| format!("failed to write {}", swap_path.display()))?;
        swap.sync_all()
            .with_context(|| format!("failed to flush {}", swap_path.display()))?;
        Ok(())
    })();
    if let Err(error) = write_result {
        let _ = std::fs::remove_file(&swap_path);
        return Err(error);
    }

    if let Err(error) = std::fs::rename(&swap_path, path) {
        let _ = std::fs::remove_file(&swap_path);
        return Err(error)
            .with_context(|| format!("failed to commit {}", path.display()));
    }
    Ok(())
}

/// Commits a record as the pretty-printed JSON document ClawTalk uses for
/// `talk.json`, affinity snapshots, and the host config: trailing newline,
/// rename as the commit point.
pub fn commit_json_pretty<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(record)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    payload.push('\n');
    commit_text(path, &payload)
}
