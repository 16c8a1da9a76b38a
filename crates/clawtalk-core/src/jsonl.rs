//! Tolerant JSONL access shared by the talk log, report log, and affinity log.
//!
//! Readers skip corrupt lines with a warning instead of aborting; large files
//! are scanned backward in fixed-size chunks so tail reads stay cheap.

use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

const WHOLE_FILE_READ_LIMIT_BYTES: u64 = 64 * 1024;
const BACKWARD_CHUNK_BYTES: u64 = 16 * 1024;

/// Append-only JSONL file guarded by a mutex so concurrent lanes interleave
/// whole lines.
#[derive(Clone)]
pub struct JsonlLog {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl JsonlLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to encode jsonl record")?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("jsonl log mutex is poisoned"))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

/// Reads every parseable line of a JSONL file in order, returning the records
/// plus the count of skipped corrupt lines. A missing file reads as empty.
pub fn read_jsonl_tolerant<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut records = Vec::new();
    let mut skipped = 0_usize;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(record) => records.push(record),
            Err(error) => {
                skipped = skipped.saturating_add(1);
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "skipping corrupt jsonl line"
                );
            }
        }
    }
    Ok((records, skipped))
}

/// Reads the last `limit` parseable records of a JSONL file, oldest first.
///
/// Files under 64 KiB are loaded whole and sliced. Larger files are scanned
/// backward in 16 KiB chunks, carrying the partial first line of each chunk
/// into the next read, and stop as soon as `limit` records are collected.
pub fn read_jsonl_tail<T: DeserializeOwned>(path: &Path, limit: usize) -> Result<Vec<T>> {
    if limit == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let file_len = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if file_len <= WHOLE_FILE_READ_LIMIT_BYTES {
        let (mut records, _skipped) = read_jsonl_tolerant::<T>(path)?;
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        return Ok(records);
    }

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut collected: Vec<T> = Vec::new();
    let mut carry: Vec<u8> = Vec::new();
    let mut cursor = file_len;

    while cursor > 0 && collected.len() < limit {
        let chunk_len = cursor.min(BACKWARD_CHUNK_BYTES);
        cursor -= chunk_len;
        file.seek(SeekFrom::Start(cursor))
            .with_context(|| format!("failed to seek {}", path.display()))?;
        let mut chunk = vec![0_u8; chunk_len as usize];
        file.read_exact(&mut chunk)
            .with_context(|| format!("failed to read {}", path.display()))?;
        chunk.extend_from_slice(&carry);

        let mut parsed_this_chunk: Vec<T> = Vec::new();
        let mut segments = chunk.split(|byte| *byte == b'\n');
        // The leading segment may be the tail of a line that starts in the
        // previous (earlier) chunk; keep it as carry unless we are at offset 0.
        let first = segments.next().unwrap_or_default().to_vec();
        for segment in segments {
            push_parsed_line(path, segment, &mut parsed_this_chunk);
        }
        if cursor == 0 {
            let mut head: Vec<T> = Vec::new();
            push_parsed_line(path, &first, &mut head);
            head.extend(parsed_this_chunk);
            parsed_this_chunk = head;
            carry = Vec::new();
        } else {
            carry = first;
        }

        parsed_this_chunk.extend(collected);
        collected = parsed_this_chunk;
        if collected.len() > limit {
            collected.drain(..collected.len() - limit);
        }
    }

    Ok(collected)
}

fn push_parsed_line<T: DeserializeOwned>(path: &Path, segment: &[u8], out: &mut Vec<T>) {
    let Ok(text) = std::str::from_utf8(segment) else {
        tracing::warn!(path = %path.display(), "skipping non-utf8 jsonl line");
        return;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    match serde_json::from_str::<T>(trimmed) {
        Ok(record) => out.push(record),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "skipping corrupt jsonl line");
        }
    }
}
