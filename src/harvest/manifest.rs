//! Append-only download manifest.
//!
//! Every candidate that enters the download phase gets exactly one row, written
//! to two parallel logs under the output directory:
//! - `<prefix>.csv`: RFC 4180 table with [`ManifestRow::COLUMNS`]
//! - `<prefix>.jsonl`: one JSON object per line
//!
//! Rows are flushed one at a time and never rewritten.

use crate::harvest::gate::{sha256_hex, Admitted};
use crate::harvest::traits::ManifestError;
use crate::model::{CandidateRecord, DownloadOutcome, ManifestRow, SkipReason};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const SAFE_EXTS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];
const DEFAULT_EXT: &str = ".jpg";

// ============================================================================
// Naming
// ============================================================================

/// Stable row identifier: the first 16 hex chars of SHA-256 of the URL.
///
/// Candidates without a URL get a `ts-<unix micros>` identifier instead.
pub fn derive_id(source_url: &str) -> String {
    let url = source_url.trim();
    if url.is_empty() {
        return format!("ts-{}", Utc::now().timestamp_micros());
    }
    let mut id = sha256_hex(url.as_bytes());
    id.truncate(16);
    id
}

/// Lower-cases `s` and collapses anything outside `[a-z0-9._-]` into single dashes.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.to_lowercase().chars() {
        let keep = ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-');
        let ch = if keep { ch } else { '-' };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "img".to_string()
    } else {
        trimmed.to_string()
    }
}

/// File extension (with dot) from the URL path, then the content type,
/// defaulting to `.jpg`.
pub fn pick_extension(url: &str, content_type: Option<&str>) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    if let Some(ext) = Path::new(last_segment).extension().and_then(|e| e.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if let Some(safe) = SAFE_EXTS.iter().find(|s| **s == ext) {
            return match *safe {
                "jpg" => ".jpg",
                "jpeg" => ".jpeg",
                "png" => ".png",
                _ => ".webp",
            };
        }
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("image/jpeg") | Some("image/jpg") => ".jpg",
        Some("image/png") => ".png",
        Some("image/webp") => ".webp",
        _ => DEFAULT_EXT,
    }
}

/// `<slug>_<unix millis>_<6 hex random><ext>`
pub fn synthesize_filename(query: &str, url: &str, content_type: Option<&str>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}{}",
        slugify(query),
        Utc::now().timestamp_millis(),
        &suffix[..6],
        pick_extension(url, content_type)
    )
}

/// Writes admitted content into `out_dir` under a synthesized name.
pub async fn store_image(out_dir: &Path, candidate: &CandidateRecord, admitted: Admitted) -> DownloadOutcome {
    let name = synthesize_filename(
        &candidate.query,
        &candidate.source_url,
        admitted.content_type.as_deref(),
    );
    store_image_at(out_dir.join(name), admitted).await
}

/// Writes admitted content to a path that must not exist yet.
///
/// A failed write becomes a `write_error` skip. Only a file this call
/// created is removed afterwards; an existing file at `path` is left alone.
async fn store_image_at(path: PathBuf, admitted: Admitted) -> DownloadOutcome {
    let opened = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await;
    let mut file = match opened {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), "Failed to create image file: {}", e);
            return DownloadOutcome::skip(SkipReason::WriteError).with_content(admitted.sha256, admitted.dims);
        }
    };

    let written: std::io::Result<()> = async {
        file.write_all(&admitted.bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    match written {
        Ok(()) => {
            debug!(path = %path.display(), bytes = admitted.bytes.len(), "Image stored");
            DownloadOutcome::accepted(path, admitted.sha256, admitted.dims)
        }
        Err(e) => {
            warn!(path = %path.display(), "Failed to write image: {}", e);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), "Partial image not removed: {}", e);
            }
            DownloadOutcome::skip(SkipReason::WriteError).with_content(admitted.sha256, admitted.dims)
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Quotes a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = cells
        .into_iter()
        .map(|c| csv_field(c.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

struct Log {
    path: PathBuf,
    file: File,
}

impl Log {
    async fn open(path: &Path) -> Result<Self, ManifestError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    async fn is_empty(&self) -> Result<bool, ManifestError> {
        let meta = self.file.metadata().await.map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(meta.len() == 0)
    }

    async fn append(&mut self, line: &str) -> Result<(), ManifestError> {
        let result: std::io::Result<()> = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.flush().await
        }
        .await;
        result.map_err(|source| ManifestError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Owns both manifest logs for one run.
pub struct ManifestWriter {
    label: String,
    csv: Log,
    jsonl: Log,
    rows_written: usize,
}

impl ManifestWriter {
    /// Opens (or creates) both logs in append mode. The CSV header is only
    /// written to an empty file.
    pub async fn open(csv_path: &Path, jsonl_path: &Path, label: &str) -> Result<Self, ManifestError> {
        let mut csv = Log::open(csv_path).await?;
        if csv.is_empty().await? {
            csv.append(&csv_line(ManifestRow::COLUMNS)).await?;
        }
        let jsonl = Log::open(jsonl_path).await?;

        Ok(Self {
            label: label.to_string(),
            csv,
            jsonl,
            rows_written: 0,
        })
    }

    /// Appends one row for `candidate` to both logs.
    pub async fn persist(
        &mut self,
        candidate: &CandidateRecord,
        outcome: &DownloadOutcome,
    ) -> Result<ManifestRow, ManifestError> {
        let row = ManifestRow::new(derive_id(&candidate.source_url), &self.label, candidate, outcome);

        let mut json = serde_json::to_string(&row)?;
        json.push('\n');

        self.csv.append(&csv_line(row.cells())).await?;
        self.jsonl.append(&json).await?;
        self.rows_written += 1;
        Ok(row)
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Loads every well-formed row of a JSONL manifest.
///
/// Blank lines are ignored; malformed lines are logged and skipped.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRow>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ManifestRow>(line) {
            Ok(row) => rows.push(row),
            Err(e) => warn!(
                path = %path.display(),
                line = idx + 1,
                "Skipping malformed manifest line: {}",
                e
            ),
        }
    }
    Ok(rows)
}
