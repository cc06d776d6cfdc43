//! Extract parts of a message to files.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::message::{Message, Part};

/// Listing entry for one part.
#[derive(Debug, Clone, Serialize)]
pub struct PartSummary {
    pub index: usize,
    pub content_id: String,
    pub content_type: String,
    pub filename: Option<String>,
    pub size: u64,
    pub spilled: bool,
}

/// Parse the whole message and describe each part.
pub fn summarize(message: &Message) -> Result<Vec<PartSummary>> {
    message
        .attachments()?
        .iter()
        .map(|part| {
            let headers = part.headers()?;
            let storage = part.storage();
            Ok(PartSummary {
                index: part.index()?,
                content_id: part.content_id()?,
                content_type: headers.content_type().to_string(),
                filename: headers.filename(),
                size: storage.total(),
                spilled: storage.file_bytes > 0,
            })
        })
        .collect()
}

/// File name to use for `part` inside an export directory.
pub fn part_file_name(part: &Part) -> Result<String> {
    let name = match part.headers()?.filename() {
        Some(name) => name,
        None => format!("part-{}", part.content_id()?),
    };
    Ok(sanitize_filename_part(&name, 150))
}

/// Move a single part into `output_dir`. The part is closed afterwards.
pub fn export_part(part: &Part, output_dir: &Path) -> anyhow::Result<PathBuf> {
    let filename = part_file_name(part)?;
    let path = unique_path(&output_dir.join(filename));
    part.move_to(&path)?;
    Ok(path)
}

/// Outcome of [`export_all`].
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Files written, in part order.
    pub paths: Vec<PathBuf>,
    /// Indices of parts that could not be written.
    pub failed: Vec<usize>,
}

/// Extract every part of `message` into `output_dir`.
///
/// Parts that fail to export are logged and listed in the report; a parse
/// failure aborts the whole export.
pub fn export_all(
    message: &Message,
    output_dir: &Path,
    progress: &dyn Fn(usize, usize),
) -> anyhow::Result<ExportReport> {
    std::fs::create_dir_all(output_dir)?;
    let parts = message.attachments()?;
    let total = parts.len();
    let mut report = ExportReport {
        paths: Vec::with_capacity(total),
        failed: Vec::new(),
    };

    for (i, part) in parts.iter().enumerate() {
        progress(i, total);
        match export_part(part, output_dir) {
            Ok(path) => report.paths.push(path),
            Err(e) => {
                tracing::warn!(index = i, error = %e, "Failed to export part");
                report.failed.push(i);
            }
        }
    }
    progress(total, total);

    Ok(report)
}

/// Replace characters that are unsafe in file names and truncate.
pub fn sanitize_filename_part(s: &str, max_len: usize) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '@' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// If `path` already exists, append a counter to make it unique.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("part");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 1..1000 {
        let candidate = if ext.is_empty() {
            parent.join(format!("{stem}_{i}"))
        } else {
            parent.join(format!("{stem}_{i}.{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }

    parent.join(format!("{stem}_dup.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename_part("hello world", 20), "hello_world");
        assert_eq!(sanitize_filename_part("part-a@example.com", 30), "part-a@example.com");
        assert_eq!(sanitize_filename_part("a/b\\c:d*e", 20), "a_b_c_d_e");
        assert_eq!(sanitize_filename_part("", 20), "unknown");
        assert_eq!(sanitize_filename_part("..", 20), "unknown");
    }

    #[test]
    fn test_export_all_reports_failed_parts() {
        let stream = b"--b\r\nContent-ID: <one>\r\n\r\nfirst\r\n\
--b\r\nContent-ID: <two>\r\n\r\nsecond\r\n--b--\r\n"
            .to_vec();
        let message =
            Message::new(std::io::Cursor::new(stream), "b", crate::StoreConfig::new()).unwrap();
        message.attachments().unwrap()[0].close();

        let dir = tempfile::tempdir().unwrap();
        let report = export_all(&message, dir.path(), &|_, _| {}).unwrap();
        assert_eq!(report.failed, vec![0]);
        assert_eq!(report.paths, vec![dir.path().join("part-two")]);
        assert_eq!(std::fs::read(&report.paths[0]).unwrap(), b"second");
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("report.pdf");
        assert_eq!(unique_path(&first), first);
        std::fs::write(&first, b"x").unwrap();
        assert_eq!(unique_path(&first), dir.path().join("report_1.pdf"));
    }
}
