use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ExtractConfig;

/// File suffixes the pipeline will ingest; everything else is silently skipped.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "pdf"];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode a file into normalized text. Every failure mode — missing file,
/// oversized file, unsupported extension, decode error, PDF timeout — is
/// logged and collapses to an empty string: "no indexable content" is not an
/// error to the caller.
pub async fn extract_text(path: &Path, cfg: &ExtractConfig) -> String {
    let size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat file");
            return String::new();
        }
    };
    if size > cfg.max_file_size {
        warn!(
            path = %path.display(),
            size,
            limit = cfg.max_file_size,
            "file exceeds size ceiling, skipping"
        );
        return String::new();
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" => read_text_lossy(path),
        "pdf" => extract_pdf_text(path, cfg.pdf_timeout()).await,
        other => {
            debug!(path = %path.display(), extension = other, "unsupported extension");
            String::new()
        }
    }
}

fn read_text_lossy(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read file");
            String::new()
        }
    }
}

/// PDF extraction runs on a blocking worker under a hard timeout so a
/// pathological document cannot wedge the ingest pipeline. On timeout the
/// worker is abandoned and the file counts as empty.
async fn extract_pdf_text(path: &Path, budget: Duration) -> String {
    let owned = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned));

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(text))) => {
            debug!(path = %path.display(), chars = text.len(), "pdf extraction complete");
            text
        }
        Ok(Ok(Err(e))) => {
            warn!(path = %path.display(), error = %e, "pdf extraction failed");
            String::new()
        }
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "pdf extraction worker died");
            String::new()
        }
        Err(_) => {
            warn!(
                path = %path.display(),
                budget_secs = budget.as_secs(),
                "pdf extraction timed out"
            );
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max: u64) -> ExtractConfig {
        ExtractConfig {
            max_file_size: max,
            pdf_timeout_secs: 5,
        }
    }

    #[test]
    fn extension_support() {
        assert!(is_supported(Path::new("/a/b.txt")));
        assert!(is_supported(Path::new("/a/b.MD")));
        assert!(is_supported(Path::new("/a/b.pdf")));
        assert!(!is_supported(Path::new("/a/b.rs")));
        assert!(!is_supported(Path::new("/a/noext")));
    }

    #[tokio::test]
    async fn reads_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        std::fs::write(&file, "hello world").unwrap();
        assert_eq!(extract_text(&file, &cfg(1024)).await, "hello world");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        std::fs::write(&file, [0x68, 0x69, 0xFF, 0x21]).unwrap();
        let text = extract_text(&file, &cfg(1024)).await;
        assert!(text.starts_with("hi"));
        assert!(text.ends_with('!'));
    }

    #[tokio::test]
    async fn size_ceiling_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        std::fs::write(&file, "x".repeat(100)).unwrap();

        assert_eq!(
            extract_text(&file, &cfg(100)).await.len(),
            100,
            "a file exactly at the ceiling is extracted"
        );
        assert!(
            extract_text(&file, &cfg(99)).await.is_empty(),
            "one byte over the ceiling is skipped"
        );
    }

    #[tokio::test]
    async fn unsupported_extension_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.csv");
        std::fs::write(&file, "a,b,c").unwrap();
        assert!(extract_text(&file, &cfg(1024)).await.is_empty());
    }

    #[tokio::test]
    async fn missing_file_yields_empty() {
        assert!(extract_text(Path::new("/nonexistent/nope.txt"), &cfg(1024)).await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_pdf_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.pdf");
        std::fs::write(&file, "this is not a pdf").unwrap();
        assert!(extract_text(&file, &cfg(1024)).await.is_empty());
    }
}
