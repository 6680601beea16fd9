//! Writes decoded multipart parts to the upload directory.
//!
//! Consumes the decoder's parts one by one, skipping plain form fields, and
//! rolls back every file written for a request when any part fails. Multiple
//! files can be bundled into a single zip so the broker always gets exactly
//! one artifact path.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;
use zip::write::{FileOptions, ZipWriter};

use crate::error::IngestError;
use crate::multipart::MultipartDecoder;

/// Maximum length of a stored file name
pub const MAX_FILENAME_LENGTH: usize = 200;

/// One file part persisted to the upload directory.
#[derive(Debug, Clone)]
pub struct SavedArtifact {
    pub path: PathBuf,
    pub original_name: String,
}

/// Drain the decoder, writing every file part to `upload_dir` under a
/// `<uuid>-<sanitized-name>` file name. Form fields are skipped. On any
/// failure all files written so far are removed before the error returns.
pub async fn save_parts<R: AsyncRead + Unpin>(
    decoder: &mut MultipartDecoder<R>,
    upload_dir: &Path,
) -> Result<Vec<SavedArtifact>, IngestError> {
    tokio::fs::create_dir_all(upload_dir).await?;

    let mut saved: Vec<SavedArtifact> = Vec::new();
    loop {
        let mut part = match decoder.next_part().await {
            Ok(Some(part)) => part,
            Ok(None) => break,
            Err(e) => {
                discard_artifacts(&saved).await;
                return Err(e.into());
            }
        };

        let Some(original_name) = part.file_name() else {
            // Form field, not a file; the decoder drains it on the next call
            continue;
        };
        if original_name.is_empty() {
            continue;
        }

        let safe = sanitize_file_name(&original_name);
        let path = upload_dir.join(format!("{}-{}", Uuid::new_v4(), safe));
        if let Err(e) = write_part_body(&mut part, &path).await {
            let _ = tokio::fs::remove_file(&path).await;
            discard_artifacts(&saved).await;
            return Err(e);
        }

        tracing::debug!(name = %original_name, path = %path.display(), "stored file part");
        saved.push(SavedArtifact {
            path,
            original_name,
        });
    }
    Ok(saved)
}

async fn write_part_body<R: AsyncRead + Unpin>(
    part: &mut crate::multipart::Part<'_, R>,
    path: &Path,
) -> Result<(), IngestError> {
    let mut file = File::create(path).await?;
    while let Some(chunk) = part.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Remove every artifact written so far for the current request.
pub async fn discard_artifacts(saved: &[SavedArtifact]) {
    for artifact in saved {
        if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
            tracing::warn!(path = %artifact.path.display(), error = %e, "failed to discard artifact");
        }
    }
}

/// Bundle several saved artifacts into one zip archive in `upload_dir`.
/// The partial archive is removed when bundling fails.
pub async fn bundle_artifacts(
    saved: &[SavedArtifact],
    upload_dir: &Path,
) -> Result<PathBuf, IngestError> {
    let zip_path = upload_dir.join(format!("bundle-{}.zip", Uuid::new_v4()));
    let paths: Vec<PathBuf> = saved.iter().map(|a| a.path.clone()).collect();

    let result = {
        let zip_path = zip_path.clone();
        tokio::task::spawn_blocking(move || write_zip(&zip_path, &paths))
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))?
    };

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&zip_path).await;
        return Err(e);
    }
    Ok(zip_path)
}

fn write_zip(zip_path: &Path, paths: &[PathBuf]) -> Result<(), IngestError> {
    let file = std::fs::File::create(zip_path)?;
    let mut zip = ZipWriter::new(std::io::BufWriter::new(file));
    for path in paths {
        let entry_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown_file".to_string());
        zip.start_file::<_, ()>(entry_name, FileOptions::default())?;
        let mut src = std::fs::File::open(path)?;
        std::io::copy(&mut src, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Sanitize a client-supplied file name to prevent path traversal and ensure
/// it is safe to store
pub fn sanitize_file_name(file_name: &str) -> String {
    // Take the last path component, handling both separators
    let file_name = file_name
        .split(['/', '\\'])
        .next_back()
        .unwrap_or("unknown_file");

    let mut clean_name: String = file_name
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();

    // Windows reserved device names
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|&r| clean_name.eq_ignore_ascii_case(r))
    {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        // Preserve a reasonable-length extension while truncating
        if let Some(idx) = clean_name.rfind('.') {
            let ext_len = clean_name.len() - idx;
            if ext_len < 20 && ext_len < MAX_FILENAME_LENGTH {
                let base_len = MAX_FILENAME_LENGTH - ext_len;
                let mut base = clean_name[..idx].to_string();
                truncate_on_char_boundary(&mut base, base_len);
                base.push_str(&clean_name[idx..]);
                clean_name = base;
            } else {
                truncate_on_char_boundary(&mut clean_name, MAX_FILENAME_LENGTH);
            }
        } else {
            truncate_on_char_boundary(&mut clean_name, MAX_FILENAME_LENGTH);
        }
    }

    clean_name
}

fn truncate_on_char_boundary(s: &mut String, mut cutoff: usize) {
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    const BOUNDARY: &str = "ingest-test-boundary";

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            let disposition = match filename {
                Some(f) => format!("form-data; name=\"{name}\"; filename=\"{f}\""),
                None => format!("form-data; name=\"{name}\""),
            };
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    #[tokio::test]
    async fn test_save_parts_skips_form_fields() {
        let dir = tempfile::tempdir().unwrap();
        let body = multipart_body(&[
            ("meta", None, b""),
            ("files", Some("hello.txt"), b"hello world"),
        ]);

        let mut decoder = MultipartDecoder::new(&body[..], BOUNDARY);
        let saved = save_parts(&mut decoder, dir.path()).await.unwrap();

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].original_name, "hello.txt");
        let content = tokio::fs::read(&saved[0].path).await.unwrap();
        assert_eq!(content, b"hello world");
        let name = saved[0].path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-hello.txt"));
    }

    #[tokio::test]
    async fn test_save_parts_rolls_back_on_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        // One complete part, then a part whose body is cut off
        let mut body = multipart_body(&[("files", Some("ok.txt"), b"fine")]);
        body.truncate(body.len() - format!("--{BOUNDARY}--\r\n").len());
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"f\"; filename=\"cut.bin\"\r\n\r\nincomplete"
            )
            .as_bytes(),
        );

        let mut decoder = MultipartDecoder::new(&body[..], BOUNDARY);
        let err = save_parts(&mut decoder, dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Decode(DecodeError::Truncated { part_index: 2 })
        ));

        // Everything written for this request is gone again
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bundle_artifacts_creates_zip() {
        let dir = tempfile::tempdir().unwrap();
        let body = multipart_body(&[
            ("files", Some("a.txt"), b"aaa"),
            ("files", Some("b.txt"), b"bbb"),
        ]);

        let mut decoder = MultipartDecoder::new(&body[..], BOUNDARY);
        let saved = save_parts(&mut decoder, dir.path()).await.unwrap();
        assert_eq!(saved.len(), 2);

        let zip_path = bundle_artifacts(&saved, dir.path()).await.unwrap();
        let name = zip_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("bundle-") && name.ends_with(".zip"));

        let meta = tokio::fs::metadata(&zip_path).await.unwrap();
        assert!(meta.len() > 0);
    }

    #[test]
    fn test_sanitize_file_name_basic() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\calc.exe"), "calc.exe");
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "unknown_file");
        assert_eq!(sanitize_file_name("."), "unknown_file");
        assert_eq!(sanitize_file_name(""), "unknown_file");
    }

    #[test]
    fn test_sanitize_file_name_reserved() {
        assert_eq!(sanitize_file_name("CON"), "unknown_file");
        assert_eq!(sanitize_file_name("com1"), "unknown_file");
        assert_eq!(sanitize_file_name("concert.txt"), "concert.txt");
    }

    #[test]
    fn test_sanitize_file_name_length() {
        let long_name = "a".repeat(300) + ".txt";
        let sanitized = sanitize_file_name(&long_name);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".txt"));

        let crabs = "🦀".repeat(100) + ".txt";
        let sanitized = sanitize_file_name(&crabs);
        assert!(sanitized.len() <= MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".txt"));
    }
}
