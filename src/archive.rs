//! ZIP expansion.
//!
//! Archives are extracted into fresh temp directories under the configured
//! extract root and walked recursively. Entries whose name starts with `.`
//! or `__` are skipped (hidden files, `__MACOSX` droppings). Nested ZIPs
//! are expanded in turn. Malformed archives yield an empty list; nothing
//! here raises past the boundary.

use std::fs;

use crate::{convert::FileEntry, prelude::*};

/// The outcome of expanding one uploaded archive.
pub struct ExpandedArchive {
    /// Carrier-tagged entries for every usable file.
    pub entries: Vec<FileEntry>,

    /// Extraction roots. Dropping these deletes the extracted trees, so the
    /// caller holds them for the life of the run.
    pub temp_dirs: Vec<tempfile::TempDir>,
}

impl ExpandedArchive {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            temp_dirs: Vec::new(),
        }
    }
}

/// Is this file name a ZIP archive?
pub fn is_zip_file(file_name: &str) -> bool {
    file_name.to_lowercase().ends_with(".zip")
}

/// Should this path component be skipped?
fn is_hidden(component: &str) -> bool {
    component.starts_with('.') || component.starts_with("__")
}

/// Expand a ZIP archive (and any ZIPs inside it) into `extract_root`.
pub async fn expand_zip(
    zip_path: &Path,
    archive_name: &str,
    extract_root: &Path,
) -> ExpandedArchive {
    // Work stack of (zip path, display prefix). Nested archives push onto
    // it; each gets its own temp dir.
    let mut pending = vec![(zip_path.to_path_buf(), archive_name.to_string())];
    let mut expanded = ExpandedArchive::empty();

    while let Some((path, name)) = pending.pop() {
        match extract_one(&path, extract_root).await {
            Ok((temp_dir, files)) => {
                for (abs_path, rel_path) in files {
                    if is_zip_file(&rel_path) {
                        pending.push((abs_path, format!("{name} → {rel_path}")));
                    } else {
                        expanded.entries.push(FileEntry::from_archive(
                            abs_path, &name, &rel_path,
                        ));
                    }
                }
                expanded.temp_dirs.push(temp_dir);
            }
            Err(err) => {
                warn!(archive = %name, %err, "failed to expand archive");
            }
        }
    }

    // The stack pops in LIFO order; give callers a stable, readable order.
    expanded.entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    info!(
        archive = %archive_name,
        files = expanded.entries.len(),
        "expanded archive"
    );
    expanded
}

/// Extract a single ZIP into a fresh temp dir and list its visible files as
/// `(absolute, relative)` pairs.
async fn extract_one(
    zip_path: &Path,
    extract_root: &Path,
) -> Result<(tempfile::TempDir, Vec<(PathBuf, String)>)> {
    let zip_path = zip_path.to_path_buf();
    let extract_root = extract_root.to_path_buf();
    // The zip crate does blocking I/O.
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&extract_root)?;
        let temp_dir = tempfile::Builder::new()
            .prefix("docstream_")
            .tempdir_in(&extract_root)?;

        let file = fs::File::open(&zip_path)
            .with_context(|| format!("failed to open archive {zip_path:?}"))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("failed to read archive {zip_path:?}"))?;
        archive
            .extract(temp_dir.path())
            .with_context(|| format!("failed to extract archive {zip_path:?}"))?;

        let mut files = Vec::new();
        walk_dir(temp_dir.path(), temp_dir.path(), &mut files)?;
        files.sort_by(|a, b| a.1.cmp(&b.1));
        Ok((temp_dir, files))
    })
    .await
    .context("archive extraction task failed")?
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    files: &mut Vec<(PathBuf, String)>,
) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, files)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            files.push((path, rel));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use zip::write::SimpleFileOptions;

    use super::*;

    fn build_zip(entries: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::with_suffix(".zip").unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        for (name, contents) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[tokio::test]
    async fn hidden_and_system_entries_are_skipped() {
        let zip = build_zip(&[
            ("a.txt", "alpha"),
            ("sub/b.txt", "beta"),
            (".hidden", "no"),
            ("__meta", "no"),
        ]);
        let root = tempfile::tempdir().unwrap();
        let expanded = expand_zip(zip.path(), "batch.zip", root.path()).await;

        let names: Vec<_> = expanded
            .entries
            .iter()
            .map(|e| e.display_name.clone())
            .collect();
        assert_eq!(names, vec!["batch.zip → a.txt", "batch.zip → sub/b.txt"]);
        for entry in &expanded.entries {
            assert!(entry.path.exists());
        }
    }

    #[tokio::test]
    async fn nested_zips_are_expanded() {
        let inner = build_zip(&[("deep.txt", "deep")]);
        let inner_bytes = fs::read(inner.path()).unwrap();

        let file = tempfile::NamedTempFile::with_suffix(".zip").unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        writer
            .start_file("inner.zip", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&inner_bytes).unwrap();
        writer
            .start_file("top.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"top").unwrap();
        writer.finish().unwrap();

        let root = tempfile::tempdir().unwrap();
        let expanded = expand_zip(file.path(), "outer.zip", root.path()).await;
        let names: Vec<_> = expanded
            .entries
            .iter()
            .map(|e| e.display_name.clone())
            .collect();
        assert!(names.contains(&"outer.zip → top.txt".to_string()));
        assert!(names.contains(&"outer.zip → inner.zip → deep.txt".to_string()));
    }

    #[tokio::test]
    async fn malformed_archives_yield_nothing() {
        let mut file = tempfile::NamedTempFile::with_suffix(".zip").unwrap();
        file.write_all(b"this is not a zip").unwrap();
        let root = tempfile::tempdir().unwrap();
        let expanded = expand_zip(file.path(), "broken.zip", root.path()).await;
        assert!(expanded.entries.is_empty());
    }
}
