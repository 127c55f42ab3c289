//! Passthrough adapter for files that already are text.

use super::{ConversionError, Converter, FileEntry, extension_of};
use crate::prelude::*;

const EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

/// Reads text and Markdown files as-is.
pub struct PassthroughConverter {}

impl PassthroughConverter {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PassthroughConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Converter for PassthroughConverter {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn supports(&self, file_name: &str) -> bool {
        EXTENSIONS.contains(&extension_of(file_name).as_str())
    }

    async fn convert(&self, entry: &FileEntry) -> Result<String, ConversionError> {
        tokio::fs::read_to_string(&entry.path)
            .await
            .map_err(|err| {
                ConversionError::internal(format!(
                    "failed to read {}: {err}",
                    entry.path.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[tokio::test]
    async fn reads_text_files_verbatim() {
        let mut file = tempfile::NamedTempFile::with_suffix(".txt").unwrap();
        write!(file, "plain contents").unwrap();
        let converter = PassthroughConverter::new();
        let entry = FileEntry::direct(file.path());
        let markdown = converter.convert(&entry).await.unwrap();
        assert_eq!(markdown, "plain contents");
    }

    #[test]
    fn accepts_only_text_extensions() {
        let converter = PassthroughConverter::new();
        assert!(converter.supports("a.md"));
        assert!(converter.supports("b.TXT"));
        assert!(!converter.supports("c.pdf"));
    }
}
