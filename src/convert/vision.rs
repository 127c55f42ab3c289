//! Vision adapter: images and generic office formats, converted to Markdown
//! by the vision provider.

use std::sync::Arc;

use super::{ConversionError, Converter, FileEntry, extension_of};
use crate::{prelude::*, provider::VisionProvider};

const IMAGE_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp", "heic"];

const DOCUMENT_EXTENSIONS: &[&str] =
    &["docx", "doc", "xlsx", "xls", "pptx", "ppt", "html", "htm", "csv", "rtf"];

/// The prompt we send when the config doesn't provide one.
const DEFAULT_PROMPT: &str = "Convert this document to clean Markdown. \
Transcribe all visible text exactly. Describe charts, diagrams and \
photographs in place. Preserve table structure using Markdown tables.";

pub struct VisionConverter {
    vision: Arc<dyn VisionProvider>,
    prompt: String,
}

impl VisionConverter {
    /// `prompt` comes from `prompts.vision_prompt`; empty means use the
    /// built-in default.
    pub fn new(vision: Arc<dyn VisionProvider>, prompt: String) -> Self {
        let prompt = if prompt.is_empty() {
            DEFAULT_PROMPT.to_string()
        } else {
            prompt
        };
        Self { vision, prompt }
    }
}

#[async_trait]
impl Converter for VisionConverter {
    fn name(&self) -> &'static str {
        "vision"
    }

    fn supports(&self, file_name: &str) -> bool {
        let ext = extension_of(file_name);
        IMAGE_EXTENSIONS.contains(&ext.as_str())
            || DOCUMENT_EXTENSIONS.contains(&ext.as_str())
    }

    async fn convert(&self, entry: &FileEntry) -> Result<String, ConversionError> {
        let markdown = self
            .vision
            .to_markdown(&entry.path, &self.prompt)
            .await
            .map_err(ConversionError::from)?;
        if markdown.trim().is_empty() {
            return Err(ConversionError::internal(
                "vision provider returned empty output",
            ));
        }
        Ok(markdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;

    #[tokio::test]
    async fn images_and_office_files_are_accepted() {
        let stub = Arc::new(
            StubProvider::always(json!({})).with_vision_markdown("# A photo"),
        );
        let converter = VisionConverter::new(stub, String::new());
        assert!(converter.supports("scan.png"));
        assert!(converter.supports("report.docx"));
        assert!(!converter.supports("notes.txt"));

        let entry = FileEntry::direct("/tmp/scan.png");
        assert_eq!(converter.convert(&entry).await.unwrap(), "# A photo");
    }
}
