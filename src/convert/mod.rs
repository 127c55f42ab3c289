//! File → Markdown conversion.
//!
//! One adapter per modality, polymorphic over [`Converter`]. Adapter
//! selection is by file extension, first match wins, in fixed order: pdf,
//! audio, vision, passthrough. Adapters never raise past their boundary;
//! every failure becomes a [`ConversionError`] with an error kind.

pub mod audio;
pub mod parallel;
pub mod passthrough;
pub mod pdf;
pub mod vision;

use std::sync::Arc;

use crate::{errors::ErrorKind, prelude::*, provider::ProviderError};

/// Where a file came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FileOrigin {
    /// Uploaded directly.
    Direct,
    /// Expanded out of an archive.
    Archive {
        archive_name: String,
        relative_path: String,
    },
}

/// One file the pipeline is asked to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Where the bytes live on disk.
    pub path: PathBuf,

    /// Human-readable name, e.g. `archive.zip → sub/file.pdf`.
    pub display_name: String,

    pub origin: FileOrigin,
}

impl FileEntry {
    /// An entry for a directly-uploaded file.
    pub fn direct(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            display_name,
            origin: FileOrigin::Direct,
        }
    }

    /// An entry expanded out of an archive.
    pub fn from_archive(
        path: impl Into<PathBuf>,
        archive_name: &str,
        relative_path: &str,
    ) -> Self {
        Self {
            path: path.into(),
            display_name: format!("{archive_name} → {relative_path}"),
            origin: FileOrigin::Archive {
                archive_name: archive_name.to_string(),
                relative_path: relative_path.to_string(),
            },
        }
    }

    /// The bare file name, used for adapter selection.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Why a conversion failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConversionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<ProviderError> for ConversionError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => Self::new(ErrorKind::Timeout, err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// The outcome of converting one file.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub file_entry: FileEntry,
    pub outcome: Result<String, ConversionError>,
}

impl ConversionResult {
    pub fn ok(file_entry: FileEntry, markdown: String) -> Self {
        Self {
            file_entry,
            outcome: Ok(markdown),
        }
    }

    pub fn failed(file_entry: FileEntry, error: ConversionError) -> Self {
        Self {
            file_entry,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn markdown(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(String::as_str)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(|e| e.kind)
    }
}

/// A single conversion modality.
#[async_trait]
pub trait Converter: Send + Sync + 'static {
    /// Short name, for logs.
    fn name(&self) -> &'static str;

    /// Does this adapter want the file, judged by its name?
    fn supports(&self, file_name: &str) -> bool;

    /// Convert the file to Markdown.
    async fn convert(&self, entry: &FileEntry) -> Result<String, ConversionError>;
}

/// Extract a lowercase extension from a file name.
pub(crate) fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// The ordered adapter list.
pub struct ConverterSet {
    adapters: Vec<Arc<dyn Converter>>,
}

impl ConverterSet {
    /// Build the fixed adapter order: pdf, audio, vision, passthrough.
    pub fn new(
        pdf: pdf::PdfConverter,
        audio: audio::AudioConverter,
        vision: vision::VisionConverter,
    ) -> Self {
        Self {
            adapters: vec![
                Arc::new(pdf),
                Arc::new(audio),
                Arc::new(vision),
                Arc::new(passthrough::PassthroughConverter::new()),
            ],
        }
    }

    /// First adapter accepting the file name.
    pub fn select(&self, file_name: &str) -> Option<Arc<dyn Converter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.supports(file_name))
            .cloned()
    }

    /// Is any adapter willing to take this file?
    pub fn supports(&self, file_name: &str) -> bool {
        self.select(file_name).is_some()
    }

    /// Convert one entry, coercing every failure to a result.
    pub async fn convert_entry(&self, entry: &FileEntry) -> ConversionResult {
        let file_name = entry.file_name();
        let adapter = match self.select(&file_name) {
            Some(adapter) => adapter,
            None => {
                return ConversionResult::failed(
                    entry.clone(),
                    ConversionError::new(
                        ErrorKind::Unsupported,
                        format!("Unsupported file type: {file_name}"),
                    ),
                );
            }
        };
        debug!(adapter = adapter.name(), file = %entry.display_name, "converting");
        match adapter.convert(entry).await {
            Ok(markdown) => ConversionResult::ok(entry.clone(), markdown),
            Err(error) => ConversionResult::failed(entry.clone(), error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{config::Config, provider::stub::StubProvider};

    fn converter_set() -> ConverterSet {
        let config = Config::default();
        let stub = Arc::new(StubProvider::always(json!({})));
        ConverterSet::new(
            pdf::PdfConverter::new(
                config.pdf.detection.clone(),
                Some(stub.clone()),
                true,
            ),
            audio::AudioConverter::new(stub.clone()),
            vision::VisionConverter::new(stub, String::new()),
        )
    }

    #[test]
    fn adapter_selection_is_ordered_and_extension_based() {
        let set = converter_set();
        assert_eq!(set.select("report.PDF").unwrap().name(), "pdf");
        assert_eq!(set.select("call.mp3").unwrap().name(), "audio");
        assert_eq!(set.select("photo.png").unwrap().name(), "vision");
        assert_eq!(set.select("notes.txt").unwrap().name(), "passthrough");
        assert!(set.select("data.xyz").is_none());
    }

    #[tokio::test]
    async fn unsupported_extension_yields_unsupported_kind() {
        let set = converter_set();
        let entry = FileEntry::direct("/nonexistent/data.xyz");
        let result = set.convert_entry(&entry).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Unsupported));
    }

    #[test]
    fn archive_entries_render_display_names() {
        let entry = FileEntry::from_archive("/tmp/x/a.txt", "batch.zip", "sub/a.txt");
        assert_eq!(entry.display_name, "batch.zip → sub/a.txt");
        assert!(matches!(entry.origin, FileOrigin::Archive { .. }));
    }
}
