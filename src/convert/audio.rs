//! Audio adapter: speech-to-text through the transcription provider.

use std::sync::Arc;

use chrono::Utc;

use super::{ConversionError, Converter, FileEntry, extension_of};
use crate::{prelude::*, provider::TranscriptionProvider};

const EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "ogg", "oga", "webm"];

/// Transcribes audio files and wraps the transcript in a small Markdown
/// document.
pub struct AudioConverter {
    transcription: Arc<dyn TranscriptionProvider>,
}

impl AudioConverter {
    pub fn new(transcription: Arc<dyn TranscriptionProvider>) -> Self {
        Self { transcription }
    }
}

#[async_trait]
impl Converter for AudioConverter {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn supports(&self, file_name: &str) -> bool {
        EXTENSIONS.contains(&extension_of(file_name).as_str())
    }

    async fn convert(&self, entry: &FileEntry) -> Result<String, ConversionError> {
        let transcript = self
            .transcription
            .transcribe(&entry.path)
            .await
            .map_err(ConversionError::from)?;
        Ok(format_transcript(&transcript, &entry.file_name()))
    }
}

fn format_transcript(transcript: &str, file_name: &str) -> String {
    format!(
        "# Audio Transcription\n\n\
         **Source File:** {file_name}\n\
         **Transcription Date:** {date}\n\n\
         ---\n\n\
         ## Transcript\n\n\
         {transcript}\n",
        date = Utc::now().to_rfc3339(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::stub::StubProvider;

    #[tokio::test]
    async fn transcript_is_wrapped_in_markdown() {
        let stub =
            Arc::new(StubProvider::always(json!({})).with_transcript("hello world"));
        let converter = AudioConverter::new(stub);
        assert!(converter.supports("call.mp3"));
        assert!(!converter.supports("call.txt"));

        let entry = FileEntry::direct("/tmp/call.mp3");
        let markdown = converter.convert(&entry).await.unwrap();
        assert!(markdown.starts_with("# Audio Transcription"));
        assert!(markdown.contains("**Source File:** call.mp3"));
        assert!(markdown.contains("hello world"));
    }
}
