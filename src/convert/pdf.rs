//! PDF adapter with intelligent routing between text extraction and OCR.
//!
//! Extracting embedded text is cheap; OCR is not. We look at every page,
//! count the pages that carry real text, and only route to the OCR provider
//! when the share of text pages falls below the configured threshold.
//!
//! Text extraction shells out to `pdftotext` and `pdfinfo` from
//! `poppler-utils`. This will miss any "non-searchable" text in a PDF, but
//! sometimes you just want cheap and fast; that is exactly what the
//! classifier decides.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use super::{ConversionError, Converter, FileEntry, extension_of};
use crate::{
    async_utils::check_for_command_failure,
    config::PdfDetectionConfig,
    errors::ErrorKind,
    prelude::*,
    provider::OcrProvider,
};

/// Which way a PDF should be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfRoute {
    /// Embedded text is good enough.
    Text,
    /// Mostly scanned pages; needs OCR.
    Ocr,
}

/// The classifier's verdict for one PDF.
#[derive(Debug, Clone)]
pub struct PdfAnalysis {
    pub route: PdfRoute,
    pub total_pages: usize,
    pub text_pages: usize,
    pub text_page_percentage: f64,
    pub reason: String,
}

/// Decide the route from page counts. Pure so it can be tested without a
/// PDF in sight.
pub fn route_for_counts(
    text_pages: usize,
    total_pages: usize,
    detection: &PdfDetectionConfig,
) -> PdfAnalysis {
    if total_pages == 0 {
        return PdfAnalysis {
            route: PdfRoute::Ocr,
            total_pages: 0,
            text_pages: 0,
            text_page_percentage: 0.0,
            reason: "Could not read PDF pages".to_string(),
        };
    }
    let text_page_percentage = (text_pages as f64 / total_pages as f64) * 100.0;
    let needs_ocr = text_page_percentage < detection.text_page_threshold_percent;
    let reason = if needs_ocr {
        format!(
            "Only {:.1}% of pages have sufficient text (threshold: {}%). \
             Routing to OCR for complete extraction.",
            text_page_percentage, detection.text_page_threshold_percent
        )
    } else {
        format!(
            "{:.1}% of pages have sufficient text. Using standard text extraction \
             (skipping {} scanned pages).",
            text_page_percentage,
            total_pages - text_pages
        )
    };
    PdfAnalysis {
        route: if needs_ocr { PdfRoute::Ocr } else { PdfRoute::Text },
        total_pages,
        text_pages,
        text_page_percentage,
        reason,
    }
}

pub struct PdfConverter {
    detection: PdfDetectionConfig,
    ocr: Option<Arc<dyn OcrProvider>>,
    ocr_enabled: bool,
}

impl PdfConverter {
    pub fn new(
        detection: PdfDetectionConfig,
        ocr: Option<Arc<dyn OcrProvider>>,
        ocr_enabled: bool,
    ) -> Self {
        Self {
            detection,
            ocr,
            ocr_enabled,
        }
    }

    /// Classify a PDF by extracting each page's text and counting
    /// non-whitespace characters. Classifier failures default to the OCR
    /// route.
    pub async fn analyze(&self, path: &Path) -> Result<PdfAnalysis, ConversionError> {
        let info = pdf_info(path).await?;
        if info.encrypted {
            return Err(ConversionError::new(
                ErrorKind::PasswordRequired,
                "PDF is password-protected",
            ));
        }
        let mut text_pages = 0;
        for page in 1..=info.pages {
            let text = match extract_page_text(path, page).await {
                Ok(text) => text,
                Err(err) => {
                    warn!(page, %err.message, "could not extract page text");
                    String::new()
                }
            };
            let char_count = text.chars().filter(|c| !c.is_whitespace()).count();
            if char_count >= self.detection.min_chars_per_page {
                text_pages += 1;
                trace!(page, char_count, "text-based page");
            } else {
                trace!(page, char_count, "likely scanned page");
            }
        }
        let analysis = route_for_counts(text_pages, info.pages, &self.detection);
        info!(
            text_pages = analysis.text_pages,
            total_pages = analysis.total_pages,
            percentage = format!("{:.1}", analysis.text_page_percentage),
            route = ?analysis.route,
            "PDF analysis"
        );
        Ok(analysis)
    }
}

#[async_trait]
impl Converter for PdfConverter {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn supports(&self, file_name: &str) -> bool {
        extension_of(file_name) == "pdf"
    }

    async fn convert(&self, entry: &FileEntry) -> Result<String, ConversionError> {
        let analysis = match self.analyze(&entry.path).await {
            Ok(analysis) => analysis,
            Err(err) if err.kind == ErrorKind::PasswordRequired => return Err(err),
            Err(err) => {
                // Default to OCR on classifier failure.
                warn!(%err.message, "PDF analysis failed, defaulting to OCR");
                PdfAnalysis {
                    route: PdfRoute::Ocr,
                    total_pages: 0,
                    text_pages: 0,
                    text_page_percentage: 0.0,
                    reason: format!("Analysis failed: {}. Defaulting to OCR.", err.message),
                }
            }
        };

        match analysis.route {
            PdfRoute::Text => extract_full_text(&entry.path).await,
            PdfRoute::Ocr => {
                let ocr = match (&self.ocr, self.ocr_enabled) {
                    (Some(ocr), true) => ocr,
                    _ => {
                        return Err(ConversionError::new(
                            ErrorKind::OcrUnavailable,
                            format!(
                                "This PDF needs OCR but OCR is not available. {}",
                                analysis.reason
                            ),
                        ));
                    }
                };
                ocr.ocr_pdf(&entry.path).await.map_err(ConversionError::from)
            }
        }
    }
}

/// The subset of `pdfinfo` output we care about.
struct PdfInfo {
    pages: usize,
    encrypted: bool,
}

async fn pdf_info(path: &Path) -> Result<PdfInfo, ConversionError> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| ConversionError::internal(format!("cannot run pdfinfo: {err}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Incorrect password")
        || stderr.contains("Command Line Error: Incorrect password")
    {
        return Err(ConversionError::new(
            ErrorKind::PasswordRequired,
            "PDF is password-protected",
        ));
    }
    check_for_command_failure("pdfinfo", output.status)
        .map_err(|err| ConversionError::internal(err.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut pages = 0;
    let mut encrypted = false;
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Pages:") {
            pages = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Encrypted:") {
            encrypted = rest.trim().starts_with("yes");
        }
    }
    Ok(PdfInfo { pages, encrypted })
}

/// Extract one page's text to stdout.
async fn extract_page_text(path: &Path, page: usize) -> Result<String, ConversionError> {
    run_pdftotext(path, &["-f", &page.to_string(), "-l", &page.to_string()]).await
}

/// Extract the whole document with layout preserved.
async fn extract_full_text(path: &Path) -> Result<String, ConversionError> {
    run_pdftotext(path, &["-layout"]).await
}

async fn run_pdftotext(path: &Path, extra: &[&str]) -> Result<String, ConversionError> {
    let output = Command::new("pdftotext")
        .args(extra)
        .arg(path)
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| {
            ConversionError::internal(format!("cannot run pdftotext: {err}"))
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Incorrect password") {
        return Err(ConversionError::new(
            ErrorKind::PasswordRequired,
            "PDF is password-protected",
        ));
    }
    check_for_command_failure("pdftotext", output.status)
        .map_err(|err| ConversionError::internal(err.to_string()))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection() -> PdfDetectionConfig {
        PdfDetectionConfig::default()
    }

    #[test]
    fn mostly_text_pdfs_route_to_text_extraction() {
        let analysis = route_for_counts(8, 10, &detection());
        assert_eq!(analysis.route, PdfRoute::Text);
        assert!((analysis.text_page_percentage - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn threshold_is_inclusive() {
        // 7/10 = exactly 70%, the default threshold.
        let analysis = route_for_counts(7, 10, &detection());
        assert_eq!(analysis.route, PdfRoute::Text);
    }

    #[test]
    fn scanned_pdfs_route_to_ocr() {
        let analysis = route_for_counts(2, 10, &detection());
        assert_eq!(analysis.route, PdfRoute::Ocr);
        assert!(analysis.reason.contains("Routing to OCR"));
    }

    #[test]
    fn unreadable_pdfs_default_to_ocr() {
        let analysis = route_for_counts(0, 0, &detection());
        assert_eq!(analysis.route, PdfRoute::Ocr);
    }

    #[tokio::test]
    async fn ocr_route_without_provider_is_ocr_unavailable() {
        let converter = PdfConverter::new(detection(), None, false);
        // A file that doesn't exist: analysis fails, we default to OCR, and
        // OCR is unavailable.
        let entry = FileEntry::direct("/nonexistent/scan.pdf");
        let err = converter.convert(&entry).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OcrUnavailable);
    }
}
