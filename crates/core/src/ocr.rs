use crate::engines::{PageRenderer, TextRecognizer};
use crate::error::ExtractError;
use crate::extractor::NativePage;
use crate::models::{Page, Reliability, TextOrigin};
use crate::reliability::{classify, nonws_len, ReliabilityThresholds};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct OcrOptions {
    /// Native text with fewer non-whitespace characters than this is re-recognized.
    pub min_nonws_chars: usize,
    pub dpi: u32,
    pub languages: Vec<String>,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            min_nonws_chars: 50,
            dpi: 200,
            languages: vec!["eng".to_string(), "rus".to_string()],
        }
    }
}

/// Final per-page text for one document.
#[derive(Debug, Clone)]
pub struct PageSet {
    pub pages: Vec<Page>,
    pub ocr_used: bool,
}

impl PageSet {
    /// Page blocks joined in ascending page order, each behind its label.
    pub fn document_text(&self) -> String {
        self.pages
            .iter()
            .map(Page::block)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn ocr_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.used_ocr()).count()
    }

    pub fn ocr_failures(&self) -> usize {
        self.pages
            .iter()
            .filter(|page| matches!(page.origin, TextOrigin::OcrFailed(_)))
            .count()
    }
}

pub struct OcrFallback<'a> {
    renderer: &'a dyn PageRenderer,
    recognizer: &'a dyn TextRecognizer,
    options: &'a OcrOptions,
    thresholds: &'a ReliabilityThresholds,
}

impl<'a> OcrFallback<'a> {
    pub fn new(
        renderer: &'a dyn PageRenderer,
        recognizer: &'a dyn TextRecognizer,
        options: &'a OcrOptions,
        thresholds: &'a ReliabilityThresholds,
    ) -> Self {
        Self {
            renderer,
            recognizer,
            options,
            thresholds,
        }
    }

    /// Verdict on native text: `Sparse` below the character floor, otherwise the classifier's.
    pub fn assess(&self, text: &str) -> Reliability {
        if nonws_len(text) < self.options.min_nonws_chars {
            Reliability::Sparse
        } else {
            classify(text, self.thresholds)
        }
    }

    /// Produces final text for every page.
    ///
    /// A recognition failure becomes a marker on that page only. Errors that
    /// signal a missing engine are returned, since every later page would fail
    /// the same way.
    pub fn process(&self, source: &Path, mut native: Vec<NativePage>) -> Result<PageSet, ExtractError> {
        native.sort_by_key(|page| page.number);

        let mut ocr_used = false;
        let mut pages = Vec::with_capacity(native.len());

        for NativePage { number, text } in native {
            let verdict = self.assess(&text);
            if verdict == Reliability::Reliable {
                pages.push(Page {
                    number,
                    text: text.clone(),
                    native_text: text,
                    verdict,
                    origin: TextOrigin::Native,
                });
                continue;
            }

            ocr_used = true;
            debug!(page = number, ?verdict, "running OCR fallback");

            let page = match self.recognize(source, number) {
                Ok(recognized) => Page {
                    number,
                    native_text: text,
                    verdict,
                    origin: TextOrigin::Ocr,
                    text: recognized,
                },
                Err(error) if error.is_configuration_fatal() => return Err(error),
                Err(error) => {
                    warn!(page = number, error = %error, "OCR failed; keeping failure marker");
                    Page {
                        number,
                        native_text: text,
                        verdict,
                        origin: TextOrigin::OcrFailed(failure_reason(error)),
                        text: String::new(),
                    }
                }
            };
            pages.push(page);
        }

        Ok(PageSet { pages, ocr_used })
    }

    fn recognize(&self, source: &Path, page: u32) -> Result<String, ExtractError> {
        let raster = self.renderer.render_page(source, page, self.options.dpi)?;
        let text = self.recognizer.recognize(&raster, &self.options.languages)?;
        Ok(text.trim().to_string())
    }
}

/// Marker text for a failed page, without the error's own `OCR failed` prefix.
fn failure_reason(error: ExtractError) -> String {
    match error {
        ExtractError::OcrFailed(reason) => reason,
        other => other.to_string(),
    }
}
