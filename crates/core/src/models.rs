use crate::chunking::ChunkingConfig;
use crate::images::ImageFilter;
use crate::ocr::OcrOptions;
use crate::reliability::{nonws_len, ReliabilityThresholds};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Reliable,
    Garbled,
    Sparse,
}

/// Where a page's final text came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum TextOrigin {
    Native,
    Ocr,
    OcrFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub native_text: String,
    pub verdict: Reliability,
    pub origin: TextOrigin,
    pub text: String,
}

impl Page {
    pub fn label(&self) -> String {
        match &self.origin {
            TextOrigin::Native => format!("[Page {}]", self.number),
            TextOrigin::Ocr => format!("[Page {} - OCR]", self.number),
            TextOrigin::OcrFailed(reason) => {
                format!("[Page {} - OCR failed: {reason}]", self.number)
            }
        }
    }

    /// The page as it appears in the document text file.
    pub fn block(&self) -> String {
        match self.origin {
            TextOrigin::OcrFailed(_) => self.label(),
            _ => format!("{}\n{}", self.label(), self.text),
        }
    }

    pub fn text_nonws(&self) -> usize {
        nonws_len(&self.text)
    }

    pub fn used_ocr(&self) -> bool {
        !matches!(self.origin, TextOrigin::Native)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColorSpaceKind {
    ImageMask,
    DeviceGray,
    DeviceRgb,
    DeviceCmyk,
    CalGray,
    CalRgb,
    IccBased,
    Separation,
    DeviceN,
    Indexed,
}

/// Placement size as a fraction of the page box.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coverage {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedImage {
    pub reference: String,
    pub page: u32,
    pub resource_id: String,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpaceKind,
    pub coverage: Option<Coverage>,
    pub caption: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FigureRef {
    pub caption: String,
    pub picture_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_file: Option<String>,
}

impl FigureRef {
    pub fn new(caption: impl Into<String>, picture_ref: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            picture_ref: picture_ref.into(),
            image_file: None,
        }
    }
}

impl PartialEq for FigureRef {
    fn eq(&self, other: &Self) -> bool {
        self.picture_ref == other.picture_ref
    }
}

impl Eq for FigureRef {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRef {
    pub caption: String,
    pub csv_file: String,
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.csv_file == other.csv_file
    }
}

impl Eq for TableRef {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub headings: Vec<String>,
    pub item_types: Vec<String>,
    pub source_file: String,
    pub group: String,
    pub page_numbers: Vec<u32>,
    pub figures: Vec<FigureRef>,
    pub tables: Vec<TableRef>,
}

impl Chunk {
    pub fn references(&self, picture_ref: &str) -> bool {
        self.figures
            .iter()
            .any(|figure| figure.picture_ref == picture_ref)
    }

    pub fn covers_page(&self, page: u32) -> bool {
        self.page_numbers.contains(&page)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedFilename {
    pub author: String,
    pub year: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub reliability: ReliabilityThresholds,
    pub ocr: OcrOptions,
    pub images: ImageFilter,
    pub chunking: ChunkingConfig,
    pub fuzzy_threshold: f64,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            reliability: ReliabilityThresholds::default(),
            ocr: OcrOptions::default(),
            images: ImageFilter::default(),
            chunking: ChunkingConfig::default(),
            fuzzy_threshold: 85.0,
        }
    }
}
