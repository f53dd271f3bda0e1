pub mod chunking;
pub mod duplicates;
pub mod engines;
pub mod error;
pub mod export;
pub mod extractor;
pub mod fuzzy;
pub mod images;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod reliability;
pub mod resolver;
pub mod run;
pub mod structure;

pub use chunking::{normalize_whitespace, split_text, ChunkBuilder, ChunkingConfig};
pub use duplicates::{
    find_duplicates, redundant_copies, select_keeper, write_duplicate_csv, DuplicateGroup,
    DuplicateScan,
};
pub use engines::{
    HttpRecognizer, OcrEndpointConfig, PageRenderer, PdftoppmRenderer, TesseractRecognizer,
    TextRecognizer,
};
pub use error::{ExtractError, Result};
pub use export::{ArtifactWriter, DocumentMetadata, OutputLayout, SlugRegistry};
pub use extractor::{load_document, native_pages, NativePage};
pub use fuzzy::{partial_ratio, CaptionMatcher, DisabledMatcher, PartialRatioMatcher};
pub use images::{ExtractedRaster, ImageExtractor, ImageFilter, PictureRefs};
pub use ingest::{
    digest_file, discover_pdf_files, generate_document_id, parse_filename, plan_jobs, DocumentJob,
};
pub use models::{
    Chunk, ColorSpaceKind, Coverage, ExtractedImage, ExtractionOptions, FigureRef, Page,
    ParsedFilename, Reliability, TableRef, TextOrigin,
};
pub use ocr::{OcrFallback, OcrOptions, PageSet};
pub use pipeline::{DocumentReport, Engines, Pipeline};
pub use reliability::{classify, ReliabilityThresholds};
pub use resolver::{ImageIndex, ReferenceResolver, Removal, ResolutionReport};
pub use run::{process_jobs, settle, LogRow, RunLog, RunOutcome, RunSummary};
pub use structure::{DocumentTree, StructuralItem, StructureConverter, TextLayoutConverter};
