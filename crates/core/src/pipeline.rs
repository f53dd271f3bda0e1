//! Per-document orchestration: text, OCR fallback, images, structure,
//! chunks and reference resolution, written to one output directory.

use crate::chunking::ChunkBuilder;
use crate::engines::{PageRenderer, TextRecognizer};
use crate::error::ExtractError;
use crate::export::{ArtifactWriter, DocumentContext, DocumentMetadata, OutputLayout};
use crate::extractor::{load_document, native_pages};
use crate::fuzzy::CaptionMatcher;
use crate::images::{ImageExtractor, PageRequest, PictureRefs};
use crate::ingest::{build_document_fingerprint, parse_filename, DocumentJob};
use crate::models::ExtractionOptions;
use crate::ocr::OcrFallback;
use crate::resolver::{ReferenceResolver, ResolutionReport};
use crate::structure::{ConversionInput, LayoutRules, StructureConverter};
use std::path::PathBuf;
use tracing::{debug, info};

/// External collaborators used by the pipeline.
pub struct Engines {
    pub renderer: Box<dyn PageRenderer>,
    pub recognizer: Box<dyn TextRecognizer>,
    pub converter: Box<dyn StructureConverter>,
    pub matcher: Box<dyn CaptionMatcher>,
}

/// Statistics for one successfully processed document.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub source: PathBuf,
    pub group: String,
    pub output_dir: PathBuf,
    pub page_count: usize,
    pub text_length: usize,
    pub ocr_used: bool,
    pub pages_ocr: usize,
    pub pages_ocr_failed: usize,
    pub images_saved: usize,
    pub images_failed: usize,
    pub images_rejected: usize,
    pub images_unreadable: usize,
    pub tables_exported: usize,
    pub tables_failed: usize,
    pub chunk_count: usize,
    pub chunks_with_figures: usize,
    pub chunks_with_tables: usize,
    pub resolution: ResolutionReport,
}

pub struct Pipeline {
    options: ExtractionOptions,
    engines: Engines,
    rules: LayoutRules,
}

impl Pipeline {
    pub fn new(options: ExtractionOptions, engines: Engines) -> Result<Self, ExtractError> {
        options.chunking.validate()?;
        Ok(Self {
            options,
            engines,
            rules: LayoutRules::new()?,
        })
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub fn process(&self, job: &DocumentJob) -> Result<DocumentReport, ExtractError> {
        let fingerprint = build_document_fingerprint(&job.source)?;
        let parsed = parse_filename(&job.stem)?;
        let document = load_document(&job.source)?;

        let ocr = OcrFallback::new(
            self.engines.renderer.as_ref(),
            self.engines.recognizer.as_ref(),
            &self.options.ocr,
            &self.options.reliability,
        );
        let page_set = ocr.process(&job.source, native_pages(&document))?;

        let page_ids = document.get_pages();
        let extractor = ImageExtractor::new(&document, &self.options.images);
        let mut refs = PictureRefs::default();
        let mut rasters = Vec::new();
        let mut images_rejected = 0;
        let mut images_unreadable = 0;
        for page in &page_set.pages {
            let Some(&page_id) = page_ids.get(&page.number) else {
                continue;
            };
            let captions = self.rules.figure_captions(&page.text);
            let found = extractor.extract_page(
                &PageRequest {
                    page: page.number,
                    page_id,
                    page_nonws: page.text_nonws(),
                    captions: &captions,
                },
                &mut refs,
            );
            debug!(page = page.number, kept = found.kept.len(), rejected = found.rejected, "page images");
            images_rejected += found.rejected;
            images_unreadable += found.unreadable;
            rasters.extend(found.kept);
        }

        let layout = OutputLayout::new(&job.output_dir);
        layout.prepare()?;
        let writer = ArtifactWriter::new(
            layout,
            DocumentContext {
                source_file: fingerprint.file_name.clone(),
                document_id: fingerprint.document_id.clone(),
                group: job.group.clone(),
            },
        );

        let text = page_set.document_text();
        writer.write_text(&text)?;
        let images = writer.write_images(rasters);

        let tree = self.engines.converter.convert(&ConversionInput {
            name: &fingerprint.file_name,
            pages: &page_set.pages,
            images: &images.images,
        })?;
        writer.write_tree(&tree)?;
        let tables = writer.write_tables(&tree)?;

        let mut chunks = ChunkBuilder::new(
            &self.options.chunking,
            &tree,
            &tables.files,
            &fingerprint.file_name,
            &job.group,
        )
        .build();
        let resolution = ReferenceResolver::new(
            &images.index,
            self.engines.matcher.as_ref(),
            self.options.fuzzy_threshold,
        )
        .resolve(&mut chunks);
        writer.write_chunks(&chunks)?;

        let text_length = text.chars().count();
        writer.write_metadata(&DocumentMetadata {
            original_pdf_path: fingerprint.source_path.clone(),
            document_id: fingerprint.document_id.clone(),
            checksum: fingerprint.checksum.clone(),
            group: job.group.clone(),
            author: parsed.author,
            year: parsed.year,
            title: parsed.title,
            page_count: page_set.pages.len(),
            text_length_chars: text_length,
            image_count: images.saved,
            table_count: tables.exported,
            chunk_count: chunks.len(),
            ocr_used: page_set.ocr_used,
            extraction_datetime: fingerprint.extracted_at.to_rfc3339(),
            postprocess: resolution.clone(),
        })?;

        info!(
            source = %job.source.display(),
            pages = page_set.pages.len(),
            images = images.saved,
            tables = tables.exported,
            chunks = chunks.len(),
            ocr_used = page_set.ocr_used,
            "document processed"
        );

        Ok(DocumentReport {
            source: job.source.clone(),
            group: job.group.clone(),
            output_dir: job.output_dir.clone(),
            page_count: page_set.pages.len(),
            text_length,
            ocr_used: page_set.ocr_used,
            pages_ocr: page_set.ocr_pages(),
            pages_ocr_failed: page_set.ocr_failures(),
            images_saved: images.saved,
            images_failed: images.failed,
            images_rejected,
            images_unreadable,
            tables_exported: tables.exported,
            tables_failed: tables.failed,
            chunk_count: chunks.len(),
            chunks_with_figures: chunks.iter().filter(|chunk| !chunk.figures.is_empty()).count(),
            chunks_with_tables: chunks.iter().filter(|chunk| !chunk.tables.is_empty()).count(),
            resolution,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fuzzy::PartialRatioMatcher;
    use crate::structure::TextLayoutConverter;
    use image::DynamicImage;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    /// Renders page `n` as an `n`x1 raster so the recognizer can tell pages apart.
    pub(crate) struct PageStampRenderer;

    impl PageRenderer for PageStampRenderer {
        fn render_page(&self, _source: &Path, page: u32, _dpi: u32) -> Result<DynamicImage, ExtractError> {
            Ok(DynamicImage::new_luma8(page, 1))
        }
    }

    pub(crate) struct ScriptedRecognizer {
        pub(crate) pages: Vec<&'static str>,
    }

    impl TextRecognizer for ScriptedRecognizer {
        fn recognize(&self, image: &DynamicImage, _languages: &[String]) -> Result<String, ExtractError> {
            let index = image.width() as usize - 1;
            self.pages
                .get(index)
                .map(|text| text.to_string())
                .ok_or_else(|| ExtractError::OcrFailed(format!("no script for page {}", index + 1)))
        }
    }

    struct MissingRecognizer;

    impl TextRecognizer for MissingRecognizer {
        fn recognize(&self, _image: &DynamicImage, _languages: &[String]) -> Result<String, ExtractError> {
            Err(ExtractError::EngineUnavailable {
                engine: "tesseract".to_string(),
                details: "not installed".to_string(),
            })
        }
    }

    pub(crate) const PAGE_ONE: &str =
        "Introduction\n\nWolf spiders of the genus Pardosa are common in open habitats across the region.";
    pub(crate) const PAGE_TWO: &str =
        "Fig. 1. Habitus of the male, dorsal view.\n\nThe carapace is dark brown with a pale median band.";

    pub(crate) fn engines(recognizer: Box<dyn TextRecognizer>) -> Result<Engines, ExtractError> {
        Ok(Engines {
            renderer: Box::new(PageStampRenderer),
            recognizer,
            converter: Box::new(TextLayoutConverter::new()?),
            matcher: Box::new(PartialRatioMatcher),
        })
    }

    pub(crate) fn scripted_engines() -> Result<Engines, ExtractError> {
        engines(Box::new(ScriptedRecognizer {
            pages: vec![PAGE_ONE, PAGE_TWO],
        }))
    }

    /// Two text-less pages; page 2 draws a 100x100 gray image at 200x200 points.
    pub(crate) fn write_scanned_pdf(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let figure = document.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 100,
                "Height" => 100,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![90u8; 100 * 100],
        ));

        let blank = document.add_object(Stream::new(dictionary! {}, Vec::new()));
        let drawing = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![200.into(), 0.into(), 0.into(), 200.into(), 100.into(), 300.into()],
                ),
                Operation::new("Do", vec![Object::Name(b"Fig1".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let drawn = document.add_object(Stream::new(dictionary! {}, drawing.encode()?));

        let mut kids = Vec::new();
        for contents in [blank, drawn] {
            let page_id = document.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => contents,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Resources" => dictionary! {
                    "XObject" => dictionary! { "Fig1" => figure },
                },
            });
            kids.push(Object::Reference(page_id));
        }
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 2,
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);
        document.save(path)?;
        Ok(())
    }

    #[test]
    fn scanned_document_produces_every_artifact() -> Result<(), Box<dyn std::error::Error>> {
        let input = tempdir()?;
        let output = tempdir()?;
        let group_dir = input.path().join("pardosa");
        fs::create_dir(&group_dir)?;
        let source = group_dir.join("Smith_2019_Pardosa_palps.pdf");
        write_scanned_pdf(&source)?;

        let pipeline = Pipeline::new(ExtractionOptions::default(), scripted_engines()?)?;
        let job = DocumentJob::new(&source, output.path())?;
        let report = pipeline.process(&job)?;

        assert_eq!(report.page_count, 2);
        assert!(report.ocr_used);
        assert_eq!(report.pages_ocr, 2);
        assert_eq!(report.images_saved, 1);
        assert_eq!(report.chunks_with_figures, 1);
        assert_eq!(report.chunks_with_tables, 0);

        let dir = output.path().join("pardosa").join("Smith_2019_Pardosa_palps");
        let text = fs::read_to_string(dir.join("text.txt"))?;
        assert!(text.contains("[Page 1 - OCR]"));
        assert!(text.contains("[Page 2 - OCR]\nFig. 1. Habitus"));
        assert!(dir.join("images/page2_img1.png").exists());
        assert!(dir.join("images/page2_img1_meta.json").exists());
        assert!(dir.join("document.json").exists());

        let metadata: serde_json::Value = serde_json::from_slice(&fs::read(dir.join("metadata.json"))?)?;
        assert_eq!(metadata["author"], "Smith");
        assert_eq!(metadata["year"], "2019");
        assert_eq!(metadata["title"], "Pardosa palps");
        assert_eq!(metadata["group"], "pardosa");
        assert_eq!(metadata["page_count"], 2);
        assert_eq!(metadata["image_count"], 1);
        assert_eq!(metadata["ocr_used"], true);

        let chunks: serde_json::Value = serde_json::from_slice(&fs::read(dir.join("chunks.json"))?)?;
        let figures: Vec<&serde_json::Value> = chunks
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|chunk| chunk["figures"].as_array().into_iter().flatten())
            .collect();
        assert_eq!(figures.len(), 1);
        assert_eq!(figures[0]["picture_ref"], "#/pictures/0");
        assert_eq!(figures[0]["image_file"], "images/page2_img1.png");
        assert_eq!(figures[0]["caption"], "Fig. 1. Habitus of the male, dorsal view.");
        Ok(())
    }

    #[test]
    fn unreadable_pdf_fails_the_document() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let source = dir.path().join("broken.pdf");
        fs::write(&source, b"%PDF-1.4\n%broken")?;

        let pipeline = Pipeline::new(ExtractionOptions::default(), scripted_engines()?)?;
        let result = pipeline.process(&DocumentJob::new(&source, dir.path())?);
        assert!(matches!(result, Err(ExtractError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn missing_recognizer_is_configuration_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let source = dir.path().join("Scan_2001_Plates.pdf");
        write_scanned_pdf(&source)?;

        let pipeline = Pipeline::new(ExtractionOptions::default(), engines(Box::new(MissingRecognizer))?)?;
        let error = match pipeline.process(&DocumentJob::new(&source, dir.path())?) {
            Ok(_) => return Err("expected a fatal engine error".into()),
            Err(error) => error,
        };
        assert!(error.is_configuration_fatal());
        Ok(())
    }

    #[test]
    fn invalid_chunking_is_rejected_up_front() -> Result<(), Box<dyn std::error::Error>> {
        let mut options = ExtractionOptions::default();
        options.chunking.overlap_chars = options.chunking.max_chars;
        assert!(matches!(
            Pipeline::new(options, scripted_engines()?),
            Err(ExtractError::InvalidChunkConfig(_))
        ));
        Ok(())
    }
}
