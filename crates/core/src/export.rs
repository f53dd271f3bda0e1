use crate::error::ExtractError;
use crate::images::ExtractedRaster;
use crate::models::{Chunk, ExtractedImage};
use crate::resolver::{ImageIndex, ResolutionReport};
use crate::structure::DocumentTree;
use image::ImageFormat;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const SLUG_MAX_CHARS: usize = 50;

/// File locations for one document's artifacts.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn prepare(&self) -> Result<(), ExtractError> {
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.tables_dir())?;
        Ok(())
    }

    pub fn text_file(&self) -> PathBuf {
        self.root.join("text.txt")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    pub fn document_file(&self) -> PathBuf {
        self.root.join("document.json")
    }

    pub fn chunks_file(&self) -> PathBuf {
        self.root.join("chunks.json")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.root.join("tables")
    }
}

/// Filesystem-safe names derived from captions, unique within one document.
pub struct SlugRegistry {
    strip: Regex,
    spaces: Regex,
    used: HashSet<String>,
    counters: HashMap<String, usize>,
}

impl SlugRegistry {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            strip: Regex::new(r"[^\w\s-]")?,
            spaces: Regex::new(r"\s+")?,
            used: HashSet::new(),
            counters: HashMap::new(),
        })
    }

    /// Word characters, spaces and hyphens survive; whitespace runs become
    /// `_`; the result is cut to 50 characters without trailing `_` or `-`.
    pub fn slug(&self, text: &str) -> String {
        let stripped = self.strip.replace_all(text, "");
        let joined = self.spaces.replace_all(stripped.trim(), "_");
        let cut: String = joined.chars().take(SLUG_MAX_CHARS).collect();
        cut.trim_end_matches(['_', '-']).to_string()
    }

    /// Slug for `text` (or `fallback` when nothing survives), suffixed
    /// `_2`, `_3`, ... on collision.
    pub fn claim(&mut self, text: &str, fallback: &str) -> String {
        let mut base = self.slug(text);
        if base.is_empty() {
            base = fallback.to_string();
        }

        let mut candidate = base.clone();
        while self.used.contains(&candidate) {
            let counter = self.counters.entry(base.clone()).or_insert(1);
            *counter += 1;
            candidate = format!("{base}_{counter}");
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

/// Provenance stamped into every sidecar record.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub source_file: String,
    pub document_id: String,
    pub group: String,
}

#[derive(Debug, Serialize)]
struct ImageSidecar<'a> {
    caption: &'a str,
    page_number: u32,
    picture_ref: &'a str,
    source_file: &'a str,
    document_id: &'a str,
    group: &'a str,
    width: u32,
    height: u32,
    color_space: crate::models::ColorSpaceKind,
}

#[derive(Debug, Serialize)]
struct TableSidecar<'a> {
    caption: &'a str,
    page_number: Option<u32>,
    rows: usize,
    cols: usize,
    table_ref: &'a str,
    source_file: &'a str,
    document_id: &'a str,
    group: &'a str,
}

#[derive(Debug)]
pub struct ImageExport {
    /// Every kept image, saved or not, in extraction order.
    pub images: Vec<ExtractedImage>,
    /// Saved images only.
    pub index: ImageIndex,
    pub saved: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct TableExport {
    /// Table self ref to its CSV path relative to the document directory.
    pub files: HashMap<String, String>,
    pub exported: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub original_pdf_path: String,
    pub document_id: String,
    pub checksum: String,
    pub group: String,
    pub author: String,
    pub year: String,
    pub title: String,
    pub page_count: usize,
    pub text_length_chars: usize,
    pub image_count: usize,
    pub table_count: usize,
    pub chunk_count: usize,
    pub ocr_used: bool,
    pub extraction_datetime: String,
    pub postprocess: ResolutionReport,
}

/// Single writer for one document's output directory.
pub struct ArtifactWriter {
    layout: OutputLayout,
    context: DocumentContext,
}

impl ArtifactWriter {
    pub fn new(layout: OutputLayout, context: DocumentContext) -> Self {
        Self { layout, context }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn write_text(&self, text: &str) -> Result<(), ExtractError> {
        fs::write(self.layout.text_file(), text)?;
        Ok(())
    }

    /// Saves kept rasters as `images/page{N}_img{k}.png` with a JSON sidecar.
    /// A failed save is logged and leaves the image out of the index.
    pub fn write_images(&self, rasters: Vec<ExtractedRaster>) -> ImageExport {
        let mut export = ImageExport {
            images: Vec::with_capacity(rasters.len()),
            index: ImageIndex::new(),
            saved: 0,
            failed: 0,
        };
        let mut per_page: HashMap<u32, usize> = HashMap::new();

        for raster in rasters {
            let ordinal = per_page.entry(raster.image.page).or_default();
            *ordinal += 1;
            let stem = format!("page{}_img{}", raster.image.page, ordinal);
            let relative = format!("images/{stem}.png");

            match self.save_image(&raster, &stem) {
                Ok(()) => {
                    export.saved += 1;
                    export.index.insert(raster.image.clone(), relative);
                }
                Err(error) => {
                    warn!(picture = %raster.image.reference, page = raster.image.page, error = %error, "failed to save image");
                    export.failed += 1;
                }
            }
            export.images.push(raster.image);
        }

        export
    }

    fn save_image(&self, raster: &ExtractedRaster, stem: &str) -> Result<(), ExtractError> {
        let dir = self.layout.images_dir();
        raster
            .pixels
            .save_with_format(dir.join(format!("{stem}.png")), ImageFormat::Png)?;

        let image = &raster.image;
        let sidecar = ImageSidecar {
            caption: &image.caption,
            page_number: image.page,
            picture_ref: &image.reference,
            source_file: &self.context.source_file,
            document_id: &self.context.document_id,
            group: &self.context.group,
            width: image.width,
            height: image.height,
            color_space: image.color_space,
        };
        write_json(&dir.join(format!("{stem}_meta.json")), &sidecar)
    }

    /// Exports every table item as `tables/<slug>.csv` plus `<slug>_meta.json`.
    pub fn write_tables(&self, tree: &DocumentTree) -> Result<TableExport, ExtractError> {
        let mut slugs = SlugRegistry::new()?;
        let mut export = TableExport::default();

        for (position, table) in tree.tables().enumerate() {
            let slug = slugs.claim(&table.caption, &format!("table_{}", position + 1));
            match self.save_table(table, &slug) {
                Ok(()) => {
                    export
                        .files
                        .insert(table.self_ref.clone(), format!("tables/{slug}.csv"));
                    export.exported += 1;
                }
                Err(error) => {
                    warn!(table = %table.self_ref, error = %error, "failed to export table");
                    export.failed += 1;
                }
            }
        }

        Ok(export)
    }

    fn save_table(&self, table: &crate::structure::TableItem, slug: &str) -> Result<(), ExtractError> {
        let dir = self.layout.tables_dir();
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(dir.join(format!("{slug}.csv")))?;
        for row in &table.cells {
            writer.write_record(row)?;
        }
        writer.flush()?;

        let sidecar = TableSidecar {
            caption: &table.caption,
            page_number: table.pages.first().copied(),
            rows: table.rows(),
            cols: table.cols(),
            table_ref: &table.self_ref,
            source_file: &self.context.source_file,
            document_id: &self.context.document_id,
            group: &self.context.group,
        };
        write_json(&dir.join(format!("{slug}_meta.json")), &sidecar)
    }

    pub fn write_tree(&self, tree: &DocumentTree) -> Result<(), ExtractError> {
        write_json(&self.layout.document_file(), tree)
    }

    pub fn write_chunks(&self, chunks: &[Chunk]) -> Result<(), ExtractError> {
        write_json(&self.layout.chunks_file(), &chunks)
    }

    pub fn write_metadata(&self, metadata: &DocumentMetadata) -> Result<(), ExtractError> {
        write_json(&self.layout.metadata_file(), metadata)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ExtractError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColorSpaceKind, FigureRef};
    use crate::structure::{StructuralItem, TableItem};
    use image::{DynamicImage, RgbImage};
    use tempfile::tempdir;

    fn context() -> DocumentContext {
        DocumentContext {
            source_file: "Smith_2019_Pardosa.pdf".to_string(),
            document_id: "abc".to_string(),
            group: "pardosa".to_string(),
        }
    }

    fn raster(reference: &str, page: u32, caption: &str) -> ExtractedRaster {
        ExtractedRaster {
            image: ExtractedImage {
                reference: reference.to_string(),
                page,
                resource_id: "7 0 R".to_string(),
                width: 4,
                height: 3,
                color_space: ColorSpaceKind::DeviceRgb,
                coverage: None,
                caption: caption.to_string(),
            },
            pixels: DynamicImage::ImageRgb8(RgbImage::new(4, 3)),
        }
    }

    fn table(self_ref: &str, caption: &str, cells: Vec<Vec<String>>) -> StructuralItem {
        StructuralItem::Table(TableItem {
            self_ref: self_ref.to_string(),
            caption: caption.to_string(),
            pages: vec![3],
            cells,
        })
    }

    fn strings(row: &[&str]) -> Vec<String> {
        row.iter().map(|cell| cell.to_string()).collect()
    }

    #[test]
    fn slug_strips_punctuation_and_truncates() -> Result<(), ExtractError> {
        let registry = SlugRegistry::new()?;
        assert_eq!(registry.slug("Table 2. Measurements (mm)"), "Table_2_Measurements_mm");
        assert_eq!(registry.slug("  Таблица 1: самцы  "), "Таблица_1_самцы");

        let long = "Table 1 ".repeat(10);
        let slug = registry.slug(&long);
        assert!(slug.chars().count() <= 50);
        assert!(!slug.ends_with('_'));
        assert_eq!(registry.slug("?!"), "");
        Ok(())
    }

    #[test]
    fn colliding_slugs_are_numbered() -> Result<(), ExtractError> {
        let mut registry = SlugRegistry::new()?;
        assert_eq!(registry.claim("Table 1", "table_1"), "Table_1");
        assert_eq!(registry.claim("Table 1", "table_2"), "Table_1_2");
        assert_eq!(registry.claim("Table 1!", "table_3"), "Table_1_3");
        assert_eq!(registry.claim("", "table_4"), "table_4");
        Ok(())
    }

    #[test]
    fn images_are_saved_with_sidecars_and_indexed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let layout = OutputLayout::new(dir.path());
        layout.prepare()?;
        let writer = ArtifactWriter::new(layout, context());

        let export = writer.write_images(vec![
            raster("#/pictures/0", 2, "Fig. 1. Habitus"),
            raster("#/pictures/1", 2, ""),
            raster("#/pictures/2", 5, ""),
        ]);

        assert_eq!(export.saved, 3);
        assert_eq!(export.failed, 0);
        assert_eq!(export.images.len(), 3);
        assert_eq!(
            export.index.get("#/pictures/1").map(|entry| entry.file.as_str()),
            Some("images/page2_img2.png")
        );
        assert!(dir.path().join("images/page5_img1.png").exists());

        let sidecar: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("images/page2_img1_meta.json"))?)?;
        assert_eq!(sidecar["caption"], "Fig. 1. Habitus");
        assert_eq!(sidecar["picture_ref"], "#/pictures/0");
        assert_eq!(sidecar["group"], "pardosa");
        assert_eq!(sidecar["page_number"], 2);
        Ok(())
    }

    #[test]
    fn failed_image_save_stays_out_of_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let writer = ArtifactWriter::new(OutputLayout::new(dir.path().join("missing")), context());

        let export = writer.write_images(vec![raster("#/pictures/0", 1, "")]);
        assert_eq!(export.saved, 0);
        assert_eq!(export.failed, 1);
        assert!(export.index.is_empty());
        assert_eq!(export.images.len(), 1);
        Ok(())
    }

    #[test]
    fn tables_export_csv_and_meta() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let layout = OutputLayout::new(dir.path());
        layout.prepare()?;
        let writer = ArtifactWriter::new(layout, context());
        let tree = DocumentTree {
            name: "Smith_2019_Pardosa.pdf".to_string(),
            pages: Vec::new(),
            items: vec![
                table(
                    "#/tables/0",
                    "Table 1. Measurements",
                    vec![strings(&["Leg", "Femur", "Tibia"]), strings(&["I", "2.1", "1.9"]), strings(&["II", "2.0"])],
                ),
                table("#/tables/1", "", vec![strings(&["a", "b"])]),
            ],
        };

        let export = writer.write_tables(&tree)?;
        assert_eq!(export.exported, 2);
        assert_eq!(
            export.files.get("#/tables/0").map(String::as_str),
            Some("tables/Table_1_Measurements.csv")
        );
        assert_eq!(export.files.get("#/tables/1").map(String::as_str), Some("tables/table_2.csv"));

        let csv_text = fs::read_to_string(dir.path().join("tables/Table_1_Measurements.csv"))?;
        assert_eq!(csv_text, "Leg,Femur,Tibia\nI,2.1,1.9\nII,2.0\n");

        let meta: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("tables/Table_1_Measurements_meta.json"))?)?;
        assert_eq!(meta["rows"], 3);
        assert_eq!(meta["cols"], 3);
        assert_eq!(meta["page_number"], 3);
        Ok(())
    }

    #[test]
    fn chunks_file_lists_figures_with_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let layout = OutputLayout::new(dir.path());
        layout.prepare()?;
        let writer = ArtifactWriter::new(layout, context());

        let mut figure = FigureRef::new("Fig. 1", "#/pictures/0");
        figure.image_file = Some("images/page1_img1.png".to_string());
        let chunk = Chunk {
            text: "Body".to_string(),
            page_numbers: vec![1],
            figures: vec![figure],
            ..Chunk::default()
        };
        writer.write_chunks(&[chunk])?;

        let written: serde_json::Value = serde_json::from_slice(&fs::read(writer.layout().chunks_file())?)?;
        assert_eq!(written[0]["figures"][0]["image_file"], "images/page1_img1.png");
        assert_eq!(written[0]["page_numbers"][0], 1);
        Ok(())
    }
}
