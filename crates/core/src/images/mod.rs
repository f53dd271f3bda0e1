//! Per-page extraction of embedded figures.
//!
//! Placements come from the content stream, each embedded object is decoded
//! at most once per page, and two kinds of artifact are filtered out: icons
//! below a pixel floor and full-page background scans behind text-bearing
//! pages. Figure plates (full-page images on pages with little text) are kept.

pub mod color;
pub mod placement;

use crate::models::{Coverage, ExtractedImage};
use image::DynamicImage;
use lopdf::{Document, ObjectId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageFilter {
    pub min_width: u32,
    pub min_height: u32,
    /// Fraction of page width and height a placement must reach to count as full-page.
    pub full_page_coverage: f32,
    /// Full-page images are rejected only on pages with more non-whitespace text than this.
    pub full_page_text_cutoff: usize,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self {
            min_width: 50,
            min_height: 50,
            full_page_coverage: 0.85,
            full_page_text_cutoff: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Keep,
    TooSmall,
    FullPageScan,
}

impl ImageFilter {
    pub fn admit(
        &self,
        width: u32,
        height: u32,
        coverage: Option<Coverage>,
        page_nonws: usize,
    ) -> Admission {
        if width < self.min_width || height < self.min_height {
            return Admission::TooSmall;
        }
        let full_page = coverage.is_some_and(|coverage| {
            coverage.width >= self.full_page_coverage && coverage.height >= self.full_page_coverage
        });
        if full_page && page_nonws > self.full_page_text_cutoff {
            Admission::FullPageScan
        } else {
            Admission::Keep
        }
    }
}

/// Document-wide allocator of picture reference identifiers.
#[derive(Debug, Default)]
pub struct PictureRefs {
    next: usize,
}

impl PictureRefs {
    pub fn allocate(&mut self) -> String {
        let reference = format!("#/pictures/{}", self.next);
        self.next += 1;
        reference
    }

    pub fn allocated(&self) -> usize {
        self.next
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'c> {
    pub page: u32,
    pub page_id: ObjectId,
    /// Non-whitespace length of the page's final text.
    pub page_nonws: usize,
    /// Figure captions on the page in reading order.
    pub captions: &'c [String],
}

#[derive(Debug, Clone)]
pub struct ExtractedRaster {
    pub image: ExtractedImage,
    pub pixels: DynamicImage,
}

#[derive(Debug, Default)]
pub struct PageImages {
    pub kept: Vec<ExtractedRaster>,
    pub rejected: usize,
    pub unreadable: usize,
}

pub struct ImageExtractor<'a> {
    document: &'a Document,
    filter: &'a ImageFilter,
}

impl<'a> ImageExtractor<'a> {
    pub fn new(document: &'a Document, filter: &'a ImageFilter) -> Self {
        Self { document, filter }
    }

    pub fn extract_page(&self, request: &PageRequest<'_>, refs: &mut PictureRefs) -> PageImages {
        let page_box = placement::page_box(self.document, request.page_id);
        let mut result = PageImages::default();

        for placed in placement::page_placements(self.document, request.page_id) {
            let resource_id = format!("{} {} R", placed.object_id.0, placed.object_id.1);
            let stream = match self
                .document
                .get_object(placed.object_id)
                .and_then(|object| object.as_stream())
            {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(page = request.page, resource = %resource_id, error = %error, "skipping unreadable image");
                    result.unreadable += 1;
                    continue;
                }
            };

            let (width, height) = match color::declared_size(stream) {
                Ok(size) => size,
                Err(error) => {
                    warn!(page = request.page, resource = %resource_id, error = %error, "skipping unreadable image");
                    result.unreadable += 1;
                    continue;
                }
            };

            let coverage = placed.bounds.map(|bounds| Coverage {
                width: bounds.width() / page_box.width(),
                height: bounds.height() / page_box.height(),
            });

            match self
                .filter
                .admit(width, height, coverage, request.page_nonws)
            {
                Admission::Keep => {}
                verdict => {
                    debug!(page = request.page, resource = %resource_id, ?verdict, width, height, "image rejected");
                    result.rejected += 1;
                    continue;
                }
            }

            let (pixels, color_space) =
                match color::decode_image(self.document, stream, placed.color_spaces.as_ref()) {
                    Ok(decoded) => decoded,
                    Err(error) => {
                        warn!(page = request.page, resource = %resource_id, error = %error, "skipping unreadable image");
                        result.unreadable += 1;
                        continue;
                    }
                };

            let caption = request
                .captions
                .get(result.kept.len())
                .cloned()
                .unwrap_or_default();

            result.kept.push(ExtractedRaster {
                image: ExtractedImage {
                    reference: refs.allocate(),
                    page: request.page,
                    resource_id,
                    width,
                    height,
                    color_space,
                    coverage,
                    caption,
                },
                pixels,
            });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};
    use std::collections::HashSet;

    fn gray_image(document: &mut Document, size: i64) -> ObjectId {
        document.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => size,
                "Height" => size,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![128u8; (size * size) as usize],
        ))
    }

    fn draw(name: &str, scale: f32, x: f32, y: f32) -> Vec<Operation> {
        vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![scale.into(), 0.into(), 0.into(), scale.into(), x.into(), y.into()],
            ),
            Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
            Operation::new("Q", vec![]),
        ]
    }

    /// One 600x600 page drawing `Plate` full-page, `Fig` twice and `Icon` once.
    fn plate_page() -> Result<(Document, ObjectId), Box<dyn std::error::Error>> {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let plate = gray_image(&mut document, 80);
        let figure = gray_image(&mut document, 60);
        let icon = gray_image(&mut document, 10);

        let mut operations = draw("Plate", 600.0, 0.0, 0.0);
        operations.extend(draw("Fig", 100.0, 10.0, 10.0));
        operations.extend(draw("FigAgain", 120.0, 200.0, 200.0));
        operations.extend(draw("Icon", 10.0, 5.0, 5.0));
        let content_id = document.add_object(Stream::new(
            dictionary! {},
            Content { operations }.encode()?,
        ));

        let page_id = document.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 600.into(), 600.into()],
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    "Plate" => plate,
                    "Fig" => figure,
                    "FigAgain" => figure,
                    "Icon" => icon,
                },
            },
        });
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);
        Ok((document, page_id))
    }

    fn full_page() -> Option<Coverage> {
        Some(Coverage {
            width: 0.95,
            height: 0.9,
        })
    }

    #[test]
    fn small_images_are_rejected() {
        let filter = ImageFilter::default();
        assert_eq!(filter.admit(49, 400, None, 0), Admission::TooSmall);
        assert_eq!(filter.admit(400, 49, None, 0), Admission::TooSmall);
        assert_eq!(filter.admit(50, 50, None, 0), Admission::Keep);
    }

    #[test]
    fn full_page_scan_rejection_depends_on_page_text() {
        let filter = ImageFilter::default();
        assert_eq!(filter.admit(2000, 3000, full_page(), 500), Admission::FullPageScan);
        assert_eq!(filter.admit(2000, 3000, full_page(), 200), Admission::Keep);
        assert_eq!(filter.admit(2000, 3000, full_page(), 300), Admission::Keep);

        let half_width = Some(Coverage {
            width: 0.5,
            height: 0.95,
        });
        assert_eq!(filter.admit(2000, 3000, half_width, 500), Admission::Keep);
    }

    #[test]
    fn picture_refs_are_sequential() {
        let mut refs = PictureRefs::default();
        assert_eq!(refs.allocate(), "#/pictures/0");
        assert_eq!(refs.allocate(), "#/pictures/1");
        assert_eq!(refs.allocated(), 2);
    }

    #[test]
    fn text_heavy_page_drops_plate_and_dedups_figure() -> Result<(), Box<dyn std::error::Error>> {
        let (document, page_id) = plate_page()?;
        let filter = ImageFilter::default();
        let extractor = ImageExtractor::new(&document, &filter);
        let captions = vec!["Fig. 1. Habitus".to_string()];
        let mut refs = PictureRefs::default();

        let result = extractor.extract_page(
            &PageRequest {
                page: 1,
                page_id,
                page_nonws: 500,
                captions: &captions,
            },
            &mut refs,
        );

        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.rejected, 2);
        let figure = &result.kept[0].image;
        assert_eq!(figure.width, 60);
        assert_eq!(figure.caption, "Fig. 1. Habitus");
        assert_eq!(figure.reference, "#/pictures/0");

        let resources: HashSet<&str> = result
            .kept
            .iter()
            .map(|kept| kept.image.resource_id.as_str())
            .collect();
        assert_eq!(resources.len(), result.kept.len());
        Ok(())
    }

    #[test]
    fn figure_plate_page_keeps_full_page_image() -> Result<(), Box<dyn std::error::Error>> {
        let (document, page_id) = plate_page()?;
        let filter = ImageFilter::default();
        let extractor = ImageExtractor::new(&document, &filter);
        let mut refs = PictureRefs::default();

        let result = extractor.extract_page(
            &PageRequest {
                page: 1,
                page_id,
                page_nonws: 200,
                captions: &[],
            },
            &mut refs,
        );

        assert_eq!(result.kept.len(), 2);
        assert_eq!(result.rejected, 1);
        assert_eq!(result.kept[0].image.width, 80);
        assert!(result.kept.iter().all(|kept| kept.image.caption.is_empty()));
        assert_eq!(result.kept[0].pixels.width(), 80);
        Ok(())
    }

    #[test]
    fn corrupt_image_is_skipped_without_failing_the_page() -> Result<(), Box<dyn std::error::Error>> {
        let (mut document, page_id) = plate_page()?;
        let broken = document.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 300,
                "Height" => 300,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![0u8; 16],
        ));
        let mut operations = draw("Broken", 100.0, 300.0, 300.0);
        operations.extend(draw("Fig", 100.0, 10.0, 10.0));
        let content_id = document.add_object(Stream::new(
            dictionary! {},
            Content { operations }.encode()?,
        ));
        let page = document.get_dictionary_mut(page_id)?;
        page.set("Contents", content_id);
        let resources = page.get_mut(b"Resources")?.as_dict_mut()?;
        resources
            .get_mut(b"XObject")?
            .as_dict_mut()?
            .set("Broken", broken);

        let filter = ImageFilter::default();
        let extractor = ImageExtractor::new(&document, &filter);
        let mut refs = PictureRefs::default();
        let result = extractor.extract_page(
            &PageRequest {
                page: 1,
                page_id,
                page_nonws: 0,
                captions: &[],
            },
            &mut refs,
        );

        assert_eq!(result.unreadable, 1);
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.kept[0].image.reference, "#/pictures/0");
        Ok(())
    }
}
