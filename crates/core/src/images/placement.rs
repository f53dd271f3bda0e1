//! Where image XObjects are drawn on a page.
//!
//! Walks the page content stream tracking the graphics state stack and the
//! current transformation matrix, descending into form XObjects, so every
//! `Do` of an image yields the page-space box of its unit square.

use crate::error::ExtractError;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashSet;
use tracing::warn;

const MAX_FORM_DEPTH: usize = 8;
const LETTER: Rect = Rect {
    x0: 0.0,
    y0: 0.0,
    x1: 612.0,
    y1: 792.0,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    fn from_operands(operands: &[Object]) -> Option<Matrix> {
        let values: Vec<f32> = operands.iter().filter_map(number).collect();
        match values.as_slice() {
            [a, b, c, d, e, f] => Some(Matrix {
                a: *a,
                b: *b,
                c: *c,
                d: *d,
                e: *e,
                f: *f,
            }),
            _ => None,
        }
    }

    /// `self` applied first, then `outer`.
    pub fn then(&self, outer: &Matrix) -> Matrix {
        Matrix {
            a: self.a * outer.a + self.b * outer.c,
            b: self.a * outer.b + self.b * outer.d,
            c: self.c * outer.a + self.d * outer.c,
            d: self.c * outer.b + self.d * outer.d,
            e: self.e * outer.a + self.f * outer.c + outer.e,
            f: self.e * outer.b + self.f * outer.d + outer.f,
        }
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    /// Page-space bounds of the unit square, which is where images are painted.
    pub fn unit_square_bounds(&self) -> Rect {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(1.0, 0.0),
            self.apply(0.0, 1.0),
            self.apply(1.0, 1.0),
        ];
        let mut rect = Rect {
            x0: f32::MAX,
            y0: f32::MAX,
            x1: f32::MIN,
            y1: f32::MIN,
        };
        for (x, y) in corners {
            rect.x0 = rect.x0.min(x);
            rect.y0 = rect.y0.min(y);
            rect.x1 = rect.x1.max(x);
            rect.y1 = rect.y1.max(y);
        }
        rect
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).abs()
    }

    fn from_array(object: &Object, document: &Document) -> Option<Rect> {
        let values: Vec<f32> = deref(document, object)?
            .as_array()
            .ok()?
            .iter()
            .filter_map(|item| deref(document, item).and_then(number))
            .collect();
        match values.as_slice() {
            [x0, y0, x1, y1] => Some(Rect {
                x0: x0.min(*x1),
                y0: y0.min(*y1),
                x1: x0.max(*x1),
                y1: y0.max(*y1),
            }),
            _ => None,
        }
    }
}

/// One drawn image, first placement only.
#[derive(Debug, Clone)]
pub struct Placement {
    pub object_id: ObjectId,
    /// `None` when the content stream could not be interpreted.
    pub bounds: Option<Rect>,
    /// The `ColorSpace` resource dictionary in scope at the `Do`.
    pub color_spaces: Option<Dictionary>,
}

/// Visible page area: CropBox, else MediaBox (both inheritable), else US Letter.
pub fn page_box(document: &Document, page_id: ObjectId) -> Rect {
    inherited(document, page_id, b"CropBox")
        .and_then(|object| Rect::from_array(object, document))
        .or_else(|| {
            inherited(document, page_id, b"MediaBox")
                .and_then(|object| Rect::from_array(object, document))
        })
        .filter(|rect| rect.width() > 0.0 && rect.height() > 0.0)
        .unwrap_or(LETTER)
}

/// Image placements on a page, deduplicated by embedded object.
///
/// A page whose content stream cannot be decoded still reports the images
/// listed in its resources, without bounds.
pub fn page_placements(document: &Document, page_id: ObjectId) -> Vec<Placement> {
    let resources = inherited(document, page_id, b"Resources")
        .and_then(|object| deref(document, object))
        .and_then(|object| object.as_dict().ok());

    let mut walker = Walker {
        document,
        placements: Vec::new(),
        seen: HashSet::new(),
    };

    let walked = document
        .get_page_content(page_id)
        .map_err(|error| ExtractError::PdfParse(error.to_string()))
        .and_then(|bytes| walker.walk(&bytes, resources, Matrix::IDENTITY, 0));

    if let Err(error) = walked {
        warn!(page_object = ?page_id, error = %error, "content stream not interpretable; listing resource images");
        walker.placements.clear();
        walker.seen.clear();
        walker.list_resource_images(resources);
    }

    walker.placements
}

struct Walker<'a> {
    document: &'a Document,
    placements: Vec<Placement>,
    seen: HashSet<ObjectId>,
}

impl<'a> Walker<'a> {
    fn walk(
        &mut self,
        bytes: &[u8],
        resources: Option<&'a Dictionary>,
        base: Matrix,
        depth: usize,
    ) -> Result<(), ExtractError> {
        let content =
            Content::decode(bytes).map_err(|error| ExtractError::PdfParse(error.to_string()))?;

        let mut ctm = base;
        let mut stack = Vec::new();

        for operation in &content.operations {
            match operation.operator.as_str() {
                "q" => stack.push(ctm),
                "Q" => ctm = stack.pop().unwrap_or(base),
                "cm" => {
                    if let Some(matrix) = Matrix::from_operands(&operation.operands) {
                        ctm = matrix.then(&ctm);
                    }
                }
                "Do" => {
                    let Some(name) = operation
                        .operands
                        .first()
                        .and_then(|operand| operand.as_name().ok())
                    else {
                        continue;
                    };
                    self.draw(name, resources, ctm, depth)?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn draw(
        &mut self,
        name: &[u8],
        resources: Option<&'a Dictionary>,
        ctm: Matrix,
        depth: usize,
    ) -> Result<(), ExtractError> {
        let Some(object_id) = resources
            .and_then(|resources| sub_dictionary(self.document, resources, b"XObject"))
            .and_then(|xobjects| xobjects.get(name).ok())
            .and_then(|object| object.as_reference().ok())
        else {
            return Ok(());
        };

        let Ok(stream) = self
            .document
            .get_object(object_id)
            .and_then(|object| object.as_stream())
        else {
            return Ok(());
        };

        match subtype(stream) {
            Some(b"Image") => {
                if self.seen.insert(object_id) {
                    self.placements.push(Placement {
                        object_id,
                        bounds: Some(ctm.unit_square_bounds()),
                        color_spaces: resources
                            .and_then(|resources| {
                                sub_dictionary(self.document, resources, b"ColorSpace")
                            })
                            .cloned(),
                    });
                }
            }
            Some(b"Form") if depth < MAX_FORM_DEPTH => {
                let form_matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|object| deref(self.document, object))
                    .and_then(|object| object.as_array().ok())
                    .and_then(|operands| Matrix::from_operands(operands))
                    .unwrap_or(Matrix::IDENTITY);
                let form_resources = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|object| deref(self.document, object))
                    .and_then(|object| object.as_dict().ok())
                    .or(resources);
                let bytes = stream_bytes(stream)?;
                self.walk(&bytes, form_resources, form_matrix.then(&ctm), depth + 1)?;
            }
            _ => {}
        }

        Ok(())
    }

    fn list_resource_images(&mut self, resources: Option<&'a Dictionary>) {
        let Some(resources) = resources else {
            return;
        };
        let color_spaces = sub_dictionary(self.document, resources, b"ColorSpace").cloned();
        let Some(xobjects) = sub_dictionary(self.document, resources, b"XObject") else {
            return;
        };

        for (_, object) in xobjects.iter() {
            let Ok(object_id) = object.as_reference() else {
                continue;
            };
            let is_image = self
                .document
                .get_object(object_id)
                .and_then(|object| object.as_stream())
                .map(|stream| subtype(stream) == Some(b"Image".as_slice()))
                .unwrap_or(false);
            if is_image && self.seen.insert(object_id) {
                self.placements.push(Placement {
                    object_id,
                    bounds: None,
                    color_spaces: color_spaces.clone(),
                });
            }
        }
    }
}

fn subtype(stream: &Stream) -> Option<&[u8]> {
    stream
        .dict
        .get(b"Subtype")
        .ok()
        .and_then(|object| object.as_name().ok())
}

/// Stream payload with its filters removed; unfiltered streams are returned as is.
pub(crate) fn stream_bytes(stream: &Stream) -> Result<Vec<u8>, ExtractError> {
    if stream.dict.get(b"Filter").is_err() {
        return Ok(stream.content.clone());
    }
    stream
        .decompressed_content()
        .map_err(|error| ExtractError::CorruptImage(format!("cannot decode stream: {error}")))
}

pub(crate) fn deref<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    }
}

pub(crate) fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn sub_dictionary<'a>(
    document: &'a Document,
    dictionary: &'a Dictionary,
    key: &[u8],
) -> Option<&'a Dictionary> {
    dictionary
        .get(key)
        .ok()
        .and_then(|object| deref(document, object))
        .and_then(|object| object.as_dict().ok())
}

/// Page attribute lookup following the `Parent` chain.
fn inherited<'a>(document: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = document.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Ok(value) = current.get(key) {
            return Some(value);
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = document.get_dictionary(parent).ok()?;
    }
    None
}
