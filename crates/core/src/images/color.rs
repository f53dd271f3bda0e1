//! Decoding embedded rasters into saveable RGB or white-background grayscale.
//!
//! Separation and single-channel DeviceN samples are ink amounts, so a zero
//! sample is white paper. Image masks paint where the sample is 0 unless the
//! Decode array flips them.

use super::placement::{deref, number, stream_bytes};
use crate::error::ExtractError;
use crate::models::ColorSpaceKind;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, Stream};

const MAX_COLOR_SPACE_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelModel {
    Mask,
    Gray,
    Rgb,
    Cmyk,
    /// One tint channel; 0 means no ink.
    Ink,
    Indexed {
        base: Box<PixelModel>,
        palette: Vec<u8>,
    },
}

impl PixelModel {
    pub fn components(&self) -> usize {
        match self {
            PixelModel::Rgb => 3,
            PixelModel::Cmyk => 4,
            PixelModel::Mask | PixelModel::Gray | PixelModel::Ink | PixelModel::Indexed { .. } => 1,
        }
    }

    /// Converts one already 8-bit-scaled pixel to RGB.
    fn to_rgb(&self, channels: &[u8]) -> [u8; 3] {
        match self {
            PixelModel::Gray | PixelModel::Mask => [channels[0]; 3],
            PixelModel::Ink => [255 - channels[0]; 3],
            PixelModel::Rgb => [channels[0], channels[1], channels[2]],
            PixelModel::Cmyk => cmyk_to_rgb(channels[0], channels[1], channels[2], channels[3]),
            PixelModel::Indexed { base, palette } => {
                let width = base.components();
                let start = channels[0] as usize * width;
                match palette.get(start..start + width) {
                    Some(entry) => base.to_rgb(entry),
                    None => [0; 3],
                }
            }
        }
    }
}

fn cmyk_to_rgb(c: u8, m: u8, y: u8, k: u8) -> [u8; 3] {
    let white = 255 - k as u32;
    let channel = |ink: u8| ((255 - ink as u32) * white / 255) as u8;
    [channel(c), channel(m), channel(y)]
}

/// Resolves an image's color space into a pixel model.
///
/// Names not defined by PDF are looked up in the `ColorSpace` resources in
/// scope where the image was drawn.
pub fn resolve_color_space(
    document: &Document,
    color_space: &Object,
    named: Option<&Dictionary>,
) -> Result<(PixelModel, ColorSpaceKind), ExtractError> {
    resolve_at_depth(document, color_space, named, 0)
}

fn resolve_at_depth(
    document: &Document,
    color_space: &Object,
    named: Option<&Dictionary>,
    depth: usize,
) -> Result<(PixelModel, ColorSpaceKind), ExtractError> {
    if depth > MAX_COLOR_SPACE_DEPTH {
        return Err(ExtractError::UnsupportedImage(
            "color space nesting too deep".to_string(),
        ));
    }

    let color_space = deref(document, color_space)
        .ok_or_else(|| ExtractError::CorruptImage("dangling color space reference".to_string()))?;

    match color_space {
        Object::Name(name) => match name.as_slice() {
            b"DeviceGray" | b"G" | b"CalGray" => Ok((PixelModel::Gray, ColorSpaceKind::DeviceGray)),
            b"DeviceRGB" | b"RGB" | b"CalRGB" => Ok((PixelModel::Rgb, ColorSpaceKind::DeviceRgb)),
            b"DeviceCMYK" | b"CMYK" => Ok((PixelModel::Cmyk, ColorSpaceKind::DeviceCmyk)),
            other => {
                let defined = named
                    .and_then(|named| named.get(other).ok())
                    .ok_or_else(|| {
                        ExtractError::UnsupportedImage(format!(
                            "unknown color space /{}",
                            String::from_utf8_lossy(other)
                        ))
                    })?;
                resolve_at_depth(document, defined, named, depth + 1)
            }
        },
        Object::Array(items) => resolve_family(document, items, named, depth),
        _ => Err(ExtractError::CorruptImage(
            "color space is neither a name nor an array".to_string(),
        )),
    }
}

fn resolve_family(
    document: &Document,
    items: &[Object],
    named: Option<&Dictionary>,
    depth: usize,
) -> Result<(PixelModel, ColorSpaceKind), ExtractError> {
    let family = items
        .first()
        .and_then(|item| item.as_name().ok())
        .ok_or_else(|| ExtractError::CorruptImage("color space array without family".to_string()))?;

    match family {
        b"ICCBased" => {
            let components = items
                .get(1)
                .and_then(|item| deref(document, item))
                .and_then(|item| item.as_stream().ok())
                .and_then(|stream| stream.dict.get(b"N").ok())
                .and_then(|n| n.as_i64().ok())
                .unwrap_or(3);
            let model = match components {
                1 => PixelModel::Gray,
                3 => PixelModel::Rgb,
                4 => PixelModel::Cmyk,
                other => {
                    return Err(ExtractError::UnsupportedImage(format!(
                        "ICC profile with {other} components"
                    )))
                }
            };
            Ok((model, ColorSpaceKind::IccBased))
        }
        b"CalGray" => Ok((PixelModel::Gray, ColorSpaceKind::CalGray)),
        b"CalRGB" => Ok((PixelModel::Rgb, ColorSpaceKind::CalRgb)),
        b"DeviceGray" | b"DeviceRGB" | b"DeviceCMYK" => {
            resolve_at_depth(document, &items[0], named, depth + 1)
        }
        b"Separation" => Ok((PixelModel::Ink, ColorSpaceKind::Separation)),
        b"DeviceN" => {
            let colorants = items
                .get(1)
                .and_then(|item| deref(document, item))
                .and_then(|item| item.as_array().ok())
                .map(Vec::len)
                .unwrap_or(0);
            if colorants == 1 {
                Ok((PixelModel::Ink, ColorSpaceKind::DeviceN))
            } else {
                Err(ExtractError::UnsupportedImage(format!(
                    "DeviceN with {colorants} colorants"
                )))
            }
        }
        b"Indexed" | b"I" => {
            let base_object = items
                .get(1)
                .ok_or_else(|| ExtractError::CorruptImage("indexed space without base".to_string()))?;
            let (base, _) = resolve_at_depth(document, base_object, named, depth + 1)?;
            if matches!(base, PixelModel::Indexed { .. } | PixelModel::Mask) {
                return Err(ExtractError::CorruptImage(
                    "indexed space over an invalid base".to_string(),
                ));
            }
            let palette = match items.get(3).and_then(|item| deref(document, item)) {
                Some(Object::String(bytes, _)) => bytes.clone(),
                Some(Object::Stream(stream)) => stream_bytes(stream)?,
                _ => {
                    return Err(ExtractError::CorruptImage(
                        "indexed space without lookup table".to_string(),
                    ))
                }
            };
            Ok((
                PixelModel::Indexed {
                    base: Box::new(base),
                    palette,
                },
                ColorSpaceKind::Indexed,
            ))
        }
        other => Err(ExtractError::UnsupportedImage(format!(
            "color space family /{}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Decoded image samples before color conversion.
#[derive(Debug, Clone)]
pub struct RawRaster {
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u8,
    pub model: PixelModel,
    /// Decode array reverses the sample range, e.g. `[1 0]`.
    pub decode_inverted: bool,
    pub samples: Vec<u8>,
}

impl RawRaster {
    /// Masks become white-background grayscale; everything else becomes RGB.
    pub fn normalize(&self) -> Result<DynamicImage, ExtractError> {
        let bpc = self.bits_per_component;
        if !matches!(bpc, 1 | 2 | 4 | 8 | 16) {
            return Err(ExtractError::UnsupportedImage(format!(
                "{bpc} bits per component"
            )));
        }
        if self.model == PixelModel::Mask && bpc != 1 {
            return Err(ExtractError::CorruptImage(format!(
                "image mask with {bpc} bits per component"
            )));
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let components = self.model.components();
        let row_bytes = (width * components * bpc as usize + 7) / 8;
        if self.samples.len() < row_bytes * height {
            return Err(ExtractError::CorruptImage(format!(
                "{} sample bytes for a {}x{} image needing {}",
                self.samples.len(),
                self.width,
                self.height,
                row_bytes * height
            )));
        }

        let indexed = matches!(self.model, PixelModel::Indexed { .. });
        let flips = self.decode_inverted
            && matches!(self.model, PixelModel::Gray | PixelModel::Ink);

        if self.model == PixelModel::Mask {
            let mut gray = Vec::with_capacity(width * height);
            for row in self.samples.chunks(row_bytes).take(height) {
                for x in 0..width {
                    let ink = (read_sample(row, x, 1) == 0) != self.decode_inverted;
                    let alpha: u8 = if ink { 255 } else { 0 };
                    gray.push(255 - alpha);
                }
            }
            return GrayImage::from_raw(self.width, self.height, gray)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| ExtractError::CorruptImage("mask buffer size mismatch".to_string()));
        }

        let mut rgb = Vec::with_capacity(width * height * 3);
        let mut pixel = vec![0u8; components];
        for row in self.samples.chunks(row_bytes).take(height) {
            for x in 0..width {
                for (channel, value) in pixel.iter_mut().enumerate() {
                    let raw = read_sample(row, x * components + channel, bpc);
                    *value = if indexed {
                        raw.min(255) as u8
                    } else {
                        scale_to_byte(raw, bpc)
                    };
                    if flips {
                        *value = 255 - *value;
                    }
                }
                rgb.extend_from_slice(&self.model.to_rgb(&pixel));
            }
        }

        RgbImage::from_raw(self.width, self.height, rgb)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| ExtractError::CorruptImage("rgb buffer size mismatch".to_string()))
    }
}

fn read_sample(row: &[u8], index: usize, bpc: u8) -> u16 {
    match bpc {
        8 => row[index] as u16,
        16 => u16::from_be_bytes([row[index * 2], row[index * 2 + 1]]),
        _ => {
            let bit = index * bpc as usize;
            let byte = row[bit / 8];
            let shift = 8 - bpc as usize - bit % 8;
            ((byte >> shift) & ((1u8 << bpc) - 1)) as u16
        }
    }
}

fn scale_to_byte(value: u16, bpc: u8) -> u8 {
    match bpc {
        8 => value as u8,
        16 => (value >> 8) as u8,
        _ => (value as u32 * 255 / ((1u32 << bpc) - 1)) as u8,
    }
}

/// Composites any alpha channel over white and drops it.
pub fn flatten_alpha(image: DynamicImage) -> DynamicImage {
    if !image.color().has_alpha() {
        return image;
    }
    let rgba = image.to_rgba8();
    let mut rgb = Vec::with_capacity(rgba.width() as usize * rgba.height() as usize * 3);
    for pixel in rgba.pixels() {
        let alpha = pixel[3] as u32;
        for channel in 0..3 {
            rgb.push(((pixel[channel] as u32 * alpha + 255 * (255 - alpha)) / 255) as u8);
        }
    }
    match RgbImage::from_raw(rgba.width(), rgba.height(), rgb) {
        Some(flat) => DynamicImage::ImageRgb8(flat),
        None => DynamicImage::ImageRgb8(image.to_rgb8()),
    }
}

fn filters(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn dimension(stream: &Stream, key: &[u8]) -> Result<u32, ExtractError> {
    stream
        .dict
        .get(key)
        .ok()
        .and_then(|value| value.as_i64().ok())
        .filter(|value| *value > 0)
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| {
            ExtractError::CorruptImage(format!(
                "missing or invalid /{}",
                String::from_utf8_lossy(key)
            ))
        })
}

/// Pixel dimensions as declared in the image dictionary.
pub fn declared_size(stream: &Stream) -> Result<(u32, u32), ExtractError> {
    Ok((dimension(stream, b"Width")?, dimension(stream, b"Height")?))
}

/// Decodes an image XObject to a saveable raster plus its color space tag.
pub fn decode_image(
    document: &Document,
    stream: &Stream,
    named: Option<&Dictionary>,
) -> Result<(DynamicImage, ColorSpaceKind), ExtractError> {
    let (width, height) = declared_size(stream)?;
    let is_mask = stream
        .dict
        .get(b"ImageMask")
        .ok()
        .and_then(|value| value.as_bool().ok())
        .unwrap_or(false);

    let (model, kind) = if is_mask {
        (PixelModel::Mask, ColorSpaceKind::ImageMask)
    } else {
        match stream.dict.get(b"ColorSpace") {
            Ok(color_space) => resolve_color_space(document, color_space, named)?,
            Err(_) => (PixelModel::Mask, ColorSpaceKind::ImageMask),
        }
    };

    let filters = filters(stream);
    if let Some(unsupported) = filters.iter().find(|name| {
        matches!(
            name.as_slice(),
            b"JPXDecode" | b"JBIG2Decode" | b"CCITTFaxDecode" | b"CCF"
        )
    }) {
        return Err(ExtractError::UnsupportedImage(format!(
            "/{} payload",
            String::from_utf8_lossy(unsupported)
        )));
    }

    if filters.iter().any(|name| name == b"DCTDecode" || name == b"DCT") {
        if filters.len() != 1 {
            return Err(ExtractError::UnsupportedImage(
                "chained filters ending in DCTDecode".to_string(),
            ));
        }
        let decoded = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)?;
        let image = match model {
            PixelModel::Ink => {
                let mut luma = decoded.to_luma8();
                for pixel in luma.pixels_mut() {
                    pixel[0] = 255 - pixel[0];
                }
                DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(luma).to_rgb8())
            }
            _ => DynamicImage::ImageRgb8(flatten_alpha(decoded).to_rgb8()),
        };
        return Ok((image, kind));
    }

    let bits_per_component = if model == PixelModel::Mask {
        1
    } else {
        stream
            .dict
            .get(b"BitsPerComponent")
            .ok()
            .and_then(|value| value.as_i64().ok())
            .and_then(|value| u8::try_from(value).ok())
            .unwrap_or(8)
    };

    let decode_inverted = stream
        .dict
        .get(b"Decode")
        .ok()
        .and_then(|value| deref(document, value))
        .and_then(|value| value.as_array().ok())
        .and_then(|values| match (values.first(), values.get(1)) {
            (Some(low), Some(high)) => Some(
                number(low).unwrap_or(0.0) > number(high).unwrap_or(1.0),
            ),
            _ => None,
        })
        .unwrap_or(false);

    let raster = RawRaster {
        width,
        height,
        bits_per_component,
        model,
        decode_inverted,
        samples: stream_bytes(stream)?,
    };
    Ok((flatten_alpha(raster.normalize()?), kind))
}
