//! Post-processing of chunk references.
//!
//! Five passes in fixed order: fuzzy caption injection, image file
//! resolution, intra-chunk dedup, cross-chunk dedup, and fallback injection
//! for uncaptioned images (followed by one more cross-chunk dedup when
//! anything was injected). Running the passes again over their own output
//! injects and removes nothing.

use crate::fuzzy::CaptionMatcher;
use crate::models::{Chunk, ExtractedImage, FigureRef};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IndexedImage {
    pub image: ExtractedImage,
    /// Saved raster path relative to the document output directory.
    pub file: String,
}

/// Saved images keyed by picture reference, in extraction order.
#[derive(Debug, Clone, Default)]
pub struct ImageIndex {
    entries: Vec<IndexedImage>,
    positions: HashMap<String, usize>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: ExtractedImage, file: impl Into<String>) {
        let file = file.into();
        match self.positions.get(&image.reference) {
            Some(&position) => self.entries[position] = IndexedImage { image, file },
            None => {
                self.positions
                    .insert(image.reference.clone(), self.entries.len());
                self.entries.push(IndexedImage { image, file });
            }
        }
    }

    pub fn get(&self, picture_ref: &str) -> Option<&IndexedImage> {
        self.positions
            .get(picture_ref)
            .map(|&position| &self.entries[position])
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedImage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Removal {
    pub picture_ref: String,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    pub fuzzy_injected: usize,
    pub image_files_resolved: usize,
    pub cross_chunk_removed: Vec<Removal>,
    pub fallback_injected: usize,
    pub unassignable: Vec<String>,
}

impl ResolutionReport {
    /// True when the run changed no reference membership.
    pub fn is_noop(&self) -> bool {
        self.fuzzy_injected == 0 && self.fallback_injected == 0 && self.cross_chunk_removed.is_empty()
    }
}

pub struct ReferenceResolver<'a> {
    index: &'a ImageIndex,
    matcher: &'a dyn CaptionMatcher,
    threshold: f64,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(index: &'a ImageIndex, matcher: &'a dyn CaptionMatcher, threshold: f64) -> Self {
        Self {
            index,
            matcher,
            threshold,
        }
    }

    pub fn resolve(&self, chunks: &mut [Chunk]) -> ResolutionReport {
        let mut report = ResolutionReport {
            fuzzy_injected: self.inject_fuzzy(chunks),
            image_files_resolved: self.resolve_files(chunks),
            ..ResolutionReport::default()
        };
        dedup_within_chunks(chunks);
        report.cross_chunk_removed = dedup_across_chunks(chunks);

        let (injected, unassignable) = self.inject_fallback(chunks);
        report.fallback_injected = injected;
        report.unassignable = unassignable;
        if injected > 0 {
            report.cross_chunk_removed.extend(dedup_across_chunks(chunks));
        }
        report
    }

    /// Pass 1. Captioned images referenced nowhere go to the first chunk whose
    /// text scores at or above the threshold.
    pub fn inject_fuzzy(&self, chunks: &mut [Chunk]) -> usize {
        let referenced = referenced_pictures(chunks);
        let mut injected = 0;

        for entry in self.index.iter() {
            let caption = entry.image.caption.trim();
            if caption.is_empty() || referenced.contains(&entry.image.reference) {
                continue;
            }

            for chunk in chunks.iter_mut() {
                if chunk.text.is_empty() || chunk.references(&entry.image.reference) {
                    continue;
                }
                let Some(score) = self.matcher.partial_score(caption, &chunk.text) else {
                    return injected;
                };
                if score >= self.threshold {
                    chunk
                        .figures
                        .push(FigureRef::new(caption, entry.image.reference.as_str()));
                    injected += 1;
                    break;
                }
            }
        }

        injected
    }

    /// Pass 2.
    pub fn resolve_files(&self, chunks: &mut [Chunk]) -> usize {
        let mut resolved = 0;
        for figure in chunks.iter_mut().flat_map(|chunk| chunk.figures.iter_mut()) {
            if figure.image_file.is_some() {
                continue;
            }
            if let Some(entry) = self.index.get(&figure.picture_ref) {
                figure.image_file = Some(entry.file.clone());
                resolved += 1;
            }
        }
        resolved
    }

    /// Pass 5. Returns the injection count and the references no chunk covers.
    pub fn inject_fallback(&self, chunks: &mut [Chunk]) -> (usize, Vec<String>) {
        let mut assigned = referenced_pictures(chunks);
        let mut injected = 0;
        let mut unassignable = Vec::new();

        for entry in self.index.iter() {
            let image = &entry.image;
            if !image.caption.trim().is_empty() || assigned.contains(&image.reference) {
                continue;
            }

            match chunks
                .iter_mut()
                .enumerate()
                .find(|(_, chunk)| chunk.covers_page(image.page))
            {
                Some((chunk_index, chunk)) => {
                    chunk.figures.push(FigureRef {
                        caption: String::new(),
                        picture_ref: image.reference.clone(),
                        image_file: Some(entry.file.clone()),
                    });
                    assigned.insert(image.reference.clone());
                    injected += 1;
                    info!(picture = %image.reference, chunk = chunk_index, page = image.page, "fallback figure injection");
                }
                None => {
                    warn!(picture = %image.reference, page = image.page, "no chunk covers the image page; leaving it unreferenced");
                    unassignable.push(image.reference.clone());
                }
            }
        }

        (injected, unassignable)
    }
}

fn referenced_pictures(chunks: &[Chunk]) -> HashSet<String> {
    chunks
        .iter()
        .flat_map(|chunk| chunk.figures.iter())
        .map(|figure| figure.picture_ref.clone())
        .collect()
}

/// Pass 3. Keeps the first figure per picture and the first table per file.
pub fn dedup_within_chunks(chunks: &mut [Chunk]) {
    for chunk in chunks.iter_mut() {
        let mut seen = HashSet::new();
        chunk
            .figures
            .retain(|figure| seen.insert(figure.picture_ref.clone()));

        let mut seen = HashSet::new();
        chunk
            .tables
            .retain(|table| seen.insert(table.csv_file.clone()));
    }
}

/// Pass 4. A picture stays only in the first chunk that references it.
pub fn dedup_across_chunks(chunks: &mut [Chunk]) -> Vec<Removal> {
    let mut seen = HashSet::new();
    let mut removed = Vec::new();

    for (chunk_index, chunk) in chunks.iter_mut().enumerate() {
        chunk.figures.retain(|figure| {
            if figure.picture_ref.is_empty() || seen.insert(figure.picture_ref.clone()) {
                return true;
            }
            warn!(picture = %figure.picture_ref, chunk = chunk_index, "duplicate cross-chunk figure removed");
            removed.push(Removal {
                picture_ref: figure.picture_ref.clone(),
                chunk_index,
            });
            false
        });
    }

    removed
}
