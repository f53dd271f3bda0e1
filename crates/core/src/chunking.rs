use crate::error::ExtractError;
use crate::models::{Chunk, FigureRef, TableRef};
use crate::structure::{DocumentTree, StructuralItem, TextLabel};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1200,
            overlap_chars: 120,
            min_chars: 120,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.max_chars == 0 {
            return Err(ExtractError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(ExtractError::InvalidChunkConfig(format!(
                "overlap_chars ({}) must be smaller than max_chars ({})",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits text into pieces of at most `max_chars`, packing whole sentences
/// where possible and falling back to overlapping windows for run-on text.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let normalized = normalize_whitespace(text);
    if char_len(&normalized) <= config.max_chars {
        return if normalized.is_empty() {
            Vec::new()
        } else {
            vec![normalized]
        };
    }

    let mut pieces = Vec::new();
    let mut current = String::new();

    for sentence in normalized
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
    {
        let sentence_len = char_len(sentence);
        if sentence_len > config.max_chars {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            pieces.extend(windows(sentence, config));
            continue;
        }

        if !current.is_empty() && char_len(&current) + 1 + sentence_len > config.max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn windows(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = config.max_chars.saturating_sub(config.overlap_chars).max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + config.max_chars).min(chars.len());
        pieces.push(chars[start..end].iter().collect::<String>().trim().to_string());
        if end == chars.len() {
            break;
        }
        start = start.saturating_add(step);
    }
    pieces
}

#[derive(Default)]
struct Draft {
    text: String,
    headings: Vec<String>,
    item_types: Vec<String>,
    pages: BTreeSet<u32>,
    figures: Vec<FigureRef>,
    tables: Vec<TableRef>,
    seen_pictures: HashSet<String>,
    seen_tables: HashSet<String>,
}

impl Draft {
    fn text_len(&self) -> usize {
        char_len(&self.text)
    }

    fn push_text(&mut self, piece: &str, headings: &[String]) {
        if self.text.is_empty() {
            self.headings = headings.to_vec();
        } else {
            self.text.push('\n');
        }
        self.text.push_str(piece);
    }

    fn note(&mut self, tag: &str, pages: &[u32]) {
        self.item_types.push(tag.to_string());
        self.pages.extend(pages.iter().copied());
    }

    fn add_figure(&mut self, figure: FigureRef) {
        if self.seen_pictures.insert(figure.picture_ref.clone()) {
            self.figures.push(figure);
        }
    }

    fn add_table(&mut self, table: TableRef) {
        if self.seen_tables.insert(table.csv_file.clone()) {
            self.tables.push(table);
        }
    }

    fn into_chunk(self, source_file: &str, group: &str) -> Chunk {
        Chunk {
            text: self.text,
            headings: self.headings,
            item_types: self.item_types,
            source_file: source_file.to_string(),
            group: group.to_string(),
            page_numbers: self.pages.into_iter().collect(),
            figures: self.figures,
            tables: self.tables,
        }
    }
}

/// Segments a document tree into retrieval chunks with initial references.
pub struct ChunkBuilder<'a> {
    config: &'a ChunkingConfig,
    tree: &'a DocumentTree,
    /// Table self ref to exported CSV path; unexported tables get no TableRef.
    table_files: &'a HashMap<String, String>,
    source_file: &'a str,
    group: &'a str,
}

impl<'a> ChunkBuilder<'a> {
    pub fn new(
        config: &'a ChunkingConfig,
        tree: &'a DocumentTree,
        table_files: &'a HashMap<String, String>,
        source_file: &'a str,
        group: &'a str,
    ) -> Self {
        Self {
            config,
            tree,
            table_files,
            source_file,
            group,
        }
    }

    pub fn build(&self) -> Vec<Chunk> {
        let mut captions: HashMap<&str, &str> = HashMap::new();
        for item in &self.tree.items {
            if let StructuralItem::Picture(picture) = item {
                if !picture.caption.is_empty() {
                    captions
                        .entry(picture.caption.as_str())
                        .or_insert(picture.self_ref.as_str());
                }
            }
        }

        let mut chunks = Vec::new();
        let mut headings: Vec<(u8, String)> = Vec::new();
        let mut draft = Draft::default();

        for item in &self.tree.items {
            match item {
                StructuralItem::Text(text) if text.label == TextLabel::SectionHeader => {
                    self.flush(&mut draft, &mut chunks);
                    let level = text.level.unwrap_or(1);
                    while headings.last().is_some_and(|(open, _)| *open >= level) {
                        headings.pop();
                    }
                    headings.push((level, text.text.clone()));
                }
                StructuralItem::Text(text) => {
                    let scope = heading_texts(&headings);
                    let figure = (text.label == TextLabel::Caption)
                        .then(|| captions.get(text.text.as_str()))
                        .flatten()
                        .map(|picture_ref| FigureRef::new(text.text.as_str(), *picture_ref));
                    self.append(&mut draft, &mut chunks, &text.text, &scope, item);
                    if let Some(figure) = figure {
                        draft.add_figure(figure);
                    }
                }
                StructuralItem::Picture(picture) => {
                    draft.note(item.type_tag(), &picture.pages);
                    draft.add_figure(FigureRef::new(
                        picture.caption.as_str(),
                        picture.self_ref.as_str(),
                    ));
                }
                StructuralItem::Table(table) => {
                    let scope = heading_texts(&headings);
                    let rendered = table
                        .cells
                        .iter()
                        .map(|row| row.join(" | "))
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.append(&mut draft, &mut chunks, &rendered, &scope, item);
                    if let Some(csv_file) = self.table_files.get(&table.self_ref) {
                        draft.add_table(TableRef {
                            caption: table.caption.clone(),
                            csv_file: csv_file.clone(),
                        });
                    }
                }
            }
        }

        self.flush(&mut draft, &mut chunks);
        if draft.text.is_empty() && !(draft.figures.is_empty() && draft.tables.is_empty()) {
            match chunks.last_mut() {
                Some(last) => absorb_references(last, draft),
                None => {
                    draft.headings = heading_texts(&headings);
                    chunks.push(draft.into_chunk(self.source_file, self.group));
                }
            }
        }

        merge_undersized(chunks, self.config)
    }

    /// Adds an item's text, flushing first whenever the draft would overflow.
    fn append(
        &self,
        draft: &mut Draft,
        chunks: &mut Vec<Chunk>,
        text: &str,
        headings: &[String],
        item: &StructuralItem,
    ) {
        let pieces = if char_len(text) > self.config.max_chars {
            split_text(text, self.config)
        } else {
            vec![text.to_string()]
        };

        for piece in pieces.iter().filter(|piece| !piece.trim().is_empty()) {
            if !draft.text.is_empty()
                && draft.text_len() + 1 + char_len(piece) > self.config.max_chars
            {
                self.flush(draft, chunks);
            }
            draft.push_text(piece, headings);
            draft.note(item.type_tag(), item.pages());
        }
    }

    /// Emits the draft as a chunk. A draft holding only references stays
    /// open so they travel with the text that follows.
    fn flush(&self, draft: &mut Draft, chunks: &mut Vec<Chunk>) {
        if draft.text.is_empty() {
            return;
        }
        let finished = std::mem::take(draft);
        chunks.push(finished.into_chunk(self.source_file, self.group));
    }
}

fn heading_texts(headings: &[(u8, String)]) -> Vec<String> {
    headings.iter().map(|(_, text)| text.clone()).collect()
}

fn absorb_references(chunk: &mut Chunk, draft: Draft) {
    for figure in draft.figures {
        if !chunk.references(&figure.picture_ref) {
            chunk.figures.push(figure);
        }
    }
    for table in draft.tables {
        if !chunk.tables.contains(&table) {
            chunk.tables.push(table);
        }
    }
    chunk.item_types.extend(draft.item_types);
    let pages: BTreeSet<u32> = chunk
        .page_numbers
        .iter()
        .copied()
        .chain(draft.pages)
        .collect();
    chunk.page_numbers = pages.into_iter().collect();
}

/// Folds chunks shorter than `min_chars` into their successor when both sit
/// under the same headings and the result still fits.
fn merge_undersized(chunks: Vec<Chunk>, config: &ChunkingConfig) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    let mut carry: Option<Chunk> = None;

    for chunk in chunks {
        let Some(short) = carry.take() else {
            if char_len(&chunk.text) < config.min_chars {
                carry = Some(chunk);
            } else {
                merged.push(chunk);
            }
            continue;
        };

        let fits = char_len(&short.text) + 1 + char_len(&chunk.text) <= config.max_chars;
        if short.headings == chunk.headings && fits {
            let mut combined = short;
            combined.text.push('\n');
            combined.text.push_str(&chunk.text);
            let references = Draft {
                item_types: chunk.item_types,
                pages: chunk.page_numbers.into_iter().collect(),
                figures: chunk.figures,
                tables: chunk.tables,
                ..Draft::default()
            };
            absorb_references(&mut combined, references);
            if char_len(&combined.text) < config.min_chars {
                carry = Some(combined);
            } else {
                merged.push(combined);
            }
        } else {
            merged.push(short);
            if char_len(&chunk.text) < config.min_chars {
                carry = Some(chunk);
            } else {
                merged.push(chunk);
            }
        }
    }

    merged.extend(carry);
    merged
}
