//! Structural document tree consumed by the chunker.
//!
//! Conversion sits behind [`StructureConverter`]. The built-in
//! [`TextLayoutConverter`] reads each page's final text: blank lines separate
//! blocks, and each block becomes a section header, list items, a caption, a
//! whitespace-aligned table, or a paragraph. Extracted images become picture
//! items placed just before their caption.

use crate::error::ExtractError;
use crate::models::{ExtractedImage, Page, Reliability, TextOrigin};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TextLabel {
    SectionHeader,
    Paragraph,
    Caption,
    ListItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextItem {
    pub self_ref: String,
    pub label: TextLabel,
    pub text: String,
    pub pages: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PictureItem {
    pub self_ref: String,
    pub caption: String,
    pub pages: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableItem {
    pub self_ref: String,
    pub caption: String,
    pub pages: Vec<u32>,
    pub cells: Vec<Vec<String>>,
}

impl TableItem {
    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cols(&self) -> usize {
        self.cells.iter().map(Vec::len).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuralItem {
    Text(TextItem),
    Picture(PictureItem),
    Table(TableItem),
}

impl StructuralItem {
    pub fn pages(&self) -> &[u32] {
        match self {
            StructuralItem::Text(item) => &item.pages,
            StructuralItem::Picture(item) => &item.pages,
            StructuralItem::Table(item) => &item.pages,
        }
    }

    pub fn self_ref(&self) -> &str {
        match self {
            StructuralItem::Text(item) => &item.self_ref,
            StructuralItem::Picture(item) => &item.self_ref,
            StructuralItem::Table(item) => &item.self_ref,
        }
    }

    /// Item type tag recorded on chunks.
    pub fn type_tag(&self) -> &'static str {
        match self {
            StructuralItem::Text(item) => match item.label {
                TextLabel::SectionHeader => "SectionHeaderItem",
                TextLabel::ListItem => "ListItem",
                TextLabel::Paragraph | TextLabel::Caption => "TextItem",
            },
            StructuralItem::Picture(_) => "PictureItem",
            StructuralItem::Table(_) => "TableItem",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageEntry {
    pub number: u32,
    pub origin: TextOrigin,
    pub verdict: Reliability,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentTree {
    pub name: String,
    pub pages: Vec<PageEntry>,
    pub items: Vec<StructuralItem>,
}

impl DocumentTree {
    pub fn tables(&self) -> impl Iterator<Item = &TableItem> {
        self.items.iter().filter_map(|item| match item {
            StructuralItem::Table(table) => Some(table),
            _ => None,
        })
    }
}

pub struct ConversionInput<'a> {
    pub name: &'a str,
    pub pages: &'a [Page],
    pub images: &'a [ExtractedImage],
}

pub trait StructureConverter: Send + Sync {
    fn convert(&self, input: &ConversionInput<'_>) -> Result<DocumentTree, ExtractError>;
}

const SECTION_NAMES: [&str; 20] = [
    "abstract",
    "introduction",
    "material and methods",
    "materials and methods",
    "methods",
    "results",
    "discussion",
    "conclusions",
    "acknowledgements",
    "acknowledgments",
    "references",
    "literature",
    "taxonomy",
    "diagnosis",
    "description",
    "distribution",
    "summary",
    "аннотация",
    "введение",
    "литература",
];

/// Line classification rules shared by conversion and caption detection.
#[derive(Debug, Clone)]
pub struct LayoutRules {
    figure_caption: Regex,
    table_caption: Regex,
    numbered_heading: Regex,
    list_marker: Regex,
    cell_separator: Regex,
}

impl LayoutRules {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            figure_caption: Regex::new(r"(?i)^(fig(ure)?s?\.?|plate|рис(унок)?\.?|abb\.?)\s*\d+")?,
            table_caption: Regex::new(r"(?i)^(table|tab\.|таблица|табл\.)\s*\d+")?,
            numbered_heading: Regex::new(r"^(\d+(?:\.\d+)*)\.?\s+\p{Lu}")?,
            list_marker: Regex::new(r"^([-•*–]|\(?\d{1,2}[.)]|\(?[a-z][.)])\s+")?,
            cell_separator: Regex::new(r"\t+|\s{2,}")?,
        })
    }

    /// Figure caption blocks of a page, in reading order.
    pub fn figure_captions(&self, text: &str) -> Vec<String> {
        blocks(text)
            .into_iter()
            .filter(|lines| self.figure_caption.is_match(lines[0]))
            .map(|lines| join_lines(&lines))
            .collect()
    }

    fn classify(&self, lines: &[&str]) -> Block {
        if let Some(cells) = self.table_cells(lines) {
            return Block::Table(cells);
        }

        let first = lines[0];
        if self.figure_caption.is_match(first) {
            return Block::FigureCaption(join_lines(lines));
        }
        if self.table_caption.is_match(first) {
            return Block::TableCaption(join_lines(lines));
        }
        if lines.len() == 1 {
            if let Some(level) = self.heading_level(first) {
                return Block::Heading(first.to_string(), level);
            }
        }
        if lines.len() > 1 && lines.iter().all(|line| self.list_marker.is_match(line)) {
            return Block::List(lines.iter().map(|line| line.to_string()).collect());
        }
        Block::Paragraph(join_lines(lines))
    }

    fn table_cells(&self, lines: &[&str]) -> Option<Vec<Vec<String>>> {
        if lines.len() < 3 {
            return None;
        }
        let rows: Vec<Vec<String>> = lines
            .iter()
            .map(|line| {
                self.cell_separator
                    .split(line)
                    .map(|cell| cell.trim().to_string())
                    .filter(|cell| !cell.is_empty())
                    .collect()
            })
            .collect();
        let width = rows[0].len();
        if width >= 2 && rows.iter().all(|row| row.len() == width) {
            Some(rows)
        } else {
            None
        }
    }

    fn heading_level(&self, line: &str) -> Option<u8> {
        if line.chars().count() > 80 || line.ends_with(['.', ',', ';']) {
            return None;
        }

        if let Some(captures) = self.numbered_heading.captures(line) {
            let depth = captures
                .get(1)
                .map(|number| number.as_str().split('.').count())
                .unwrap_or(1);
            let words = line.split_whitespace().count();
            return (words <= 12).then(|| depth.min(6) as u8);
        }

        let bare = line.trim_end_matches(':').trim().to_lowercase();
        if SECTION_NAMES.contains(&bare.as_str()) {
            return Some(1);
        }

        let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
        let shouting = letters.len() >= 4 && letters.iter().all(|c| c.is_uppercase());
        (shouting && line.split_whitespace().count() <= 8).then_some(1)
    }
}

enum Block {
    Heading(String, u8),
    Paragraph(String),
    List(Vec<String>),
    FigureCaption(String),
    TableCaption(String),
    Table(Vec<Vec<String>>),
}

fn blocks(text: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn join_lines(lines: &[&str]) -> String {
    let mut joined = String::new();
    for line in lines {
        if joined.ends_with('-') && line.starts_with(|c: char| c.is_lowercase()) {
            joined.pop();
        } else if !joined.is_empty() {
            joined.push(' ');
        }
        joined.push_str(line);
    }
    joined
}

/// Converter that derives structure from page text alone.
#[derive(Debug, Clone)]
pub struct TextLayoutConverter {
    rules: LayoutRules,
}

impl TextLayoutConverter {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            rules: LayoutRules::new()?,
        })
    }

    pub fn rules(&self) -> &LayoutRules {
        &self.rules
    }
}

#[derive(Default)]
struct RefCounters {
    texts: usize,
    tables: usize,
}

impl RefCounters {
    fn text(&mut self) -> String {
        let reference = format!("#/texts/{}", self.texts);
        self.texts += 1;
        reference
    }

    fn table(&mut self) -> String {
        let reference = format!("#/tables/{}", self.tables);
        self.tables += 1;
        reference
    }
}

impl StructureConverter for TextLayoutConverter {
    fn convert(&self, input: &ConversionInput<'_>) -> Result<DocumentTree, ExtractError> {
        let mut counters = RefCounters::default();
        let mut items = Vec::new();

        for page in input.pages {
            let mut pending: Vec<&ExtractedImage> = input
                .images
                .iter()
                .filter(|image| image.page == page.number)
                .collect();
            let mut table_caption: Option<String> = None;
            let text_item = |counters: &mut RefCounters, label, text: String, level| {
                StructuralItem::Text(TextItem {
                    self_ref: counters.text(),
                    label,
                    text,
                    pages: vec![page.number],
                    level,
                })
            };

            for lines in blocks(&page.text) {
                match self.rules.classify(&lines) {
                    Block::Heading(text, level) => {
                        items.push(text_item(&mut counters, TextLabel::SectionHeader, text, Some(level)));
                    }
                    Block::Paragraph(text) => {
                        items.push(text_item(&mut counters, TextLabel::Paragraph, text, None));
                    }
                    Block::List(entries) => {
                        for entry in entries {
                            items.push(text_item(&mut counters, TextLabel::ListItem, entry, None));
                        }
                    }
                    Block::FigureCaption(text) => {
                        if let Some(position) = pending
                            .iter()
                            .position(|image| !image.caption.is_empty() && image.caption == text)
                        {
                            let image = pending.remove(position);
                            items.push(picture(image));
                        }
                        items.push(text_item(&mut counters, TextLabel::Caption, text, None));
                    }
                    Block::TableCaption(text) => {
                        table_caption = Some(text.clone());
                        items.push(text_item(&mut counters, TextLabel::Caption, text, None));
                    }
                    Block::Table(cells) => {
                        items.push(StructuralItem::Table(TableItem {
                            self_ref: counters.table(),
                            caption: table_caption.take().unwrap_or_default(),
                            pages: vec![page.number],
                            cells,
                        }));
                    }
                }
            }

            items.extend(pending.into_iter().map(picture));
        }

        Ok(DocumentTree {
            name: input.name.to_string(),
            pages: input
                .pages
                .iter()
                .map(|page| PageEntry {
                    number: page.number,
                    origin: page.origin.clone(),
                    verdict: page.verdict,
                })
                .collect(),
            items,
        })
    }
}

fn picture(image: &ExtractedImage) -> StructuralItem {
    StructuralItem::Picture(PictureItem {
        self_ref: image.reference.clone(),
        caption: image.caption.clone(),
        pages: vec![image.page],
    })
}
