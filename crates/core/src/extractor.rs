use crate::error::ExtractError;
use lopdf::Document;
use std::path::Path;
use tracing::warn;

/// Text embedded in the PDF for one page, before any reliability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePage {
    pub number: u32,
    pub text: String,
}

pub fn load_document(path: &Path) -> Result<Document, ExtractError> {
    Document::load(path).map_err(|error| {
        ExtractError::PdfParse(format!("{}: {error}", path.display()))
    })
}

/// Native text for every page in ascending page order.
///
/// A page whose text layer cannot be decoded yields empty text, which the
/// OCR fallback then treats as sparse.
pub fn native_pages(document: &Document) -> Vec<NativePage> {
    document
        .get_pages()
        .into_keys()
        .map(|number| {
            let text = match document.extract_text(&[number]) {
                Ok(text) => text,
                Err(error) => {
                    warn!(page = number, error = %error, "native text extraction failed");
                    String::new()
                }
            };
            NativePage { number, text }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{load_document, native_pages};
    use crate::ExtractError;
    use lopdf::{dictionary, Document, Object, Stream};
    use std::fs;
    use tempfile::tempdir;

    fn blank_document(pages: usize) -> Document {
        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let mut kids = Vec::new();
        for _ in 0..pages {
            let content_id = document.add_object(Stream::new(dictionary! {}, Vec::new()));
            let page_id = document.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(Object::Reference(page_id));
        }
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);
        document
    }

    #[test]
    fn pages_are_returned_in_ascending_order() {
        let document = blank_document(3);
        let pages = native_pages(&document);
        let numbers: Vec<u32> = pages.iter().map(|page| page.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(pages.iter().all(|page| page.text.trim().is_empty()));
    }

    #[test]
    fn unreadable_file_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = load_document(&path);
        assert!(matches!(result, Err(ExtractError::PdfParse(_))));
        Ok(())
    }
}
