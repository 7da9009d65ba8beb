//! PDF text extraction.

use anyhow::{Context, Result};

/// Result of extracting text from a PDF.
#[derive(Debug, Clone)]
pub struct ExtractedPdf {
    /// Extracted text content, pages joined with newlines.
    pub text: String,
    /// Number of pages in the PDF.
    pub page_count: usize,
}

/// Extract text from in-memory PDF bytes.
pub fn extract_text(pdf_bytes: &[u8]) -> Result<ExtractedPdf> {
    let doc = lopdf::Document::load_mem(pdf_bytes).context("Failed to parse PDF")?;

    let mut pages: Vec<u32> = doc.get_pages().keys().cloned().collect();
    pages.sort();
    let page_count = pages.len();

    let mut full_text = String::new();
    for page_num in &pages {
        let page_text = doc.extract_text(&[*page_num]).unwrap_or_default();
        full_text.push_str(&page_text);
        if !page_text.ends_with('\n') && !page_text.is_empty() {
            full_text.push('\n');
        }
    }

    tracing::debug!(
        chars = full_text.len(),
        page_count,
        "Extracted text from PDF"
    );

    Ok(ExtractedPdf {
        text: full_text,
        page_count,
    })
}

/// Create a minimal single-page PDF with the given text content.
#[cfg(test)]
pub(crate) fn create_test_pdf(text: &str) -> Vec<u8> {
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.4");

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let content = format!(
        "BT /F1 12 Tf 100 700 Td ({}) Tj ET",
        text.replace('\\', "\\\\")
            .replace('(', "\\(")
            .replace(')', "\\)")
    );
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Resources" => resources_id,
        "Contents" => content_id,
    });

    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
    });

    if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(page_id) {
        dict.set("Parent", pages_id);
    }

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}
