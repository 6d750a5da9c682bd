//! Page text extraction from PDF documents.

use lopdf::Document;

/// Failure while parsing the PDF. The caller attaches the path.
#[derive(Debug)]
pub struct PdfError(pub String);

/// Extract the text of every page, in page order.
///
/// Pages with no text layer (scans) yield an empty string, so the returned
/// length is always the page count.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<String>, PdfError> {
    let doc = Document::load_mem(bytes).map_err(|e| PdfError(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(PdfError("encrypted PDF".into()));
    }

    doc.get_pages()
        .keys()
        .map(|&number| {
            doc.extract_text(&[number])
                .map(|text| text.trim().to_string())
                .map_err(|e| PdfError(format!("page {}: {}", number, e)))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};

    use super::*;

    /// A minimal PDF with one Courier text line per page.
    pub(crate) fn pdf_with_pages(lines: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for line in lines {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*line)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_extract_pages_in_order() {
        let pages = extract_pages(&pdf_with_pages(&["Overview", "Uses S3."])).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].contains("Overview"));
        assert!(pages[1].contains("Uses S3."));
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(extract_pages(b"%PDF-1.5 truncated").is_err());
        assert!(extract_pages(b"not a pdf at all").is_err());
    }
}
