//! Paragraph text extraction from Office Open XML (`.docx`) documents.

use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;

const DOCUMENT_PART: &str = "word/document.xml";

/// Failure while reading the archive or its XML. The caller attaches the path.
#[derive(Debug)]
pub struct DocxError(pub String);

/// Extract the body text of a `.docx` file.
///
/// Returns one entry per paragraph. Table rows are flattened into a single
/// entry with cells separated by `" | "`. Tabs and line breaks inside runs are
/// kept as `\t` and `\n`.
pub fn extract_paragraphs(bytes: &[u8]) -> Result<Vec<String>, DocxError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| DocxError(e.to_string()))?;

    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|e| DocxError(format!("{}: {}", DOCUMENT_PART, e)))?
        .read_to_string(&mut xml)
        .map_err(|e| DocxError(e.to_string()))?;

    parse_document_xml(&xml)
}

#[derive(Default)]
struct Extractor {
    paragraphs: Vec<String>,
    current: String,
    in_text: bool,
    table_depth: usize,
    cells: Vec<String>,
    cell: Vec<String>,
}

impl Extractor {
    fn end_paragraph(&mut self) {
        let text = std::mem::take(&mut self.current);
        if self.table_depth > 0 {
            self.cell.push(text);
        } else {
            self.paragraphs.push(text);
        }
    }

    fn end_cell(&mut self) {
        let text = std::mem::take(&mut self.cell).join("\n");
        let text = text.trim();
        if !text.is_empty() {
            self.cells.push(text.to_string());
        }
    }

    fn end_row(&mut self) {
        let cells = std::mem::take(&mut self.cells);
        if !cells.is_empty() {
            self.paragraphs.push(cells.join(" | "));
        }
    }
}

fn parse_document_xml(xml: &str) -> Result<Vec<String>, DocxError> {
    let mut reader = Reader::from_str(xml);
    let mut ex = Extractor::default();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| DocxError(format!("XML error at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"w:t" => ex.in_text = true,
                b"w:tbl" => ex.table_depth += 1,
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"w:t" => ex.in_text = false,
                b"w:p" => ex.end_paragraph(),
                b"w:tc" if ex.table_depth == 1 => ex.end_cell(),
                b"w:tr" if ex.table_depth == 1 => ex.end_row(),
                b"w:tbl" => ex.table_depth = ex.table_depth.saturating_sub(1),
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"w:tab" => ex.current.push('\t'),
                b"w:br" | b"w:cr" => ex.current.push('\n'),
                b"w:p" => ex.end_paragraph(),
                _ => {}
            },
            Event::Text(t) if ex.in_text => {
                let text = t.unescape().map_err(|e| DocxError(e.to_string()))?;
                ex.current.push_str(&text);
            }
            Event::CData(c) if ex.in_text => {
                ex.current.push_str(&String::from_utf8_lossy(&c));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ex.paragraphs)
}
