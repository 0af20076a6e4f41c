use crate::chunking::{normalize_whitespace, page_break_marker};
use crate::error::IngestError;
use crate::models::{DocType, ExtractedDocument, IngestionOptions};
use crate::{forum, mailbox};
use lopdf::{Dictionary, Document, Object, ObjectId};
use quick_xml::events::Event;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use url::Url;

pub const IMAGE_TOKEN: &str = "<IMAGE>";

const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const DISALLOWED_SYMBOLS: &str = r"[^\p{L}\p{N}\s.,!?\-()]";

#[derive(Debug, Clone)]
pub struct PageText {
    /// Zero-based page index.
    pub number: u32,
    pub text: String,
    pub has_images: bool,
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document = Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;
            let has_images = page_has_images(&document, page_id);

            if !text.trim().is_empty() || has_images {
                pages.push(PageText {
                    number: page_no.saturating_sub(1),
                    text,
                    has_images,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

fn page_has_images(document: &Document, page_id: ObjectId) -> bool {
    let (inline, inherited) = document.get_page_resources(page_id);
    let mut resources: Vec<&Dictionary> = inline.into_iter().collect();
    resources.extend(
        inherited
            .into_iter()
            .filter_map(|id| document.get_dictionary(id).ok()),
    );

    resources.iter().any(|resource| {
        let xobjects = match resource.get(b"XObject") {
            Ok(Object::Reference(id)) => document.get_dictionary(*id).ok(),
            Ok(other) => other.as_dict().ok(),
            Err(_) => None,
        };
        xobjects.is_some_and(|dict| dict.iter().any(|(_, object)| is_image(document, object)))
    })
}

fn is_image(document: &Document, object: &Object) -> bool {
    let resolved = match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    };
    match resolved {
        Some(Object::Stream(stream)) => stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .is_ok_and(|name| name == b"Image".as_slice()),
        _ => false,
    }
}

pub fn is_url(text: &str) -> bool {
    Url::parse(text.trim()).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

/// Collects cleaned body lines; the first non-empty line becomes the source when it is a URL.
pub(crate) struct LineCollector {
    symbols: Regex,
    seen_first_line: bool,
    source: Option<String>,
    lines: Vec<String>,
}

impl LineCollector {
    pub(crate) fn new() -> Result<Self, IngestError> {
        Ok(Self {
            symbols: Regex::new(DISALLOWED_SYMBOLS)?,
            seen_first_line: false,
            source: None,
            lines: Vec::new(),
        })
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        let normalized = normalize_whitespace(line);
        if normalized.is_empty() {
            return;
        }

        if !self.seen_first_line {
            self.seen_first_line = true;
            if is_url(&normalized) {
                self.source = Some(normalized);
                return;
            }
        }

        let cleaned = normalize_whitespace(&self.symbols.replace_all(&normalized, ""));
        if !cleaned.is_empty() {
            self.lines.push(cleaned);
        }
    }

    pub(crate) fn push_raw(&mut self, token: impl Into<String>) {
        self.lines.push(token.into());
    }

    pub(crate) fn finish(self) -> (Option<String>, String) {
        (self.source, self.lines.join(" "))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub(crate) fn file_name(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })
}

pub fn detect_doc_type(path: &Path) -> Option<DocType> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("docx") => Some(DocType::Word),
        Some("pdf") => Some(DocType::Pdf),
        Some("jsonl") => Some(DocType::ForumThread),
        _ if name.ends_with("mbox") => Some(DocType::Mbox),
        _ => None,
    }
}

/// Routes a file to the extractor for its type. Mailboxes and forum dumps yield one
/// document per message or thread.
pub fn extract_file(path: &Path, options: &IngestionOptions) -> Result<Vec<ExtractedDocument>, IngestError> {
    match detect_doc_type(path) {
        Some(DocType::Pdf) => Ok(vec![extract_pdf(&LopdfExtractor, path, options.mark_images)?]),
        Some(DocType::Word) => Ok(vec![extract_docx(path)?]),
        Some(DocType::Mbox) => mailbox::extract_mailbox(path),
        Some(DocType::ForumThread) => forum::extract_forum_threads(path),
        None => Err(IngestError::UnsupportedFile(path.display().to_string())),
    }
}

pub fn extract_pdf(
    extractor: &dyn PdfExtractor,
    path: &Path,
    mark_images: bool,
) -> Result<ExtractedDocument, IngestError> {
    let name = file_name(path)?;
    let checksum = sha256_hex(&std::fs::read(path)?);
    let pages = extractor.extract_pages(path)?;
    let raw_text = pages_to_raw_text(&pages, mark_images)?;

    Ok(ExtractedDocument {
        doc_type: DocType::Pdf,
        title: name.clone(),
        source: raw_text.0.unwrap_or(name),
        raw_text: raw_text.1,
        category: None,
        checksum,
    })
}

fn pages_to_raw_text(pages: &[PageText], mark_images: bool) -> Result<(Option<String>, String), IngestError> {
    let mut collector = LineCollector::new()?;
    for page in pages {
        collector.push_raw(page_break_marker(page.number));
        for line in page.text.lines() {
            collector.push_line(line);
        }
        if mark_images && page.has_images {
            collector.push_raw(IMAGE_TOKEN);
        }
    }
    Ok(collector.finish())
}

pub fn extract_docx(path: &Path) -> Result<ExtractedDocument, IngestError> {
    let name = file_name(path)?;
    let bytes = std::fs::read(path)?;
    let checksum = sha256_hex(&bytes);

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
        .map_err(|error| IngestError::DocxParse(error.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|error| IngestError::DocxParse(error.to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(IngestError::DocxParse(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    let mut collector = LineCollector::new()?;
    for paragraph in docx_paragraphs(&xml)? {
        collector.push_line(&paragraph);
    }
    let (source, raw_text) = collector.finish();

    Ok(ExtractedDocument {
        doc_type: DocType::Word,
        title: name.clone(),
        source: source.unwrap_or(name),
        raw_text,
        category: None,
        checksum,
    })
}

fn docx_paragraphs(xml: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"t" => in_text = true,
                b"tab" => current.push(' '),
                _ => {}
            },
            Ok(Event::Empty(element)) => match element.local_name().as_ref() {
                b"tab" | b"br" => current.push(' '),
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Text(text)) if in_text => {
                let unescaped = text
                    .unescape()
                    .map_err(|error| IngestError::DocxParse(error.to_string()))?;
                current.push_str(&unescaped);
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::DocxParse(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    const DOCX_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>https://example.edu/notice/42</w:t></w:r></w:p>
    <w:p><w:r><w:t>Dormitory   rules</w:t></w:r><w:r><w:t xml:space="preserve"> &amp; fees</w:t></w:r></w:p>
    <w:p/>
    <w:p><w:r><w:t>Check-in opens (March 2).</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    fn write_docx(path: &Path, xml: &str) -> Result<(), Box<dyn std::error::Error>> {
        let mut writer = zip::ZipWriter::new(File::create(path)?);
        writer.start_file("word/document.xml", zip::write::SimpleFileOptions::default())?;
        writer.write_all(xml.as_bytes())?;
        writer.finish()?;
        Ok(())
    }

    #[test]
    fn docx_first_line_url_becomes_source() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("rules.docx");
        write_docx(&path, DOCX_XML)?;

        let document = extract_docx(&path)?;
        assert_eq!(document.doc_type, DocType::Word);
        assert_eq!(document.title, "rules.docx");
        assert_eq!(document.source, "https://example.edu/notice/42");
        assert_eq!(document.raw_text, "Dormitory rules fees Check-in opens (March 2).");
        assert_eq!(document.checksum.len(), 64);
        Ok(())
    }

    #[test]
    fn docx_without_url_uses_file_name() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("plain.docx");
        write_docx(
            &path,
            r#"<w:document xmlns:w="x"><w:body><w:p><w:r><w:t>Hello</w:t></w:r></w:p></w:body></w:document>"#,
        )?;

        let document = extract_docx(&path)?;
        assert_eq!(document.source, "plain.docx");
        assert_eq!(document.raw_text, "Hello");
        Ok(())
    }

    #[test]
    fn invalid_docx_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, b"not a zip")?;
        assert!(matches!(extract_docx(&path), Err(IngestError::DocxParse(_))));
        Ok(())
    }

    #[test]
    fn invalid_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;
        let result = extract_file(&path, &IngestionOptions::default());
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn pdf_pages_are_marked_and_images_tagged() -> Result<(), Box<dyn std::error::Error>> {
        let pages = vec![
            PageText {
                number: 0,
                text: "http://portal.example.org/a.pdf\nIntro  line ★".to_string(),
                has_images: false,
            },
            PageText {
                number: 1,
                text: "Second page".to_string(),
                has_images: true,
            },
        ];

        let (source, text) = pages_to_raw_text(&pages, true)?;
        assert_eq!(source.as_deref(), Some("http://portal.example.org/a.pdf"));
        assert_eq!(
            text,
            "<PAGE_BREAK: 0> Intro line <PAGE_BREAK: 1> Second page <IMAGE>"
        );

        let (_, without_images) = pages_to_raw_text(&pages, false)?;
        assert!(!without_images.contains(IMAGE_TOKEN));
        Ok(())
    }

    #[test]
    fn doc_types_are_detected_by_name() {
        assert_eq!(detect_doc_type(Path::new("a/B.PDF")), Some(DocType::Pdf));
        assert_eq!(detect_doc_type(Path::new("a/b.docx")), Some(DocType::Word));
        assert_eq!(detect_doc_type(Path::new("inbox.mbox")), Some(DocType::Mbox));
        assert_eq!(detect_doc_type(Path::new("All mail 2.mbox")), Some(DocType::Mbox));
        assert_eq!(detect_doc_type(Path::new("free.jsonl")), Some(DocType::ForumThread));
        assert_eq!(detect_doc_type(Path::new("notes.txt")), None);
    }

    #[test]
    fn url_detection_requires_http_scheme() {
        assert!(is_url("https://example.com/x"));
        assert!(!is_url("ftp://example.com/x"));
        assert!(!is_url("Dormitory rules"));
    }
}
