//! Per-format text extraction from raw document bytes.
//!
//! The processor layer decides *which* of these run for a given deployment
//! mode; this module only turns bytes into text (plus the per-format
//! structure the section builder needs). Everything operates on in-memory
//! bytes; ZIP member reads are size-bounded.

use std::io::Read;

/// Maximum slides/sheets walked per OOXML container.
const OOXML_MAX_PARTS: usize = 500;
/// Maximum cells collected per worksheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug)]
pub enum ExtractError {
    UnsupportedExtension(String),
    Pdf(String),
    Ooxml(String),
    Html(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedExtension(ext) => {
                write!(f, "unsupported file extension: {}", ext)
            }
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::Html(e) => write!(f, "HTML extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Lowercased extension including the dot (`"report.PDF"` → `".pdf"`), or
/// empty string when the filename has none.
pub fn file_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!(".{}", ext.to_lowercase())
        }
        _ => String::new(),
    }
}

// ============ Plain text ============

/// Decodes text bytes, trying strict UTF-8 first, then UTF-8 with a BOM,
/// then a CP1252-style single-byte fallback that cannot fail. Returns the
/// decoded text and the encoding label recorded in document metadata.
pub fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    // BOM check must run first: a BOM-prefixed buffer is also valid UTF-8
    // and would otherwise keep a stray U+FEFF at the start of the text.
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(s) = std::str::from_utf8(&bytes[3..]) {
            return (s.to_string(), "utf-8-sig");
        }
    }
    if let Ok(s) = std::str::from_utf8(bytes) {
        return (s.to_string(), "utf-8");
    }
    let s: String = bytes.iter().map(|&b| cp1252_char(b)).collect();
    (s, "cp1252")
}

/// Maps a single byte to its CP1252 character. Bytes 0x80–0x9F use the
/// Windows-1252 table; everything else matches Latin-1.
fn cp1252_char(b: u8) -> char {
    match b {
        0x80 => '\u{20AC}',
        0x82 => '\u{201A}',
        0x83 => '\u{0192}',
        0x84 => '\u{201E}',
        0x85 => '\u{2026}',
        0x86 => '\u{2020}',
        0x87 => '\u{2021}',
        0x88 => '\u{02C6}',
        0x89 => '\u{2030}',
        0x8A => '\u{0160}',
        0x8B => '\u{2039}',
        0x8C => '\u{0152}',
        0x8E => '\u{017D}',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '\u{201C}',
        0x94 => '\u{201D}',
        0x95 => '\u{2022}',
        0x96 => '\u{2013}',
        0x97 => '\u{2014}',
        0x98 => '\u{02DC}',
        0x99 => '\u{2122}',
        0x9A => '\u{0161}',
        0x9B => '\u{203A}',
        0x9C => '\u{0153}',
        0x9E => '\u{017E}',
        0x9F => '\u{0178}',
        other => other as char,
    }
}

// ============ PDF ============

/// Text plus the page-level coverage figures the OCR heuristic needs.
///
/// Extraction runs page by page; a page whose text layer is empty still
/// counts toward `page_count`, which is what drives the coverage ratio.
#[derive(Debug)]
pub struct PdfText {
    pub text: String,
    pub page_count: usize,
    pub pages_with_text: usize,
}

pub fn extract_pdf(bytes: &[u8]) -> Result<PdfText, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    let page_count = pages.len().max(1);
    let pages_with_text = pages.iter().filter(|p| !p.trim().is_empty()).count();
    let text = pages.join("\n");

    Ok(PdfText {
        text,
        page_count,
        pages_with_text,
    })
}

// ============ DOCX ============

/// One paragraph of a DOCX body, with the heading level when the paragraph
/// carries a `Heading1`..`Heading9` style.
#[derive(Debug, Clone)]
pub struct DocxParagraph {
    pub text: String,
    pub heading_level: Option<u32>,
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

pub fn extract_docx(bytes: &[u8]) -> Result<Vec<DocxParagraph>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    parse_docx_paragraphs(&doc_xml)
}

fn parse_docx_paragraphs(xml: &[u8]) -> Result<Vec<DocxParagraph>, ExtractError> {
    let mut paragraphs = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut current = String::new();
    let mut heading_level: Option<u32> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    current.clear();
                    heading_level = None;
                }
                b"t" => in_text = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"pStyle" {
                    heading_level = heading_level.or_else(|| style_heading_level(&e));
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = current.trim().to_string();
                    if !text.is_empty() {
                        paragraphs.push(DocxParagraph {
                            text,
                            heading_level,
                        });
                    }
                    current.clear();
                    heading_level = None;
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(paragraphs)
}

/// Reads `w:val` off a `pStyle` element and maps `Heading1`..`Heading9` to a
/// level. Other style names yield `None`.
fn style_heading_level(e: &quick_xml::events::BytesStart<'_>) -> Option<u32> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"val" {
            let val = String::from_utf8_lossy(attr.value.as_ref()).into_owned();
            if let Some(num) = val.strip_prefix("Heading") {
                if let Ok(level) = num.parse::<u32>() {
                    if (1..=9).contains(&level) {
                        return Some(level);
                    }
                }
            }
        }
    }
    None
}

/// DOCX body as flat text, paragraphs separated by blank lines.
pub fn docx_to_text(paragraphs: &[DocxParagraph]) -> String {
    paragraphs
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============ PPTX ============

/// Extracts one text blob per slide, in slide order.
pub fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut slides = Vec::new();
    for name in slide_names.into_iter().take(OOXML_MAX_PARTS) {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        slides.push(extract_a_t_elements(&xml)?);
    }
    Ok(slides)
}

fn extract_a_t_elements(xml: &[u8]) -> Result<String, ExtractError> {
    let mut parts: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                let t = te.unescape().unwrap_or_default().into_owned();
                if !t.trim().is_empty() {
                    parts.push(t);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(parts.join(" "))
}

// ============ XLSX ============

pub fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&mut archive)?;
    let mut out = String::new();
    for (idx, name) in sheet_names.into_iter().take(OOXML_MAX_PARTS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let cell_texts = extract_xlsx_sheet_cells(&sheet_xml, &shared_strings)?;
        if idx > 0 && !out.is_empty() && !cell_texts.is_empty() {
            out.push(' ');
        }
        out.push_str(&cell_texts);
    }
    Ok(out)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                strings.push(te.unescape().unwrap_or_default().into_owned());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"si" => in_si = false,
                b"t" => in_text = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    Ok(names)
}

fn extract_xlsx_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() && cell_is_shared_str {
                    if let Ok(i) = s.parse::<usize>() {
                        if i < shared_strings.len() {
                            cells.push(shared_strings[i].clone());
                        }
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

// ============ HTML ============

/// Tag-stripping text walk. Lossy on purpose: good enough for indexing and
/// extraction, not a rendering path. `script`/`style` contents are skipped;
/// block-level closes insert line breaks.
pub fn extract_html(bytes: &[u8]) -> Result<String, ExtractError> {
    let (source, _) = decode_text(bytes);
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_str(&source);
    reader.config_mut().check_end_names = false;
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) => {
                if is_skipped_html_element(e.local_name().as_ref()) {
                    skip_depth += 1;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if is_skipped_html_element(name.as_ref()) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if skip_depth == 0 && is_block_html_element(name.as_ref()) {
                    push_newline(&mut out);
                }
            }
            Ok(quick_xml::events::Event::Empty(e)) => {
                if skip_depth == 0 && e.local_name().as_ref() == b"br" {
                    push_newline(&mut out);
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if skip_depth == 0 => {
                let t = te.unescape().unwrap_or_default().into_owned();
                let trimmed = t.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push(' ');
                    }
                    out.push_str(trimmed);
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Html(e.to_string())),
            _ => {}
        }
    }
    Ok(out.trim().to_string())
}

fn is_skipped_html_element(name: &[u8]) -> bool {
    matches!(name, b"script" | b"style" | b"head")
}

fn is_block_html_element(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"div"
            | b"h1"
            | b"h2"
            | b"h3"
            | b"h4"
            | b"h5"
            | b"h6"
            | b"li"
            | b"tr"
            | b"section"
            | b"article"
    )
}

fn push_newline(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_normalized() {
        assert_eq!(file_extension("Flood Plan.PDF"), ".pdf");
        assert_eq!(file_extension("notes.tar.gz"), ".gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension(".bashrc"), "");
    }

    #[test]
    fn utf8_decodes_strict() {
        let (text, enc) = decode_text("evacuation ro\u{00FC}te".as_bytes());
        assert_eq!(enc, "utf-8");
        assert!(text.contains("ro\u{00FC}te"));
    }

    #[test]
    fn bom_is_stripped() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"shelter list");
        let (text, enc) = decode_text(&bytes);
        assert_eq!(enc, "utf-8-sig");
        assert_eq!(text, "shelter list");
    }

    #[test]
    fn cp1252_fallback_maps_smart_quotes() {
        // 0x93/0x94 are curly quotes in CP1252 and invalid UTF-8 alone.
        let bytes = [0x93, b'o', b'k', 0x94];
        let (text, enc) = decode_text(&bytes);
        assert_eq!(enc, "cp1252");
        assert_eq!(text, "\u{201C}ok\u{201D}");
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_pdf(b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_docx(b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_capture_heading_styles() {
        let xml = br#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Flood Response</w:t></w:r></w:p>
    <w:p><w:r><w:t>Sandbags are staged at the depot.</w:t></w:r></w:p>
    <w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Evacuation</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let paragraphs = parse_docx_paragraphs(xml).unwrap();
        assert_eq!(paragraphs.len(), 3);
        assert_eq!(paragraphs[0].heading_level, Some(1));
        assert_eq!(paragraphs[0].text, "Flood Response");
        assert_eq!(paragraphs[1].heading_level, None);
        assert_eq!(paragraphs[2].heading_level, Some(2));
    }

    #[test]
    fn html_strips_tags_and_scripts() {
        let html = br#"<html><head><title>x</title><script>var a = 1;</script></head>
<body><h1>Wildfire Brief</h1><p>Defensible space reduces risk.</p>
<style>.a { color: red }</style><p>Check <b>alerts</b> daily.</p></body></html>"#;
        let text = extract_html(html).unwrap();
        assert!(text.contains("Wildfire Brief"));
        assert!(text.contains("Defensible space reduces risk."));
        assert!(text.contains("Check alerts daily."));
        assert!(!text.contains("var a"));
        assert!(!text.contains("color: red"));
    }

    #[test]
    fn heading_style_requires_known_range() {
        use quick_xml::events::BytesStart;
        let mut e = BytesStart::new("pStyle");
        e.push_attribute(("w:val", "Heading3"));
        assert_eq!(style_heading_level(&e), Some(3));

        let mut e = BytesStart::new("pStyle");
        e.push_attribute(("w:val", "BodyText"));
        assert_eq!(style_heading_level(&e), None);

        let mut e = BytesStart::new("pStyle");
        e.push_attribute(("w:val", "Heading12"));
        assert_eq!(style_heading_level(&e), None);
    }
}
