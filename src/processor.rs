//! Mode-selected document processing.
//!
//! A `cloud` deployment runs the shallow path only: plain text and PDFs with
//! a usable text layer. Anything heavier is accepted but parked with
//! `needs_full_processing` until a local instance picks it up over sync. A
//! `local` deployment runs the full path: Office documents, HTML, and
//! structured sections. OCR is out of scope in both modes; a scanned PDF
//! fails in local mode instead of completing empty.

use serde_json::json;

use crate::config::Config;
use crate::extract::{self, DocxParagraph, ExtractError};
use crate::models::{ProcessedDocument, Section};

/// Formats the shallow path extracts directly.
pub const SIMPLE_TEXT_EXTENSIONS: [&str; 4] = [".txt", ".md", ".markdown", ".text"];
/// Formats only the full path extracts; the shallow path parks them.
pub const FULL_ONLY_EXTENSIONS: [&str; 8] = [
    ".docx", ".doc", ".pptx", ".ppt", ".xlsx", ".xls", ".html", ".htm",
];

/// A PDF below either threshold is treated as scanned: its text layer is
/// too thin to trust without OCR.
const MIN_TEXT_COVERAGE: f64 = 0.1;
const MIN_TEXT_CHARS: usize = 100;

pub struct DocumentProcessor {
    deployment_mode: String,
    max_file_size_mb: u64,
}

impl DocumentProcessor {
    pub fn new(config: &Config) -> Self {
        Self {
            deployment_mode: config.deployment.mode.clone(),
            max_file_size_mb: config.max_upload_bytes() / (1024 * 1024),
        }
    }

    pub fn for_mode(mode: &str) -> Self {
        Self {
            deployment_mode: mode.to_string(),
            max_file_size_mb: if mode == "local" { 50 } else { 10 },
        }
    }

    fn is_full(&self) -> bool {
        self.deployment_mode == "local"
    }

    /// Upload allow-list. Identical in both modes: the cloud accepts Office
    /// files too, it just parks them for the local instance.
    pub fn is_supported(&self, filename: &str) -> bool {
        let ext = extract::file_extension(filename);
        SIMPLE_TEXT_EXTENSIONS.contains(&ext.as_str())
            || ext == ".pdf"
            || FULL_ONLY_EXTENSIONS.contains(&ext.as_str())
    }

    pub fn supported_formats(&self) -> Vec<&'static str> {
        let mut formats: Vec<&'static str> = vec![".pdf"];
        formats.extend(SIMPLE_TEXT_EXTENSIONS);
        formats.extend(FULL_ONLY_EXTENSIONS);
        formats
    }

    pub fn capabilities(&self) -> serde_json::Value {
        json!({
            "pdf_text_extraction": true,
            "pdf_ocr": false,
            "office_documents": self.is_full(),
            "structured_sections": self.is_full(),
            "supported_formats": self.supported_formats(),
            "max_file_size_mb": self.max_file_size_mb,
        })
    }

    /// Runs the mode's extraction over raw bytes. Never panics; failures
    /// come back as an unsuccessful `ProcessedDocument` with an error
    /// message, which callers store via the failed path.
    pub fn process(&self, filename: &str, bytes: &[u8]) -> ProcessedDocument {
        let ext = extract::file_extension(filename);

        let mut result = if SIMPLE_TEXT_EXTENSIONS.contains(&ext.as_str()) {
            self.process_text(&ext, bytes)
        } else if ext == ".pdf" {
            self.process_pdf(bytes)
        } else if FULL_ONLY_EXTENSIONS.contains(&ext.as_str()) {
            if self.is_full() {
                self.process_full_format(&ext, bytes)
            } else {
                // Shallow path: accept and park for the local instance.
                park_for_full_processing()
            }
        } else {
            failure(
                "unsupported",
                ExtractError::UnsupportedExtension(ext.clone()).to_string(),
            )
        };

        enrich_metadata(
            &mut result,
            filename,
            &ext,
            bytes.len(),
            &self.deployment_mode,
            self.is_full(),
        );
        result
    }

    fn process_text(&self, ext: &str, bytes: &[u8]) -> ProcessedDocument {
        let (content, encoding) = extract::decode_text(bytes);
        if content.trim().is_empty() {
            return failure("error", "file contains no text");
        }
        let sections = if self.is_full() && matches!(ext, ".md" | ".markdown") {
            markdown_sections(&content)
        } else {
            Vec::new()
        };
        ProcessedDocument {
            success: true,
            metadata: json!({ "encoding": encoding }),
            sections,
            needs_full_processing: false,
            processing_mode: "simple_text".to_string(),
            error: None,
            content,
        }
    }

    fn process_pdf(&self, bytes: &[u8]) -> ProcessedDocument {
        let pdf = match extract::extract_pdf(bytes) {
            Ok(pdf) => pdf,
            Err(e) => return failure("pdf_error", e.to_string()),
        };
        let coverage = pdf.pages_with_text as f64 / pdf.page_count as f64;
        let metadata = json!({
            "page_count": pdf.page_count,
            "pages_with_text": pdf.pages_with_text,
            "text_coverage": coverage,
        });

        if needs_ocr(coverage, pdf.text.trim().chars().count()) {
            if self.is_full() {
                // OCR is not available; completing with a junk text layer
                // would be worse than failing loudly.
                let mut doc = failure(
                    "pdf_needs_ocr",
                    "PDF has no usable text layer and OCR is not available",
                );
                doc.metadata = metadata;
                return doc;
            }
            return ProcessedDocument {
                success: true,
                content: String::new(),
                metadata,
                sections: Vec::new(),
                needs_full_processing: true,
                processing_mode: "pdf_needs_ocr".to_string(),
                error: None,
            };
        }

        ProcessedDocument {
            success: true,
            content: pdf.text,
            metadata,
            sections: Vec::new(),
            needs_full_processing: false,
            processing_mode: "pdf_text".to_string(),
            error: None,
        }
    }

    fn process_full_format(&self, ext: &str, bytes: &[u8]) -> ProcessedDocument {
        match ext {
            ".docx" => match extract::extract_docx(bytes) {
                Ok(paragraphs) => {
                    let content = extract::docx_to_text(&paragraphs);
                    if content.trim().is_empty() {
                        return failure("error", "document contains no text");
                    }
                    ProcessedDocument {
                        success: true,
                        sections: docx_sections(&paragraphs),
                        metadata: json!({ "paragraph_count": paragraphs.len() }),
                        needs_full_processing: false,
                        processing_mode: "office_text".to_string(),
                        error: None,
                        content,
                    }
                }
                Err(e) => failure("error", e.to_string()),
            },
            ".pptx" => match extract::extract_pptx(bytes) {
                Ok(slides) => {
                    let content = slides
                        .iter()
                        .filter(|s| !s.trim().is_empty())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    if content.trim().is_empty() {
                        return failure("error", "presentation contains no text");
                    }
                    ProcessedDocument {
                        success: true,
                        sections: pptx_sections(&slides),
                        metadata: json!({ "slide_count": slides.len() }),
                        needs_full_processing: false,
                        processing_mode: "office_text".to_string(),
                        error: None,
                        content,
                    }
                }
                Err(e) => failure("error", e.to_string()),
            },
            ".xlsx" => match extract::extract_xlsx(bytes) {
                Ok(content) => {
                    if content.trim().is_empty() {
                        return failure("error", "spreadsheet contains no text");
                    }
                    ProcessedDocument {
                        success: true,
                        sections: Vec::new(),
                        metadata: json!({}),
                        needs_full_processing: false,
                        processing_mode: "office_text".to_string(),
                        error: None,
                        content,
                    }
                }
                Err(e) => failure("error", e.to_string()),
            },
            ".html" | ".htm" => match extract::extract_html(bytes) {
                Ok(content) => {
                    if content.trim().is_empty() {
                        return failure("error", "page contains no text");
                    }
                    ProcessedDocument {
                        success: true,
                        sections: Vec::new(),
                        metadata: json!({}),
                        needs_full_processing: false,
                        processing_mode: "html_text".to_string(),
                        error: None,
                        content,
                    }
                }
                Err(e) => failure("error", e.to_string()),
            },
            // Legacy binary Office formats need a converter we don't carry.
            ".doc" | ".ppt" | ".xls" => failure(
                "unsupported",
                format!("legacy Office format {} requires conversion to its OOXML equivalent", ext),
            ),
            other => failure(
                "unsupported",
                ExtractError::UnsupportedExtension(other.to_string()).to_string(),
            ),
        }
    }
}

fn needs_ocr(text_coverage: f64, trimmed_chars: usize) -> bool {
    text_coverage < MIN_TEXT_COVERAGE || trimmed_chars < MIN_TEXT_CHARS
}

fn park_for_full_processing() -> ProcessedDocument {
    ProcessedDocument {
        success: true,
        content: String::new(),
        metadata: json!({}),
        sections: Vec::new(),
        needs_full_processing: true,
        processing_mode: "pending_full_processing".to_string(),
        error: None,
    }
}

fn failure(mode: &str, error: impl Into<String>) -> ProcessedDocument {
    ProcessedDocument {
        success: false,
        content: String::new(),
        metadata: json!({}),
        sections: Vec::new(),
        needs_full_processing: false,
        processing_mode: mode.to_string(),
        error: Some(error.into()),
    }
}

fn enrich_metadata(
    result: &mut ProcessedDocument,
    filename: &str,
    ext: &str,
    file_size: usize,
    deployment_mode: &str,
    full: bool,
) {
    if let Some(obj) = result.metadata.as_object_mut() {
        obj.insert("filename".to_string(), json!(filename));
        obj.insert("file_extension".to_string(), json!(ext));
        obj.insert("file_size".to_string(), json!(file_size));
        obj.insert(
            "character_count".to_string(),
            json!(result.content.chars().count()),
        );
        obj.insert(
            "processor".to_string(),
            json!(if full { "full" } else { "shallow" }),
        );
        obj.insert("deployment_mode".to_string(), json!(deployment_mode));
    }
}

/// Builds sections from `#`-style Markdown headings. Text before the first
/// heading stays in the document content but gets no section of its own.
fn markdown_sections(content: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|&c| c == '#').count();
        let is_heading = (1..=6).contains(&hashes)
            && trimmed[hashes..].starts_with(' ')
            && !trimmed[hashes..].trim().is_empty();
        if is_heading {
            sections.push(Section {
                title: trimmed[hashes..].trim().to_string(),
                level: hashes as u32,
                content: String::new(),
            });
        } else if let Some(current) = sections.last_mut() {
            if !current.content.is_empty() {
                current.content.push('\n');
            }
            current.content.push_str(line);
        }
    }
    for s in &mut sections {
        s.content = s.content.trim().to_string();
    }
    sections
}

/// Groups DOCX paragraphs under their nearest preceding heading.
fn docx_sections(paragraphs: &[DocxParagraph]) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    for p in paragraphs {
        if let Some(level) = p.heading_level {
            sections.push(Section {
                title: p.text.clone(),
                level,
                content: String::new(),
            });
        } else if let Some(current) = sections.last_mut() {
            if !current.content.is_empty() {
                current.content.push_str("\n\n");
            }
            current.content.push_str(&p.text);
        }
    }
    sections
}

fn pptx_sections(slides: &[String]) -> Vec<Section> {
    slides
        .iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(i, text)| Section {
            title: format!("Slide {}", i + 1),
            level: 1,
            content: text.trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> DocumentProcessor {
        DocumentProcessor::for_mode("cloud")
    }

    fn local() -> DocumentProcessor {
        DocumentProcessor::for_mode("local")
    }

    #[test]
    fn plain_text_completes_in_both_modes() {
        let body = b"Keep three days of water per person.";
        for p in [cloud(), local()] {
            let doc = p.process("prep.txt", body);
            assert!(doc.success);
            assert!(!doc.needs_full_processing);
            assert_eq!(doc.processing_mode, "simple_text");
            assert!(doc.content.contains("three days of water"));
        }
    }

    #[test]
    fn office_upload_is_parked_on_cloud() {
        let doc = cloud().process("plan.docx", b"irrelevant");
        assert!(doc.success);
        assert!(doc.needs_full_processing);
        assert_eq!(doc.processing_mode, "pending_full_processing");
        assert!(doc.content.is_empty());
    }

    #[test]
    fn unknown_extension_fails_in_both_modes() {
        for p in [cloud(), local()] {
            let doc = p.process("archive.tar", b"x");
            assert!(!doc.success);
            assert_eq!(doc.processing_mode, "unsupported");
            assert!(doc.error.as_deref().unwrap().contains(".tar"));
        }
    }

    #[test]
    fn legacy_office_fails_in_local_mode() {
        let doc = local().process("old.doc", b"\xd0\xcf\x11\xe0");
        assert!(!doc.success);
        assert_eq!(doc.processing_mode, "unsupported");
    }

    #[test]
    fn empty_text_file_does_not_complete() {
        let doc = cloud().process("blank.txt", b"   \n  ");
        assert!(!doc.success);
        assert_eq!(doc.processing_mode, "error");
    }

    #[test]
    fn ocr_heuristic_thresholds() {
        assert!(needs_ocr(0.05, 5000));
        assert!(needs_ocr(0.9, 50));
        assert!(!needs_ocr(0.5, 500));
        assert!(!needs_ocr(0.1, 100));
    }

    #[test]
    fn metadata_carries_provenance_fields() {
        let doc = cloud().process("notes.txt", b"Community shelters open at 8am.");
        let meta = doc.metadata.as_object().unwrap();
        assert_eq!(meta["file_extension"], ".txt");
        assert_eq!(meta["processor"], "shallow");
        assert_eq!(meta["deployment_mode"], "cloud");
        assert_eq!(meta["encoding"], "utf-8");
        assert!(meta["character_count"].as_u64().unwrap() > 0);
    }

    #[test]
    fn markdown_sections_follow_headings() {
        let md = "intro line\n# Flood\nRaise furniture.\n\n## Sandbags\nFill halfway.\n# Heat\nCheck on neighbors.";
        let sections = markdown_sections(md);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].title, "Flood");
        assert_eq!(sections[0].level, 1);
        assert!(sections[0].content.contains("Raise furniture."));
        assert_eq!(sections[1].title, "Sandbags");
        assert_eq!(sections[1].level, 2);
        assert_eq!(sections[2].title, "Heat");
    }

    #[test]
    fn markdown_sections_only_in_local_mode() {
        let md = b"# Title\nBody text for the plan.\nMore body text to pass the check.";
        let shallow = cloud().process("plan.md", md);
        assert!(shallow.sections.is_empty());
        let full = local().process("plan.md", md);
        assert_eq!(full.sections.len(), 1);
        assert_eq!(full.sections[0].title, "Title");
    }

    #[test]
    fn docx_sections_group_by_heading() {
        let paragraphs = vec![
            DocxParagraph {
                text: "Overview".to_string(),
                heading_level: Some(1),
            },
            DocxParagraph {
                text: "First paragraph.".to_string(),
                heading_level: None,
            },
            DocxParagraph {
                text: "Second paragraph.".to_string(),
                heading_level: None,
            },
            DocxParagraph {
                text: "Details".to_string(),
                heading_level: Some(2),
            },
        ];
        let sections = docx_sections(&paragraphs);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Overview");
        assert!(sections[0].content.contains("First paragraph."));
        assert!(sections[0].content.contains("Second paragraph."));
        assert_eq!(sections[1].title, "Details");
        assert!(sections[1].content.is_empty());
    }

    #[test]
    fn capabilities_reflect_mode() {
        let c = cloud().capabilities();
        assert_eq!(c["office_documents"], false);
        assert_eq!(c["structured_sections"], false);
        assert_eq!(c["pdf_ocr"], false);
        assert_eq!(c["max_file_size_mb"], 10);

        let l = local().capabilities();
        assert_eq!(l["office_documents"], true);
        assert_eq!(l["max_file_size_mb"], 50);
    }
}
