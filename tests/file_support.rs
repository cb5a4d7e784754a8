//! Format support tests against real fixture files built in memory.
//!
//! Exercises the extraction pipeline end to end per format: a valid PDF with
//! a text layer, OOXML archives (docx/pptx/xlsx) assembled with the same zip
//! crate the extractor reads them with, HTML, and the failure modes (sparse
//! scans, legacy binaries, corrupt input) that decide whether a document is
//! completed, parked for local processing, or failed.

use resilience_pipeline::processor::DocumentProcessor;
use std::io::Write;

fn cloud() -> DocumentProcessor {
    DocumentProcessor::for_mode("cloud")
}

fn local() -> DocumentProcessor {
    DocumentProcessor::for_mode("local")
}

/// Valid single-page PDF carrying `text` in its content stream, built with
/// lopdf so pdf-extract can parse it back out.
fn pdf_with_text(text: &str) -> Vec<u8> {
    use lopdf::dictionary;
    use lopdf::{Document, Object, Stream};

    let mut doc = Document::with_version("1.4");

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let content = format!("BT /F1 12 Tf 100 700 Td ({text}) Tj ET");
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

    let resources = dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    };

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
        "Resources" => resources,
    });

    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
    });

    if let Ok(Object::Dictionary(ref mut dict)) = doc.get_object_mut(page_id) {
        dict.set("Parent", pages_id);
    }

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

fn zip_with_entries(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, xml) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// Minimal docx: a ZIP whose `word/document.xml` wraps the given body XML.
fn docx_with_body(body: &str) -> Vec<u8> {
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
        body
    );
    zip_with_entries(&[("word/document.xml", &xml)])
}

/// Minimal pptx with one `ppt/slides/slideN.xml` per entry.
fn pptx_with_slides(slides: &[&str]) -> Vec<u8> {
    let entries: Vec<(String, String)> = slides
        .iter()
        .enumerate()
        .map(|(i, text)| {
            (
                format!("ppt/slides/slide{}.xml", i + 1),
                format!(
                    "<?xml version=\"1.0\"?><p:sld xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\" xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                    text
                ),
            )
        })
        .collect();
    let borrowed: Vec<(&str, &str)> = entries
        .iter()
        .map(|(n, x)| (n.as_str(), x.as_str()))
        .collect();
    zip_with_entries(&borrowed)
}

/// Minimal xlsx: a shared-string table plus one sheet referencing every
/// string in order.
fn xlsx_with_strings(strings: &[&str]) -> Vec<u8> {
    let shared: String = strings
        .iter()
        .map(|s| format!("<si><t>{}</t></si>", s))
        .collect();
    let shared_xml = format!(
        "<?xml version=\"1.0\"?><sst xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" count=\"{n}\" uniqueCount=\"{n}\">{shared}</sst>",
        n = strings.len(),
        shared = shared
    );
    let cells: String = strings
        .iter()
        .enumerate()
        .map(|(i, _)| format!("<c r=\"A{row}\" t=\"s\"><v>{i}</v></c>", row = i + 1, i = i))
        .collect();
    let sheet_xml = format!(
        "<?xml version=\"1.0\"?><worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData><row r=\"1\">{}</row></sheetData></worksheet>",
        cells
    );
    zip_with_entries(&[
        ("xl/sharedStrings.xml", &shared_xml),
        ("xl/worksheets/sheet1.xml", &sheet_xml),
    ])
}

// A text layer long enough to clear the OCR heuristic.
const PDF_BODY: &str = "Vaccination sites open at dawn on the showground and remain staffed until the last resident in the queue has been seen.";

#[test]
fn pdf_with_text_layer_completes_in_both_modes() {
    let bytes = pdf_with_text(PDF_BODY);
    for processor in [cloud(), local()] {
        let doc = processor.process("vaccination_sites.pdf", &bytes);
        assert!(doc.success, "error: {:?}", doc.error);
        assert!(!doc.needs_full_processing);
        assert_eq!(doc.processing_mode, "pdf_text");
        assert!(
            doc.content.contains("showground"),
            "extracted text should survive the round trip, got: {}",
            doc.content
        );
        assert_eq!(doc.metadata["page_count"], 1);
        assert_eq!(doc.metadata["pages_with_text"], 1);
    }
}

#[test]
fn pdf_with_sparse_text_is_parked_on_cloud() {
    let bytes = pdf_with_text("Scanned archive page");
    let doc = cloud().process("scan.pdf", &bytes);
    assert!(doc.success);
    assert!(doc.needs_full_processing, "a thin text layer means OCR territory");
    assert_eq!(doc.processing_mode, "pdf_needs_ocr");
    assert!(doc.content.is_empty());
}

#[test]
fn pdf_with_sparse_text_fails_locally() {
    // The local instance is the end of the line; without OCR the honest
    // outcome is failure, not a junk text layer.
    let bytes = pdf_with_text("Scanned archive page");
    let doc = local().process("scan.pdf", &bytes);
    assert!(!doc.success);
    assert_eq!(doc.processing_mode, "pdf_needs_ocr");
    assert!(doc.error.as_deref().unwrap().contains("OCR"));
}

#[test]
fn corrupt_pdf_reports_error() {
    let doc = local().process("broken.pdf", b"not a valid pdf at all");
    assert!(!doc.success);
    assert_eq!(doc.processing_mode, "pdf_error");
    assert!(doc.error.is_some());
}

#[test]
fn docx_extracts_paragraphs_and_sections_locally() {
    let bytes = docx_with_body(
        r#"<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Flood Response</w:t></w:r></w:p>
<w:p><w:r><w:t>Sandbags are staged at the council depot.</w:t></w:r></w:p>
<w:p><w:r><w:t>Road closures are announced on local radio.</w:t></w:r></w:p>
<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Evacuation</w:t></w:r></w:p>"#,
    );
    let doc = local().process("flood_response.docx", &bytes);
    assert!(doc.success, "error: {:?}", doc.error);
    assert_eq!(doc.processing_mode, "office_text");
    assert!(doc.content.contains("Sandbags are staged at the council depot."));
    assert!(doc.content.contains("Road closures are announced on local radio."));
    assert_eq!(doc.metadata["paragraph_count"], 4);

    assert_eq!(doc.sections.len(), 2);
    assert_eq!(doc.sections[0].title, "Flood Response");
    assert_eq!(doc.sections[0].level, 1);
    assert!(doc.sections[0].content.contains("Sandbags"));
    assert_eq!(doc.sections[1].title, "Evacuation");
    assert_eq!(doc.sections[1].level, 2);
}

#[test]
fn docx_is_parked_on_cloud_without_reading_it() {
    let bytes = docx_with_body("<w:p><w:r><w:t>anything</w:t></w:r></w:p>");
    let doc = cloud().process("plan.docx", &bytes);
    assert!(doc.success);
    assert!(doc.needs_full_processing);
    assert_eq!(doc.processing_mode, "pending_full_processing");
    assert!(doc.content.is_empty());
}

#[test]
fn pptx_slides_become_sections() {
    let bytes = pptx_with_slides(&[
        "Storm surge reaches two metres above the highway",
        "Move livestock to the northern paddocks early",
    ]);
    let doc = local().process("storm_briefing.pptx", &bytes);
    assert!(doc.success, "error: {:?}", doc.error);
    assert_eq!(doc.processing_mode, "office_text");
    assert!(doc.content.contains("Storm surge"));
    assert!(doc.content.contains("northern paddocks"));
    assert_eq!(doc.metadata["slide_count"], 2);

    assert_eq!(doc.sections.len(), 2);
    assert_eq!(doc.sections[0].title, "Slide 1");
    assert_eq!(doc.sections[1].title, "Slide 2");
    assert!(doc.sections[1].content.contains("livestock"));
}

#[test]
fn xlsx_shared_strings_extract() {
    let bytes = xlsx_with_strings(&[
        "Evacuation kit checklist",
        "Torch and spare batteries",
        "Battery radio",
    ]);
    let doc = local().process("kit_checklist.xlsx", &bytes);
    assert!(doc.success, "error: {:?}", doc.error);
    assert_eq!(doc.processing_mode, "office_text");
    assert!(doc.content.contains("Evacuation kit checklist"));
    assert!(doc.content.contains("Torch and spare batteries"));
    assert!(doc.content.contains("Battery radio"));
}

#[test]
fn html_keeps_text_and_drops_scripts() {
    let html = br#"<html><head><title>x</title><script>var tracker = 1;</script></head>
<body><h1>Heatwave Advice</h1><p>Check on elderly neighbours twice a day.</p>
<style>.hot { color: red }</style><p>Never leave children in parked cars.</p></body></html>"#;
    let doc = local().process("heatwave.html", html);
    assert!(doc.success, "error: {:?}", doc.error);
    assert_eq!(doc.processing_mode, "html_text");
    assert!(doc.content.contains("Heatwave Advice"));
    assert!(doc.content.contains("elderly neighbours"));
    assert!(!doc.content.contains("var tracker"));
    assert!(!doc.content.contains("color: red"));
}

#[test]
fn legacy_office_formats_fail_with_guidance() {
    for name in ["minutes.doc", "slides.ppt", "register.xls"] {
        let doc = local().process(name, b"\xd0\xcf\x11\xe0legacy compound file");
        assert!(!doc.success, "{} should not extract", name);
        assert_eq!(doc.processing_mode, "unsupported");
        assert!(
            doc.error.as_deref().unwrap().contains("OOXML"),
            "error should point at the converted format, got: {:?}",
            doc.error
        );
    }
}

#[test]
fn docx_zip_without_document_xml_fails() {
    let bytes = zip_with_entries(&[("word/styles.xml", "<styles/>")]);
    let doc = local().process("hollow.docx", &bytes);
    assert!(!doc.success);
    assert_eq!(doc.processing_mode, "error");
}
