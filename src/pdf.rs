use image::{DynamicImage, ImageFormat};
use lopdf::{Document, Object, ObjectId};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Minimum number of non-whitespace characters we expect from a real text
/// layer. Below this the document is treated as scanned.
const MIN_TEXT_CHARS: usize = 30;

/// Share of image-only pages from which the whole document counts as scanned.
const SCANNED_PAGE_RATIO: f64 = 0.8;

/// What the submitted bytes look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Image,
    Empty,
    Unknown,
}

/// Classify a payload by its leading bytes.
pub fn detect_kind(bytes: &[u8]) -> DocumentKind {
    if bytes.is_empty() {
        return DocumentKind::Empty;
    }
    // Some generators put junk before the header; readers accept it within 1 KiB.
    let head = &bytes[..bytes.len().min(1024)];
    if head.windows(5).any(|w| w == b"%PDF-") {
        return DocumentKind::Pdf;
    }
    if image::guess_format(bytes).is_ok() {
        return DocumentKind::Image;
    }
    DocumentKind::Unknown
}

/// Inclusive, 1-based page range (`3` or `2-4` on the command line).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn contains(&self, page: u32) -> bool {
        (self.first..=self.last).contains(&page)
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

impl FromStr for PageRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid page number {p:?}"))
        };
        let (first, last) = match s.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let n = parse(s)?;
                (n, n)
            }
        };
        if first == 0 || last < first {
            return Err(format!("invalid page range {s:?} (pages start at 1, first <= last)"));
        }
        Ok(PageRange { first, last })
    }
}

/// Result of reading a PDF's text layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PdfText {
    /// The PDF carries a usable text layer.
    Text(String),
    /// Image-only, or too little text: needs OCR.
    ScannedImage,
    Error(String),
}

/// Read the native text layer, optionally restricted to `pages`.
pub fn read_native_text(pdf_bytes: &[u8], pages: Option<PageRange>) -> PdfText {
    let doc = match Document::load_mem(pdf_bytes) {
        Ok(d) => d,
        Err(e) => return PdfText::Error(format!("Failed to parse PDF: {e}")),
    };

    let selected = selected_pages(&doc, pages);
    if selected.is_empty() {
        let total = doc.get_pages().len();
        return match pages {
            Some(range) => PdfText::Error(format!("Page range {range} is outside the document ({total} pages)")),
            None => PdfText::Error("PDF has no pages".to_string()),
        };
    }

    if looks_like_scanned(&doc, &selected) {
        info!("PDF structural check: likely scanned / image-only");
        return PdfText::ScannedImage;
    }

    let extracted = match pages {
        // lopdf can restrict extraction to given pages; pdf-extract cannot.
        Some(_) => {
            let numbers: Vec<u32> = selected.iter().map(|(n, _)| *n).collect();
            doc.extract_text(&numbers).map_err(|e| e.to_string())
        }
        None => panic::catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(pdf_bytes)))
            .map_err(|_| "pdf-extract aborted".to_string())
            .and_then(|r| r.map_err(|e| e.to_string())),
    };

    match extracted {
        Ok(text) => {
            let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
            if meaningful < MIN_TEXT_CHARS {
                info!(chars = meaningful, "Extracted text too short; treating as scanned");
                PdfText::ScannedImage
            } else {
                info!(chars = meaningful, "Text layer extracted");
                PdfText::Text(text)
            }
        }
        Err(e) => {
            warn!(error = %e, "Text extraction failed; may be scanned or corrupted");
            PdfText::ScannedImage
        }
    }
}

fn selected_pages(doc: &Document, range: Option<PageRange>) -> Vec<(u32, ObjectId)> {
    doc.get_pages()
        .into_iter()
        .filter(|(n, _)| range.map_or(true, |r| r.contains(*n)))
        .collect()
}

fn page_resources<'a>(doc: &'a Document, page_id: ObjectId) -> Option<&'a lopdf::Dictionary> {
    let page = doc.get_object(page_id).ok()?.as_dict().ok()?;
    let (_, resources) = doc.dereference(page.get(b"Resources").ok()?).ok()?;
    resources.as_dict().ok()
}

fn resource_dict<'a>(doc: &'a Document, resources: &'a lopdf::Dictionary, key: &[u8]) -> Option<&'a lopdf::Dictionary> {
    let (_, resolved) = doc.dereference(resources.get(key).ok()?).ok()?;
    resolved.as_dict().ok()
}

/// A page with image XObjects but no fonts is almost certainly a scan.
fn looks_like_scanned(doc: &Document, pages: &[(u32, ObjectId)]) -> bool {
    let image_only = pages
        .iter()
        .filter(|(_, id)| {
            let Some(res) = page_resources(doc, *id) else {
                return false;
            };
            let has_fonts = resource_dict(doc, res, b"Font").is_some_and(|f| !f.is_empty());
            let has_images = resource_dict(doc, res, b"XObject").is_some_and(|x| !x.is_empty());
            has_images && !has_fonts
        })
        .count();

    let ratio = image_only as f64 / pages.len() as f64;
    debug!(total_pages = pages.len(), image_only, ratio = format!("{ratio:.2}"), "Scanned-page analysis");
    ratio >= SCANNED_PAGE_RATIO
}

fn is_dct(filter: &Object) -> bool {
    match filter {
        Object::Name(name) => name == b"DCTDecode",
        // A single-entry array is the same thing; chains would need decoding first.
        Object::Array(items) => items.len() == 1 && is_dct(&items[0]),
        _ => false,
    }
}

/// Decode the largest JPEG image placed on `page` (1-based).
///
/// Scanner-produced PDFs wrap each scan as one DCT-encoded XObject; other
/// encodings are not handled and yield `None`.
pub fn embedded_page_image(pdf_bytes: &[u8], page: u32) -> Option<DynamicImage> {
    let doc = Document::load_mem(pdf_bytes).ok()?;
    let page_id = *doc.get_pages().get(&page)?;
    let xobjects = resource_dict(&doc, page_resources(&doc, page_id)?, b"XObject")?;

    let mut best: Option<(i64, &[u8])> = None;
    for (_, obj) in xobjects.iter() {
        let Ok((_, resolved)) = doc.dereference(obj) else {
            continue;
        };
        let Ok(stream) = resolved.as_stream() else {
            continue;
        };
        let dict = &stream.dict;
        let is_image = dict
            .get(b"Subtype")
            .ok()
            .and_then(|s| s.as_name().ok())
            .is_some_and(|n| n == b"Image");
        let jpeg = dict.get(b"Filter").ok().is_some_and(is_dct);
        if !is_image || !jpeg {
            continue;
        }
        let dim = |key: &[u8]| dict.get(key).ok().and_then(|o| o.as_i64().ok()).unwrap_or(0);
        let area = dim(b"Width") * dim(b"Height");
        if best.map_or(true, |(a, _)| area > a) {
            best = Some((area, stream.content.as_slice()));
        }
    }

    let (area, jpeg) = best?;
    match image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg) {
        Ok(img) => {
            debug!(page, area, "Embedded page scan decoded");
            Some(img)
        }
        Err(e) => {
            warn!(page, error = %e, "Embedded page scan could not be decoded");
            None
        }
    }
}
