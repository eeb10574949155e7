use image::{GrayImage, Luma};
use tesseract::{PageSegMode as Psm, Tesseract};
use tracing::debug;

use super::{build_lang, OcrParams, OcrResult, PageSegMode, Recognizer};

/// White margin added around each zone; Tesseract finds text blocks
/// touching the image edge poorly.
const PAD: u32 = 15;

/// Tesseract-backed recognizer. One engine instance is created per call,
/// so a single recognizer can be shared across batch workers.
pub struct TesseractRecognizer {
    pub tessdata_dir: Option<String>,
}

impl TesseractRecognizer {
    pub fn new(tessdata_dir: Option<String>) -> Self {
        Self { tessdata_dir }
    }
}

impl Recognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, zone: &GrayImage, params: &OcrParams) -> Option<OcrResult> {
        let lang = build_lang(&params.languages);
        let padded = pad(zone);
        let (w, h) = padded.dimensions();
        let bytes = padded.into_raw();

        // Sparse text is the second chance for zones where block layout finds nothing.
        let mut modes = vec![params.page_seg_mode];
        if params.page_seg_mode != PageSegMode::SparseText {
            modes.push(PageSegMode::SparseText);
        }

        for mode in modes {
            match try_ocr(&bytes, w, h, self.tessdata_dir.as_deref(), &lang, to_psm(mode)) {
                Ok((text, confidence)) => {
                    return Some(OcrResult {
                        text,
                        confidence,
                        engine_name: self.name().to_string(),
                    })
                }
                Err(reason) => debug!(zone = params.zone.name(), ?mode, reason, "Tesseract pass failed"),
            }
        }
        None
    }
}

fn to_psm(mode: PageSegMode) -> Psm {
    match mode {
        PageSegMode::Auto => Psm::PsmAuto,
        PageSegMode::SingleColumn => Psm::PsmSingleColumn,
        PageSegMode::SingleBlock => Psm::PsmSingleBlock,
        PageSegMode::SingleLine => Psm::PsmSingleLine,
        PageSegMode::SparseText => Psm::PsmSparseText,
    }
}

/// Run Tesseract once over an 8-bit grayscale frame.
fn try_ocr(
    bytes: &[u8],
    w: u32,
    h: u32,
    datapath: Option<&str>,
    lang: &str,
    psm: Psm,
) -> Result<(String, f64), &'static str> {
    let mut tess = Tesseract::new(datapath, Some(lang))
        .map_err(|_| "init")?
        .set_frame(bytes, w as i32, h as i32, 1, w as i32)
        .map_err(|_| "set_frame")?;
    tess.set_page_seg_mode(psm);
    let mut tess = tess.recognize().map_err(|_| "recognize")?;

    let raw = tess.get_text().map_err(|_| "get_text")?;
    let trimmed = raw.trim().to_string();
    if trimmed.is_empty() {
        return Err("empty");
    }

    let conf = tess.mean_text_conf().max(0) as f64 / 100.0;
    Ok((trimmed, conf))
}

fn pad(zone: &GrayImage) -> GrayImage {
    let (w, h) = zone.dimensions();
    let mut padded = GrayImage::from_pixel(w + PAD * 2, h + PAD * 2, Luma([255u8]));
    image::imageops::overlay(&mut padded, zone, PAD as i64, PAD as i64);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_adds_white_border() {
        let zone = GrayImage::from_pixel(10, 4, Luma([0]));
        let padded = pad(&zone);
        assert_eq!(padded.dimensions(), (10 + 2 * PAD, 4 + 2 * PAD));
        assert_eq!(padded.get_pixel(0, 0)[0], 255);
        assert_eq!(padded.get_pixel(PAD, PAD)[0], 0);
    }

    #[test]
    fn test_psm_mapping() {
        assert!(matches!(to_psm(PageSegMode::SingleBlock), Psm::PsmSingleBlock));
        assert!(matches!(to_psm(PageSegMode::SparseText), Psm::PsmSparseText));
    }
}
