use fcascan_lib::ocr::{OcrParams, OcrResult};
use fcascan_lib::pdf::DocumentKind;
use fcascan_lib::zones::Zone;
use fcascan_lib::{
    BatchStatus, InvoiceProcessor, ParseMethod, PipelineConfig, ProductCodeRegistry, Recognizer, ScanRequest,
    ValidationStatus,
};
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Reads the VIN and options zones only; pages wider than `slow_above`
/// pixels (VIN zone width) take three seconds.
struct PartialReader {
    slow_above: u32,
}

impl Recognizer for PartialReader {
    fn name(&self) -> &str {
        "partial"
    }

    fn recognize(&self, zone: &GrayImage, params: &OcrParams) -> Option<OcrResult> {
        if params.zone == Zone::Vin && zone.width() > self.slow_above {
            thread::sleep(Duration::from_secs(3));
        }
        let text = match params.zone {
            Zone::Vin => "NIV / VIN  1C6PJTAG4SL5I2345   MODELE JTJL98",
            Zone::Options => "PW7   BLANC ECLATANT        66,770.00\nTXX8  SIEGES EN TISSU        SANS FRAIS\nAHU   ATTELAGE REMORQUE          876.00",
            _ => return None,
        };
        Some(OcrResult {
            text: text.to_string(),
            confidence: 0.7,
            engine_name: self.name().to_string(),
        })
    }
}

fn png(width: u32, height: u32, fill: [u8; 3]) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(fill)))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn processor() -> InvoiceProcessor {
    InvoiceProcessor::new(
        Arc::new(ProductCodeRegistry::builtin()),
        PipelineConfig::default(),
        Arc::new(PartialReader { slow_above: 1000 }),
    )
}

fn request(id: &str, bytes: Vec<u8>) -> ScanRequest {
    ScanRequest {
        id: id.to_string(),
        bytes,
        ..Default::default()
    }
}

#[test]
fn scan_without_page_outline_still_scores() {
    // A uniform page has no quadrilateral; geometry must fall through.
    let outcome = processor().process(&request("flat.png", png(400, 560, [250, 250, 250])));

    assert_eq!(outcome.kind, DocumentKind::Image);
    let r = &outcome.extraction;
    assert_eq!(r.zones_extracted, 2);
    assert_eq!(r.vin.as_deref(), Some("1C6PJTAG4SL512345"));
    assert!(r.vin_valid);
    assert_eq!(r.vin_brand.as_deref(), Some("Jeep"));
    assert_eq!(r.vin_year, Some(2025));
    assert_eq!(r.model_code.as_deref(), Some("JTJL98"));
    assert!(r.code_found_in_registry);

    let codes: Vec<&str> = r.options.iter().map(|o| o.product_code.as_str()).collect();
    assert_eq!(codes, ["PW7", "TXX8", "AHU"]);

    // VIN and options alone cannot make a usable invoice.
    assert_eq!(r.ep_cost, None);
    assert!(!outcome.validation.is_valid);
    assert!(outcome.validation.errors.iter().any(|e| e.contains("EP")));
    assert_eq!(outcome.validation.score, 25 + 5 + 5);
    assert_eq!(outcome.validation.status, ValidationStatus::Invalid);
    assert_eq!(r.parse_method, ParseMethod::AiFallbackRecommended);
}

#[test]
fn undecodable_payloads_yield_empty_results() {
    let p = processor();
    for (id, bytes) in [
        ("empty.bin", Vec::new()),
        ("noise.bin", b"\x00\x01\x02 definitely not an invoice".to_vec()),
        ("broken.png", b"\x89PNG\r\n\x1a\n truncated".to_vec()),
        ("broken.pdf", b"%PDF-1.4 then nothing useful".to_vec()),
    ] {
        let outcome = p.process(&request(id, bytes));
        assert_eq!(outcome.id, id);
        assert_eq!(outcome.extraction.zones_extracted, 0, "{id}");
        assert!(outcome.extraction.vin.is_none(), "{id}");
        assert!(outcome.zones.is_empty(), "{id}");
        assert_eq!(outcome.validation.status, ValidationStatus::Invalid, "{id}");
        assert_eq!(outcome.extraction.parse_method, ParseMethod::AiFallbackRecommended, "{id}");
    }
}

#[test]
fn batch_keeps_order_and_abandons_slow_scans() {
    let requests = vec![
        request("a", png(400, 560, [255, 255, 255])),
        // VIN zone is 65% of the width: 1950 px, above the slow threshold.
        request("b", png(3000, 200, [255, 255, 255])),
        request("c", png(300, 420, [255, 255, 255])),
    ];

    let items = processor().process_batch(requests, 2, Duration::from_millis(1500));

    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
    assert_eq!(items[0].status, BatchStatus::Completed);
    assert_eq!(items[1].status, BatchStatus::TimedOut);
    assert!(items[1].outcome.is_none());
    assert_eq!(items[2].status, BatchStatus::Completed);
    assert_eq!(items[2].outcome.as_ref().map(|o| o.extraction.zones_extracted), Some(2));
}

#[test]
fn outcome_serializes_for_hand_off() {
    let outcome = processor().process(&request("flat.png", png(400, 560, [250, 250, 250])));
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["kind"], "image");
    assert_eq!(json["extraction"]["parse_method"], "ai_fallback_recommended");
    assert_eq!(json["validation"]["status"], "invalid");
    assert_eq!(json["extraction"]["options"][0]["product_code"], "PW7");
    assert_eq!(json["extraction"]["vehicle"]["source"], "registry");
    // Previews are off by default.
    assert!(json["zones"][0].get("preview_b64").is_none());
}
