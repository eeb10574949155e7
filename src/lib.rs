//! FCA/Stellantis dealer invoice extraction.
//!
//! A submission goes through geometry correction, zone segmentation and
//! zone OCR (or straight to the PDF text layer), then regex field
//! extraction and rule-based scoring. See [`processor::InvoiceProcessor`].

pub mod config;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod ocr;
pub mod pdf;
pub mod price;
pub mod processor;
pub mod registry;
pub mod validate;
pub mod vin;
pub mod zones;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use extract::{InvoiceExtractionResult, OptionLine, ParseMethod};
pub use ocr::{NoRecognizer, Recognizer};
pub use processor::{BatchItem, BatchStatus, InvoiceProcessor, ScanOutcome, ScanRequest};
pub use registry::ProductCodeRegistry;
pub use validate::{ValidationResult, ValidationStatus};
