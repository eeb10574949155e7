use crate::error::{Error, Result};
use crate::ocr::PageSegMode;
use crate::zones::{LayoutProfile, Zone, FCA_STANDARD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Knobs for the quadrilateral detection / perspective correction step.
///
/// Every field has a default, so a config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometrySettings {
    pub enabled: bool,
    /// Larger pages are downscaled to this longest side before detection.
    pub max_dimension: u32,
    /// Polygon approximation tolerance, as a fraction of the contour perimeter.
    pub approx_epsilon: f64,
    /// How many of the largest contours are tried as page candidates.
    pub candidate_contours: usize,
    /// Quads covering less than this share of the page are ignored.
    pub min_area_ratio: f64,
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_dimension: 2500,
            approx_epsilon: 0.02,
            candidate_contours: 5,
            min_area_ratio: 0.2,
            blur_sigma: 1.0,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

/// Preprocessing and recognition parameters applied to every zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Invoices mix English and French.
    pub languages: Vec<String>,
    pub page_seg_mode: PageSegMode,
    /// Per-zone overrides of `page_seg_mode`.
    pub zone_page_seg_modes: BTreeMap<Zone, PageSegMode>,
    /// Linear contrast: `alpha * p + beta`.
    pub contrast_alpha: f32,
    pub contrast_beta: f32,
    /// Side of the local-mean window used for binarization (odd, ≥ 3).
    pub threshold_block_size: u32,
    /// Subtracted from the local mean before comparing.
    pub threshold_offset: i32,
    /// Attach a base64 PNG of each preprocessed zone to the outcome.
    pub previews: bool,
    /// Directory holding `tessdata/`; system default when unset.
    pub tessdata_dir: Option<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string(), "fra".to_string()],
            page_seg_mode: PageSegMode::SingleBlock,
            zone_page_seg_modes: BTreeMap::new(),
            contrast_alpha: 1.5,
            contrast_beta: 0.0,
            threshold_block_size: 11,
            threshold_offset: 2,
            previews: false,
            tessdata_dir: None,
        }
    }
}

impl OcrSettings {
    pub fn page_seg_mode_for(&self, zone: Zone) -> PageSegMode {
        self.zone_page_seg_modes
            .get(&zone)
            .copied()
            .unwrap_or(self.page_seg_mode)
    }
}

/// Caller-side limits for batch scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Simultaneous in-flight submissions.
    pub max_in_flight: usize,
    /// Per-submission budget; a scan still running after this is abandoned.
    pub timeout_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self { max_in_flight: 5, timeout_secs: 60 }
    }
}

impl LimitSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub geometry: GeometrySettings,
    pub ocr: OcrSettings,
    pub limits: LimitSettings,
    /// Layout used when a request names none (or an unknown one).
    pub default_layout: String,
    /// Extra or overriding layout profiles, keyed by template id.
    pub layouts: BTreeMap<String, LayoutProfile>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let standard = LayoutProfile::fca_standard();
        Self {
            geometry: GeometrySettings::default(),
            ocr: OcrSettings::default(),
            limits: LimitSettings::default(),
            default_layout: standard.id.clone(),
            layouts: BTreeMap::from([(standard.id.clone(), standard)]),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
        let cfg: PipelineConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("Parse error in {}: {e}", path.display())))?;
        cfg.check()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot honour.
    pub fn check(&self) -> Result<()> {
        for (id, layout) in &self.layouts {
            if *id != layout.id {
                return Err(Error::Config(format!(
                    "layout key {id:?} does not match its id {:?}",
                    layout.id
                )));
            }
            for zone in Zone::ALL {
                if !layout.fractions(zone).is_well_formed() {
                    return Err(Error::Config(format!(
                        "layout {id:?}: {} zone fractions are out of range",
                        zone.name()
                    )));
                }
            }
        }
        if self.ocr.threshold_block_size < 3 {
            return Err(Error::Config("ocr.threshold_block_size must be at least 3".into()));
        }
        let eps = self.geometry.approx_epsilon;
        if !(eps > 0.0 && eps < 0.5) {
            return Err(Error::Config("geometry.approx_epsilon must be in (0, 0.5)".into()));
        }
        Ok(())
    }

    /// Pick the layout for a request: the named one, else the configured
    /// default, else the built-in FCA profile.
    pub fn layout(&self, requested: Option<&str>) -> LayoutProfile {
        if let Some(id) = requested {
            if let Some(layout) = self.layouts.get(id) {
                return layout.clone();
            }
            tracing::warn!(layout = id, "Unknown layout requested; using default");
        }
        self.layouts
            .get(&self.default_layout)
            .cloned()
            .unwrap_or_else(|| {
                if self.default_layout != FCA_STANDARD {
                    tracing::warn!(layout = %self.default_layout, "Default layout missing; using fca_standard");
                }
                LayoutProfile::fca_standard()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::ZoneFractions;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.geometry.max_dimension, 2500);
        assert_eq!(cfg.ocr.languages, vec!["eng", "fra"]);
        assert_eq!(cfg.ocr.page_seg_mode, PageSegMode::SingleBlock);
        assert_eq!(cfg.limits.max_in_flight, 5);
        assert_eq!(cfg.limits.timeout(), Duration::from_secs(60));
        assert!(cfg.check().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"limits": {"max_in_flight": 10}, "ocr": {"zone_page_seg_modes": {"options": "single_column"}}}"#).unwrap();

        let cfg = PipelineConfig::load(&path).unwrap();
        assert_eq!(cfg.limits.max_in_flight, 10);
        assert_eq!(cfg.limits.timeout_secs, 60);
        assert_eq!(cfg.ocr.page_seg_mode_for(Zone::Options), PageSegMode::SingleColumn);
        assert_eq!(cfg.ocr.page_seg_mode_for(Zone::Vin), PageSegMode::SingleBlock);
        assert_eq!(cfg.layout(None).id, FCA_STANDARD);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cfg.json");

        let mut cfg = PipelineConfig::default();
        let mut wide = LayoutProfile::fca_standard();
        wide.id = "wide_vin".to_string();
        wide.vin = ZoneFractions::new(0.0, 0.3, 0.0, 0.8);
        cfg.layouts.insert(wide.id.clone(), wide.clone());
        cfg.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.layout(Some("wide_vin")), wide);
        assert_eq!(loaded.layout(Some("missing")).id, FCA_STANDARD);
    }

    #[test]
    fn test_rejects_bad_layout() {
        let mut cfg = PipelineConfig::default();
        let mut bad = LayoutProfile::fca_standard();
        bad.id = "bad".to_string();
        bad.totals = ZoneFractions::new(0.9, 0.8, 0.0, 1.0);
        cfg.layouts.insert("bad".to_string(), bad);
        assert!(matches!(cfg.check(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(Error::Config(_))));
    }
}
