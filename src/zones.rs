use serde::{Deserialize, Serialize};

/// Identifier of the layout shipped for the standard FCA dealer invoice.
pub const FCA_STANDARD: &str = "fca_standard";

/// Page regions read independently by the OCR engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Vin,
    Finance,
    Options,
    Totals,
}

impl Zone {
    pub const ALL: [Zone; 4] = [Zone::Vin, Zone::Finance, Zone::Options, Zone::Totals];

    pub fn name(self) -> &'static str {
        match self {
            Zone::Vin => "vin",
            Zone::Finance => "finance",
            Zone::Options => "options",
            Zone::Totals => "totals",
        }
    }
}

/// A rectangle expressed as fractions (0.0 – 1.0) of the page size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneFractions {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl ZoneFractions {
    pub const fn new(top: f64, bottom: f64, left: f64, right: f64) -> Self {
        Self { top, bottom, left, right }
    }

    /// `true` when the fractions describe a non-empty rectangle inside the page.
    pub fn is_well_formed(&self) -> bool {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        in_unit(self.top)
            && in_unit(self.bottom)
            && in_unit(self.left)
            && in_unit(self.right)
            && self.top < self.bottom
            && self.left < self.right
    }
}

/// Where each zone sits on one invoice template.
///
/// Layouts are data: a new template is a new profile in the config file,
/// selected by its `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutProfile {
    pub id: String,
    pub vin: ZoneFractions,
    pub finance: ZoneFractions,
    pub options: ZoneFractions,
    pub totals: ZoneFractions,
}

impl LayoutProfile {
    /// Fractions tuned on the FCA/Stellantis Canada dealer invoice.
    pub fn fca_standard() -> Self {
        Self {
            id: FCA_STANDARD.to_string(),
            vin: ZoneFractions::new(0.0, 0.25, 0.0, 0.65),
            finance: ZoneFractions::new(0.0, 0.40, 0.45, 1.0),
            options: ZoneFractions::new(0.35, 0.85, 0.0, 1.0),
            totals: ZoneFractions::new(0.75, 1.0, 0.0, 1.0),
        }
    }

    pub fn fractions(&self, zone: Zone) -> &ZoneFractions {
        match zone {
            Zone::Vin => &self.vin,
            Zone::Finance => &self.finance,
            Zone::Options => &self.options,
            Zone::Totals => &self.totals,
        }
    }
}

/// A zone resolved to pixel coordinates on a concrete page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneRect {
    pub zone: Zone,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Resolve every zone of `profile` on a `width` × `height` page.
///
/// Zones come back in `Zone::ALL` order. Zones that collapse to nothing
/// (degenerate fractions or a tiny page) are left out.
pub fn segment(width: u32, height: u32, profile: &LayoutProfile) -> Vec<ZoneRect> {
    Zone::ALL
        .iter()
        .filter_map(|&zone| resolve(zone, profile.fractions(zone), width, height))
        .collect()
}

fn resolve(zone: Zone, f: &ZoneFractions, width: u32, height: u32) -> Option<ZoneRect> {
    let scale = |frac: f64, extent: u32| -> u32 {
        (frac.clamp(0.0, 1.0) * extent as f64).round() as u32
    };
    let x = scale(f.left, width);
    let x2 = scale(f.right, width).min(width);
    let y = scale(f.top, height);
    let y2 = scale(f.bottom, height).min(height);
    if x2 <= x || y2 <= y {
        return None;
    }
    Some(ZoneRect { zone, x, y, width: x2 - x, height: y2 - y })
}
