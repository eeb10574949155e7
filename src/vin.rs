use serde::Serialize;

/// Position weights for the ISO 3779 / FMVSS 115 check digit.
const WEIGHTS: [u32; 17] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

/// Characters OCR engines swap for one another on printed VINs.
/// A character may appear in several groups; every partner is a candidate.
const CONFUSION_GROUPS: &[&[char]] = &[
    &['0', 'O', 'Q', 'D'],
    &['1', 'I', 'L'],
    &['5', 'S'],
    &['8', 'B'],
    &['8', '9'],
    &['2', 'Z'],
    &['6', 'G'],
];

/// Model-year codes at position 10, starting from the 2010 cycle.
const YEAR_CODES: &[(char, u16)] = &[
    ('A', 2010),
    ('B', 2011),
    ('C', 2012),
    ('D', 2013),
    ('E', 2014),
    ('F', 2015),
    ('G', 2016),
    ('H', 2017),
    ('J', 2018),
    ('K', 2019),
    ('L', 2020),
    ('M', 2021),
    ('N', 2022),
    ('P', 2023),
    ('R', 2024),
    ('S', 2025),
    ('T', 2026),
    ('V', 2027),
    ('W', 2028),
    ('X', 2029),
    ('Y', 2030),
];

/// Gladiator VINs share the Ram truck WMI; this prefix wins over the table.
const BRAND_PREFIX_OVERRIDE: (&str, &str) = ("1C6PJ", "Jeep");

const WMI_BRANDS: &[(&str, &str)] = &[
    ("1C4", "Jeep"),
    ("1J4", "Jeep"),
    ("1J8", "Jeep"),
    ("3C4", "Jeep"),
    ("ZAC", "Jeep"),
    ("1C6", "Ram"),
    ("3C6", "Ram"),
    ("3C7", "Ram"),
    ("1D7", "Ram"),
    ("3D7", "Ram"),
    ("2C3", "Chrysler"),
    ("2C4", "Chrysler"),
    ("1C3", "Chrysler"),
    ("2A4", "Chrysler"),
    ("1B3", "Dodge"),
    ("2B3", "Dodge"),
    ("2D3", "Dodge"),
    ("ZFA", "Fiat"),
    ("3C3", "Fiat"),
    ("ZAR", "Alfa Romeo"),
];

/// Outcome of checking (and possibly repairing) a VIN read off a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VinCheck {
    /// The upper-cased input, or the repaired VIN when `corrected` is set.
    pub vin: String,
    pub valid: bool,
    pub corrected: bool,
}

fn transliterate(c: char) -> Option<u32> {
    let value = match c {
        '0'..='9' => c.to_digit(10)?,
        'A' | 'J' => 1,
        'B' | 'K' | 'S' => 2,
        'C' | 'L' | 'T' => 3,
        'D' | 'M' | 'U' => 4,
        'E' | 'N' | 'V' => 5,
        'F' | 'W' => 6,
        'G' | 'P' | 'X' => 7,
        'H' | 'Y' => 8,
        'R' | 'Z' => 9,
        // I, O, Q never appear in a VIN.
        _ => return None,
    };
    Some(value)
}

/// Compute the check digit a VIN should carry at position 9.
/// `None` when the input is not 17 characters of the VIN alphabet.
pub fn check_digit(vin: &str) -> Option<char> {
    if vin.len() != 17 || !vin.is_ascii() {
        return None;
    }
    let mut sum = 0u32;
    for (c, weight) in vin.chars().zip(WEIGHTS) {
        sum += transliterate(c)? * weight;
    }
    match sum % 11 {
        10 => Some('X'),
        r => char::from_digit(r, 10),
    }
}

/// `true` when `vin` is 17 legal characters with a matching check digit.
pub fn validate(vin: &str) -> bool {
    match check_digit(vin) {
        Some(expected) => vin.as_bytes()[8] as char == expected,
        None => false,
    }
}

fn confusion_partners(c: char) -> Vec<char> {
    let mut partners = Vec::new();
    for group in CONFUSION_GROUPS.iter().filter(|g| g.contains(&c)) {
        for &p in group.iter() {
            if p != c && !partners.contains(&p) {
                partners.push(p);
            }
        }
    }
    partners
}

/// Validate `raw` and, when the checksum fails, try to repair one misread
/// character.
///
/// Candidates are generated position by position, left to right, from the
/// confusion table; the first one that validates is accepted. Only a single
/// substitution is ever attempted, so two simultaneous misreads stay invalid.
pub fn correct(raw: &str) -> VinCheck {
    let vin = raw.trim().to_ascii_uppercase();
    if validate(&vin) {
        return VinCheck { vin, valid: true, corrected: false };
    }
    if vin.len() != 17 || !vin.is_ascii() {
        return VinCheck { vin, valid: false, corrected: false };
    }

    let chars: Vec<char> = vin.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        for partner in confusion_partners(c) {
            let mut candidate = chars.clone();
            candidate[i] = partner;
            let candidate: String = candidate.into_iter().collect();
            if validate(&candidate) {
                tracing::debug!(from = %vin, to = %candidate, position = i + 1, "VIN corrected");
                return VinCheck { vin: candidate, valid: true, corrected: true };
            }
        }
    }

    VinCheck { vin, valid: false, corrected: false }
}

/// Model year from position 10, or `None` for codes outside 2010–2030.
pub fn decode_year(vin: &str) -> Option<u16> {
    let code = vin.chars().nth(9)?.to_ascii_uppercase();
    YEAR_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, year)| *year)
}

/// Brand from the World Manufacturer Identifier (first three characters).
pub fn decode_brand(vin: &str) -> Option<&'static str> {
    let vin = vin.trim().to_ascii_uppercase();
    let (prefix, brand) = BRAND_PREFIX_OVERRIDE;
    if vin.starts_with(prefix) {
        return Some(brand);
    }
    let wmi = vin.get(..3)?;
    WMI_BRANDS
        .iter()
        .find(|(w, _)| *w == wmi)
        .map(|(_, brand)| *brand)
}
