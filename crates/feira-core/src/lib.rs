//! Core domain model and product-label parsing for feira-precos.
//!
//! Everything in this crate is pure: no I/O, no database, no clocks. The
//! collectors and the sync engine build on these functions so that the same
//! cleaning/splitting rules apply to both quotation sources.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feira-core";

/// Provenance tag written by the bulletin (PDF) collector.
pub const ALGORITHM_AMA: &str = "ama-pdf-v1";
/// Provenance tag written by the web/OCR collector.
pub const ALGORITHM_AGROLINK: &str = "agrolink-ocr-v1";

/// Persisted quotation record, one per (product, date, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub id: Uuid,
    /// Cleaned, upper-cased product name. Never empty.
    pub product_name: String,
    /// Human-readable unit descriptor, e.g. "Cx 10 Kg". None when the
    /// quotation is unitless or per-kg.
    pub product_unit: Option<String>,
    /// Packaging kind: "Cx", "Sc", "Kg", "Un", "Unid", "Lt", "L", "Mo-NN".
    pub unit_kind: Option<String>,
    /// Weight per package in kilograms, when the unit encodes one.
    pub unit_kg: Option<f64>,
    /// Number of packages, for "N packages of K kg" descriptors.
    pub pack_count: Option<f64>,
    /// market_price / unit_kg, rounded to 2 decimals. Present only when
    /// unit_kg is known and positive.
    pub price_per_kg: Option<f64>,
    pub market_price: f64,
    pub suggested_price: f64,
    /// Quotation date as reported by the source, not the ingestion time.
    pub date: NaiveDate,
    /// Producing source/version; doubles as the read-time tie-break key.
    pub algorithm_version: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload handed to the store by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceQuote {
    pub product_name: String,
    pub product_unit: Option<String>,
    pub unit_kind: Option<String>,
    pub unit_kg: Option<f64>,
    pub pack_count: Option<f64>,
    pub price_per_kg: Option<f64>,
    pub market_price: f64,
    pub suggested_price: f64,
    pub date: NaiveDate,
    pub algorithm_version: String,
}

/// Result of splitting a composite raw label into name + unit descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLabel {
    pub name: String,
    pub unit: Option<String>,
}

/// Structured packaging attributes parsed out of a unit descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnitInfo {
    pub unit_kind: Option<String>,
    pub unit_kg: Option<f64>,
    pub pack_count: Option<f64>,
}

/// Source preference used identically at write-conflict and read time:
/// bulletin (ama*) beats web scrape (agrolink*) beats anything else.
pub fn source_rank(algorithm_version: &str) -> i32 {
    let s = algorithm_version.to_lowercase();
    if s.starts_with("ama") {
        2
    } else if s.starts_with("agrolink") {
        1
    } else {
        0
    }
}

/// market_price / unit_kg rounded to 2 decimals; None unless unit_kg > 0.
pub fn price_per_kg(market_price: f64, unit_kg: Option<f64>) -> Option<f64> {
    match unit_kg {
        Some(kg) if kg > 0.0 => Some((market_price / kg * 100.0).round() / 100.0),
        _ => None,
    }
}

/// Parses a pt-BR decimal ("1.250,00" / "62,80") into f64.
pub fn parse_decimal_br(text: &str) -> Option<f64> {
    let normalized = text.trim().replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok()
}

/// Parses "dd/mm/yyyy" into a calendar date.
pub fn parse_date_br(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%d/%m/%Y").ok()
}

pub fn norm_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Name cleaning
// ---------------------------------------------------------------------------

// Grading/commercial descriptors that never belong in the stored name.
const STOPWORDS: &[&str] = &[
    "produtor",
    "produtora",
    "produtores",
    "produtoras",
    "beneficiador",
    "beneficiadora",
    "beneficiadores",
    "beneficiadoras",
    "beneficiado",
    "beneficiados",
    "beneficiada",
    "beneficiadas",
    "tipo",
    "tipos",
    "e",
    "primeira",
    "segunda",
];

// Unit words that occasionally leak into the name portion of a label.
const UNIT_STOPWORDS: &[&str] = &[
    "cx", "sc", "kg", "g", "l", "lt", "un", "unid", "maço", "maco", "dúzia", "duzia", "dz",
];

static RX_PARENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)").unwrap());
static RX_LONE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+[ºª]?\b").unwrap());
static RX_LABEL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\p{L}+\s*){1,2}:\s*").unwrap());
static RX_CONNECTORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[|:–—\-ºª°]").unwrap());
static RX_STOPWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{})\b", STOPWORDS.join("|"))).unwrap()
});
static RX_UNIT_STOPWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{})\b", UNIT_STOPWORDS.join("|"))).unwrap()
});
static RX_NON_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\s]").unwrap());

static RX_LOCATION_CITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bJUAZEIRO\s*\(BA\)").unwrap());
static RX_LOCATION_UF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*[A-Z]{2}\s*\)\s*$").unwrap());
static RX_LOCATION_CITY_TRAILING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bJUAZEIRO\b\s*$").unwrap());

/// Removes the locality suffix ("Juazeiro (BA)", a trailing "(XX)" region
/// code, a bare trailing city token) from a raw product label.
pub fn strip_location_suffix(raw: &str) -> String {
    let s = RX_LOCATION_CITY.replace_all(raw, " ");
    let s = RX_LOCATION_UF.replace_all(&s, " ");
    let s = RX_LOCATION_CITY_TRAILING.replace_all(&s, " ");
    norm_spaces(&s)
}

/// Like [`strip_location_suffix`] but first removes an explicitly known
/// locality string (the text of the source's own location column).
pub fn strip_location(raw: &str, local: Option<&str>) -> String {
    let mut s = raw.to_string();
    if let Some(local) = local {
        let local = local.trim();
        if !local.is_empty() {
            if let Ok(rx) = Regex::new(&format!(r"(?i)\s*{}\s*", regex::escape(local))) {
                s = rx.replace_all(&s, " ").into_owned();
            }
        }
    }
    strip_location_suffix(&s)
}

/// Cleans a raw product-name string: parenthesized asides, standalone
/// numbers and ordinals, label prefixes, visual connectors, stopwords, unit
/// words and non-letter characters are all removed; whitespace collapses.
///
/// Never returns an empty string for non-empty input: when the cleanup
/// degenerates to nothing the whitespace-normalized original is returned,
/// and callers that need "empty name means drop the row" must re-check after
/// sanitizing.
pub fn clean_product_name(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }

    let original = norm_spaces(raw);
    let s = RX_PARENS.replace_all(&original, " ");
    let s = RX_LONE_NUMBER.replace_all(&s, " ");
    let s = RX_LABEL_PREFIX.replace_all(s.trim(), " ");
    let s = RX_CONNECTORS.replace_all(&s, " ");
    let s = RX_STOPWORDS.replace_all(&s, " ");
    let s = RX_UNIT_STOPWORDS.replace_all(&s, " ");
    let s = RX_NON_LETTER.replace_all(&s, " ");
    let s = norm_spaces(&s);

    if s.is_empty() {
        original
    } else {
        s
    }
}

/// Cleans + upper-cases a product name for persistence. Returns None when
/// the cleanup leaves nothing; callers drop (and log) such rows.
pub fn sanitize_product_name(raw: &str) -> Option<String> {
    let cleaned = norm_spaces(&clean_product_name(raw)).to_uppercase();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

// ---------------------------------------------------------------------------
// Name/unit splitting
// ---------------------------------------------------------------------------

const UNIT_WORDS: &[&str] = &[
    "cx", "sc", "kg", "g", "l", "lt", "un", "unid", "maço", "maco", "dúzia", "duzia", "dz",
    r"mo-\d{1,2}",
];

static RX_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:[.,]\d+)?$").unwrap());
static RX_NUM_WITH_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(?:[.,]\d+)?\s*(?:kg|g|l|lt)$").unwrap());
static RX_UNIT_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^(?:{})$", UNIT_WORDS.join("|"))).unwrap()
});
static RX_GLUED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(Cx|Sc)(\d+(?:[.,]\d+)?)Kg$").unwrap());

static RX_UNIT_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\d\s]").unwrap());
static RX_UNIT_CX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcx\s*(\d+(?:[.,]\d+)?)\s*(?:kg)?\b").unwrap());
static RX_UNIT_SC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsc\s*(\d+(?:[.,]\d+)?)\s*(?:kg)?\b").unwrap());
static RX_UNIT_NKG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d+(?:[.,]\d+)?)\s*kg\b").unwrap());

/// Canonicalizes a unit phrase: splits glued "Cx20Kg"-style tokens and
/// normalizes abbreviation capitalization (cx->Cx, sc->Sc, kg->Kg, ...).
fn normalize_unit(unit: &str) -> Option<String> {
    let s = unit.replace(['(', ')'], " ");
    let s = RX_UNIT_JUNK.replace_all(&s, " ");
    let s = norm_spaces(&s);
    if s.is_empty() {
        return None;
    }

    let s = RX_UNIT_CX.replace_all(&s, "Cx $1 Kg");
    let s = RX_UNIT_SC.replace_all(&s, "Sc $1 Kg");
    let s = RX_UNIT_NKG.replace_all(&s, "$1 Kg");

    let mut out = Vec::new();
    for token in s.split_whitespace() {
        let canon = match token.to_lowercase().as_str() {
            "cx" => "Cx".to_string(),
            "sc" => "Sc".to_string(),
            "kg" => "Kg".to_string(),
            "g" => "g".to_string(),
            "lt" => "Lt".to_string(),
            "l" => "L".to_string(),
            "unid" => "Unid".to_string(),
            "un" => "Un".to_string(),
            _ => token.to_string(),
        };
        out.push(canon);
    }
    Some(out.join(" "))
}

/// Splits a composite raw label ("Alho Comum Cx 10Kg Juazeiro (BA)") into a
/// cleaned product name and a normalized unit descriptor.
///
/// Tokens are scanned right to left; bare numbers, unit words, suffixed
/// numbers ("10kg") and glued tokens ("Cx20Kg") accumulate into the unit
/// phrase. The first token matching none of these closes the name.
pub fn split_product_label(raw: &str) -> SplitLabel {
    let s = norm_spaces(&strip_location_suffix(raw));
    if s.is_empty() {
        return SplitLabel {
            name: String::new(),
            unit: None,
        };
    }

    let tokens: Vec<&str> = s.split(' ').collect();
    let mut unit_tokens: Vec<String> = Vec::new();

    for i in (0..tokens.len()).rev() {
        let t = tokens[i];

        if let Some(caps) = RX_GLUED.captures(t) {
            unit_tokens.insert(0, format!("{}Kg", &caps[2]));
            unit_tokens.insert(0, caps[1].to_string());
            continue;
        }
        if RX_NUM_WITH_SUFFIX.is_match(t) || RX_UNIT_WORD.is_match(t) || RX_NUMBER.is_match(t) {
            unit_tokens.insert(0, t.to_string());
            continue;
        }

        // First non-unit token closes the name portion.
        let raw_name = norm_spaces(&tokens[..=i].join(" "));
        let unit = if unit_tokens.is_empty() {
            None
        } else {
            normalize_unit(&unit_tokens.join(" "))
        };
        return SplitLabel {
            name: clean_product_name(&raw_name),
            unit,
        };
    }

    // The whole label was unit-like; treat it as a unitless name.
    SplitLabel {
        name: clean_product_name(&s),
        unit: None,
    }
}

// ---------------------------------------------------------------------------
// Unit detail parsing
// ---------------------------------------------------------------------------

static RX_UNIT_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(\d+(?:[.,]\d+)?)\s+)?(Cx|Sc|Kg|Mo-\d{1,2}|Lt|L|Un|Unid)(?:\s*(\d+(?:[.,]\d+)?))?\s*(?:Kg)?$",
    )
    .unwrap()
});
static RX_UNIT_N_KG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+(?:[.,]\d+)?)\s*Kg$").unwrap());
static RX_UNIT_BARE_KG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^Kg$").unwrap());

fn parse_num_br(text: &str) -> Option<f64> {
    text.replace(',', ".").parse::<f64>().ok()
}

fn canonical_kind(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// Converts a normalized unit descriptor into structured packaging
/// attributes. Unparseable descriptors yield all-None (price-per-kg is then
/// undefined for that quote).
///
/// "12 Cx 13 Kg" -> pack_count=12, kind=Cx, kg=13
/// "Cx 20 Kg"    -> kind=Cx, kg=20
/// "15 Kg"       -> kind=Kg, kg=15 (a bare "N Kg" is a weight, not a count)
/// "Kg"          -> kind=Kg, kg=1
pub fn parse_unit_details(unit: Option<&str>) -> UnitInfo {
    let Some(unit) = unit else {
        return UnitInfo::default();
    };
    let s = norm_spaces(unit);
    if s.is_empty() {
        return UnitInfo::default();
    }

    if let Some(caps) = RX_UNIT_FULL.captures(&s) {
        let pack_count = caps.get(1).and_then(|m| parse_num_br(m.as_str()));
        let unit_kind = canonical_kind(&caps[2]);
        let weight = caps.get(3).and_then(|m| parse_num_br(m.as_str()));

        // "15 Kg": the leading number is the weight, not a pack count.
        if unit_kind == "Kg" && pack_count.is_some() && weight.is_none() {
            return UnitInfo {
                unit_kind: Some("Kg".to_string()),
                unit_kg: pack_count,
                pack_count: None,
            };
        }

        let unit_kg = weight.or(if unit_kind == "Kg" { Some(1.0) } else { None });
        return UnitInfo {
            unit_kind: Some(unit_kind),
            unit_kg,
            pack_count,
        };
    }

    if let Some(caps) = RX_UNIT_N_KG.captures(&s) {
        return UnitInfo {
            unit_kind: Some("Kg".to_string()),
            unit_kg: parse_num_br(&caps[1]),
            pack_count: None,
        };
    }

    if RX_UNIT_BARE_KG.is_match(&s) {
        return UnitInfo {
            unit_kind: Some("Kg".to_string()),
            unit_kg: Some(1.0),
            pack_count: None,
        };
    }

    UnitInfo::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_locations_numbers_and_stopwords() {
        assert_eq!(clean_product_name("Tomate Tipo 1ª (BA)"), "Tomate");
        assert_eq!(clean_product_name("Feijão Produtor 2"), "Feijão");
        assert_eq!(clean_product_name("Cebola | Primeira"), "Cebola");
    }

    #[test]
    fn clean_preserves_accented_letters() {
        assert_eq!(clean_product_name("Feijão Carioca"), "Feijão Carioca");
        assert_eq!(clean_product_name("Maxixe 3"), "Maxixe");
    }

    #[test]
    fn clean_is_idempotent() {
        for raw in [
            "Alho Comum Juazeiro (BA)",
            "Tomate Tipo 1ª",
            "Feijão Produtor Beneficiado",
            "Cebola | Primeira 2",
            "Batata Doce",
        ] {
            let once = clean_product_name(raw);
            assert_eq!(clean_product_name(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn clean_falls_back_to_original_when_emptied() {
        // A purely numeric label cleans to nothing; the normalized original
        // comes back instead of an empty string.
        assert_eq!(clean_product_name("  123  "), "123");
        assert_eq!(clean_product_name(""), "");
    }

    #[test]
    fn sanitize_uppercases_and_rejects_empty() {
        assert_eq!(sanitize_product_name("Alho Comum").as_deref(), Some("ALHO COMUM"));
        assert_eq!(sanitize_product_name("   ").as_deref(), None);
    }

    #[test]
    fn split_example_label() {
        let split = split_product_label("Alho Comum Cx 10Kg Juazeiro (BA)");
        assert_eq!(split.name, "Alho Comum");
        assert_eq!(split.unit.as_deref(), Some("Cx 10 Kg"));
    }

    #[test]
    fn split_glued_unit_token() {
        let split = split_product_label("Tomate Salada Cx20Kg");
        assert_eq!(split.name, "Tomate Salada");
        assert_eq!(split.unit.as_deref(), Some("Cx 20 Kg"));
    }

    #[test]
    fn split_without_unit_returns_none() {
        let split = split_product_label("Coentro Juazeiro (BA)");
        assert_eq!(split.name, "Coentro");
        assert_eq!(split.unit, None);
    }

    #[test]
    fn split_rejoin_normalizes_unit_consistently() {
        for (name, unit) in [("Alho Comum", "Cx 10Kg"), ("Cebola", "sc 20 kg"), ("Tomate", "Kg")] {
            let label = format!("{name} {unit}");
            let split = split_product_label(&label);
            assert_eq!(split.unit, normalize_unit(unit), "unit mismatch for {label:?}");
        }
    }

    #[test]
    fn unit_details_box_with_weight() {
        let d = parse_unit_details(Some("Cx 10 Kg"));
        assert_eq!(d.unit_kind.as_deref(), Some("Cx"));
        assert_eq!(d.unit_kg, Some(10.0));
        assert_eq!(d.pack_count, None);
    }

    #[test]
    fn unit_details_bare_weight_is_not_a_pack_count() {
        let d = parse_unit_details(Some("15 Kg"));
        assert_eq!(d.unit_kind.as_deref(), Some("Kg"));
        assert_eq!(d.unit_kg, Some(15.0));
        assert_eq!(d.pack_count, None);
    }

    #[test]
    fn unit_details_literal_kg_defaults_to_one() {
        let d = parse_unit_details(Some("Kg"));
        assert_eq!(d.unit_kind.as_deref(), Some("Kg"));
        assert_eq!(d.unit_kg, Some(1.0));
        assert_eq!(d.pack_count, None);
    }

    #[test]
    fn unit_details_pack_of_boxes() {
        let d = parse_unit_details(Some("12 Cx 13 Kg"));
        assert_eq!(d.unit_kind.as_deref(), Some("Cx"));
        assert_eq!(d.unit_kg, Some(13.0));
        assert_eq!(d.pack_count, Some(12.0));
    }

    #[test]
    fn unit_details_none_and_unparseable() {
        assert_eq!(parse_unit_details(None), UnitInfo::default());
        assert_eq!(parse_unit_details(Some("bandeja grande")), UnitInfo::default());
    }

    #[test]
    fn price_per_kg_rounds_to_two_decimals() {
        assert_eq!(price_per_kg(62.80, Some(10.0)), Some(6.28));
        assert_eq!(price_per_kg(10.0, Some(3.0)), Some(3.33));
        assert_eq!(price_per_kg(10.0, None), None);
        assert_eq!(price_per_kg(10.0, Some(0.0)), None);
    }

    #[test]
    fn br_decimal_parsing() {
        assert_eq!(parse_decimal_br("62,80"), Some(62.80));
        assert_eq!(parse_decimal_br("1.250,00"), Some(1250.0));
        assert_eq!(parse_decimal_br("abc"), None);
    }

    #[test]
    fn br_date_parsing() {
        assert_eq!(
            parse_date_br("17/11/2025"),
            NaiveDate::from_ymd_opt(2025, 11, 17)
        );
        assert_eq!(parse_date_br("2025-11-17"), None);
    }

    #[test]
    fn source_ranking_prefers_bulletin() {
        assert!(source_rank(ALGORITHM_AMA) > source_rank(ALGORITHM_AGROLINK));
        assert!(source_rank(ALGORITHM_AGROLINK) > source_rank("manual-v0"));
    }
}
