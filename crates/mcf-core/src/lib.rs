//! Core contact identity model plus phone and name canonicalization for MCF.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mcf-core";

/// Shortest accepted canonical phone, in characters.
pub const MIN_PHONE_LEN: usize = 10;
/// Longest cleaned value accepted before overflow extraction kicks in.
pub const MAX_PHONE_LEN: usize = 15;
/// Trunk and country prefixes, tried in this order.
pub const TRUNK_PREFIXES: [&str; 5] = ["91", "0", "00", "+91", "091"];

/// Shape of the source a record was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    StructuredCard,
    Tabular,
}

/// Scalar or multi-valued cell/field content as handed over by a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
}

impl FieldValue {
    /// First element of a list, or the scalar itself.
    pub fn first(&self) -> Option<&str> {
        match self {
            FieldValue::Scalar(value) => Some(value.as_str()),
            FieldValue::List(values) => values.first().map(String::as_str),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.first().map(|v| v.trim().is_empty()).unwrap_or(true)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Scalar(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(values: Vec<String>) -> Self {
        FieldValue::List(values)
    }
}

fn column_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// One row of a delimited table, spreadsheet sheet or JSON export, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabularRow {
    pub columns: Vec<(String, FieldValue)>,
}

impl TabularRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.columns.push((name.into(), value.into()));
    }

    /// Case-insensitive, whitespace-trimmed column lookup.
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        let wanted = column_key(column);
        self.columns
            .iter()
            .find(|(name, _)| column_key(name) == wanted)
            .map(|(_, value)| value)
    }

    /// Trimmed first value of `column`, if present and non-blank.
    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column)
            .and_then(FieldValue::first)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|(_, value)| value.is_blank())
    }
}

/// A single contact-card property such as `TEL;TYPE=CELL:+91 98765 43210`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardProperty {
    pub name: String,
    /// Parameters in source order. Bare vCard 2.1 parameters are stored under `TYPE`.
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl CardProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            value: value.into(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_quoted_printable(&self) -> bool {
        self.params.iter().any(|(key, value)| {
            (key.eq_ignore_ascii_case("ENCODING") || key.eq_ignore_ascii_case("TYPE"))
                && value.eq_ignore_ascii_case("QUOTED-PRINTABLE")
        })
    }

    /// Splits a structured value (`N`, `ADR`) on unescaped semicolons.
    pub fn components(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut chars = self.value.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                ';' => out.push(std::mem::take(&mut current)),
                _ => current.push(ch),
            }
        }
        out.push(current);
        out
    }
}

/// Structured contact card with possibly repeated properties.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructuredCard {
    pub properties: Vec<CardProperty>,
}

impl StructuredCard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, property: CardProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a CardProperty> + 'a {
        self.properties
            .iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn first(&self, name: &str) -> Option<&CardProperty> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Raw record as decoded by a format reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawRecord {
    StructuredCard(StructuredCard),
    TabularRow(TabularRow),
}

impl RawRecord {
    pub fn kind(&self) -> SchemaKind {
        match self {
            RawRecord::StructuredCard(_) => SchemaKind::StructuredCard,
            RawRecord::TabularRow(_) => SchemaKind::Tabular,
        }
    }
}

/// Uniform `{phone, name}` identity derived from a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub phone: String,
    pub name: String,
}

impl Identity {
    pub fn new(phone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: name.into(),
        }
    }
}

fn overflow_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?\d{10,12}").expect("overflow pattern compiles"))
}

fn name_noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[^\w\s\x{0900}-\x{097F}\x{0600}-\x{06FF}+/()\[\]]")
            .expect("name pattern compiles")
    })
}

/// Canonicalizes a raw phone value, returning `None` when it cannot be a subscriber number.
///
/// Only digits and a leading `+` survive cleaning. Values longer than
/// [`MAX_PHONE_LEN`] are usually several numbers glued together, so the first
/// 10-12 digit run is taken instead. Trunk/country prefixes from [`TRUNK_PREFIXES`]
/// are then stripped while the value is longer than [`MIN_PHONE_LEN`] and the strip
/// leaves at least [`MIN_PHONE_LEN`] characters; stripping until no prefix applies keeps
/// the function idempotent for chained prefixes like `0091`.
pub fn canonicalize_phone(raw: &str) -> Option<String> {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_digit() || (ch == '+' && cleaned.is_empty()) {
            cleaned.push(ch);
        }
    }

    if cleaned.len() > MAX_PHONE_LEN {
        cleaned = overflow_run_re().find(&cleaned)?.as_str().to_string();
    }

    while cleaned.len() > MIN_PHONE_LEN {
        let Some(prefix) = TRUNK_PREFIXES.iter().find(|p| cleaned.starts_with(**p)) else {
            break;
        };
        if cleaned.len() - prefix.len() < MIN_PHONE_LEN {
            break;
        }
        cleaned.drain(..prefix.len());
    }

    if cleaned.len() < MIN_PHONE_LEN {
        return None;
    }
    Some(cleaned)
}

pub fn canonicalize_phone_field(value: &FieldValue) -> Option<String> {
    value.first().and_then(canonicalize_phone)
}

/// Canonical form of the trailing ten digits, used for cross-format matching.
pub fn short_phone(phone: &str) -> Option<String> {
    let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_PHONE_LEN {
        return None;
    }
    let tail: String = digits[digits.len() - MIN_PHONE_LEN..].iter().collect();
    canonicalize_phone(&tail)
}

/// Numeric value of a canonical phone, ignoring a leading `+`.
pub fn phone_numeric_value(phone: &str) -> Option<u64> {
    phone.trim_start_matches('+').parse().ok()
}

/// Cleans a display name: keeps word characters (Devanagari and Arabic included),
/// digits, spaces and `+ / ( ) [ ]`, collapses whitespace and trims slashes.
pub fn normalize_name(raw: &str) -> String {
    let stripped = name_noise_re().replace_all(raw, "");
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '/' || c.is_whitespace())
        .to_string()
}

pub fn normalize_name_field(value: &FieldValue) -> String {
    value.first().map(normalize_name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_trunk_prefix_is_stripped() {
        assert_eq!(
            canonicalize_phone("0091-9876543210").as_deref(),
            Some("9876543210")
        );
        assert_eq!(
            canonicalize_phone("+91 98765 43210").as_deref(),
            Some("9876543210")
        );
        assert_eq!(
            canonicalize_phone("09876543210").as_deref(),
            Some("9876543210")
        );
    }

    #[test]
    fn stripping_stops_before_going_under_ten_digits() {
        assert_eq!(
            canonicalize_phone("091234567890").as_deref(),
            Some("91234567890")
        );
        assert_eq!(
            canonicalize_phone("91234567890").as_deref(),
            Some("91234567890")
        );
        assert_eq!(
            canonicalize_phone("+91 234 567 890").as_deref(),
            Some("+91234567890")
        );
    }

    #[test]
    fn overflow_value_takes_first_digit_run() {
        let glued = "91987654321098765432";
        let run = overflow_run_re().find(glued).map(|m| m.as_str());
        assert_eq!(run, Some("919876543210"));
        assert_eq!(canonicalize_phone(glued).as_deref(), Some("9876543210"));
    }

    #[test]
    fn short_values_are_rejected() {
        assert_eq!(canonicalize_phone("12345"), None);
        assert_eq!(canonicalize_phone(""), None);
        assert_eq!(canonicalize_phone("call me maybe"), None);
        assert_eq!(canonicalize_phone("+91 98765"), None);
    }

    #[test]
    fn ten_digit_numbers_starting_with_prefix_digits_survive() {
        assert_eq!(
            canonicalize_phone("9198765432").as_deref(),
            Some("9198765432")
        );
        assert_eq!(
            canonicalize_phone("0123456789").as_deref(),
            Some("0123456789")
        );
    }

    #[test]
    fn foreign_numbers_keep_plus_and_country_code() {
        assert_eq!(
            canonicalize_phone("+44 (20) 7946-0958").as_deref(),
            Some("+442079460958")
        );
        assert_eq!(
            canonicalize_phone("tel:+1-202-555-0143").as_deref(),
            Some("+12025550143")
        );
    }

    #[test]
    fn only_a_leading_plus_is_kept() {
        assert_eq!(
            canonicalize_phone("98765+43210").as_deref(),
            Some("9876543210")
        );
        assert_eq!(
            canonicalize_phone("++91 98765 43210").as_deref(),
            Some("9876543210")
        );
    }

    #[test]
    fn canonicalization_is_idempotent_and_within_bounds() {
        let inputs = [
            "0091-9876543210",
            "+91 98765 43210",
            "91987654321098765432",
            "+44 (20) 7946-0958",
            "009191 9876 5432 10",
            "0919876543210",
            "+1 (202) 555-0143 ext 99",
            "98765 43210 / 91234 56789",
            "00000000000000000000000",
        ];
        for input in inputs {
            let Some(once) = canonicalize_phone(input) else {
                continue;
            };
            assert!(
                (MIN_PHONE_LEN..=MAX_PHONE_LEN).contains(&once.len()),
                "{input} -> {once}"
            );
            assert!(once.trim_start_matches('+').chars().all(|c| c.is_ascii_digit()));
            assert!(!once[1..].contains('+'));
            assert_eq!(canonicalize_phone(&once).as_deref(), Some(once.as_str()));
        }
    }

    #[test]
    fn list_fields_use_first_element() {
        let value = FieldValue::List(vec!["98765 43210".into(), "91234 56789".into()]);
        assert_eq!(canonicalize_phone_field(&value).as_deref(), Some("9876543210"));
        assert_eq!(canonicalize_phone_field(&FieldValue::List(vec![])), None);
    }

    #[test]
    fn short_phone_uses_trailing_ten_digits() {
        assert_eq!(short_phone("+919876543210").as_deref(), Some("9876543210"));
        assert_eq!(short_phone("9876543210").as_deref(), Some("9876543210"));
        assert_eq!(short_phone("12345"), None);
    }

    #[test]
    fn numeric_value_ignores_plus() {
        assert_eq!(phone_numeric_value("+12025550143"), Some(12025550143));
        assert_eq!(phone_numeric_value("9000000001"), Some(9000000001));
    }

    #[test]
    fn name_punctuation_is_removed_and_scripts_are_kept() {
        assert_eq!(normalize_name("  John   O'Brien, Jr. "), "John OBrien Jr");
        assert_eq!(normalize_name("राम कुमार"), "राम कुमार");
        assert_eq!(normalize_name("محمد  علي!"), "محمد علي");
        assert_eq!(normalize_name("Dr. [Office] (Main) +2"), "Dr [Office] (Main) +2");
        assert_eq!(normalize_name("/Ravi / Home/"), "Ravi / Home");
        assert_eq!(normalize_name("★ Star ★"), "Star");
    }

    #[test]
    fn name_normalization_is_idempotent() {
        for raw in ["/ / x", "  a\t\tb  ", "Mr. Smith/", "नमस्ते, दुनिया", "[Work] / ", ""] {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once, "{raw:?}");
        }
    }

    #[test]
    fn tabular_lookup_ignores_case_and_padding() {
        let row = TabularRow::new()
            .with_column(" Phone 1 - Value ", "98765 43210")
            .with_column("Name", "  ");
        assert_eq!(row.text("phone 1 - value"), Some("98765 43210"));
        assert_eq!(row.text("name"), None);
        assert!(row.get("missing").is_none());
        assert!(!row.is_empty());
    }

    #[test]
    fn card_property_helpers() {
        let prop = CardProperty::new("N", r"Sharma;Priya;K\;M;;")
            .with_param("ENCODING", "QUOTED-PRINTABLE");
        assert!(prop.is_quoted_printable());
        assert_eq!(prop.components(), vec!["Sharma", "Priya", "K;M", "", ""]);
        let bare = CardProperty::new("FN", "x").with_param("TYPE", "quoted-printable");
        assert!(bare.is_quoted_printable());

        let card = StructuredCard::new()
            .with_property(CardProperty::new("TEL", "1"))
            .with_property(CardProperty::new("tel", "2"));
        assert_eq!(card.all("TEL").count(), 2);
        assert_eq!(RawRecord::StructuredCard(card).kind(), SchemaKind::StructuredCard);
    }

    fn first_value<'c>(card: &'c StructuredCard, name: String) -> Option<&'c str> {
        card.first(&name).map(|p| p.value.as_str())
    }

    #[test]
    fn first_property_outlives_the_lookup_key() {
        let card = StructuredCard::new()
            .with_property(CardProperty::new("fn", "Asha"))
            .with_property(CardProperty::new("FN", "Bina"));
        assert_eq!(first_value(&card, "FN".to_string()), Some("Asha"));
        assert_eq!(first_value(&card, "N".to_string()), None);
    }
}
