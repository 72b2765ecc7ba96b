//! Contact record readers (vCard, delimited text, spreadsheets, JSON exports) and the
//! identity extractor that turns raw records into `{phone, name}` identities.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use mcf_core::{
    canonicalize_phone, canonicalize_phone_field, normalize_name, CardProperty, FieldValue,
    Identity, RawRecord, SchemaKind, StructuredCard, TabularRow,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mcf-adapters";

/// File extensions with a registered reader, lowercase.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "vcf", "vcard", "csv", "tsv", "xlsx", "xlsm", "xlsb", "xls", "ods", "json",
];

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing delimited file {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reading spreadsheet {}: {message}", .path.display())]
    Spreadsheet { path: PathBuf, message: String },
    #[error("parsing json {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no reader registered for {}", .0.display())]
    Unsupported(PathBuf),
}

pub type RecordResult = Result<RawRecord, ReaderError>;

/// Lazy, finite, non-restartable sequence of records decoded from one file.
pub type RecordStream = Box<dyn Iterator<Item = RecordResult>>;

pub trait RecordReader: Send + Sync {
    fn format_id(&self) -> &'static str;
    fn schema_kind(&self) -> SchemaKind;
    fn open(&self, path: &Path) -> Result<RecordStream, ReaderError>;
}

#[derive(Debug, Clone, Copy)]
struct VcardReader;

#[derive(Debug, Clone, Copy)]
struct DelimitedReader {
    format_id: &'static str,
    delimiter: u8,
}

#[derive(Debug, Clone, Copy)]
struct SpreadsheetReader;

#[derive(Debug, Clone, Copy)]
struct JsonRecordsReader;

pub fn vcard_reader() -> impl RecordReader {
    VcardReader
}

pub fn csv_reader() -> impl RecordReader {
    DelimitedReader {
        format_id: "csv",
        delimiter: b',',
    }
}

pub fn tsv_reader() -> impl RecordReader {
    DelimitedReader {
        format_id: "tsv",
        delimiter: b'\t',
    }
}

pub fn spreadsheet_reader() -> impl RecordReader {
    SpreadsheetReader
}

pub fn json_reader() -> impl RecordReader {
    JsonRecordsReader
}

/// Picks a reader by file extension.
pub fn reader_for_path(path: &Path) -> Option<Box<dyn RecordReader>> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "vcf" | "vcard" => Some(Box::new(VcardReader)),
        "csv" => Some(Box::new(DelimitedReader {
            format_id: "csv",
            delimiter: b',',
        })),
        "tsv" => Some(Box::new(DelimitedReader {
            format_id: "tsv",
            delimiter: b'\t',
        })),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(Box::new(SpreadsheetReader)),
        "json" => Some(Box::new(JsonRecordsReader)),
        _ => None,
    }
}

pub fn open_records(path: &Path) -> Result<(SchemaKind, RecordStream), ReaderError> {
    let reader =
        reader_for_path(path).ok_or_else(|| ReaderError::Unsupported(path.to_path_buf()))?;
    let stream = reader.open(path)?;
    Ok((reader.schema_kind(), stream))
}

/// Groups a record stream into batches of at most `size` records (minimum 1).
pub struct RecordBatches {
    inner: RecordStream,
    size: usize,
}

pub fn batched(stream: RecordStream, size: usize) -> RecordBatches {
    RecordBatches {
        inner: stream,
        size: size.max(1),
    }
}

impl Iterator for RecordBatches {
    type Item = Vec<RecordResult>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<_> = self.inner.by_ref().take(self.size).collect();
        (!batch.is_empty()).then_some(batch)
    }
}

// ---------------------------------------------------------------------------
// vCard
// ---------------------------------------------------------------------------

impl RecordReader for VcardReader {
    fn format_id(&self) -> &'static str {
        "vcard"
    }

    fn schema_kind(&self) -> SchemaKind {
        SchemaKind::StructuredCard
    }

    fn open(&self, path: &Path) -> Result<RecordStream, ReaderError> {
        let file = File::open(path).map_err(|source| ReaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Box::new(VcardRecords::new(BufReader::new(file), path)))
    }
}

/// Pull parser over `BEGIN:VCARD` .. `END:VCARD` blocks.
pub struct VcardRecords<R> {
    lines: Lines<R>,
    path: PathBuf,
    pending: Option<String>,
    current: Option<StructuredCard>,
    finished: bool,
}

impl<R: BufRead> VcardRecords<R> {
    pub fn new(reader: R, path: impl AsRef<Path>) -> Self {
        Self {
            lines: reader.lines(),
            path: path.as_ref().to_path_buf(),
            pending: None,
            current: None,
            finished: false,
        }
    }

    fn next_raw_line(&mut self) -> Result<Option<String>, ReaderError> {
        match self.lines.next() {
            Some(Ok(line)) => Ok(Some(line.trim_end_matches('\r').to_string())),
            Some(Err(source)) => Err(ReaderError::Io {
                path: self.path.clone(),
                source,
            }),
            None => Ok(None),
        }
    }

    /// Joins folded continuation lines and quoted-printable soft line breaks.
    fn next_logical_line(&mut self) -> Result<Option<String>, ReaderError> {
        let mut line = match self.pending.take() {
            Some(line) => line,
            None => match self.next_raw_line()? {
                Some(line) => line,
                None => return Ok(None),
            },
        };
        loop {
            if line.ends_with('=') && is_quoted_printable_head(&line) {
                match self.next_raw_line()? {
                    Some(next) => {
                        line.pop();
                        line.push_str(next.trim_start());
                        continue;
                    }
                    None => break,
                }
            }
            match self.next_raw_line()? {
                Some(next) if next.starts_with(' ') || next.starts_with('\t') => {
                    line.push_str(&next[1..]);
                }
                Some(next) => {
                    self.pending = Some(next);
                    break;
                }
                None => break,
            }
        }
        Ok(Some(line))
    }
}

impl<R: BufRead> Iterator for VcardRecords<R> {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.next_logical_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.finished = true;
                    // Unterminated trailing card: keep what was read.
                    return self
                        .current
                        .take()
                        .filter(|card| !card.properties.is_empty())
                        .map(|card| Ok(RawRecord::StructuredCard(card)));
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            };
            let Some(property) = parse_property_line(&line) else {
                continue;
            };
            let is_vcard = property.value.trim().eq_ignore_ascii_case("VCARD");
            if property.name == "BEGIN" && is_vcard {
                // A card left open by a missing END is emitted rather than overwritten.
                let previous = self.current.replace(StructuredCard::new());
                if let Some(card) = previous.filter(|card| !card.properties.is_empty()) {
                    return Some(Ok(RawRecord::StructuredCard(card)));
                }
            } else if property.name == "END" && is_vcard {
                if let Some(card) = self.current.take() {
                    return Some(Ok(RawRecord::StructuredCard(card)));
                }
            } else if let Some(card) = self.current.as_mut() {
                card.properties.push(property);
            }
        }
    }
}

fn is_quoted_printable_head(line: &str) -> bool {
    let head = match find_value_separator(line) {
        Some(idx) => &line[..idx],
        None => line,
    };
    head.to_ascii_uppercase().contains("QUOTED-PRINTABLE")
}

fn find_value_separator(line: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

fn parse_property_line(line: &str) -> Option<CardProperty> {
    let split = find_value_separator(line)?;
    let (head, value) = (&line[..split], &line[split + 1..]);
    let mut parts = head.split(';');
    let raw_name = parts.next()?.trim();
    // `item1.TEL` style group prefixes carry no meaning for extraction.
    let name = raw_name.rsplit('.').next().unwrap_or(raw_name);
    if name.is_empty() {
        return None;
    }
    let mut property = CardProperty::new(name.to_ascii_uppercase(), value);
    for param in parts.map(str::trim).filter(|p| !p.is_empty()) {
        match param.split_once('=') {
            Some((key, val)) => property.params.push((
                key.trim().to_ascii_uppercase(),
                val.trim().trim_matches('"').to_string(),
            )),
            None => property
                .params
                .push(("TYPE".to_string(), param.to_string())),
        }
    }
    Some(property)
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

/// Decodes quoted-printable text (RFC 2045), treating the payload as UTF-8.
pub fn decode_quoted_printable(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            match (bytes.get(i + 1).copied(), bytes.get(i + 2).copied()) {
                (None, _) => break,
                (Some(b'\n'), _) => {
                    i += 2;
                    continue;
                }
                (Some(b'\r'), Some(b'\n')) => {
                    i += 3;
                    continue;
                }
                (Some(hi), Some(lo)) => {
                    if let (Some(hi), Some(lo)) = (hex_value(hi), hex_value(lo)) {
                        out.push((hi << 4) | lo);
                        i += 3;
                        continue;
                    }
                }
                _ => {}
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn unescape_card_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push(' '),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn decoded_value(property: &CardProperty) -> String {
    if property.is_quoted_printable() {
        decode_quoted_printable(&property.value)
    } else {
        property.value.clone()
    }
}

// ---------------------------------------------------------------------------
// Delimited text
// ---------------------------------------------------------------------------

fn header_name(index: usize, raw: &str) -> String {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        format!("column_{}", index + 1)
    } else {
        trimmed.to_string()
    }
}

fn zip_row(headers: &[String], cells: impl Iterator<Item = String>) -> TabularRow {
    let mut row = TabularRow::new();
    for (index, cell) in cells.enumerate() {
        let name = headers
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("column_{}", index + 1));
        row.push(name, cell);
    }
    row
}

impl RecordReader for DelimitedReader {
    fn format_id(&self) -> &'static str {
        self.format_id
    }

    fn schema_kind(&self) -> SchemaKind {
        SchemaKind::Tabular
    }

    fn open(&self, path: &Path) -> Result<RecordStream, ReaderError> {
        let csv_err = |source| ReaderError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_err)?;
        let headers: Vec<String> = reader
            .byte_headers()
            .map_err(csv_err)?
            .iter()
            .enumerate()
            .map(|(index, raw)| header_name(index, &String::from_utf8_lossy(raw)))
            .collect();

        let path = path.to_path_buf();
        let rows = reader
            .into_byte_records()
            .filter_map(move |result| match result {
                Ok(record) => {
                    let cells = record
                        .iter()
                        .map(|cell| String::from_utf8_lossy(cell).into_owned());
                    let row = zip_row(&headers, cells);
                    (!row.is_empty()).then(|| Ok(RawRecord::TabularRow(row)))
                }
                Err(source) => Some(Err(ReaderError::Csv {
                    path: path.clone(),
                    source,
                })),
            });
        Ok(Box::new(rows))
    }
}

// ---------------------------------------------------------------------------
// Spreadsheets
// ---------------------------------------------------------------------------

impl RecordReader for SpreadsheetReader {
    fn format_id(&self) -> &'static str {
        "spreadsheet"
    }

    fn schema_kind(&self) -> SchemaKind {
        SchemaKind::Tabular
    }

    fn open(&self, path: &Path) -> Result<RecordStream, ReaderError> {
        let workbook = open_workbook_auto(path).map_err(|e| ReaderError::Spreadsheet {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let sheet_names = workbook.sheet_names().into_iter().collect();
        Ok(Box::new(SheetRows {
            workbook,
            path: path.to_path_buf(),
            sheet_names,
            rows: Vec::new().into_iter(),
        }))
    }
}

/// Loads one sheet at a time; every sheet's first row is its header.
struct SheetRows {
    workbook: Sheets<BufReader<File>>,
    path: PathBuf,
    sheet_names: VecDeque<String>,
    rows: std::vec::IntoIter<TabularRow>,
}

impl Iterator for SheetRows {
    type Item = RecordResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.rows.next() {
                return Some(Ok(RawRecord::TabularRow(row)));
            }
            let sheet = self.sheet_names.pop_front()?;
            match self.workbook.worksheet_range(&sheet) {
                Ok(range) => {
                    let rows = sheet_rows(&range);
                    debug!(sheet = %sheet, rows = rows.len(), "loaded sheet");
                    self.rows = rows.into_iter();
                }
                Err(err) => {
                    self.sheet_names.clear();
                    return Some(Err(ReaderError::Spreadsheet {
                        path: self.path.clone(),
                        message: format!("sheet {sheet}: {err}"),
                    }));
                }
            }
        }
    }
}

fn sheet_rows(range: &Range<Data>) -> Vec<TabularRow> {
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(index, cell)| header_name(index, &cell_to_string(cell)))
        .collect();
    rows.map(|cells| zip_row(&headers, cells.iter().map(cell_to_string)))
        .filter(|row| !row.is_empty())
        .collect()
}

/// Phone numbers typed into spreadsheets usually arrive as floats; `Display` for
/// `f64` prints integral values without a fractional part, which keeps them intact.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => format!("{}", dt),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

// ---------------------------------------------------------------------------
// JSON exports
// ---------------------------------------------------------------------------

impl RecordReader for JsonRecordsReader {
    fn format_id(&self) -> &'static str {
        "json"
    }

    fn schema_kind(&self) -> SchemaKind {
        SchemaKind::Tabular
    }

    fn open(&self, path: &Path) -> Result<RecordStream, ReaderError> {
        let file = File::open(path).map_err(|source| ReaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: JsonValue =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ReaderError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        // Either a bare array of contacts or an envelope object holding one.
        let items = match value {
            JsonValue::Array(items) => items,
            JsonValue::Object(map) => map
                .into_iter()
                .find_map(|(_, v)| match v {
                    JsonValue::Array(items) => Some(items),
                    _ => None,
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(Box::new(
            items
                .into_iter()
                .filter_map(|item| json_row(&item))
                .map(|row| Ok(RawRecord::TabularRow(row))),
        ))
    }
}

fn json_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(
            n.as_u64()
                .map(|v| v.to_string())
                .or_else(|| n.as_i64().map(|v| v.to_string()))
                .or_else(|| n.as_f64().map(|v| format!("{}", v)))
                .unwrap_or_else(|| n.to_string()),
        ),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_row(item: &JsonValue) -> Option<TabularRow> {
    let object = item.as_object()?;
    let mut row = TabularRow::new();
    for (key, value) in object {
        match value {
            JsonValue::Array(values) => {
                let list: Vec<String> = values.iter().filter_map(json_scalar).collect();
                if !list.is_empty() {
                    row.push(key.clone(), FieldValue::List(list));
                }
            }
            other => {
                if let Some(text) = json_scalar(other) {
                    row.push(key.clone(), text);
                }
            }
        }
    }
    (!row.is_empty()).then_some(row)
}

// ---------------------------------------------------------------------------
// Identity extraction
// ---------------------------------------------------------------------------

fn default_phone_columns() -> Vec<String> {
    [
        "phone",
        "mobile",
        "phone number",
        "mobile number",
        "mobile phone",
        "telephone",
        "contact",
        "contact number",
        "number",
        "phone 1 - value",
        "phone 2 - value",
        "phone 3 - value",
        "primary phone",
        "home phone",
        "business phone",
        "other phone",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_name_columns() -> Vec<String> {
    [
        "name",
        "full name",
        "display name",
        "contact name",
        "first name",
        "first_name",
        "given name",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_first_name_columns() -> Vec<String> {
    ["first name", "first_name", "firstname", "given name"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_last_name_columns() -> Vec<String> {
    ["last name", "last_name", "lastname", "family name", "surname"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Column vocabulary for tabular sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Candidate phone columns in priority order.
    pub phone_columns: Vec<String>,
    /// Candidate name columns in priority order.
    pub name_columns: Vec<String>,
    /// Name columns that only hold a given name and get a last name appended.
    pub first_name_columns: Vec<String>,
    pub last_name_columns: Vec<String>,
    /// Treat every column as a phone candidate, in row order.
    pub permissive_columns: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            phone_columns: default_phone_columns(),
            name_columns: default_name_columns(),
            first_name_columns: default_first_name_columns(),
            last_name_columns: default_last_name_columns(),
            permissive_columns: false,
        }
    }
}

fn dedup_columns(columns: &[String]) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    for column in columns {
        let key = column.trim().to_lowercase();
        if !key.is_empty() && !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen
}

/// Derives zero or more identities from one raw record.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    phone_columns: Vec<String>,
    name_columns: Vec<String>,
    first_name_columns: Vec<String>,
    last_name_columns: Vec<String>,
    permissive_columns: bool,
}

impl Default for IdentityExtractor {
    fn default() -> Self {
        Self::new(&ExtractionConfig::default())
    }
}

impl IdentityExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            phone_columns: dedup_columns(&config.phone_columns),
            name_columns: dedup_columns(&config.name_columns),
            first_name_columns: dedup_columns(&config.first_name_columns),
            last_name_columns: dedup_columns(&config.last_name_columns),
            permissive_columns: config.permissive_columns,
        }
    }

    pub fn extract(&self, record: &RawRecord) -> Vec<Identity> {
        match record {
            RawRecord::StructuredCard(card) => self.extract_card(card),
            RawRecord::TabularRow(row) => self.extract_row(row),
        }
    }

    fn extract_card(&self, card: &StructuredCard) -> Vec<Identity> {
        let name = card_name(card);
        card.all("TEL")
            .filter_map(|tel| canonicalize_phone(&decoded_value(tel)))
            .map(|phone| Identity::new(phone, name.clone()))
            .collect()
    }

    fn extract_row(&self, row: &TabularRow) -> Vec<Identity> {
        let phones: Vec<String> = if self.permissive_columns {
            row.iter()
                .filter_map(|(_, value)| canonicalize_phone_field(value))
                .collect()
        } else {
            self.phone_columns
                .iter()
                .filter_map(|column| row.get(column))
                .filter_map(canonicalize_phone_field)
                .collect()
        };
        if phones.is_empty() {
            return Vec::new();
        }
        let name = self.row_name(row);
        phones
            .into_iter()
            .map(|phone| Identity::new(phone, name.clone()))
            .collect()
    }

    fn row_name(&self, row: &TabularRow) -> String {
        for column in &self.name_columns {
            let Some(value) = row.text(column) else {
                continue;
            };
            if self.first_name_columns.contains(column) {
                let last = self
                    .last_name_columns
                    .iter()
                    .find_map(|c| row.text(c))
                    .unwrap_or_default();
                return normalize_name(format!("{value} {last}").trim());
            }
            return normalize_name(value);
        }
        String::new()
    }
}

/// `FN`, falling back to the structured `N` rendered as "given additional family".
fn card_name(card: &StructuredCard) -> String {
    let formatted = card
        .first("FN")
        .map(|fn_prop| normalize_name(&unescape_card_text(&decoded_value(fn_prop))))
        .unwrap_or_default();
    if !formatted.is_empty() {
        return formatted;
    }
    let Some(structured) = card.first("N") else {
        return String::new();
    };
    let parts = CardProperty::new("N", decoded_value(structured)).components();
    let pick = |idx: usize| parts.get(idx).map(|s| s.trim()).unwrap_or_default();
    let joined = [pick(1), pick(2), pick(0)]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    normalize_name(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn cards(text: &str) -> Vec<StructuredCard> {
        VcardRecords::new(Cursor::new(text.as_bytes().to_vec()), "test.vcf")
            .map(|r| match r.expect("record") {
                RawRecord::StructuredCard(card) => card,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).expect("create");
        file.write_all(contents).expect("write");
        path
    }

    #[test]
    fn vcard_parser_handles_multiple_cards_groups_and_folding() {
        let text = "BEGIN:VCARD\r\nVERSION:3.0\r\nFN:Priya\r\n  Sharma\r\nitem1.TEL;TYPE=CELL:+91 98765 43210\r\nTEL;HOME:022 2345 6789\r\nEND:VCARD\r\nBEGIN:VCARD\nFN:Ravi\nEND:VCARD\n";
        let parsed = cards(text);
        assert_eq!(parsed.len(), 2);
        let first = &parsed[0];
        assert_eq!(first.first("FN").map(|p| p.value.as_str()), Some("Priya Sharma"));
        let tels: Vec<_> = first.all("TEL").collect();
        assert_eq!(tels.len(), 2);
        assert_eq!(tels[0].param("TYPE"), Some("CELL"));
        assert_eq!(tels[1].param("TYPE"), Some("HOME"));
    }

    #[test]
    fn vcard_quoted_printable_soft_breaks_are_joined_and_decoded() {
        let text = "BEGIN:VCARD\nVERSION:2.1\nFN;CHARSET=UTF-8;ENCODING=QUOTED-PRINTABLE:=E0=A4=B0=E0=A4=BE=E0=A4=AE=20=\n=E0=A4=95=E0=A5=81=E0=A4=AE=E0=A4=BE=E0=A4=B0\nTEL;CELL:9876543210\nEND:VCARD\n";
        let parsed = cards(text);
        let identities = IdentityExtractor::default().extract(&RawRecord::StructuredCard(parsed[0].clone()));
        assert_eq!(identities, vec![Identity::new("9876543210", "राम कुमार")]);
    }

    #[test]
    fn unterminated_trailing_card_is_kept() {
        let parsed = cards("BEGIN:VCARD\nFN:Tail\nTEL:9876543210\n");
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn card_missing_end_is_kept_when_next_card_begins() {
        let parsed = cards(
            "BEGIN:VCARD\nFN:Asha\nTEL:9876543210\nBEGIN:VCARD\nFN:Bina\nTEL:9123456789\nEND:VCARD\n",
        );
        assert_eq!(parsed.len(), 2);

        let extractor = IdentityExtractor::default();
        let identities: Vec<Identity> = parsed
            .into_iter()
            .flat_map(|card| extractor.extract(&RawRecord::StructuredCard(card)))
            .collect();
        assert_eq!(
            identities,
            vec![
                Identity::new("9876543210", "Asha"),
                Identity::new("9123456789", "Bina"),
            ]
        );
    }

    #[test]
    fn quoted_printable_decoding() {
        assert_eq!(decode_quoted_printable("Caf=C3=A9"), "Café");
        assert_eq!(decode_quoted_printable("a=\r\nb"), "ab");
        assert_eq!(decode_quoted_printable("50=ZZ off"), "50=ZZ off");
        assert_eq!(decode_quoted_printable("trailing="), "trailing");
    }

    #[test]
    fn card_yields_one_identity_per_valid_tel() {
        let card = StructuredCard::new()
            .with_property(CardProperty::new("FN", r"Amit\, Office"))
            .with_property(CardProperty::new("TEL", "+91 98765 43210"))
            .with_property(CardProperty::new("TEL", "12345"))
            .with_property(CardProperty::new("TEL", "tel:0091-9123456789"));
        let identities = IdentityExtractor::default().extract(&RawRecord::StructuredCard(card));
        assert_eq!(
            identities,
            vec![
                Identity::new("9876543210", "Amit Office"),
                Identity::new("9123456789", "Amit Office"),
            ]
        );
    }

    #[test]
    fn card_without_fn_falls_back_to_structured_name() {
        let card = StructuredCard::new()
            .with_property(CardProperty::new("N", "Sharma;Priya;K.;Dr.;"))
            .with_property(CardProperty::new("TEL", "9876543210"));
        let identities = IdentityExtractor::default().extract(&RawRecord::StructuredCard(card));
        assert_eq!(identities[0].name, "Priya K Sharma");
    }

    #[test]
    fn row_with_three_phone_columns_yields_three_identities() {
        let row = TabularRow::new()
            .with_column("Name", "Neha")
            .with_column("Phone 1 - Value", "98765 43210")
            .with_column("Phone 2 - Value", "+91 91234 56789")
            .with_column("Mobile", "080-1234-5678")
            .with_column("Notes", "not a number");
        let identities = IdentityExtractor::default().extract(&RawRecord::TabularRow(row));
        let phones: Vec<_> = identities.iter().map(|i| i.phone.as_str()).collect();
        assert_eq!(phones, vec!["8012345678", "9876543210", "9123456789"]);
        assert!(identities.iter().all(|i| i.name == "Neha"));
    }

    #[test]
    fn first_name_column_is_joined_with_last_name() {
        let row = TabularRow::new()
            .with_column("First Name", "Priya")
            .with_column("Last Name", " Sharma ")
            .with_column("Phone", "9876543210");
        let identities = IdentityExtractor::default().extract(&RawRecord::TabularRow(row));
        assert_eq!(identities[0].name, "Priya Sharma");

        let row = TabularRow::new()
            .with_column("first_name", "Priya")
            .with_column("Phone", "9876543210");
        let identities = IdentityExtractor::default().extract(&RawRecord::TabularRow(row));
        assert_eq!(identities[0].name, "Priya");
    }

    #[test]
    fn missing_name_yields_empty_name() {
        let row = TabularRow::new().with_column("phone", "9876543210");
        let identities = IdentityExtractor::default().extract(&RawRecord::TabularRow(row));
        assert_eq!(identities, vec![Identity::new("9876543210", "")]);
    }

    #[test]
    fn permissive_mode_scans_every_column_in_order() {
        let config = ExtractionConfig {
            permissive_columns: true,
            ..ExtractionConfig::default()
        };
        let row = TabularRow::new()
            .with_column("Name", "Zed")
            .with_column("Work", "9123456789")
            .with_column("Home", "98765 43210");
        let identities = IdentityExtractor::new(&config).extract(&RawRecord::TabularRow(row.clone()));
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].phone, "9123456789");
        assert!(IdentityExtractor::default()
            .extract(&RawRecord::TabularRow(row))
            .is_empty());
    }

    #[test]
    fn duplicate_configured_columns_are_scanned_once() {
        let config = ExtractionConfig {
            phone_columns: vec!["Phone".into(), "phone ".into()],
            ..ExtractionConfig::default()
        };
        let row = TabularRow::new().with_column("PHONE", "9876543210");
        assert_eq!(
            IdentityExtractor::new(&config)
                .extract(&RawRecord::TabularRow(row))
                .len(),
            1
        );
    }

    #[test]
    fn csv_reader_maps_headers_and_skips_blank_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp(
            &dir,
            "contacts.csv",
            "\u{feff}Name,Phone,\nAsha,98765 43210,extra\n,,\nBina,\"+91 91234-56789\"\n".as_bytes(),
        );
        let (kind, stream) = open_records(&path).expect("open");
        assert_eq!(kind, SchemaKind::Tabular);
        let rows: Vec<_> = stream.map(|r| r.expect("row")).collect();
        assert_eq!(rows.len(), 2);
        let RawRecord::TabularRow(first) = &rows[0] else {
            panic!("expected row");
        };
        assert_eq!(first.text("name"), Some("Asha"));
        assert_eq!(first.text("column_3"), Some("extra"));
    }

    #[test]
    fn tsv_reader_uses_tabs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp(&dir, "contacts.tsv", b"name\tmobile\nAsha\t9876543210\n");
        let rows: Vec<_> = tsv_reader()
            .open(&path)
            .expect("open")
            .map(|r| r.expect("row"))
            .collect();
        let identities = IdentityExtractor::default().extract(&rows[0]);
        assert_eq!(identities, vec![Identity::new("9876543210", "Asha")]);
    }

    #[test]
    fn json_reader_accepts_arrays_envelopes_and_list_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp(
            &dir,
            "contacts.json",
            br#"{"meta": {"v": 1}, "contacts": [
                {"name": "Asha", "phone": ["98765 43210", "9123456789"]},
                {"name": "Num", "mobile": 9123456780},
                {"name": "Float", "mobile": 9123456781.0},
                "not an object"
            ]}"#,
        );
        let rows: Vec<_> = json_reader()
            .open(&path)
            .expect("open")
            .map(|r| r.expect("row"))
            .collect();
        assert_eq!(rows.len(), 3);
        let extractor = IdentityExtractor::default();
        assert_eq!(extractor.extract(&rows[0]), vec![Identity::new("9876543210", "Asha")]);
        assert_eq!(extractor.extract(&rows[1])[0].phone, "9123456780");
        assert_eq!(extractor.extract(&rows[2])[0].phone, "9123456781");
    }

    #[test]
    fn spreadsheet_float_cells_keep_integral_phone_numbers() {
        assert_eq!(cell_to_string(&Data::Float(9876543210.0)), "9876543210");
        assert_eq!(cell_to_string(&Data::Int(9876543210)), "9876543210");
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    #[test]
    fn unsupported_extension_is_reported() {
        let err = open_records(Path::new("notes.txt")).err().expect("error");
        assert!(matches!(err, ReaderError::Unsupported(_)));
        assert!(reader_for_path(Path::new("A.VCF")).is_some());
        assert_eq!(
            reader_for_path(Path::new("book.xlsx")).map(|r| r.format_id()),
            Some("spreadsheet")
        );
    }

    #[test]
    fn batches_cover_every_record_for_any_size() {
        let text = "BEGIN:VCARD\nTEL:9876543210\nEND:VCARD\n".repeat(5);
        for size in [0, 1, 2, 5, 9] {
            let stream: RecordStream = Box::new(VcardRecords::new(
                Cursor::new(text.clone().into_bytes()),
                "x.vcf",
            ));
            let batches: Vec<_> = batched(stream, size).collect();
            assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 5);
            assert!(batches.iter().all(|b| b.len() <= size.max(1)));
        }
    }
}
