//! Reconciliation engine and run pipeline for MCF.
//!
//! A run ingests the master corpus, then the comparison corpus, into two
//! [`ReconciliationStore`]s owned by a [`Reconciler`]; the [`MissingSetComputer`] diffs
//! them and the [`ReconcilePipeline`] writes the missing set, duplicate tables and
//! run diagnostics under `<output_dir>/<run_id>/`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use mcf_adapters::{
    batched, open_records, ExtractionConfig, IdentityExtractor, ReaderError, RecordStream,
    SUPPORTED_EXTENSIONS,
};
use mcf_core::{phone_numeric_value, short_phone, Identity, RawRecord};
use mcf_storage::{render_csv, render_vcards, OutputStore, StoredOutput};
use parquet::arrow::ArrowWriter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

pub const CRATE_NAME: &str = "mcf-sync";

pub const DEFAULT_CONFIG_PATH: &str = "mcf.yaml";

/// Candidates must exceed this numeric value to enter the comparison store.
pub const DEFAULT_NUMERIC_FLOOR: u64 = 6_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Ascending by name, case-insensitive.
    #[default]
    Name,
    /// Ascending by numeric phone value.
    Phone,
}

impl FromStr for SortOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "phone" => Ok(Self::Phone),
            other => bail!("unknown sort order `{other}` (expected `name` or `phone`)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub blocked_keywords: Vec<String>,
    pub blocked_prefixes: Vec<String>,
    pub blocked_suffixes: Vec<String>,
    pub numeric_floor: u64,
    pub placeholder_prefix: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_keywords: ["spam", "fraud", "scam"].into_iter().map(String::from).collect(),
            blocked_prefixes: Vec::new(),
            blocked_suffixes: Vec::new(),
            numeric_floor: DEFAULT_NUMERIC_FLOOR,
            placeholder_prefix: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub master_dirs: Vec<PathBuf>,
    pub compare_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub extraction: ExtractionConfig,
    pub filter: FilterConfig,
    pub sort: SortOrder,
    pub unique_names: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            master_dirs: Vec::new(),
            compare_dirs: Vec::new(),
            output_dir: PathBuf::from("./reports"),
            batch_size: 500,
            extraction: ExtractionConfig::default(),
            filter: FilterConfig::default(),
            sort: SortOrder::Name,
            unique_names: true,
        }
    }
}

impl ReconcileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// `MCF_CONFIG` (or `./mcf.yaml` when present, else defaults) plus env overrides.
    pub fn from_env() -> Result<Self> {
        Self::resolve(None)
    }

    /// An explicit path wins over `MCF_CONFIG`; env overrides apply either way.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::resolve_with(explicit, |key| std::env::var(key).ok())
    }

    pub fn resolve_with(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| lookup("MCF_CONFIG").map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::load(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("MCF_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("MCF_BATCH_SIZE") {
            self.batch_size = size
                .trim()
                .parse()
                .with_context(|| format!("MCF_BATCH_SIZE={size} is not a positive integer"))?;
        }
        if let Some(flag) = lookup("MCF_UNIQUE_NAMES") {
            self.unique_names = matches!(flag.trim(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(sort) = lookup("MCF_SORT") {
            self.sort = sort.parse()?;
        }
        Ok(())
    }
}

fn placeholder_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(name|caller)").expect("placeholder pattern compiles"))
}

/// Names that carry no information about the subscriber.
pub fn is_placeholder_name(name: &str) -> bool {
    let name = name.trim();
    name == "0" || placeholder_name_re().is_match(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum RejectReason {
    EmptyPhone,
    /// Re-seen phone whose only name is the number itself.
    NameIsPhone,
    BlockedKeyword(String),
    BelowNumericFloor,
    BlockedPrefix(String),
    BlockedSuffix(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPhone => f.write_str("empty phone"),
            Self::NameIsPhone => f.write_str("name is the phone number"),
            Self::BlockedKeyword(k) => write!(f, "blocked keyword `{k}`"),
            Self::BelowNumericFloor => f.write_str("below numeric floor"),
            Self::BlockedPrefix(p) => write!(f, "blocked prefix `{p}`"),
            Self::BlockedSuffix(s) => write!(f, "blocked suffix `{s}`"),
        }
    }
}

/// Admissibility rules for comparison candidates.
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    blocked_keywords: Vec<String>,
    blocked_prefixes: Vec<String>,
    blocked_suffixes: Vec<String>,
    numeric_floor: u64,
    placeholder_prefix: String,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

fn non_empty(values: &[String], lowercase: bool) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| if lowercase { v.to_lowercase() } else { v.to_string() })
        .collect()
}

impl FilterPolicy {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            blocked_keywords: non_empty(&config.blocked_keywords, true),
            blocked_prefixes: non_empty(&config.blocked_prefixes, false),
            blocked_suffixes: non_empty(&config.blocked_suffixes, false),
            numeric_floor: config.numeric_floor,
            placeholder_prefix: config.placeholder_prefix.trim().to_string(),
        }
    }

    /// `"<prefix> <last five digits>"`.
    pub fn placeholder_for(&self, phone: &str) -> String {
        let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
        let tail: String = digits[digits.len().saturating_sub(5)..].iter().collect();
        format!("{} {}", self.placeholder_prefix, tail)
    }

    /// Replaces empty, numeric-echo and placeholder names with a synthesized one.
    pub fn resolve_name(&self, phone: &str, name: &str) -> String {
        let name = if name.is_empty() { phone } else { name };
        if name == phone || is_placeholder_name(name) {
            self.placeholder_for(phone)
        } else {
            name.to_string()
        }
    }

    pub fn check(&self, identity: &Identity, already_stored: bool) -> Result<(), RejectReason> {
        if already_stored && identity.phone == identity.name {
            return Err(RejectReason::NameIsPhone);
        }
        let lowered = identity.name.to_lowercase();
        if let Some(keyword) = self.blocked_keywords.iter().find(|k| lowered.contains(k.as_str())) {
            return Err(RejectReason::BlockedKeyword(keyword.clone()));
        }
        match phone_numeric_value(&identity.phone) {
            Some(value) if value > self.numeric_floor => {}
            _ => return Err(RejectReason::BelowNumericFloor),
        }
        if let Some(prefix) = self.blocked_prefixes.iter().find(|p| identity.phone.starts_with(p.as_str())) {
            return Err(RejectReason::BlockedPrefix(prefix.clone()));
        }
        if let Some(suffix) = self.blocked_suffixes.iter().find(|s| identity.phone.ends_with(s.as_str())) {
            return Err(RejectReason::BlockedSuffix(suffix.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An identity with the same phone was overwritten.
    Replaced,
    Rejected(RejectReason),
}

/// Phone-keyed identities plus raw occurrence counts for one corpus.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationStore {
    identities: BTreeMap<String, Identity>,
    duplicate_frequency: BTreeMap<String, usize>,
}

impl ReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Master insertion: counts the occurrence, last writer wins.
    pub fn upsert(&mut self, identity: Identity) -> InsertOutcome {
        if identity.phone.is_empty() {
            return InsertOutcome::Rejected(RejectReason::EmptyPhone);
        }
        self.record_occurrence(&identity.phone);
        self.put(identity)
    }

    /// Comparison insertion: counts the occurrence, resolves the name, then applies `policy`.
    pub fn insert_candidate(&mut self, mut identity: Identity, policy: &FilterPolicy) -> InsertOutcome {
        if identity.phone.is_empty() {
            return InsertOutcome::Rejected(RejectReason::EmptyPhone);
        }
        self.record_occurrence(&identity.phone);
        identity.name = policy.resolve_name(&identity.phone, &identity.name);
        let already_stored = self.identities.contains_key(&identity.phone);
        match policy.check(&identity, already_stored) {
            Ok(()) => self.put(identity),
            Err(reason) => InsertOutcome::Rejected(reason),
        }
    }

    fn record_occurrence(&mut self, phone: &str) {
        *self.duplicate_frequency.entry(phone.to_string()).or_default() += 1;
    }

    fn put(&mut self, identity: Identity) -> InsertOutcome {
        match self.identities.insert(identity.phone.clone(), identity) {
            Some(_) => InsertOutcome::Replaced,
            None => InsertOutcome::Inserted,
        }
    }

    pub fn get(&self, phone: &str) -> Option<&Identity> {
        self.identities.get(phone)
    }

    pub fn contains(&self, phone: &str) -> bool {
        self.identities.contains_key(phone)
    }

    /// Stored identities in ascending phone order.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn phones(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn frequency(&self, phone: &str) -> usize {
        self.duplicate_frequency.get(phone).copied().unwrap_or(0)
    }

    pub fn duplicate_frequency(&self) -> &BTreeMap<String, usize> {
        &self.duplicate_frequency
    }

    /// Every extracted identity, accepted or not.
    pub fn total_occurrences(&self) -> usize {
        self.duplicate_frequency.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSet {
    pub identities: Vec<Identity>,
    /// Lowercased name to count over the missing identities.
    pub name_frequency: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct MissingSetComputer {
    sort: SortOrder,
    unique_names: bool,
}

impl MissingSetComputer {
    pub fn new(sort: SortOrder, unique_names: bool) -> Self {
        Self { sort, unique_names }
    }

    pub fn compute(&self, master: &ReconciliationStore, compare: &ReconciliationStore) -> MissingSet {
        let master_tails: HashSet<String> = master.phones().filter_map(short_phone).collect();

        let mut name_frequency = BTreeMap::<String, usize>::new();
        let mut missing = Vec::new();
        for identity in compare.identities() {
            let short = short_phone(&identity.phone);
            let known = master.contains(&identity.phone)
                || short
                    .as_deref()
                    .is_some_and(|s| master.contains(s) || master_tails.contains(s));
            if known {
                continue;
            }
            *name_frequency.entry(identity.name.to_lowercase()).or_default() += 1;
            missing.push(identity.clone());
        }

        sort_identities(&mut missing, self.sort);
        let identities = if self.unique_names {
            disambiguate_names(&missing, &name_frequency)
        } else {
            missing
        };
        MissingSet {
            identities,
            name_frequency,
        }
    }
}

/// Stable sort; ties keep their incoming order.
pub fn sort_identities(identities: &mut [Identity], order: SortOrder) {
    match order {
        SortOrder::Name => {
            identities.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        }
        SortOrder::Phone => identities.sort_by_key(|i| phone_numeric_value(&i.phone).unwrap_or(u64::MAX)),
    }
}

/// Suffixes `(k)` onto names shared by several missing identities; `sorted` must already
/// be in output order so equal names are adjacent.
pub fn disambiguate_names(sorted: &[Identity], name_frequency: &BTreeMap<String, usize>) -> Vec<Identity> {
    let mut out = Vec::with_capacity(sorted.len());
    let mut previous: Option<String> = None;
    let mut counter = 0usize;
    for identity in sorted {
        let key = identity.name.to_lowercase();
        if name_frequency.get(&key).copied().unwrap_or(0) > 1 {
            counter = if previous.as_deref() == Some(key.as_str()) {
                counter + 1
            } else {
                1
            };
            out.push(Identity::new(
                identity.phone.clone(),
                format!("{} ({counter})", identity.name),
            ));
        } else {
            out.push(identity.clone());
        }
        previous = Some(key);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corpus {
    Master,
    Compare,
}

impl fmt::Display for Corpus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Master => "master",
            Self::Compare => "compare",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTally {
    pub records: usize,
    pub identities: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTotal {
    pub corpus: Corpus,
    pub path: String,
    pub records: usize,
    pub identities: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub corpus: Corpus,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_files: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    /// Regular files without a registered reader.
    pub skipped_files: usize,
    pub records_read: usize,
    pub total_master: usize,
    pub unique_master: usize,
    pub total_compare: usize,
    pub unique_compare: usize,
    pub filtered_compare: usize,
    pub missing: usize,
    pub per_source: Vec<SourceTotal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub key: String,
    pub count: usize,
}

/// Sorted descending by count, then ascending by key.
pub fn frequency_entries(table: &BTreeMap<String, usize>) -> Vec<FrequencyEntry> {
    let mut entries: Vec<FrequencyEntry> = table
        .iter()
        .map(|(key, count)| FrequencyEntry {
            key: key.clone(),
            count: *count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateTables {
    pub master_phone: Vec<FrequencyEntry>,
    pub compare_phone: Vec<FrequencyEntry>,
    pub missing_name: Vec<FrequencyEntry>,
}

impl DuplicateTables {
    pub fn tables(&self) -> [(&'static str, &[FrequencyEntry]); 3] {
        [
            ("master_phone", self.master_phone.as_slice()),
            ("compare_phone", self.compare_phone.as_slice()),
            ("missing_name", self.missing_name.as_slice()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub missing: Vec<Identity>,
    pub duplicates: DuplicateTables,
    pub stats: RunStats,
    pub file_errors: Vec<FileError>,
}

/// Owns both stores for one run and drives ingestion.
#[derive(Debug)]
pub struct Reconciler {
    extractor: IdentityExtractor,
    policy: FilterPolicy,
    computer: MissingSetComputer,
    batch_size: usize,
    excluded: Vec<PathBuf>,
    master: ReconciliationStore,
    compare: ReconciliationStore,
    stats: RunStats,
    file_errors: Vec<FileError>,
}

impl Reconciler {
    pub fn new(config: &ReconcileConfig) -> Self {
        Self {
            extractor: IdentityExtractor::new(&config.extraction),
            policy: FilterPolicy::new(&config.filter),
            computer: MissingSetComputer::new(config.sort, config.unique_names),
            batch_size: config.batch_size.max(1),
            excluded: Vec::new(),
            master: ReconciliationStore::new(),
            compare: ReconciliationStore::new(),
            stats: RunStats::default(),
            file_errors: Vec::new(),
        }
    }

    /// Skips `path` and everything below it during traversal.
    pub fn exclude(&mut self, path: &Path) {
        if let Ok(path) = std::fs::canonicalize(path) {
            self.excluded.push(path);
        }
    }

    pub fn master(&self) -> &ReconciliationStore {
        &self.master
    }

    pub fn compare(&self) -> &ReconciliationStore {
        &self.compare
    }

    pub fn add_master(&mut self, identity: Identity) -> InsertOutcome {
        self.master.upsert(identity)
    }

    pub fn add_compare(&mut self, identity: Identity) -> InsertOutcome {
        let outcome = self.compare.insert_candidate(identity, &self.policy);
        if let InsertOutcome::Rejected(reason) = &outcome {
            self.stats.filtered_compare += 1;
            debug!(%reason, "comparison candidate rejected");
        }
        outcome
    }

    /// Extracts and inserts the identities of one record, returning how many were extracted.
    pub fn ingest_record(&mut self, corpus: Corpus, record: &RawRecord) -> usize {
        let identities = self.extractor.extract(record);
        let extracted = identities.len();
        for identity in identities {
            match corpus {
                Corpus::Master => self.add_master(identity),
                Corpus::Compare => self.add_compare(identity),
            };
        }
        extracted
    }

    pub fn ingest_stream(&mut self, corpus: Corpus, stream: RecordStream) -> Result<FileTally, ReaderError> {
        let mut tally = FileTally::default();
        for batch in batched(stream, self.batch_size) {
            for record in batch {
                let record = record?;
                tally.records += 1;
                self.stats.records_read += 1;
                tally.identities += self.ingest_record(corpus, &record);
            }
        }
        Ok(tally)
    }

    pub fn ingest_file(&mut self, corpus: Corpus, path: &Path) -> Result<FileTally, ReaderError> {
        let span = info_span!("ingest_file", path = %path.display());
        let _guard = span.enter();
        let (kind, stream) = open_records(path)?;
        let tally = self.ingest_stream(corpus, stream)?;
        debug!(?kind, records = tally.records, identities = tally.identities, "ingested file");
        Ok(tally)
    }

    /// Walks every root in file-name order. Unreadable roots abort; per-file failures are
    /// recorded and skipped.
    pub fn ingest_corpus(&mut self, corpus: Corpus, roots: &[PathBuf]) -> Result<()> {
        let span = info_span!("ingest_corpus", %corpus);
        let _guard = span.enter();

        for root in roots {
            let root = std::fs::canonicalize(root)
                .with_context(|| format!("{corpus} corpus root {} is not readable", root.display()))?;
            if !root.is_dir() {
                bail!("{corpus} corpus root {} is not a directory", root.display());
            }
            std::fs::read_dir(&root)
                .with_context(|| format!("listing {corpus} corpus root {}", root.display()))?;
            info!(root = %root.display(), "ingesting corpus root");

            let excluded = self.excluded.clone();
            let walker = WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(move |entry| {
                    !is_hidden(entry) && !excluded.iter().any(|x| entry.path().starts_with(x))
                });

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                        self.record_walk_error(corpus, &path, err.to_string());
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                self.stats.total_files += 1;
                let path = entry.path();
                if !has_supported_extension(path) {
                    self.stats.skipped_files += 1;
                    debug!(path = %path.display(), "skipping file without a reader");
                    continue;
                }
                match self.ingest_file(corpus, path) {
                    Ok(tally) => {
                        self.stats.processed_files += 1;
                        self.stats.per_source.push(SourceTotal {
                            corpus,
                            path: path.display().to_string(),
                            records: tally.records,
                            identities: tally.identities,
                        });
                    }
                    Err(err) => self.record_file_error(corpus, path, err.to_string()),
                }
            }
        }
        Ok(())
    }

    /// An entry that could not be visited still counts as a file seen.
    fn record_walk_error(&mut self, corpus: Corpus, path: &Path, message: String) {
        self.stats.total_files += 1;
        self.record_file_error(corpus, path, message);
    }

    fn record_file_error(&mut self, corpus: Corpus, path: &Path, message: String) {
        warn!(%corpus, path = %path.display(), error = %message, "failed to ingest file; continuing");
        self.stats.failed_files += 1;
        self.file_errors.push(FileError {
            corpus,
            path: path.display().to_string(),
            message,
        });
    }

    pub fn finish(mut self) -> ReconcileOutcome {
        let missing = self.computer.compute(&self.master, &self.compare);

        self.stats.total_master = self.master.total_occurrences();
        self.stats.unique_master = self.master.len();
        self.stats.total_compare = self.compare.total_occurrences();
        self.stats.unique_compare = self.compare.len();
        self.stats.missing = missing.identities.len();

        let duplicates = DuplicateTables {
            master_phone: frequency_entries(self.master.duplicate_frequency()),
            compare_phone: frequency_entries(self.compare.duplicate_frequency()),
            missing_name: frequency_entries(&missing.name_frequency),
        };

        info!(
            total_master = self.stats.total_master,
            unique_master = self.stats.unique_master,
            total_compare = self.stats.total_compare,
            unique_compare = self.stats.unique_compare,
            missing = self.stats.missing,
            failed_files = self.stats.failed_files,
            "reconciliation finished"
        );

        ReconcileOutcome {
            missing: missing.identities,
            duplicates,
            stats: self.stats,
            file_errors: self.file_errors,
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Blocking: ingests the master corpus fully, then the comparison corpus, then diffs.
pub fn reconcile(config: &ReconcileConfig) -> Result<ReconcileOutcome> {
    if config.master_dirs.is_empty() {
        bail!("no master corpus directories configured");
    }
    if config.compare_dirs.is_empty() {
        bail!("no comparison corpus directories configured");
    }
    let mut reconciler = Reconciler::new(config);
    reconciler.exclude(&config.output_dir);
    reconciler.ingest_corpus(Corpus::Master, &config.master_dirs)?;
    reconciler.ingest_corpus(Corpus::Compare, &config.compare_dirs)?;
    Ok(reconciler.finish())
}

#[derive(Debug, Clone, Serialize)]
struct RunRecord<'a> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status: &'static str,
    config: &'a ReconcileConfig,
    stats: &'a RunStats,
    file_errors: &'a [FileError],
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub file_errors: Vec<FileError>,
    pub run_dir: String,
    pub manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputManifest {
    pub schema_version: u32,
    pub files: Vec<OutputManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    store: OutputStore,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig) -> Self {
        let store = OutputStore::new(config.output_dir.clone());
        Self { config, store }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting reconciliation run");

        let config = self.config.clone();
        let outcome = tokio::task::spawn_blocking(move || reconcile(&config))
            .await
            .context("ingestion task did not complete")??;

        let finished_at = Utc::now();
        let run_dir = PathBuf::from(run_id.to_string());
        let mut written = self
            .write_reports(&run_dir, run_id, started_at, finished_at, &outcome)
            .await?;
        written.extend(self.export_parquet_snapshots(&run_dir, &outcome).await?);
        let manifest = self.write_manifest(&run_dir, &written).await?;

        info!(%run_id, missing = outcome.stats.missing, run_dir = %self.store.root().join(&run_dir).display(), "run complete");
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            stats: outcome.stats,
            file_errors: outcome.file_errors,
            run_dir: self.store.root().join(&run_dir).display().to_string(),
            manifest: manifest.absolute_path.display().to_string(),
        })
    }

    async fn write_reports(
        &self,
        run_dir: &Path,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: &ReconcileOutcome,
    ) -> Result<Vec<(&'static str, StoredOutput)>> {
        let mut written = Vec::new();

        let vcards = render_vcards(&outcome.missing);
        written.push((
            "missing_vcard",
            self.store
                .write_bytes(run_dir.join("missing.vcf"), vcards.as_bytes())
                .await
                .context("writing missing.vcf")?,
        ));

        let csv = render_csv(&outcome.missing).context("serializing missing.csv")?;
        written.push((
            "missing_csv",
            self.store
                .write_bytes(run_dir.join("missing.csv"), &csv)
                .await
                .context("writing missing.csv")?,
        ));

        let markdown = render_duplicates_markdown(run_id, outcome);
        written.push((
            "duplicates",
            self.store
                .write_bytes(run_dir.join("duplicates.md"), markdown.as_bytes())
                .await
                .context("writing duplicates.md")?,
        ));

        let record = RunRecord {
            run_id,
            started_at,
            finished_at,
            status: "completed",
            config: &self.config,
            stats: &outcome.stats,
            file_errors: &outcome.file_errors,
        };
        let summary = serde_json::to_vec_pretty(&record).context("serializing run summary")?;
        written.push((
            "run_summary",
            self.store
                .write_bytes(run_dir.join("run_summary.json"), &summary)
                .await
                .context("writing run_summary.json")?,
        ));

        Ok(written)
    }

    async fn export_parquet_snapshots(
        &self,
        run_dir: &Path,
        outcome: &ReconcileOutcome,
    ) -> Result<Vec<(&'static str, StoredOutput)>> {
        let snapshots = run_dir.join("snapshots");
        let missing = parquet_bytes(missing_batch(&outcome.missing)?)?;
        let duplicates = parquet_bytes(duplicates_batch(&outcome.duplicates)?)?;
        Ok(vec![
            (
                "missing_snapshot",
                self.store
                    .write_bytes(snapshots.join("missing.parquet"), &missing)
                    .await
                    .context("writing missing.parquet")?,
            ),
            (
                "duplicates_snapshot",
                self.store
                    .write_bytes(snapshots.join("duplicates.parquet"), &duplicates)
                    .await
                    .context("writing duplicates.parquet")?,
            ),
        ])
    }

    async fn write_manifest(
        &self,
        run_dir: &Path,
        written: &[(&'static str, StoredOutput)],
    ) -> Result<StoredOutput> {
        let manifest = OutputManifest {
            schema_version: 1,
            files: written
                .iter()
                .map(|(name, stored)| manifest_entry(name, run_dir, stored))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing output manifest")?;
        self.store
            .write_bytes(run_dir.join("snapshots").join("manifest.json"), &bytes)
            .await
            .context("writing manifest.json")
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = ReconcileConfig::from_env()?;
    ReconcilePipeline::new(config).run_once().await
}

fn manifest_entry(name: &str, run_dir: &Path, stored: &StoredOutput) -> OutputManifestFile {
    let rel = stored
        .relative_path
        .strip_prefix(run_dir)
        .unwrap_or(&stored.relative_path)
        .display()
        .to_string();
    OutputManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: stored.content_hash.clone(),
        bytes: stored.byte_size as u64,
    }
}

fn render_frequency_section(title: &str, entries: &[FrequencyEntry]) -> String {
    let lines: Vec<String> = entries
        .iter()
        .filter(|e| e.count > 1)
        .map(|e| format!("- {}: {}", e.key, e.count))
        .collect();
    let body = if lines.is_empty() {
        "- none".to_string()
    } else {
        lines.join("\n")
    };
    format!("## {title}\n{body}\n")
}

pub fn render_duplicates_markdown(run_id: Uuid, outcome: &ReconcileOutcome) -> String {
    let stats = &outcome.stats;
    let mut out = format!(
        "# MCF Duplicate Report\n\n- Run ID: `{run_id}`\n- Master identities: {} total, {} unique\n- Comparison identities: {} total, {} unique, {} filtered\n- Missing: {}\n- Files: {} seen, {} processed, {} failed, {} skipped\n\n",
        stats.total_master,
        stats.unique_master,
        stats.total_compare,
        stats.unique_compare,
        stats.filtered_compare,
        stats.missing,
        stats.total_files,
        stats.processed_files,
        stats.failed_files,
        stats.skipped_files,
    );
    out.push_str(&render_frequency_section("Master Phone Duplicates", &outcome.duplicates.master_phone));
    out.push('\n');
    out.push_str(&render_frequency_section("Comparison Phone Duplicates", &outcome.duplicates.compare_phone));
    out.push('\n');
    out.push_str(&render_frequency_section("Missing Name Duplicates", &outcome.duplicates.missing_name));

    out.push_str("\n## Sources\n");
    if stats.per_source.is_empty() {
        out.push_str("- none\n");
    }
    for source in &stats.per_source {
        out.push_str(&format!(
            "- [{}] {}: {} records, {} identities\n",
            source.corpus, source.path, source.records, source.identities
        ));
    }

    if !outcome.file_errors.is_empty() {
        out.push_str("\n## File Errors\n");
        for error in &outcome.file_errors {
            out.push_str(&format!("- [{}] {}: {}\n", error.corpus, error.path, error.message));
        }
    }
    out
}

/// Markdown digest of the most recent `runs` runs under `output_dir`, newest first.
pub fn report_runs_markdown(runs: usize, output_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(output_dir)
        .with_context(|| format!("reading {}", output_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# MCF Run Report".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push(format!("No runs found under `{}`.", output_dir.display()));
    }
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let stat = |key: &str| {
            summary
                .get("stats")
                .and_then(|s| s.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let finished = summary
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {finished}"));
        lines.push(format!(
            "- master: {} total / {} unique",
            stat("total_master"),
            stat("unique_master")
        ));
        lines.push(format!(
            "- comparison: {} total / {} unique ({} filtered)",
            stat("total_compare"),
            stat("unique_compare"),
            stat("filtered_compare")
        ));
        lines.push(format!("- missing: {}", stat("missing")));
        lines.push(format!(
            "- files: {} processed, {} failed",
            stat("processed_files"),
            stat("failed_files")
        ));
        lines.push(format!("- missing contacts: `{}`", dir.path().join("missing.vcf").display()));
        if manifest_path.exists() {
            lines.push(format!("- manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn parquet_bytes(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut writer =
        ArrowWriter::try_new(Vec::new(), batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn missing_batch(missing: &[Identity]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("phone", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("short_phone", DataType::Utf8, true),
    ]));
    let shorts: Vec<Option<String>> = missing.iter().map(|i| short_phone(&i.phone)).collect();
    let phone = StringArray::from(missing.iter().map(|i| i.phone.as_str()).collect::<Vec<_>>());
    let name = StringArray::from(missing.iter().map(|i| i.name.as_str()).collect::<Vec<_>>());
    let short = StringArray::from(shorts.iter().map(|s| s.as_deref()).collect::<Vec<_>>());
    RecordBatch::try_new(schema, vec![Arc::new(phone), Arc::new(name), Arc::new(short)])
        .context("building missing record batch")
}

fn duplicates_batch(tables: &DuplicateTables) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt64, false),
    ]));
    let mut table = Vec::new();
    let mut key = Vec::new();
    let mut count = Vec::new();
    for (name, entries) in tables.tables() {
        for entry in entries {
            table.push(name);
            key.push(entry.key.as_str());
            count.push(entry.count as u64);
        }
    }
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(table)),
            Arc::new(StringArray::from(key)),
            Arc::new(UInt64Array::from(count)),
        ],
    )
    .context("building duplicates record batch")
}
