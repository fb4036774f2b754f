use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

/// A raw operational record as handed over by the record store.
pub type Record = serde_json::Map<String, Value>;

/// How a column pulls its rendered value out of a record.
///
/// Paths are dotted (`customer.name`) and walk nested objects.
#[derive(Clone, Copy)]
pub enum Extractor {
    Text(&'static str),
    /// Calendar date, `YYYY-MM-DD`
    Date(&'static str),
    /// UTC timestamp, RFC 3339 to the second
    DateTime(&'static str),
    /// Two-decimal amount
    Money(&'static str),
    /// `Yes` / `No`
    Flag(&'static str),
    /// Non-empty values at the given paths joined with `", "`
    Joined(&'static [&'static str]),
    Custom(fn(&Record) -> String),
}

/// One exportable field of an entity.
#[derive(Clone, Copy)]
pub struct ColumnDef {
    pub key: &'static str,
    pub label: &'static str,
    pub extractor: Extractor,
}

impl ColumnDef {
    pub const fn new(key: &'static str, label: &'static str, extractor: Extractor) -> Self {
        Self { key, label, extractor }
    }

    pub const fn text(key: &'static str, label: &'static str) -> Self {
        Self::new(key, label, Extractor::Text(key))
    }

    pub fn render(&self, record: &Record) -> String {
        match self.extractor {
            Extractor::Text(path) => lookup(record, path).map(render_value).unwrap_or_default(),
            Extractor::Date(path) => lookup(record, path).map(render_date).unwrap_or_default(),
            Extractor::DateTime(path) => lookup(record, path).map(render_datetime).unwrap_or_default(),
            Extractor::Money(path) => lookup(record, path).map(render_money).unwrap_or_default(),
            Extractor::Flag(path) => lookup(record, path).map(render_flag).unwrap_or_default(),
            Extractor::Joined(paths) => paths
                .iter()
                .filter_map(|p| lookup(record, p))
                .map(render_value)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            Extractor::Custom(f) => f(record),
        }
    }
}

impl std::fmt::Debug for ColumnDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnDef")
            .field("key", &self.key)
            .field("label", &self.label)
            .finish()
    }
}

/// One projected row: column key to rendered cell, in projection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportRow {
    cells: Vec<(&'static str, String)>,
}

impl ExportRow {
    pub fn with_capacity(columns: usize) -> Self {
        Self { cells: Vec::with_capacity(columns) }
    }

    pub fn push(&mut self, key: &'static str, value: String) {
        self.cells.push((key, value));
    }

    /// Rendered value for `key`; absent columns render empty.
    pub fn get(&self, key: &str) -> &str {
        self.cells
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Resolve a dotted path. `null` counts as missing.
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Plain rendering used by text columns.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(arr) => arr
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Parse either an RFC 3339 timestamp or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn render_date(value: &Value) -> String {
    match value {
        Value::String(s) => parse_instant(s)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| s.clone()),
        other => render_value(other),
    }
}

fn render_datetime(value: &Value) -> String {
    match value {
        Value::String(s) => parse_instant(s)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| s.clone()),
        other => render_value(other),
    }
}

fn render_money(value: &Value) -> String {
    let parsed = match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    };
    match parsed {
        Some(amount) => format!(
            "{:.2}",
            amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        ),
        None => render_value(value),
    }
}

fn render_flag(value: &Value) -> String {
    let truthy = match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    };
    match truthy {
        Some(true) => "Yes".to_string(),
        Some(false) => "No".to_string(),
        None => render_value(value),
    }
}
