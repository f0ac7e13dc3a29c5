// ABOUTME: Converts raw ERP XML responses into typed relational records
// ABOUTME: Flattens positional field tags into rows, then coerces each cell by semantic type

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::erp::compiler::BLANK_SENTINEL;
use crate::error::{SyncError, SyncResult};
use crate::table_spec::{FieldIndex, SemanticType, TableSpec, GUID_FIELD, PARENT_GUID_FIELD};

const ROW_BREAK: char = '\n';
const FIELD_DELIMITER: char = '\t';

/// One extracted row: output field name → coerced value, in declared order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(Map<String, JsonValue>);

impl Record {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn guid(&self) -> Option<&str> {
        self.0.get(GUID_FIELD).and_then(JsonValue::as_str)
    }

    pub fn insert(&mut self, field: &str, value: JsonValue) {
        self.0.insert(field.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

/// Where a batch of records came from; stamped onto every record before replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub tenant_id: String,
    pub sub_tenant_id: String,
    pub extracted_at: DateTime<Utc>,
    pub source: String,
}

impl Provenance {
    pub fn new(tenant_id: &str, sub_tenant_id: &str, source: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            sub_tenant_id: sub_tenant_id.to_string(),
            extracted_at: Utc::now(),
            source: source.to_string(),
        }
    }
}

impl Record {
    /// Add tenant identifiers and extraction metadata. Together with the GUID
    /// the tenant fields form the natural key the store upserts on.
    pub fn stamp(&mut self, provenance: &Provenance) {
        self.insert("tenant_id", JsonValue::String(provenance.tenant_id.clone()));
        self.insert(
            "sub_tenant_id",
            JsonValue::String(provenance.sub_tenant_id.clone()),
        );
        self.insert(
            "_extracted_at",
            JsonValue::String(
                provenance
                    .extracted_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        );
        self.insert("_source", JsonValue::String(provenance.source.clone()));
    }
}

impl From<Map<String, JsonValue>> for Record {
    fn from(map: Map<String, JsonValue>) -> Self {
        Record(map)
    }
}

struct Patterns {
    envelope: Regex,
    filler: Regex,
    between_tags: Regex,
    noise: Regex,
    closing_field: Regex,
    first_field: Regex,
    other_field: Regex,
    char_ref: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        envelope: Regex::new(r"(?i)<\?xml[^>]*\?>|</?ENVELOPE>").expect("valid regex"),
        filler: Regex::new(r"(?i)<FLDBLANK>\s*</FLDBLANK>|<FLDBLANK\s*/>").expect("valid regex"),
        between_tags: Regex::new(r">[\r\n\t ]+<").expect("valid regex"),
        noise: Regex::new(r"[\r\n\t]+").expect("valid regex"),
        closing_field: Regex::new(r"</F\d+>").expect("valid regex"),
        first_field: Regex::new(r"<F0*1>").expect("valid regex"),
        other_field: Regex::new(r"<F\d+>").expect("valid regex"),
        char_ref: Regex::new(r"&#(x[0-9A-Fa-f]+|[0-9]+);").expect("valid regex"),
    })
}

/// Stage (a): strip tags and collapse the response into delimited lines.
///
/// The first field tag of a row starts a new line and every later field tag
/// starts a new cell. Entities stay escaped here; cells are unescaped one by
/// one after splitting so an escaped tab in the data never becomes a delimiter.
pub fn flatten(raw: &str) -> String {
    let p = patterns();
    let text = p.envelope.replace_all(raw, "");
    let text = p.filler.replace_all(&text, "");
    // Layout whitespace between tags goes; control characters inside a value become a space.
    let text = p.between_tags.replace_all(text.trim(), "><");
    let text = p.noise.replace_all(&text, " ");
    let text = p.closing_field.replace_all(&text, "");
    let text = p.first_field.replace_all(&text, ROW_BREAK.to_string().as_str());
    let text = p.other_field.replace_all(&text, FIELD_DELIMITER.to_string().as_str());
    text.trim_start_matches(ROW_BREAK).to_string()
}

/// Unescape the five predefined XML entities plus numeric character references.
pub fn unescape_xml(text: &str) -> String {
    let text = patterns().char_ref.replace_all(text, |caps: &regex::Captures| {
        let code = &caps[1];
        let parsed = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse::<u32>().ok(),
        };
        parsed
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Stage (b) helper: coerce one raw cell according to its semantic type.
///
/// Total by construction: every input maps to a value, nothing here fails.
pub fn coerce(raw: &str, semantic_type: SemanticType) -> JsonValue {
    let cell = raw.trim();
    let blank = cell.is_empty() || cell == BLANK_SENTINEL;

    match semantic_type {
        SemanticType::Text => {
            if blank {
                JsonValue::String(String::new())
            } else {
                JsonValue::String(cell.to_string())
            }
        }
        SemanticType::Logical => {
            let truthy = matches!(cell.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            JsonValue::Bool(truthy)
        }
        SemanticType::Date => {
            if blank {
                return JsonValue::Null;
            }
            parse_date(cell)
                .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(JsonValue::Null)
        }
        SemanticType::Number | SemanticType::Amount | SemanticType::Quantity | SemanticType::Rate => {
            let value = if blank { 0.0 } else { parse_number(cell) };
            number_value(value)
        }
    }
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%Y%m%d", "%d-%b-%Y", "%d-%b-%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cell, fmt).ok())
}

/// Parse an ERP numeric string; `(-)` prefixes and thousands separators are tolerated.
fn parse_number(cell: &str) -> f64 {
    let (negative, digits) = match cell.strip_prefix("(-)") {
        Some(rest) => (true, rest.trim()),
        None => (false, cell),
    };
    // Quantities carry a unit suffix ("12 Nos"); keep only the leading number.
    let digits = digits.split_whitespace().next().unwrap_or("");
    let cleaned: String = digits.chars().filter(|c| *c != ',').collect();

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => {
            if negative {
                -v
            } else {
                v
            }
        }
        _ => 0.0,
    }
}

fn number_value(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        JsonValue::Number((value as i64).into())
    } else {
        serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::Number(0.into()))
    }
}

/// Detect an ERP-side error reply such as `<RESPONSE>` or `<LINEERROR>`.
fn erp_error(raw: &str) -> Option<String> {
    for tag in ["LINEERROR", "RESPONSE"] {
        let open = format!("<{}>", tag);
        let close = format!("</{}>", tag);
        if let Some(start) = raw.find(&open) {
            let body = &raw[start + open.len()..];
            let end = body.find(&close).unwrap_or(body.len());
            return Some(unescape_xml(body[..end].trim()));
        }
    }
    None
}

/// Parse a raw response into records for `spec`.
///
/// Rows with a blank GUID are dropped; that is the only row-validity check.
/// Line-entity rows are keyed `<parent guid>-<n>`, numbered in response order
/// within each parent, with the parent GUID kept in `parent_guid`.
/// Short rows are padded with blanks before coercion and extra cells are ignored.
pub fn parse(raw: &str, spec: &TableSpec) -> SyncResult<Vec<Record>> {
    let index = spec.field_index()?;
    parse_with_index(raw, &spec.name, &index)
}

/// [`parse`] with a precompiled field index.
pub fn parse_with_index(raw: &str, table: &str, index: &FieldIndex) -> SyncResult<Vec<Record>> {
    if let Some(message) = erp_error(raw) {
        return Err(SyncError::parse(table, format!("ERP reported: {}", message)));
    }
    if !raw.trim().is_empty() && !raw.contains("ENVELOPE") {
        return Err(SyncError::parse(table, "response has no ENVELOPE"));
    }

    let flattened = flatten(raw);
    let mut records = Vec::new();
    // Lines seen so far per parent GUID, for line-entity keys.
    let mut lines_per_parent: HashMap<String, usize> = HashMap::new();

    for line in flattened.split(ROW_BREAK) {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split(FIELD_DELIMITER).collect();

        let guid = cells.get(index.guid_position()).map(|c| c.trim()).unwrap_or("");
        if guid.is_empty() || guid == BLANK_SENTINEL {
            continue;
        }

        let line_key = if index.is_line_entity() {
            let parent = unescape_xml(guid);
            let line = lines_per_parent.entry(parent.clone()).or_insert(0);
            *line += 1;
            Some((format!("{}-{}", parent, line), parent))
        } else {
            None
        };

        let mut map = Map::with_capacity(index.len() + 1);
        for (name, slot) in index.iter() {
            if let (GUID_FIELD, Some((key, parent))) = (name, &line_key) {
                map.insert(GUID_FIELD.to_string(), JsonValue::String(key.clone()));
                map.insert(PARENT_GUID_FIELD.to_string(), JsonValue::String(parent.clone()));
                continue;
            }
            let cell = cells.get(slot.position).copied().unwrap_or("");
            map.insert(name.to_string(), coerce(&unescape_xml(cell), slot.semantic_type));
        }
        records.push(Record(map));
    }

    tracing::debug!("Parsed {} records for '{}'", records.len(), table);
    Ok(records)
}
