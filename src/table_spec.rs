// ABOUTME: Declarative table descriptors that drive extraction and replication
// ABOUTME: Defines TableSpec, FieldDescriptor, semantic types, and the per-table field index

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Output name of the field every table must carry as its natural key.
pub const GUID_FIELD: &str = "guid";

/// Output name that keeps a line entity's parent GUID once its own key is derived.
pub const PARENT_GUID_FIELD: &str = "parent_guid";

/// Change-tracking domain a table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Master,
    Transaction,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Master => "master",
            Partition::Transaction => "transaction",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a field is rendered on the ERP side and coerced on ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    #[default]
    Text,
    Logical,
    Date,
    Number,
    Amount,
    Quantity,
    Rate,
}

impl SemanticType {
    /// Types that coerce to a JSON number.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SemanticType::Number | SemanticType::Amount | SemanticType::Quantity | SemanticType::Rate
        )
    }
}

/// One column of a table: where it comes from, what it is, what it is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Output column name in the remote store
    pub name: String,
    /// ERP-side expression; a bare identifier gets a `$` prefix, anything else passes through
    pub source: String,
    #[serde(rename = "type", default)]
    pub semantic_type: SemanticType,
}

impl FieldDescriptor {
    pub fn new(name: &str, source: &str, semantic_type: SemanticType) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            semantic_type,
        }
    }
}

/// Declarative descriptor of one entity class's extraction query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Set by the config loader from the section the table is declared in
    #[serde(skip, default = "default_partition")]
    pub partition: Partition,
    /// Dotted route into the ERP object model, e.g. `Voucher.AllLedgerEntries`
    #[serde(default)]
    pub collection: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub fetch: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    /// Use the longer bulk timeout on the ERP transport
    #[serde(default)]
    pub bulk: bool,
}

fn default_partition() -> Partition {
    Partition::Master
}

impl TableSpec {
    pub fn new(name: &str, partition: Partition, collection: &str) -> Self {
        Self {
            name: name.to_string(),
            partition,
            collection: collection.to_string(),
            fields: Vec::new(),
            fetch: Vec::new(),
            filters: Vec::new(),
            bulk: false,
        }
    }

    pub fn field(mut self, name: &str, source: &str, semantic_type: SemanticType) -> Self {
        self.fields
            .push(FieldDescriptor::new(name, source, semantic_type));
        self
    }

    pub fn fetch(mut self, item: &str) -> Self {
        self.fetch.push(item.to_string());
        self
    }

    pub fn filter(mut self, expr: &str) -> Self {
        self.filters.push(expr.to_string());
        self
    }

    /// Copy of this spec with one more filter appended after the declared ones.
    pub fn with_filter(&self, expr: String) -> Self {
        let mut spec = self.clone();
        spec.filters.push(expr);
        spec
    }

    /// Path segments of the collection route, empty segments dropped.
    pub fn collection_path(&self) -> Vec<&str> {
        self.collection
            .split('.')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    /// Whether rows are lines nested under a parent object (`Voucher.AllLedgerEntries`).
    ///
    /// Line entities declare `guid` as the parent's GUID (`..Guid`); each row's
    /// natural key becomes `<parent guid>-<line number>`.
    pub fn is_line_entity(&self) -> bool {
        self.collection_path().len() > 1
    }

    /// Check the structural invariants the compiler and extractor rely on.
    pub fn validate(&self) -> SyncResult<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::configuration("table name cannot be empty"));
        }
        if self.collection_path().is_empty() {
            return Err(SyncError::configuration(format!(
                "table '{}' has no collection path",
                self.name
            )));
        }
        if self.fields.is_empty() {
            return Err(SyncError::configuration(format!(
                "table '{}' declares no fields",
                self.name
            )));
        }

        let mut seen = HashMap::new();
        for (position, field) in self.fields.iter().enumerate() {
            if field.name.trim().is_empty() || field.source.trim().is_empty() {
                return Err(SyncError::configuration(format!(
                    "table '{}' field #{} needs both a name and a source",
                    self.name,
                    position + 1
                )));
            }
            if seen.insert(field.name.as_str(), position).is_some() {
                return Err(SyncError::configuration(format!(
                    "table '{}' declares field '{}' more than once",
                    self.name, field.name
                )));
            }
        }

        if self.is_line_entity() && seen.contains_key(PARENT_GUID_FIELD) {
            return Err(SyncError::configuration(format!(
                "table '{}' is a line entity; '{}' is filled from its guid field and cannot be declared",
                self.name, PARENT_GUID_FIELD
            )));
        }

        if !seen.contains_key(GUID_FIELD) {
            return Err(SyncError::configuration(format!(
                "table '{}' must declare a '{}' field",
                self.name, GUID_FIELD
            )));
        }

        Ok(())
    }

    /// Build the positional field index used while parsing responses.
    pub fn field_index(&self) -> SyncResult<FieldIndex> {
        self.validate()?;
        Ok(FieldIndex::new(&self.fields, self.is_line_entity()))
    }
}

/// Position and type of a single field in a response row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    pub position: usize,
    pub semantic_type: SemanticType,
}

/// `name → (position, type)`, compiled once per table so rows never search by name.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    names: Vec<String>,
    slots: HashMap<String, FieldSlot>,
    guid_position: usize,
    line_entity: bool,
}

impl FieldIndex {
    fn new(fields: &[FieldDescriptor], line_entity: bool) -> Self {
        let names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        let slots: HashMap<String, FieldSlot> = fields
            .iter()
            .enumerate()
            .map(|(position, f)| {
                (
                    f.name.clone(),
                    FieldSlot {
                        position,
                        semantic_type: f.semantic_type,
                    },
                )
            })
            .collect();
        let guid_position = slots.get(GUID_FIELD).map(|s| s.position).unwrap_or(0);

        Self {
            names,
            slots,
            guid_position,
            line_entity,
        }
    }

    pub fn is_line_entity(&self) -> bool {
        self.line_entity
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<FieldSlot> {
        self.slots.get(name).copied()
    }

    pub fn guid_position(&self) -> usize {
        self.guid_position
    }

    /// Field names with their slots, in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldSlot)> + '_ {
        self.names
            .iter()
            .map(move |name| (name.as_str(), self.slots[name.as_str()]))
    }
}
