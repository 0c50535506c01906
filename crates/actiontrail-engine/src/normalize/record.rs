use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use actiontrail_core::errors::NormalizeError;
use actiontrail_core::path::as_identifier;
use actiontrail_core::{Change, Operation};

/// A model instance as an ORM reports it after a save.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordSnapshot {
    pub table_name: Option<String>,
    pub plural_name: Option<String>,
    pub singular_name: Option<String>,
    pub id: Option<Value>,
    /// Set when the save inserted the row.
    pub is_new: bool,
    pub previous: Option<Map<String, Value>>,
    pub current: Option<Map<String, Value>>,
    /// Attribute names the save wrote.
    pub changed: Option<Vec<String>>,
}

impl RecordSnapshot {
    /// Table name, else the model's plural name, else its singular name.
    pub fn model(&self) -> Option<&str> {
        [&self.table_name, &self.plural_name, &self.singular_name]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|name| !name.is_empty())
    }
}

pub fn change_from_record(record: &RecordSnapshot) -> Result<Change, NormalizeError> {
    let model = record.model().ok_or_else(|| NormalizeError::Expected {
        expected: "model name".into(),
        found: "none".into(),
    })?;

    let operation = if record.is_new {
        Operation::Create
    } else {
        Operation::Update
    };
    let mut change = Change::new(model, operation);

    let id = record
        .id
        .as_ref()
        .or_else(|| record.current.as_ref().and_then(|c| c.get("id")))
        .and_then(as_identifier);
    if let Some(id) = id {
        change = change.with_id(id);
    }
    if let Some(previous) = &record.previous {
        change = change.with_before(previous.clone());
    }
    if let Some(current) = &record.current {
        change = change.with_after(current.clone());
    }
    if let Some(changed) = &record.changed {
        let mut meta = Map::new();
        meta.insert("changed".into(), Value::from(changed.clone()));
        change = change.with_meta(meta);
    }
    Ok(change)
}
