//! Field-level JSON diffs for audit entries.
//!
//! Objects are flattened into dotted paths; arrays, scalars and empty
//! objects are leaves. Keys must not contain `.`. `null` and absent are the
//! same thing, so a removed key shows up as a change whose `after` is `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Flatten `value` into `path → leaf` pairs, dropping nulls.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            let before = out.len();
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, path, out);
            }
            if out.len() == before && !prefix.is_empty() {
                let _ = out.insert(prefix, Value::Object(serde_json::Map::new()));
            }
        }
        leaf => {
            let _ = out.insert(prefix, leaf.clone());
        }
    }
}

/// Changes that turn `before` into `after`, ordered by field path.
pub fn diff(before: &Value, after: &Value) -> Vec<FieldChange> {
    let old = flatten(before);
    let new = flatten(after);
    let mut changes = Vec::new();

    for (field, before_val) in &old {
        match new.get(field) {
            Some(after_val) if after_val == before_val => {}
            Some(after_val) => changes.push(FieldChange {
                field: field.clone(),
                before: before_val.clone(),
                after: after_val.clone(),
            }),
            None => changes.push(FieldChange {
                field: field.clone(),
                before: before_val.clone(),
                after: Value::Null,
            }),
        }
    }
    for (field, after_val) in &new {
        if !old.contains_key(field) {
            changes.push(FieldChange {
                field: field.clone(),
                before: Value::Null,
                after: after_val.clone(),
            });
        }
    }

    changes.sort_by(|a, b| a.field.cmp(&b.field));
    changes
}

/// Replay `changes` over a flattened snapshot.
pub fn apply(flat: &mut BTreeMap<String, Value>, changes: &[FieldChange]) {
    for change in changes {
        if change.after.is_null() {
            let _ = flat.remove(&change.field);
        } else {
            let _ = flat.insert(change.field.clone(), change.after.clone());
        }
    }
}
