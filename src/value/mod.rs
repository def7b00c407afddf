// Value objects: storage types, attribute values, Entity and the
// append-only Action/Update/Comment records.

use crate::error::{EavError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// The closed set of physical storage types. Each variant maps to exactly
/// one value table; all table routing dispatches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Varchar,
    Int,
    Decimal,
    Text,
    Datetime,
    Multi,
    Fkey,
    Entity,
}

impl StorageType {
    pub const ALL: [StorageType; 8] = [
        StorageType::Varchar,
        StorageType::Int,
        StorageType::Decimal,
        StorageType::Text,
        StorageType::Datetime,
        StorageType::Multi,
        StorageType::Fkey,
        StorageType::Entity,
    ];

    /// The value table backing this storage type.
    pub fn table(&self) -> &'static str {
        match self {
            StorageType::Varchar => "entity_value_varchar",
            StorageType::Int => "entity_value_int",
            StorageType::Decimal => "entity_value_decimal",
            StorageType::Text => "entity_value_text",
            StorageType::Datetime => "entity_value_datetime",
            StorageType::Multi => "entity_value_multi",
            StorageType::Fkey => "entity_value_fkey",
            StorageType::Entity => "entity_value_entity",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Varchar => "varchar",
            StorageType::Int => "int",
            StorageType::Decimal => "decimal",
            StorageType::Text => "text",
            StorageType::Datetime => "datetime",
            StorageType::Multi => "multi",
            StorageType::Fkey => "fkey",
            StorageType::Entity => "entity",
        }
    }

    pub fn parse(s: &str) -> Result<StorageType> {
        match s {
            "varchar" => Ok(StorageType::Varchar),
            "int" => Ok(StorageType::Int),
            "decimal" => Ok(StorageType::Decimal),
            "text" => Ok(StorageType::Text),
            "datetime" => Ok(StorageType::Datetime),
            "multi" => Ok(StorageType::Multi),
            "fkey" => Ok(StorageType::Fkey),
            "entity" => Ok(StorageType::Entity),
            other => Err(EavError::Config(format!("unknown storage type '{other}'"))),
        }
    }

    /// Whether the value table carries a `key` column.
    pub fn keyed(&self) -> bool {
        matches!(self, StorageType::Multi)
    }

    /// The SQLite column affinity of the `value` column.
    pub fn sql_affinity(&self) -> &'static str {
        match self {
            StorageType::Varchar
            | StorageType::Text
            | StorageType::Datetime
            | StorageType::Multi => "TEXT",
            StorageType::Int | StorageType::Fkey | StorageType::Entity => "INTEGER",
            StorageType::Decimal => "REAL",
        }
    }

    /// Whether values of this type reference other entities by id.
    pub fn is_reference(&self) -> bool {
        matches!(self, StorageType::Fkey | StorageType::Entity)
    }
}

/// A single stored scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Decimal(f64),
    Text(String),
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Coerce this value to the attribute's declared storage type.
    ///
    /// Comparison and persistence both run on normalized values, so an
    /// integer written as `"5"` and one written as `5` are the same value
    /// for an int attribute. A value that cannot be coerced is an
    /// integrity error, never compared raw.
    pub fn normalize(&self, storage: StorageType) -> Result<Value> {
        match storage {
            StorageType::Varchar | StorageType::Text | StorageType::Multi => {
                Ok(Value::Text(self.render()))
            }
            StorageType::Int | StorageType::Fkey | StorageType::Entity => match self {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Decimal(f) if f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
                Value::Text(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    EavError::Integrity(format!(
                        "value '{s}' is not coercible to {}",
                        storage.as_str()
                    ))
                }),
                other => Err(EavError::Integrity(format!(
                    "value {other:?} is not coercible to {}",
                    storage.as_str()
                ))),
            },
            StorageType::Decimal => match self {
                Value::Int(n) => Ok(Value::Decimal(*n as f64)),
                Value::Decimal(f) => Ok(Value::Decimal(*f)),
                Value::Text(s) => s.trim().parse::<f64>().map(Value::Decimal).map_err(|_| {
                    EavError::Integrity(format!("value '{s}' is not coercible to decimal"))
                }),
                other => Err(EavError::Integrity(format!(
                    "value {other:?} is not coercible to decimal"
                ))),
            },
            StorageType::Datetime => match self {
                Value::DateTime(dt) => Ok(Value::DateTime(*dt)),
                Value::Text(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
                    .map_err(|_| {
                        EavError::Integrity(format!("value '{s}' is not coercible to datetime"))
                    }),
                other => Err(EavError::Integrity(format!(
                    "value {other:?} is not coercible to datetime"
                ))),
            },
        }
    }

    /// Render as plain text (the varchar/text/multi stored form).
    pub fn render(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Decimal(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::DateTime(dt) => dt.to_rfc3339(),
        }
    }

    /// The SQL parameter form of this value.
    pub fn to_sql(&self) -> rusqlite::types::Value {
        match self {
            Value::Int(n) => rusqlite::types::Value::Integer(*n),
            Value::Decimal(f) => rusqlite::types::Value::Real(*f),
            Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
            Value::DateTime(dt) => rusqlite::types::Value::Text(dt.to_rfc3339()),
        }
    }

    /// Read a raw SQL value back as the declared storage type.
    pub fn from_sql(raw: rusqlite::types::Value, storage: StorageType) -> Option<Value> {
        let interim = match raw {
            rusqlite::types::Value::Null => return None,
            rusqlite::types::Value::Integer(n) => Value::Int(n),
            rusqlite::types::Value::Real(f) => Value::Decimal(f),
            rusqlite::types::Value::Text(s) => Value::Text(s),
            rusqlite::types::Value::Blob(b) => {
                Value::Text(String::from_utf8_lossy(&b).into_owned())
            }
        };
        interim.normalize(storage).ok()
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Decimal(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Decimal(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

/// The full value of one attribute on one entity.
///
/// Repeated rows hydrate as `Many`, multi-type rows as `Keyed` (ordered by
/// key, so hydration is insensitive to physical row order), single rows as
/// `One`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    One(Value),
    Many(Vec<Value>),
    Keyed(BTreeMap<String, Value>),
}

impl AttrValue {
    /// Normalize every scalar to the declared storage type.
    pub fn normalize(&self, storage: StorageType) -> Result<AttrValue> {
        match self {
            AttrValue::One(v) => Ok(AttrValue::One(v.normalize(storage)?)),
            AttrValue::Many(vs) => {
                let mut out = Vec::with_capacity(vs.len());
                for v in vs {
                    out.push(v.normalize(storage)?);
                }
                Ok(AttrValue::Many(out))
            }
            AttrValue::Keyed(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.normalize(storage)?);
                }
                Ok(AttrValue::Keyed(out))
            }
        }
    }

    /// Flatten into (key, scalar) rows, one per physical row to write.
    pub fn rows(&self) -> Vec<(Option<String>, Value)> {
        match self {
            AttrValue::One(v) => vec![(None, v.clone())],
            AttrValue::Many(vs) => vs.iter().map(|v| (None, v.clone())).collect(),
            AttrValue::Keyed(map) => map
                .iter()
                .map(|(k, v)| (Some(k.clone()), v.clone()))
                .collect(),
        }
    }

    /// Every scalar in this value, ignoring keys.
    pub fn scalars(&self) -> Vec<Value> {
        match self {
            AttrValue::One(v) => vec![v.clone()],
            AttrValue::Many(vs) => vs.clone(),
            AttrValue::Keyed(map) => map.values().cloned().collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::One(v) => v.to_json(),
            AttrValue::Many(vs) => serde_json::Value::Array(vs.iter().map(Value::to_json).collect()),
            AttrValue::Keyed(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<Value> for AttrValue {
    fn from(v: Value) -> Self {
        AttrValue::One(v)
    }
}

/// A hydrated entity. Static fields are always present; attribute values
/// are only readable for attributes that were actually loaded.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: i64,
    pub entity_type_id: i64,
    pub store_id: i64,
    pub unique_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub parent_id: Option<i64>,
    loaded: HashSet<i64>,
    data: HashMap<i64, AttrValue>,
}

impl Entity {
    pub(crate) fn new(
        id: i64,
        entity_type_id: i64,
        store_id: i64,
        unique_id: Option<String>,
        updated_at: DateTime<Utc>,
        parent_id: Option<i64>,
    ) -> Self {
        Entity {
            id,
            entity_type_id,
            store_id,
            unique_id,
            updated_at,
            parent_id,
            loaded: HashSet::new(),
            data: HashMap::new(),
        }
    }

    /// Read an attribute value. Asking for an attribute that was never
    /// loaded is an integrity error: it signals a missing subscription or
    /// load, not a null value. A loaded-but-absent attribute reads `None`.
    pub fn get(&self, attribute_id: i64) -> Result<Option<&AttrValue>> {
        if !self.loaded.contains(&attribute_id) {
            return Err(EavError::Integrity(format!(
                "attribute {attribute_id} was not loaded on entity {}",
                self.id
            )));
        }
        Ok(self.data.get(&attribute_id))
    }

    pub fn is_loaded(&self, attribute_id: i64) -> bool {
        self.loaded.contains(&attribute_id)
    }

    pub fn loaded_attributes(&self) -> &HashSet<i64> {
        &self.loaded
    }

    pub(crate) fn mark_loaded(&mut self, attribute_id: i64) {
        self.loaded.insert(attribute_id);
    }

    pub(crate) fn put_value(&mut self, attribute_id: i64, value: AttrValue) {
        self.loaded.insert(attribute_id);
        self.data.insert(attribute_id, value);
    }

    /// Fold one hydrated row into the entity. Repeated scalar rows become
    /// an array; keyed rows accumulate into an ordered map.
    pub(crate) fn absorb_row(&mut self, attribute_id: i64, key: Option<String>, value: Value) {
        self.loaded.insert(attribute_id);
        match (self.data.remove(&attribute_id), key) {
            (None, None) => {
                self.data.insert(attribute_id, AttrValue::One(value));
            }
            (None, Some(k)) => {
                let mut map = BTreeMap::new();
                map.insert(k, value);
                self.data.insert(attribute_id, AttrValue::Keyed(map));
            }
            (Some(AttrValue::One(prev)), None) => {
                self.data
                    .insert(attribute_id, AttrValue::Many(vec![prev, value]));
            }
            (Some(AttrValue::Many(mut vs)), None) => {
                vs.push(value);
                self.data.insert(attribute_id, AttrValue::Many(vs));
            }
            (Some(AttrValue::Keyed(mut map)), Some(k)) => {
                map.insert(k, value);
                self.data.insert(attribute_id, AttrValue::Keyed(map));
            }
            // Mixed keyed/unkeyed rows for one attribute should not occur;
            // keep the keyed shape and index stray rows by position.
            (Some(AttrValue::Keyed(mut map)), None) => {
                map.insert(map.len().to_string(), value);
                self.data.insert(attribute_id, AttrValue::Keyed(map));
            }
            (Some(prev), Some(k)) => {
                let mut map = BTreeMap::new();
                for (i, v) in prev.scalars().into_iter().enumerate() {
                    map.insert(i.to_string(), v);
                }
                map.insert(k, value);
                self.data.insert(attribute_id, AttrValue::Keyed(map));
            }
        }
    }
}

/// The kind of change a mutation represents, as recorded on the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Action,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Action => "action",
        }
    }

    pub fn parse(s: &str) -> Result<ChangeKind> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            "action" => Ok(ChangeKind::Action),
            other => Err(EavError::Config(format!("unknown change kind '{other}'"))),
        }
    }
}

/// An outbound instruction for an external system. Immutable once
/// constructed; only the owning orchestrator later flips its done flag.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: i64,
    pub entity_id: i64,
    pub node_id: i64,
    pub action_type: String,
    pub data: serde_json::Value,
}

/// An append-only change record.
#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub log_id: i64,
    pub entity_id: i64,
    pub change: ChangeKind,
    pub timestamp: DateTime<Utc>,
    pub source_node: i64,
    pub affected_nodes: Vec<i64>,
    pub affected_attributes: Vec<String>,
}

/// An append-only audit note attached to an entity.
#[derive(Debug, Clone)]
pub struct Comment {
    pub comment_id: i64,
    pub entity_id: i64,
    pub reference_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub title: String,
    pub body: String,
    pub customer_visible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_storage_type_round_trip() {
        for st in StorageType::ALL {
            assert_eq!(StorageType::parse(st.as_str()).unwrap(), st);
        }
        assert!(StorageType::parse("blob").is_err());
    }

    #[test]
    fn test_normalize_to_int() {
        assert_eq!(
            Value::Text(" 42 ".into()).normalize(StorageType::Int).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::Decimal(7.0).normalize(StorageType::Int).unwrap(),
            Value::Int(7)
        );
        assert!(Value::Text("abc".into()).normalize(StorageType::Int).is_err());
        assert!(Value::Decimal(7.5).normalize(StorageType::Int).is_err());
    }

    #[test]
    fn test_normalize_to_varchar_renders() {
        assert_eq!(
            Value::Int(5).normalize(StorageType::Varchar).unwrap(),
            Value::Text("5".into())
        );
    }

    #[test]
    fn test_normalize_datetime() {
        let dt = Value::Text("2024-01-02T03:04:05+00:00".into())
            .normalize(StorageType::Datetime)
            .unwrap();
        match dt {
            Value::DateTime(d) => assert_eq!(d.to_rfc3339(), "2024-01-02T03:04:05+00:00"),
            other => panic!("expected datetime, got {other:?}"),
        }
        assert!(Value::Text("yesterday".into())
            .normalize(StorageType::Datetime)
            .is_err());
    }

    #[test]
    fn test_entity_unloaded_attribute_is_error() {
        let mut e = Entity::new(1, 1, 0, None, Utc::now(), None);
        e.put_value(10, AttrValue::One(Value::Int(1)));
        assert!(e.get(10).is_ok());
        assert!(matches!(e.get(11), Err(EavError::Integrity(_))));

        // Loaded but absent reads as None, not an error.
        e.mark_loaded(11);
        assert_eq!(e.get(11).unwrap(), None);
    }

    #[test]
    fn test_absorb_row_shapes() {
        let mut e = Entity::new(1, 1, 0, None, Utc::now(), None);

        e.absorb_row(1, None, Value::Int(5));
        assert_eq!(e.get(1).unwrap(), Some(&AttrValue::One(Value::Int(5))));

        e.absorb_row(1, None, Value::Int(6));
        assert_eq!(
            e.get(1).unwrap(),
            Some(&AttrValue::Many(vec![Value::Int(5), Value::Int(6)]))
        );

        // Keyed rows arrive in arbitrary physical order; the map is ordered.
        e.absorb_row(2, Some("b".into()), Value::Text("2".into()));
        e.absorb_row(2, Some("a".into()), Value::Text("1".into()));
        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), Value::Text("1".into()));
        expected.insert("b".to_string(), Value::Text("2".into()));
        assert_eq!(e.get(2).unwrap(), Some(&AttrValue::Keyed(expected)));
    }

    #[test]
    fn test_attr_value_rows() {
        let keyed: BTreeMap<String, Value> = [
            ("a".to_string(), Value::Text("1".into())),
            ("b".to_string(), Value::Text("2".into())),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            AttrValue::Keyed(keyed).rows(),
            vec![
                (Some("a".to_string()), Value::Text("1".into())),
                (Some("b".to_string()), Value::Text("2".into())),
            ]
        );
        assert_eq!(
            AttrValue::One(Value::Int(1)).rows(),
            vec![(None, Value::Int(1))]
        );
    }
}
