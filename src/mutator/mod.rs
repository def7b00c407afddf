// Diff-and-persist engine: classifies the desired state against stored
// values, generates the insert/update/delete/merge statements and runs
// them under one labeled transaction with bounded deadlock retry.

use crate::error::{EavError, Result};
use crate::locator;
use crate::registry::{Attribute, AttributeRegistry, TypeRef};
use crate::storage::EavDb;
use crate::value::{AttrValue, Value};
use chrono::Utc;
use rusqlite::params;
use std::collections::HashMap;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 7;
const RETRY_BASE: Duration = Duration::from_millis(500);
const SAVE_LABEL: &str = "entity_save";

/// The classified change for one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Create(AttrValue),
    Update(AttrValue),
    Merge(AttrValue),
    Delete,
    Noop,
}

impl Change {
    pub fn describe(&self) -> &'static str {
        match self {
            Change::Create(_) => "create",
            Change::Update(_) => "update",
            Change::Merge(_) => "merge",
            Change::Delete => "delete",
            Change::Noop => "noop",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Change::Noop)
    }
}

/// The desired state for a save: attribute id -> new value (None deletes).
pub type Payload = HashMap<i64, Option<AttrValue>>;

/// Classify one attribute's transition. Values are normalized to the
/// attribute's declared storage type before comparison, so a type change
/// in the caller's representation alone never counts as a difference.
pub fn classify(
    attr: &Attribute,
    old: Option<&AttrValue>,
    new: Option<&AttrValue>,
    merge: bool,
) -> Result<Change> {
    let new = match new {
        Some(v) => Some(v.normalize(attr.storage)?),
        None => None,
    };
    let old = match old {
        Some(v) => Some(v.normalize(attr.storage)?),
        None => None,
    };

    Ok(match (old, new) {
        (None, None) => Change::Noop,
        (None, Some(v)) => Change::Create(v),
        (Some(_), None) => Change::Delete,
        (Some(old), Some(new)) => {
            if old == new {
                Change::Noop
            } else if merge {
                Change::Merge(merge_values(&old, &new))
            } else {
                Change::Update(new)
            }
        }
    })
}

/// Union existing and incoming values. Existing-then-new when the existing
/// value was scalar; an incoming scalar is prepended to an existing
/// collection. Duplicates keep their first occurrence; keyed values merge
/// by key with incoming entries winning.
fn merge_values(old: &AttrValue, new: &AttrValue) -> AttrValue {
    match (old, new) {
        (AttrValue::Keyed(old_map), new) => {
            let mut merged = old_map.clone();
            match new {
                AttrValue::Keyed(new_map) => {
                    for (k, v) in new_map {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                other => {
                    for (i, v) in other.scalars().into_iter().enumerate() {
                        merged.insert(i.to_string(), v);
                    }
                }
            }
            AttrValue::Keyed(merged)
        }
        (old, AttrValue::Keyed(new_map)) => {
            let mut merged = std::collections::BTreeMap::new();
            for (i, v) in old.scalars().into_iter().enumerate() {
                merged.insert(i.to_string(), v);
            }
            for (k, v) in new_map {
                merged.insert(k.clone(), v.clone());
            }
            AttrValue::Keyed(merged)
        }
        (AttrValue::One(old_v), new) => {
            let mut out = vec![old_v.clone()];
            push_unique(&mut out, new.scalars());
            AttrValue::Many(out)
        }
        (AttrValue::Many(old_vs), AttrValue::One(new_v)) => {
            let mut out = vec![new_v.clone()];
            push_unique(&mut out, old_vs.clone());
            AttrValue::Many(out)
        }
        (AttrValue::Many(old_vs), AttrValue::Many(new_vs)) => {
            let mut out = old_vs.clone();
            push_unique(&mut out, new_vs.clone());
            AttrValue::Many(out)
        }
    }
}

fn push_unique(out: &mut Vec<Value>, incoming: Vec<Value>) {
    for v in incoming {
        if !out.contains(&v) {
            out.push(v);
        }
    }
}

/// Diff the payload against stored values.
pub fn diff(
    db: &EavDb,
    reg: &AttributeRegistry,
    entity_id: i64,
    payload: &Payload,
    merge_attrs: &std::collections::HashSet<i64>,
) -> Result<HashMap<i64, Change>> {
    let mut changes = HashMap::new();
    for (attr_id, new) in payload {
        let attr = reg.attribute(db, *attr_id)?;
        check_reference_values(&attr, new.as_ref())?;
        let old = locator::current_value(db, entity_id, &attr)?;
        let change = classify(&attr, old.as_ref(), new.as_ref(), merge_attrs.contains(attr_id))?;
        changes.insert(*attr_id, change);
    }
    Ok(changes)
}

/// Entity-typed values must reference an already-persisted entity.
fn check_reference_values(attr: &Attribute, value: Option<&AttrValue>) -> Result<()> {
    if !attr.storage.is_reference() {
        return Ok(());
    }
    if let Some(value) = value {
        for v in value.scalars() {
            match v.normalize(attr.storage)? {
                Value::Int(id) if id > 0 => {}
                other => {
                    return Err(EavError::Integrity(format!(
                        "attribute '{}' requires a persisted entity id, got {other:?}",
                        attr.code
                    )))
                }
            }
        }
    }
    Ok(())
}

// ── Persistence ──────────────────────────────────────────────────────

fn write_change(
    db: &EavDb,
    reg: &AttributeRegistry,
    entity_id: i64,
    attr_id: i64,
    change: &Change,
    now: &str,
) -> Result<()> {
    let attr = reg.attribute(db, attr_id)?;
    let table = attr.storage.table();

    match change {
        Change::Noop => {}
        Change::Delete => {
            db.conn().execute(
                &format!("DELETE FROM {table} WHERE entity_id = ?1 AND attribute_id = ?2"),
                params![entity_id, attr_id],
            )?;
        }
        Change::Create(value) => {
            insert_rows(db, &attr, entity_id, value, now)?;
        }
        Change::Update(value) | Change::Merge(value) => {
            db.conn().execute(
                &format!("DELETE FROM {table} WHERE entity_id = ?1 AND attribute_id = ?2"),
                params![entity_id, attr_id],
            )?;
            insert_rows(db, &attr, entity_id, value, now)?;
        }
    }
    Ok(())
}

/// One row per scalar; one row per key for multi values.
fn insert_rows(
    db: &EavDb,
    attr: &Attribute,
    entity_id: i64,
    value: &AttrValue,
    now: &str,
) -> Result<()> {
    let normalized = value.normalize(attr.storage)?;
    if attr.storage.keyed() {
        let sql = format!(
            "INSERT INTO {} (entity_id, attribute_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            attr.storage.table()
        );
        for (key, v) in normalized.rows() {
            let key = key.unwrap_or_default();
            db.conn()
                .execute(&sql, params![entity_id, attr.id, key, v.to_sql(), now])?;
        }
    } else {
        let sql = format!(
            "INSERT INTO {} (entity_id, attribute_id, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            attr.storage.table()
        );
        for (_, v) in normalized.rows() {
            db.conn()
                .execute(&sql, params![entity_id, attr.id, v.to_sql(), now])?;
        }
    }
    Ok(())
}

/// Persist a set of classified changes plus the updated_at touch, under
/// one labeled transaction with deadlock retry. Returns whether anything
/// was written.
pub fn save(
    db: &EavDb,
    reg: &AttributeRegistry,
    entity_id: i64,
    changes: &HashMap<i64, Change>,
) -> Result<bool> {
    if !changes.values().any(Change::is_write) {
        log::debug!("save for entity {entity_id}: no-op, zero writes");
        return Ok(false);
    }
    with_retry(db, SAVE_LABEL, RETRY_BASE, entity_id, || {
        let now = Utc::now().to_rfc3339();
        for (attr_id, change) in changes {
            write_change(db, reg, entity_id, *attr_id, change, &now)?;
        }
        db.conn().execute(
            "UPDATE entity SET updated_at = ?1 WHERE entity_id = ?2",
            params![now, entity_id],
        )?;
        Ok(())
    })?;
    Ok(true)
}

/// Diff then persist in one call.
pub fn apply(
    db: &EavDb,
    reg: &AttributeRegistry,
    entity_id: i64,
    payload: &Payload,
    merge_attrs: &std::collections::HashSet<i64>,
) -> Result<bool> {
    let changes = diff(db, reg, entity_id, payload, merge_attrs)?;
    save(db, reg, entity_id, &changes)
}

/// Insert the base row, then run the diff machinery in all-create mode.
/// Returns the new entity id.
pub fn create(
    db: &EavDb,
    reg: &AttributeRegistry,
    type_ref: TypeRef<'_>,
    store_id: i64,
    unique_id: Option<&str>,
    parent_id: Option<i64>,
    payload: &Payload,
) -> Result<i64> {
    let type_id = reg.resolve_entity_type(db, type_ref)?;
    for (attr_id, value) in payload {
        let attr = reg.attribute(db, *attr_id)?;
        check_reference_values(&attr, value.as_ref())?;
    }

    with_retry(db, SAVE_LABEL, RETRY_BASE, 0, || {
        let now = Utc::now().to_rfc3339();
        db.conn().execute(
            "INSERT INTO entity (type_id, store_id, unique_id, updated_at, parent_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![type_id, store_id, unique_id, now, parent_id],
        )?;
        let entity_id = db.conn().last_insert_rowid();
        for (attr_id, value) in payload {
            if let Some(value) = value {
                let attr = reg.attribute(db, *attr_id)?;
                insert_rows(db, &attr, entity_id, value, &now)?;
            }
        }
        Ok(entity_id)
    })
}

// ── Narrow metadata helpers (no diff, no change log) ─────────────────

pub fn touch(db: &EavDb, entity_id: i64) -> Result<()> {
    db.conn().execute(
        "UPDATE entity SET updated_at = ?1 WHERE entity_id = ?2",
        params![Utc::now().to_rfc3339(), entity_id],
    )?;
    Ok(())
}

pub fn set_unique_id(db: &EavDb, entity_id: i64, unique_id: Option<&str>) -> Result<()> {
    db.conn().execute(
        "UPDATE entity SET unique_id = ?1 WHERE entity_id = ?2",
        params![unique_id, entity_id],
    )?;
    Ok(())
}

pub fn set_parent_id(db: &EavDb, entity_id: i64, parent_id: Option<i64>) -> Result<()> {
    db.conn().execute(
        "UPDATE entity SET parent_id = ?1 WHERE entity_id = ?2",
        params![parent_id, entity_id],
    )?;
    Ok(())
}

/// Cascade the entity out of every physical table: all value tables, the
/// node-link table and comments; pending action/update rows are marked
/// inapplicable; finally the base row goes. One transaction.
pub fn delete(db: &EavDb, entity_id: i64) -> Result<()> {
    with_retry(db, "entity_delete", RETRY_BASE, entity_id, || {
        for storage in crate::value::StorageType::ALL {
            db.conn().execute(
                &format!("DELETE FROM {} WHERE entity_id = ?1", storage.table()),
                params![entity_id],
            )?;
        }
        db.conn().execute(
            "DELETE FROM entity_identifier WHERE entity_id = ?1",
            params![entity_id],
        )?;
        db.conn().execute(
            "DELETE FROM entity_comment WHERE entity_id = ?1",
            params![entity_id],
        )?;
        // done: 0 pending, 1 processed, 2 inapplicable
        db.conn().execute(
            "UPDATE entity_action SET done = 2 WHERE entity_id = ?1 AND done = 0",
            params![entity_id],
        )?;
        db.conn().execute(
            "UPDATE entity_update SET done = 2 WHERE entity_id = ?1 AND done = 0",
            params![entity_id],
        )?;
        db.conn().execute(
            "DELETE FROM entity WHERE entity_id = ?1",
            params![entity_id],
        )?;
        Ok(())
    })
}

// ── Retry discipline ─────────────────────────────────────────────────

/// Run `f` in a savepoint scope. Transient failures (deadlock/busy)
/// retry up to 7 attempts with sqrt(attempt) x base backoff; anything else
/// aborts immediately. Exhausted retries surface as a storage error.
///
/// Each attempt unwinds through its own savepoint, so a failed attempt
/// nested inside a caller's labeled transaction neither poisons that
/// transaction nor leaves partial writes behind.
fn with_retry<T>(
    db: &EavDb,
    label: &str,
    base: Duration,
    entity_id: i64,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    for attempt in 1..=MAX_ATTEMPTS {
        match db.with_savepoint(label, &mut f) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                log::warn!(
                    "transient failure on entity {entity_id} (attempt {attempt}/{MAX_ATTEMPTS}): {e}"
                );
                if attempt == MAX_ATTEMPTS {
                    return Err(EavError::Storage(format!(
                        "save for entity {entity_id} failed after {MAX_ATTEMPTS} attempts: {e}"
                    )));
                }
                std::thread::sleep(backoff(base, attempt));
            }
            Err(e) => {
                log::error!("save for entity {entity_id} rolled back: {e}");
                return Err(e);
            }
        }
    }
    unreachable!("retry loop always returns")
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.mul_f64((attempt as f64).sqrt())
}
