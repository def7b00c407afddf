// Attribute and entity-type registry: resolves codes to stable ids,
// caches aggressively, owns definition create/destroy.

use crate::error::{EavError, Result};
use crate::service::NodeService;
use crate::storage::EavDb;
use crate::value::StorageType;
use rusqlite::{params, OptionalExtension};
use std::cell::RefCell;
use std::collections::HashMap;

/// An entity type referenced by code or by id.
#[derive(Debug, Clone, Copy)]
pub enum TypeRef<'a> {
    Code(&'a str),
    Id(i64),
}

/// A runtime attribute definition.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub id: i64,
    pub entity_type_id: i64,
    pub code: String,
    pub name: String,
    pub storage: StorageType,
    pub metadata: bool,
    pub comment: Option<String>,
    /// For fkey/entity attributes: the target entity-type code.
    pub fetch_data: Option<String>,
    pub display_data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EntityTypeDef {
    pub id: i64,
    pub name: String,
    pub name_human: String,
    pub internal: bool,
}

/// Multi-level cache over the definition tables. Caches live for the
/// registry's lifetime and are invalidated on every definition write;
/// negative attribute lookups are cached too.
#[derive(Default)]
pub struct AttributeRegistry {
    type_ids: RefCell<HashMap<String, i64>>,
    attr_ids: RefCell<HashMap<(i64, String), Option<i64>>>,
    attrs: RefCell<HashMap<i64, Attribute>>,
    // id -> code reverse lookup, built lazily on first use
    codes: RefCell<HashMap<i64, String>>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// Resolve an entity type to its id. Unknown types are a config error.
    pub fn resolve_entity_type(&self, db: &EavDb, type_ref: TypeRef<'_>) -> Result<i64> {
        match type_ref {
            TypeRef::Id(id) => {
                let known: Option<i64> = db
                    .conn()
                    .query_row(
                        "SELECT entity_type_id FROM entity_type WHERE entity_type_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                known.ok_or_else(|| EavError::Config(format!("unknown entity type id {id}")))
            }
            TypeRef::Code(code) => {
                if let Some(id) = self.type_ids.borrow().get(code) {
                    return Ok(*id);
                }
                let id: Option<i64> = db
                    .conn()
                    .query_row(
                        "SELECT entity_type_id FROM entity_type WHERE name = ?1",
                        params![code],
                        |row| row.get(0),
                    )
                    .optional()?;
                let id =
                    id.ok_or_else(|| EavError::Config(format!("unknown entity type '{code}'")))?;
                self.type_ids.borrow_mut().insert(code.to_string(), id);
                Ok(id)
            }
        }
    }

    pub fn entity_type(&self, db: &EavDb, id: i64) -> Result<EntityTypeDef> {
        let def = db
            .conn()
            .query_row(
                "SELECT entity_type_id, name, name_human, internal
                 FROM entity_type WHERE entity_type_id = ?1",
                params![id],
                |row| {
                    Ok(EntityTypeDef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        name_human: row.get(2)?,
                        internal: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        def.ok_or_else(|| EavError::Config(format!("unknown entity type id {id}")))
    }

    /// Resolve an attribute code within a type. Returns `None` for unknown
    /// codes; the negative result is cached.
    pub fn resolve_attribute(
        &self,
        db: &EavDb,
        code: &str,
        entity_type_id: i64,
    ) -> Result<Option<i64>> {
        let key = (entity_type_id, code.to_string());
        if let Some(cached) = self.attr_ids.borrow().get(&key) {
            return Ok(*cached);
        }
        let id: Option<i64> = db
            .conn()
            .query_row(
                "SELECT attribute_id FROM entity_attribute
                 WHERE entity_type_id = ?1 AND code = ?2",
                params![entity_type_id, code],
                |row| row.get(0),
            )
            .optional()?;
        self.attr_ids.borrow_mut().insert(key, id);
        Ok(id)
    }

    /// Fetch a cached attribute definition by id.
    pub fn attribute(&self, db: &EavDb, id: i64) -> Result<Attribute> {
        if let Some(attr) = self.attrs.borrow().get(&id) {
            return Ok(attr.clone());
        }
        let attr = db
            .conn()
            .query_row(
                "SELECT attribute_id, entity_type_id, code, name, type, metadata,
                        comment, fetch_data, display_data
                 FROM entity_attribute WHERE attribute_id = ?1",
                params![id],
                row_to_attribute,
            )
            .optional()?
            .ok_or_else(|| EavError::Config(format!("unknown attribute id {id}")))?;
        let attr = finish_attribute(attr)?;
        self.attrs.borrow_mut().insert(id, attr.clone());
        Ok(attr)
    }

    /// Resolve a code to a full definition; unknown codes are a config error.
    pub fn attribute_by_code(
        &self,
        db: &EavDb,
        entity_type_id: i64,
        code: &str,
    ) -> Result<Attribute> {
        let id = self.resolve_attribute(db, code, entity_type_id)?.ok_or_else(|| {
            EavError::Config(format!(
                "unknown attribute '{code}' for entity type {entity_type_id}"
            ))
        })?;
        self.attribute(db, id)
    }

    /// Reverse lookup, id to code. The map is populated lazily per type as
    /// ids are asked for.
    pub fn attribute_code(&self, db: &EavDb, id: i64) -> Result<String> {
        if let Some(code) = self.codes.borrow().get(&id) {
            return Ok(code.clone());
        }
        let attr = self.attribute(db, id)?;
        self.codes.borrow_mut().insert(id, attr.code.clone());
        Ok(attr.code)
    }

    /// All attribute definitions for a type, ordered by code.
    pub fn attributes_for_type(&self, db: &EavDb, entity_type_id: i64) -> Result<Vec<Attribute>> {
        let mut stmt = db.conn().prepare(
            "SELECT attribute_id, entity_type_id, code, name, type, metadata,
                    comment, fetch_data, display_data
             FROM entity_attribute WHERE entity_type_id = ?1 ORDER BY code",
        )?;
        let rows = stmt.query_map(params![entity_type_id], row_to_attribute)?;

        let mut attrs = Vec::new();
        for row in rows {
            let attr = finish_attribute(row?)?;
            self.attrs.borrow_mut().insert(attr.id, attr.clone());
            attrs.push(attr);
        }
        Ok(attrs)
    }

    // ── Definition writes ────────────────────────────────────────────

    /// Create an entity type. Name collisions are an integrity error.
    pub fn create_entity_type(
        &self,
        db: &EavDb,
        name: &str,
        name_human: &str,
        internal: bool,
    ) -> Result<i64> {
        let exists: Option<i64> = db
            .conn()
            .query_row(
                "SELECT entity_type_id FROM entity_type WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(EavError::Integrity(format!(
                "entity type '{name}' already exists"
            )));
        }
        db.conn().execute(
            "INSERT INTO entity_type (name, name_human, internal) VALUES (?1, ?2, ?3)",
            params![name, name_human, internal as i64],
        )?;
        self.invalidate();
        Ok(db.conn().last_insert_rowid())
    }

    /// Create an attribute definition. Code collisions within the type are
    /// an integrity error; the storage type is already closed by the enum.
    #[allow(clippy::too_many_arguments)]
    pub fn create_attribute(
        &self,
        db: &EavDb,
        type_ref: TypeRef<'_>,
        code: &str,
        name: &str,
        storage: StorageType,
        metadata: bool,
        comment: Option<&str>,
        fetch_data: Option<&str>,
    ) -> Result<i64> {
        let entity_type_id = self.resolve_entity_type(db, type_ref)?;
        if self.resolve_attribute(db, code, entity_type_id)?.is_some() {
            return Err(EavError::Integrity(format!(
                "attribute '{code}' already exists for entity type {entity_type_id}"
            )));
        }
        db.conn().execute(
            "INSERT INTO entity_attribute
                 (entity_type_id, code, name, type, metadata, comment, fetch_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity_type_id,
                code,
                name,
                storage.as_str(),
                metadata as i64,
                comment,
                fetch_data
            ],
        )?;
        self.invalidate();
        let id = db.conn().last_insert_rowid();
        log::debug!("created attribute '{code}' ({}) as id {id}", storage.as_str());
        Ok(id)
    }

    /// Destroy an attribute definition and its stored values. Refused while
    /// any node still subscribes to the attribute.
    pub fn destroy_attribute(
        &self,
        db: &EavDb,
        nodes: &dyn NodeService,
        type_ref: TypeRef<'_>,
        code: &str,
    ) -> Result<()> {
        let entity_type_id = self.resolve_entity_type(db, type_ref)?;
        let attr = self.attribute_by_code(db, entity_type_id, code)?;

        let subscribers = nodes.nodes_subscribed_to(entity_type_id, code)?;
        if !subscribers.is_empty() {
            return Err(EavError::Integrity(format!(
                "attribute '{code}' is still subscribed by nodes {subscribers:?}"
            )));
        }

        db.with_transaction("destroy_attribute", || {
            db.conn().execute(
                &format!("DELETE FROM {} WHERE attribute_id = ?1", attr.storage.table()),
                params![attr.id],
            )?;
            db.conn().execute(
                "DELETE FROM entity_attribute WHERE attribute_id = ?1",
                params![attr.id],
            )?;
            Ok(())
        })?;
        self.invalidate();
        log::info!("destroyed attribute '{code}' (id {})", attr.id);
        Ok(())
    }

    /// Drop every cached resolution. Called after definition writes.
    pub fn invalidate(&self) {
        self.type_ids.borrow_mut().clear();
        self.attr_ids.borrow_mut().clear();
        self.attrs.borrow_mut().clear();
        self.codes.borrow_mut().clear();
    }
}

fn row_to_attribute(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Attribute, String)> {
    Ok((
        Attribute {
            id: row.get(0)?,
            entity_type_id: row.get(1)?,
            code: row.get(2)?,
            name: row.get(3)?,
            // placeholder, replaced by finish_attribute from the raw string
            storage: StorageType::Varchar,
            metadata: row.get::<_, i64>(5)? != 0,
            comment: row.get(6)?,
            fetch_data: row.get(7)?,
            display_data: row.get(8)?,
        },
        row.get::<_, String>(4)?,
    ))
}

fn finish_attribute((mut attr, raw_type): (Attribute, String)) -> Result<Attribute> {
    attr.storage = StorageType::parse(&raw_type)?;
    Ok(attr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::MockNodeService;

    fn setup() -> (EavDb, AttributeRegistry) {
        (EavDb::open_in_memory().unwrap(), AttributeRegistry::new())
    }

    #[test]
    fn test_resolve_entity_type() {
        let (db, reg) = setup();
        let id = reg.create_entity_type(&db, "widget", "Widget", false).unwrap();

        assert_eq!(reg.resolve_entity_type(&db, TypeRef::Code("widget")).unwrap(), id);
        assert_eq!(reg.resolve_entity_type(&db, TypeRef::Id(id)).unwrap(), id);
        assert!(matches!(
            reg.resolve_entity_type(&db, TypeRef::Code("missing")),
            Err(EavError::Config(_))
        ));
        assert!(matches!(
            reg.resolve_entity_type(&db, TypeRef::Id(999)),
            Err(EavError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_type_is_integrity_error() {
        let (db, reg) = setup();
        reg.create_entity_type(&db, "widget", "Widget", false).unwrap();
        assert!(matches!(
            reg.create_entity_type(&db, "widget", "Widget", false),
            Err(EavError::Integrity(_))
        ));
    }

    #[test]
    fn test_attribute_lifecycle() {
        let (db, reg) = setup();
        let type_id = reg.create_entity_type(&db, "widget", "Widget", false).unwrap();
        let attr_id = reg
            .create_attribute(
                &db,
                TypeRef::Id(type_id),
                "color",
                "Color",
                StorageType::Varchar,
                false,
                Some("display color"),
                None,
            )
            .unwrap();

        assert_eq!(reg.resolve_attribute(&db, "color", type_id).unwrap(), Some(attr_id));
        assert_eq!(reg.resolve_attribute(&db, "missing", type_id).unwrap(), None);

        let attr = reg.attribute(&db, attr_id).unwrap();
        assert_eq!(attr.code, "color");
        assert_eq!(attr.storage, StorageType::Varchar);
        assert_eq!(attr.comment.as_deref(), Some("display color"));

        assert_eq!(reg.attribute_code(&db, attr_id).unwrap(), "color");
    }

    #[test]
    fn test_duplicate_attribute_is_integrity_error() {
        let (db, reg) = setup();
        let type_id = reg.create_entity_type(&db, "widget", "Widget", false).unwrap();
        reg.create_attribute(
            &db, TypeRef::Id(type_id), "color", "Color",
            StorageType::Varchar, false, None, None,
        )
        .unwrap();
        assert!(matches!(
            reg.create_attribute(
                &db, TypeRef::Id(type_id), "color", "Color",
                StorageType::Int, false, None, None,
            ),
            Err(EavError::Integrity(_))
        ));
    }

    #[test]
    fn test_negative_lookup_is_cached_and_invalidated() {
        let (db, reg) = setup();
        let type_id = reg.create_entity_type(&db, "widget", "Widget", false).unwrap();

        assert_eq!(reg.resolve_attribute(&db, "color", type_id).unwrap(), None);

        // The write invalidates the cached negative result.
        let attr_id = reg
            .create_attribute(
                &db, TypeRef::Id(type_id), "color", "Color",
                StorageType::Varchar, false, None, None,
            )
            .unwrap();
        assert_eq!(reg.resolve_attribute(&db, "color", type_id).unwrap(), Some(attr_id));
    }

    #[test]
    fn test_destroy_attribute_blocked_by_subscription() {
        let (db, reg) = setup();
        let type_id = reg.create_entity_type(&db, "widget", "Widget", false).unwrap();
        reg.create_attribute(
            &db, TypeRef::Id(type_id), "color", "Color",
            StorageType::Varchar, false, None, None,
        )
        .unwrap();

        let nodes = MockNodeService::subscribing(vec!["color".into()]);
        assert!(matches!(
            reg.destroy_attribute(&db, &nodes, TypeRef::Id(type_id), "color"),
            Err(EavError::Integrity(_))
        ));

        let unsubscribed = MockNodeService::subscribing(vec![]);
        reg.destroy_attribute(&db, &unsubscribed, TypeRef::Id(type_id), "color")
            .unwrap();
        assert_eq!(reg.resolve_attribute(&db, "color", type_id).unwrap(), None);
    }

    #[test]
    fn test_attributes_for_type_ordered() {
        let (db, reg) = setup();
        let type_id = reg.create_entity_type(&db, "widget", "Widget", false).unwrap();
        for code in ["tags", "color", "weight"] {
            reg.create_attribute(
                &db, TypeRef::Id(type_id), code, code,
                StorageType::Varchar, false, None, None,
            )
            .unwrap();
        }
        let codes: Vec<String> = reg
            .attributes_for_type(&db, type_id)
            .unwrap()
            .into_iter()
            .map(|a| a.code)
            .collect();
        assert_eq!(codes, vec!["color", "tags", "weight"]);
    }
}
