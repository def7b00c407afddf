// The façade callers talk to. Enforces per-node attribute visibility,
// orchestrates the locator and mutator, runs the transform and
// distribution hooks around every mutation, and owns the append-only
// change log, comment, action and identifier records.

use crate::error::{EavError, Result};
use crate::locator::{self, Search};
use crate::mutator::{self, Payload};
use crate::registry::{AttributeRegistry, TypeRef};
use crate::storage::EavDb;
use crate::value::{Action, AttrValue, ChangeKind, Comment, Entity, Update};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet};

/// Attribute payload keyed by code, as callers supply it. `None` deletes.
pub type CodePayload = HashMap<String, Option<AttrValue>>;

/// External systems with attribute subscriptions. Not implemented here;
/// the orchestration layer supplies it.
pub trait NodeService {
    /// The attribute codes the node may read (or write, with `for_write`).
    fn subscribed_attribute_codes(
        &self,
        node_id: i64,
        entity_type_id: i64,
        for_write: bool,
    ) -> Result<Vec<String>>;

    /// Every node subscribed to one attribute of a type.
    fn nodes_subscribed_to(&self, entity_type_id: i64, code: &str) -> Result<Vec<i64>>;
}

/// Transform and fan-out hooks around mutations. Transforms run before
/// persistence and may replace the payload; distribution runs after and
/// must never feed back into persistence.
pub trait RouterService {
    /// `entity` is `None` when the mutation is a create.
    fn process_transforms(
        &self,
        entity: Option<&Entity>,
        data: &Payload,
        node_id: i64,
        change: ChangeKind,
    ) -> Result<Option<Payload>>;

    fn distribute_update(
        &self,
        entity: &Entity,
        changed_attributes: &[String],
        node_id: i64,
        change: ChangeKind,
    ) -> Result<()>;

    fn distribute_action(
        &self,
        entity: &Entity,
        node_id: i64,
        action_type: &str,
        data: &serde_json::Value,
    ) -> Result<bool>;
}

/// Mutation lifecycle, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationState {
    Pending,
    Validated,
    Persisted,
    Distributed,
}

pub struct EntityService {
    db: EavDb,
    registry: AttributeRegistry,
    nodes: Box<dyn NodeService>,
    router: Box<dyn RouterService>,
}

impl EntityService {
    pub fn new(
        db: EavDb,
        registry: AttributeRegistry,
        nodes: Box<dyn NodeService>,
        router: Box<dyn RouterService>,
    ) -> Self {
        EntityService { db, registry, nodes, router }
    }

    pub fn db(&self) -> &EavDb {
        &self.db
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    pub fn node_service(&self) -> &dyn NodeService {
        self.nodes.as_ref()
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Load one entity with the attributes the node may read, or with an
    /// explicit attribute-list override.
    pub fn load(
        &self,
        node_id: i64,
        entity_id: i64,
        attributes: Option<&[String]>,
    ) -> Result<Option<Entity>> {
        let Some(type_id) = self.entity_type_of(entity_id)? else {
            return Ok(None);
        };
        let codes = match attributes {
            Some(list) => list.to_vec(),
            None => self.nodes.subscribed_attribute_codes(node_id, type_id, false)?,
        };
        locator::load_entity(&self.db, &self.registry, type_id, entity_id, Some(&codes))
    }

    /// Run a search on behalf of a node. When the search names no explicit
    /// load list, it is narrowed to the node's readable attributes.
    pub fn search(&self, node_id: i64, search: &Search) -> Result<Vec<Entity>> {
        let mut q = search.clone();
        if q.options.load.is_none() {
            q.options.load = Some(self.nodes.subscribed_attribute_codes(
                node_id,
                q.entity_type_id,
                false,
            )?);
        }
        locator::search(&self.db, &self.registry, &q)
    }

    /// Existence probe by unique id. The one read allowed to downgrade a
    /// failure to a negative answer.
    pub fn exists(&self, unique_id: &str) -> bool {
        let probe: Result<Option<i64>> = (|| {
            Ok(self
                .db
                .conn()
                .query_row(
                    "SELECT entity_id FROM entity WHERE unique_id = ?1",
                    params![unique_id],
                    |row| row.get(0),
                )
                .optional()?)
        })();
        match probe {
            Ok(found) => found.is_some(),
            Err(e) => {
                log::warn!("existence probe for '{unique_id}' failed: {e}");
                false
            }
        }
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Create an entity from a code-keyed payload on behalf of a node.
    pub fn create(
        &self,
        node_id: i64,
        type_ref: TypeRef<'_>,
        store_id: i64,
        unique_id: Option<&str>,
        parent_id: Option<i64>,
        data: &CodePayload,
        attributes: Option<&[String]>,
    ) -> Result<i64> {
        let type_id = self.registry.resolve_entity_type(&self.db, type_ref)?;
        let mut state = MutationState::Pending;
        log::debug!("create of type {type_id} by node {node_id}: {state:?}");

        self.check_write_boundary(node_id, type_id, data, attributes)?;
        let mut payload = self.payload_from_codes(type_id, data)?;
        if let Some(replacement) =
            self.router
                .process_transforms(None, &payload, node_id, ChangeKind::Create)?
        {
            payload = replacement;
        }
        state = MutationState::Validated;
        log::debug!("create of type {type_id} by node {node_id}: {state:?}");

        // The base insert and its change-log record commit together, so a
        // persisted entity can never be missing from the log.
        let affected = self.codes_of(&payload)?;
        let entity_id = self.db.with_transaction("entity_create", || {
            let entity_id = mutator::create(
                &self.db,
                &self.registry,
                TypeRef::Id(type_id),
                store_id,
                unique_id,
                parent_id,
                &payload,
            )?;
            self.log_update(type_id, entity_id, ChangeKind::Create, node_id, &affected)?;
            Ok(entity_id)
        })?;
        state = MutationState::Persisted;

        if self.distribute(entity_id, type_id, &affected, node_id, ChangeKind::Create) {
            state = MutationState::Distributed;
        }
        log::debug!("create of entity {entity_id} by node {node_id}: {state:?}");
        Ok(entity_id)
    }

    /// Diff a code-keyed payload against storage and persist the changes.
    /// Returns false, with zero writes, when every value already matched.
    pub fn update(
        &self,
        node_id: i64,
        entity_id: i64,
        data: &CodePayload,
        merge: &[String],
        attributes: Option<&[String]>,
    ) -> Result<bool> {
        let type_id = self.require_entity(entity_id)?;
        let mut state = MutationState::Pending;
        log::debug!("update of entity {entity_id} by node {node_id}: {state:?}");

        self.check_write_boundary(node_id, type_id, data, attributes)?;
        let mut payload = self.payload_from_codes(type_id, data)?;

        let entity = locator::load_entity(&self.db, &self.registry, type_id, entity_id, None)?
            .ok_or_else(|| {
                EavError::Integrity(format!("entity {entity_id} vanished during update"))
            })?;
        if let Some(replacement) =
            self.router
                .process_transforms(Some(&entity), &payload, node_id, ChangeKind::Update)?
        {
            payload = replacement;
        }
        state = MutationState::Validated;
        log::debug!("update of entity {entity_id} by node {node_id}: {state:?}");

        let mut merge_ids = HashSet::new();
        for code in merge {
            merge_ids.insert(self.registry.attribute_by_code(&self.db, type_id, code)?.id);
        }
        let changes = mutator::diff(&self.db, &self.registry, entity_id, &payload, &merge_ids)?;
        let mut affected = Vec::new();
        for (attr_id, change) in &changes {
            if change.is_write() {
                affected.push(self.registry.attribute_code(&self.db, *attr_id)?);
            }
        }
        affected.sort();

        // Save and change-log record commit together.
        let saved = self.db.with_transaction("entity_update", || {
            if !mutator::save(&self.db, &self.registry, entity_id, &changes)? {
                return Ok(false);
            }
            self.log_update(type_id, entity_id, ChangeKind::Update, node_id, &affected)?;
            Ok(true)
        })?;
        if !saved {
            log::debug!("update of entity {entity_id} by node {node_id}: no-op");
            return Ok(false);
        }
        state = MutationState::Persisted;

        if self.distribute(entity_id, type_id, &affected, node_id, ChangeKind::Update) {
            state = MutationState::Distributed;
        }
        log::debug!("update of entity {entity_id} by node {node_id}: {state:?}");
        Ok(true)
    }

    /// Remove an entity and all its dependent rows, then log and fan out
    /// the deletion.
    pub fn delete(&self, node_id: i64, entity_id: i64) -> Result<()> {
        let type_id = self.require_entity(entity_id)?;
        let entity = locator::load_entity(&self.db, &self.registry, type_id, entity_id, None)?
            .ok_or_else(|| {
                EavError::Integrity(format!("entity {entity_id} vanished during delete"))
            })?;

        self.db.with_transaction("entity_delete", || {
            mutator::delete(&self.db, entity_id)?;
            self.log_update(type_id, entity_id, ChangeKind::Delete, node_id, &[])
        })?;

        if let Err(e) = self
            .router
            .distribute_update(&entity, &[], node_id, ChangeKind::Delete)
        {
            log::error!("distribution of delete for entity {entity_id} failed: {e}");
        }
        Ok(())
    }

    // ── Change log ───────────────────────────────────────────────────

    fn log_update(
        &self,
        type_id: i64,
        entity_id: i64,
        change: ChangeKind,
        source_node: i64,
        affected_attributes: &[String],
    ) -> Result<i64> {
        let mut affected_nodes = Vec::new();
        for code in affected_attributes {
            for node in self.nodes.nodes_subscribed_to(type_id, code)? {
                if node != source_node && !affected_nodes.contains(&node) {
                    affected_nodes.push(node);
                }
            }
        }
        affected_nodes.sort_unstable();

        self.db.conn().execute(
            "INSERT INTO entity_update
                 (log_id, entity_id, type, timestamp, source_node,
                  affected_nodes, affected_attributes, done)
             VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                entity_id,
                change.as_str(),
                Utc::now().to_rfc3339(),
                source_node,
                serde_json::to_string(&affected_nodes)?,
                serde_json::to_string(affected_attributes)?,
            ],
        )?;
        Ok(self.db.conn().last_insert_rowid())
    }

    /// The change log for one entity, oldest first.
    pub fn updates(&self, entity_id: i64) -> Result<Vec<Update>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT update_id, log_id, entity_id, type, timestamp, source_node,
                    affected_nodes, affected_attributes
             FROM entity_update WHERE entity_id = ?1 ORDER BY update_id",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut updates = Vec::new();
        for row in rows {
            let (update_id, log_id, entity_id, kind, ts, source_node, nodes, attrs) = row?;
            updates.push(Update {
                update_id,
                log_id,
                entity_id,
                change: ChangeKind::parse(&kind)?,
                timestamp: parse_timestamp(&ts)?,
                source_node,
                affected_nodes: serde_json::from_str(&nodes)?,
                affected_attributes: serde_json::from_str(&attrs)?,
            });
        }
        Ok(updates)
    }

    // ── Comments ─────────────────────────────────────────────────────

    pub fn add_comment(
        &self,
        entity_id: i64,
        source: &str,
        title: &str,
        body: &str,
        reference_id: Option<&str>,
        customer_visible: bool,
    ) -> Result<i64> {
        self.require_entity(entity_id)?;
        self.db.conn().execute(
            "INSERT INTO entity_comment
                 (entity_id, reference_id, timestamp, source, title, body, customer_visible)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity_id,
                reference_id,
                Utc::now().to_rfc3339(),
                source,
                title,
                body,
                customer_visible as i64,
            ],
        )?;
        Ok(self.db.conn().last_insert_rowid())
    }

    pub fn comments(&self, entity_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT comment_id, entity_id, reference_id, timestamp, source, title,
                    body, customer_visible
             FROM entity_comment WHERE entity_id = ?1 ORDER BY comment_id",
        )?;
        let rows = stmt.query_map(params![entity_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut comments = Vec::new();
        for row in rows {
            let (comment_id, entity_id, reference_id, ts, source, title, body, visible) = row?;
            comments.push(Comment {
                comment_id,
                entity_id,
                reference_id,
                timestamp: parse_timestamp(&ts)?,
                source,
                title,
                body,
                customer_visible: visible != 0,
            });
        }
        Ok(comments)
    }

    // ── Actions ──────────────────────────────────────────────────────

    /// Persist an outbound action record and hand it to the router. The
    /// record stays pending unless the router acknowledges it.
    pub fn send_action(
        &self,
        node_id: i64,
        entity_id: i64,
        action_type: &str,
        data: serde_json::Value,
    ) -> Result<bool> {
        let type_id = self.require_entity(entity_id)?;
        let entity = locator::load_entity(&self.db, &self.registry, type_id, entity_id, None)?
            .ok_or_else(|| {
                EavError::Integrity(format!("entity {entity_id} vanished during action"))
            })?;

        self.db.conn().execute(
            "INSERT INTO entity_action (entity_id, node_id, type, data, done)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![entity_id, node_id, action_type, serde_json::to_string(&data)?],
        )?;
        let action = Action {
            id: self.db.conn().last_insert_rowid(),
            entity_id,
            node_id,
            action_type: action_type.to_string(),
            data,
        };

        match self
            .router
            .distribute_action(&entity, node_id, &action.action_type, &action.data)
        {
            Ok(true) => {
                self.db.conn().execute(
                    "UPDATE entity_action SET done = 1 WHERE action_id = ?1",
                    params![action.id],
                )?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                log::error!(
                    "distribution of action '{action_type}' for entity {entity_id} failed: {e}"
                );
                Ok(false)
            }
        }
    }

    // ── Local ids ────────────────────────────────────────────────────

    /// Record how a node knows this entity.
    pub fn register_local_id(
        &self,
        entity_id: i64,
        node_id: i64,
        store_id: i64,
        local_id: &str,
    ) -> Result<()> {
        self.require_entity(entity_id)?;
        self.db.conn().execute(
            "INSERT INTO entity_identifier (entity_id, node_id, store_id, local_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_id, node_id) DO UPDATE SET
                 store_id = excluded.store_id, local_id = excluded.local_id",
            params![entity_id, node_id, store_id, local_id],
        )?;
        Ok(())
    }

    pub fn local_id(&self, entity_id: i64, node_id: i64) -> Result<Option<String>> {
        Ok(self
            .db
            .conn()
            .query_row(
                "SELECT local_id FROM entity_identifier
                 WHERE entity_id = ?1 AND node_id = ?2",
                params![entity_id, node_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn find_by_local_id(&self, node_id: i64, local_id: &str) -> Result<Option<i64>> {
        Ok(self
            .db
            .conn()
            .query_row(
                "SELECT entity_id FROM entity_identifier
                 WHERE node_id = ?1 AND local_id = ?2",
                params![node_id, local_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Open a labelled logical transaction so multi-step service calls
    /// share one physical transaction with the mutator.
    pub fn begin_entity_transaction(&self, label: &str) -> Result<()> {
        self.db.begin(label)
    }

    pub fn commit_entity_transaction(&self, label: &str) -> Result<()> {
        self.db.commit(label)
    }

    pub fn rollback_entity_transaction(&self, label: &str) -> Result<()> {
        self.db.rollback(label)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn entity_type_of(&self, entity_id: i64) -> Result<Option<i64>> {
        Ok(self
            .db
            .conn()
            .query_row(
                "SELECT type_id FROM entity WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn require_entity(&self, entity_id: i64) -> Result<i64> {
        self.entity_type_of(entity_id)?
            .ok_or_else(|| EavError::Integrity(format!("unknown entity {entity_id}")))
    }

    /// Reject any write key outside the node's writable set before a
    /// single row is touched. An explicit attribute list overrides the
    /// subscription lookup.
    fn check_write_boundary(
        &self,
        node_id: i64,
        type_id: i64,
        data: &CodePayload,
        attributes: Option<&[String]>,
    ) -> Result<()> {
        let writable: Vec<String> = match attributes {
            Some(list) => list.to_vec(),
            None => self.nodes.subscribed_attribute_codes(node_id, type_id, true)?,
        };
        for code in data.keys() {
            if !writable.iter().any(|c| c == code) {
                return Err(EavError::Integrity(format!(
                    "node {node_id} may not write attribute '{code}'"
                )));
            }
        }
        Ok(())
    }

    fn payload_from_codes(&self, type_id: i64, data: &CodePayload) -> Result<Payload> {
        let mut payload = Payload::with_capacity(data.len());
        for (code, value) in data {
            let attr = self.registry.attribute_by_code(&self.db, type_id, code)?;
            payload.insert(attr.id, value.clone());
        }
        Ok(payload)
    }

    fn codes_of(&self, payload: &Payload) -> Result<Vec<String>> {
        let mut codes = Vec::with_capacity(payload.len());
        for attr_id in payload.keys() {
            codes.push(self.registry.attribute_code(&self.db, *attr_id)?);
        }
        codes.sort();
        Ok(codes)
    }

    /// Post-persistence fan-out. A failure here is logged and swallowed;
    /// the mutation is already durable and must not run again.
    fn distribute(
        &self,
        entity_id: i64,
        type_id: i64,
        affected: &[String],
        node_id: i64,
        change: ChangeKind,
    ) -> bool {
        let entity = match locator::load_entity(&self.db, &self.registry, type_id, entity_id, None)
        {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                log::error!("entity {entity_id} missing after persistence");
                return false;
            }
            Err(e) => {
                log::error!("reload of entity {entity_id} for distribution failed: {e}");
                return false;
            }
        };
        match self
            .router
            .distribute_update(&entity, affected, node_id, change)
        {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "distribution of {} for entity {entity_id} failed: {e}",
                    change.as_str()
                );
                false
            }
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EavError::Integrity(format!("unparsable timestamp '{raw}'")))
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A node service backed by fixed code lists.
    pub struct MockNodeService {
        pub read_codes: Vec<String>,
        pub write_codes: Vec<String>,
        pub node_id: i64,
    }

    impl MockNodeService {
        /// One node, id 1, subscribed to these codes for read and write.
        pub fn subscribing(codes: Vec<String>) -> Self {
            MockNodeService {
                read_codes: codes.clone(),
                write_codes: codes,
                node_id: 1,
            }
        }

        pub fn split(read: Vec<String>, write: Vec<String>) -> Self {
            MockNodeService { read_codes: read, write_codes: write, node_id: 1 }
        }
    }

    impl NodeService for MockNodeService {
        fn subscribed_attribute_codes(
            &self,
            _node_id: i64,
            _entity_type_id: i64,
            for_write: bool,
        ) -> Result<Vec<String>> {
            Ok(if for_write {
                self.write_codes.clone()
            } else {
                self.read_codes.clone()
            })
        }

        fn nodes_subscribed_to(&self, _entity_type_id: i64, code: &str) -> Result<Vec<i64>> {
            let subscribed = self.read_codes.iter().chain(&self.write_codes).any(|c| c == code);
            Ok(if subscribed { vec![self.node_id] } else { Vec::new() })
        }
    }

    #[derive(Default)]
    pub struct RouterLog {
        /// (entity_id, change, node_id, affected attribute codes)
        pub updates: Vec<(i64, ChangeKind, i64, Vec<String>)>,
        /// (entity_id, action type)
        pub actions: Vec<(i64, String)>,
    }

    /// A router that records every call; behavior is tweaked per test.
    pub struct MockRouterService {
        pub log: Rc<RefCell<RouterLog>>,
        pub transform: Option<Box<dyn Fn(&Payload) -> Payload>>,
        pub fail_distribution: bool,
        pub action_ack: bool,
    }

    impl MockRouterService {
        pub fn new() -> (Self, Rc<RefCell<RouterLog>>) {
            let log = Rc::new(RefCell::new(RouterLog::default()));
            let router = MockRouterService {
                log: Rc::clone(&log),
                transform: None,
                fail_distribution: false,
                action_ack: true,
            };
            (router, log)
        }
    }

    impl RouterService for MockRouterService {
        fn process_transforms(
            &self,
            _entity: Option<&Entity>,
            data: &Payload,
            _node_id: i64,
            _change: ChangeKind,
        ) -> Result<Option<Payload>> {
            Ok(self.transform.as_ref().map(|f| f(data)))
        }

        fn distribute_update(
            &self,
            entity: &Entity,
            changed_attributes: &[String],
            node_id: i64,
            change: ChangeKind,
        ) -> Result<()> {
            if self.fail_distribution {
                return Err(EavError::Storage("downstream unreachable".to_string()));
            }
            self.log.borrow_mut().updates.push((
                entity.id,
                change,
                node_id,
                changed_attributes.to_vec(),
            ));
            Ok(())
        }

        fn distribute_action(
            &self,
            entity: &Entity,
            _node_id: i64,
            action_type: &str,
            _data: &serde_json::Value,
        ) -> Result<bool> {
            if self.fail_distribution {
                return Err(EavError::Storage("downstream unreachable".to_string()));
            }
            self.log
                .borrow_mut()
                .actions
                .push((entity.id, action_type.to_string()));
            Ok(self.action_ack)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockNodeService, MockRouterService, RouterLog};
    use super::*;
    use crate::value::{StorageType, Value};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    const NODE: i64 = 7;

    struct Fixture {
        svc: EntityService,
        log: Rc<RefCell<RouterLog>>,
        type_id: i64,
    }

    fn setup() -> Fixture {
        setup_with(|_| {})
    }

    fn setup_with(tweak: impl FnOnce(&mut MockRouterService)) -> Fixture {
        let db = EavDb::open_in_memory().unwrap();
        let registry = AttributeRegistry::new();
        let type_id = registry.create_entity_type(&db, "widget", "Widget", false).unwrap();
        for (code, storage) in [
            ("color", StorageType::Varchar),
            ("tags", StorageType::Multi),
            ("weight", StorageType::Int),
        ] {
            registry
                .create_attribute(
                    &db, TypeRef::Id(type_id), code, code, storage, false, None, None,
                )
                .unwrap();
        }

        let nodes = MockNodeService::subscribing(vec![
            "color".into(),
            "tags".into(),
            "weight".into(),
        ]);
        let (mut router, log) = MockRouterService::new();
        tweak(&mut router);
        let svc = EntityService::new(db, registry, Box::new(nodes), Box::new(router));
        Fixture { svc, log, type_id }
    }

    fn widget_payload() -> CodePayload {
        let mut tags = BTreeMap::new();
        tags.insert("a".to_string(), Value::Text("1".into()));
        tags.insert("b".to_string(), Value::Text("2".into()));

        let mut data = CodePayload::new();
        data.insert("color".into(), Some(AttrValue::One("red".into())));
        data.insert("tags".into(), Some(AttrValue::Keyed(tags)));
        data
    }

    fn attr_id(f: &Fixture, code: &str) -> i64 {
        f.svc
            .registry()
            .attribute_by_code(f.svc.db(), f.type_id, code)
            .unwrap()
            .id
    }

    fn count(f: &Fixture, sql: &str) -> i64 {
        f.svc.db().conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_end_to_end_widget() {
        let f = setup();
        let id = f
            .svc
            .create(
                NODE, TypeRef::Code("widget"), 0, Some("W1"), None, &widget_payload(), None,
            )
            .unwrap();

        let entity = f.svc.load(NODE, id, None).unwrap().unwrap();
        assert_eq!(entity.unique_id.as_deref(), Some("W1"));
        assert_eq!(
            entity.get(attr_id(&f, "color")).unwrap(),
            Some(&AttrValue::One(Value::Text("red".into())))
        );
        let mut expected_tags = BTreeMap::new();
        expected_tags.insert("a".to_string(), Value::Text("1".into()));
        expected_tags.insert("b".to_string(), Value::Text("2".into()));
        assert_eq!(
            entity.get(attr_id(&f, "tags")).unwrap(),
            Some(&AttrValue::Keyed(expected_tags.clone()))
        );

        let mut change = CodePayload::new();
        change.insert("color".into(), Some(AttrValue::One("blue".into())));
        assert!(f.svc.update(NODE, id, &change, &[], None).unwrap());

        let entity = f.svc.load(NODE, id, None).unwrap().unwrap();
        assert_eq!(
            entity.get(attr_id(&f, "color")).unwrap(),
            Some(&AttrValue::One(Value::Text("blue".into())))
        );
        assert_eq!(
            entity.get(attr_id(&f, "tags")).unwrap(),
            Some(&AttrValue::Keyed(expected_tags))
        );
    }

    #[test]
    fn test_update_noop_returns_false_and_skips_hooks() {
        let f = setup();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();
        let updates_before = f.svc.updates(id).unwrap().len();
        let distributions_before = f.log.borrow().updates.len();

        let same = widget_payload();
        assert!(!f.svc.update(NODE, id, &same, &[], None).unwrap());

        assert_eq!(f.svc.updates(id).unwrap().len(), updates_before);
        assert_eq!(f.log.borrow().updates.len(), distributions_before);
    }

    #[test]
    fn test_node_boundary_rejected_with_zero_writes() {
        // The node may read both attributes but write only color.
        let nodes = MockNodeService::split(
            vec!["color".into(), "weight".into()],
            vec!["color".into()],
        );
        let (router, _log) = MockRouterService::new();
        let svc = EntityService::new(
            EavDb::open_in_memory().unwrap(),
            AttributeRegistry::new(),
            Box::new(nodes),
            Box::new(router),
        );
        let type_id = svc
            .registry()
            .create_entity_type(svc.db(), "widget", "Widget", false)
            .unwrap();
        svc.registry()
            .create_attribute(
                svc.db(), TypeRef::Id(type_id), "color", "color",
                StorageType::Varchar, false, None, None,
            )
            .unwrap();
        svc.registry()
            .create_attribute(
                svc.db(), TypeRef::Id(type_id), "weight", "weight",
                StorageType::Int, false, None, None,
            )
            .unwrap();

        let mut data = CodePayload::new();
        data.insert("color".into(), Some(AttrValue::One("red".into())));
        data.insert("weight".into(), Some(AttrValue::One(Value::Int(5))));
        let err = svc
            .create(NODE, TypeRef::Id(type_id), 0, None, None, &data, None)
            .unwrap_err();
        assert!(matches!(err, EavError::Integrity(_)));
        assert_eq!(
            svc.db()
                .conn()
                .query_row("SELECT COUNT(*) FROM entity", [], |r| r.get::<_, i64>(0))
                .unwrap(),
            0
        );

        // The explicit attribute-list override widens the set.
        let id = svc
            .create(
                NODE, TypeRef::Id(type_id), 0, None, None, &data,
                Some(&["color".to_string(), "weight".to_string()]),
            )
            .unwrap();
        assert!(id > 0);
    }

    #[test]
    fn test_change_log_failure_rolls_back_save() {
        // A node service whose subscription enumeration is down: the
        // change-log append fails, and the save must fail with it.
        struct FailingEnumeration;
        impl NodeService for FailingEnumeration {
            fn subscribed_attribute_codes(
                &self,
                _node_id: i64,
                _entity_type_id: i64,
                _for_write: bool,
            ) -> Result<Vec<String>> {
                Ok(vec!["color".to_string()])
            }

            fn nodes_subscribed_to(&self, _entity_type_id: i64, _code: &str) -> Result<Vec<i64>> {
                Err(EavError::Storage("node registry offline".to_string()))
            }
        }

        let (router, _log) = MockRouterService::new();
        let svc = EntityService::new(
            EavDb::open_in_memory().unwrap(),
            AttributeRegistry::new(),
            Box::new(FailingEnumeration),
            Box::new(router),
        );
        let type_id = svc
            .registry()
            .create_entity_type(svc.db(), "widget", "Widget", false)
            .unwrap();
        let color = svc
            .registry()
            .create_attribute(
                svc.db(), TypeRef::Id(type_id), "color", "color",
                StorageType::Varchar, false, None, None,
            )
            .unwrap();

        // Seed the entity below the façade so the log append only runs on
        // the update under test.
        let mut payload = Payload::new();
        payload.insert(color, Some(AttrValue::One("red".into())));
        let id = mutator::create(
            svc.db(), svc.registry(), TypeRef::Id(type_id), 0, None, None, &payload,
        )
        .unwrap();

        let mut change = CodePayload::new();
        change.insert("color".into(), Some(AttrValue::One("blue".into())));
        let err = svc.update(NODE, id, &change, &[], None).unwrap_err();
        assert!(matches!(err, EavError::Storage(_)));

        // The value write was rolled back along with the failed append.
        let entity = svc.load(NODE, id, None).unwrap().unwrap();
        assert_eq!(
            entity.get(color).unwrap(),
            Some(&AttrValue::One(Value::Text("red".into())))
        );
        assert_eq!(
            svc.db()
                .conn()
                .query_row("SELECT COUNT(*) FROM entity_update", [], |r| r.get::<_, i64>(0))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_transform_hook_replaces_payload() {
        let f = setup_with(|router| {
            router.transform = Some(Box::new(|data: &Payload| {
                let mut out = data.clone();
                for value in out.values_mut() {
                    if let Some(AttrValue::One(Value::Text(s))) = value {
                        *s = s.to_uppercase();
                    }
                }
                out
            }));
        });

        let mut data = CodePayload::new();
        data.insert("color".into(), Some(AttrValue::One("red".into())));
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &data, None)
            .unwrap();

        let entity = f.svc.load(NODE, id, None).unwrap().unwrap();
        assert_eq!(
            entity.get(attr_id(&f, "color")).unwrap(),
            Some(&AttrValue::One(Value::Text("RED".into())))
        );
    }

    #[test]
    fn test_change_log_rows() {
        let f = setup();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();
        let mut change = CodePayload::new();
        change.insert("color".into(), Some(AttrValue::One("blue".into())));
        f.svc.update(NODE, id, &change, &[], None).unwrap();

        let updates = f.svc.updates(id).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].change, ChangeKind::Create);
        assert_eq!(updates[0].source_node, NODE);
        assert_eq!(
            updates[0].affected_attributes,
            vec!["color".to_string(), "tags".to_string()]
        );
        // The mock's single node (id 1) subscribes to color.
        assert_eq!(updates[0].affected_nodes, vec![1]);
        assert_eq!(updates[1].change, ChangeKind::Update);
        assert_eq!(updates[1].affected_attributes, vec!["color".to_string()]);
    }

    #[test]
    fn test_distribution_failure_keeps_mutation() {
        let f = setup_with(|router| router.fail_distribution = true);
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();

        // Persisted despite the failed fan-out, and fanned out zero times.
        let entity = f.svc.load(NODE, id, None).unwrap().unwrap();
        assert_eq!(
            entity.get(attr_id(&f, "color")).unwrap(),
            Some(&AttrValue::One(Value::Text("red".into())))
        );
        assert!(f.log.borrow().updates.is_empty());
        assert_eq!(count(&f, "SELECT COUNT(*) FROM entity_value_varchar"), 1);
    }

    #[test]
    fn test_delete_cascade() {
        let f = setup();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, Some("W1"), None, &widget_payload(), None)
            .unwrap();
        f.svc.add_comment(id, "test", "note", "body", None, false).unwrap();
        f.svc.register_local_id(id, NODE, 0, "ext-1").unwrap();

        f.svc.delete(NODE, id).unwrap();

        assert!(f.svc.load(NODE, id, None).unwrap().is_none());
        assert_eq!(count(&f, "SELECT COUNT(*) FROM entity_value_varchar"), 0);
        assert_eq!(count(&f, "SELECT COUNT(*) FROM entity_value_multi"), 0);
        assert_eq!(count(&f, "SELECT COUNT(*) FROM entity_comment"), 0);
        assert_eq!(count(&f, "SELECT COUNT(*) FROM entity_identifier"), 0);
        // The pre-delete pending record is marked inapplicable; the delete
        // itself is logged afterwards and stays pending.
        assert_eq!(
            count(&f, "SELECT COUNT(*) FROM entity_update WHERE done = 2"),
            1
        );
        let updates = f.svc.updates(id).unwrap();
        assert_eq!(updates.last().unwrap().change, ChangeKind::Delete);
    }

    #[test]
    fn test_comments_round_trip() {
        let f = setup();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();
        f.svc
            .add_comment(id, "importer", "first", "hello", Some("ref-9"), true)
            .unwrap();
        f.svc.add_comment(id, "importer", "second", "again", None, false).unwrap();

        let comments = f.svc.comments(id).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].title, "first");
        assert_eq!(comments[0].reference_id.as_deref(), Some("ref-9"));
        assert!(comments[0].customer_visible);
        assert!(!comments[1].customer_visible);

        // Comments require a persisted entity.
        assert!(f.svc.add_comment(9999, "x", "t", "b", None, false).is_err());
    }

    #[test]
    fn test_send_action_ack_and_failure() {
        let f = setup();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();

        let ok = f
            .svc
            .send_action(NODE, id, "ship", serde_json::json!({"qty": 1}))
            .unwrap();
        assert!(ok);
        assert_eq!(
            count(&f, "SELECT COUNT(*) FROM entity_action WHERE done = 1"),
            1
        );
        assert_eq!(f.log.borrow().actions, vec![(id, "ship".to_string())]);

        let f = setup_with(|router| router.fail_distribution = true);
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();
        let ok = f
            .svc
            .send_action(NODE, id, "ship", serde_json::json!({}))
            .unwrap();
        assert!(!ok);
        // The record stays pending for a later replay.
        assert_eq!(
            count(&f, "SELECT COUNT(*) FROM entity_action WHERE done = 0"),
            1
        );
    }

    #[test]
    fn test_local_id_round_trip() {
        let f = setup();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();

        f.svc.register_local_id(id, NODE, 0, "ext-42").unwrap();
        assert_eq!(f.svc.local_id(id, NODE).unwrap().as_deref(), Some("ext-42"));
        assert_eq!(f.svc.find_by_local_id(NODE, "ext-42").unwrap(), Some(id));
        assert_eq!(f.svc.find_by_local_id(NODE, "nope").unwrap(), None);

        // Re-registration replaces the mapping.
        f.svc.register_local_id(id, NODE, 0, "ext-43").unwrap();
        assert_eq!(f.svc.local_id(id, NODE).unwrap().as_deref(), Some("ext-43"));
    }

    #[test]
    fn test_exists_probe() {
        let f = setup();
        assert!(!f.svc.exists("W1"));
        f.svc
            .create(NODE, TypeRef::Id(f.type_id), 0, Some("W1"), None, &widget_payload(), None)
            .unwrap();
        assert!(f.svc.exists("W1"));
    }

    #[test]
    fn test_entity_transaction_labels_compose() {
        let f = setup();
        f.svc.begin_entity_transaction("import").unwrap();
        let id = f
            .svc
            .create(NODE, TypeRef::Id(f.type_id), 0, None, None, &widget_payload(), None)
            .unwrap();
        assert_eq!(f.svc.db().transaction_depth(), 1);
        f.svc.rollback_entity_transaction("import").unwrap();

        assert!(f.svc.load(NODE, id, None).unwrap().is_none());
        assert_eq!(count(&f, "SELECT COUNT(*) FROM entity"), 0);
    }

    #[test]
    fn test_search_narrows_to_readable_attributes() {
        let db = EavDb::open_in_memory().unwrap();
        let registry = AttributeRegistry::new();
        let type_id = registry.create_entity_type(&db, "widget", "Widget", false).unwrap();
        for code in ["color", "weight"] {
            registry
                .create_attribute(
                    &db, TypeRef::Id(type_id), code, code,
                    StorageType::Varchar, false, None, None,
                )
                .unwrap();
        }
        let nodes = MockNodeService::split(vec!["color".into()], vec!["color".into()]);
        let (router, _log) = MockRouterService::new();
        let svc = EntityService::new(db, registry, Box::new(nodes), Box::new(router));

        let mut data = CodePayload::new();
        data.insert("color".into(), Some(AttrValue::One("red".into())));
        let id = svc
            .create(NODE, TypeRef::Id(type_id), 0, None, None, &data, None)
            .unwrap();

        let results = svc.search(NODE, &Search::new(type_id)).unwrap();
        assert_eq!(results.len(), 1);
        let weight = svc
            .registry()
            .attribute_by_code(svc.db(), type_id, "weight")
            .unwrap();
        // weight was outside the readable set, so it was never hydrated.
        assert!(results[0].get(weight.id).is_err());
        assert!(results[0]
            .get(
                svc.registry()
                    .attribute_by_code(svc.db(), type_id, "color")
                    .unwrap()
                    .id
            )
            .unwrap()
            .is_some());
        assert_eq!(results[0].id, id);
    }
}
