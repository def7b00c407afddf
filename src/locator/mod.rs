// Search-to-SQL compiler: turns a declarative search specification into
// one base query over the entity table plus per-attribute joins against
// the type-sharded value tables, then hydrates entities with a single
// UNION-ALL fill query.

use crate::error::{EavError, Result};
use crate::registry::{Attribute, AttributeRegistry};
use crate::storage::{EavDb, SqlParams};
use crate::value::{AttrValue, Entity, StorageType, Value};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Static entity fields addressable in a search alongside attribute codes.
const STATIC_FIELDS: [&str; 6] = [
    "ENTITY_ID",
    "UNIQUE_ID",
    "PARENT_ID",
    "STORE_ID",
    "UPDATED_AT",
    "LOCAL_ID",
];

/// A search condition value.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchValue {
    Null,
    One(Value),
    Many(Vec<Value>),
}

impl From<Value> for SearchValue {
    fn from(v: Value) -> Self {
        SearchValue::One(v)
    }
}

impl From<&str> for SearchValue {
    fn from(s: &str) -> Self {
        SearchValue::One(Value::Text(s.to_string()))
    }
}

impl From<String> for SearchValue {
    fn from(s: String) -> Self {
        SearchValue::One(Value::Text(s))
    }
}

impl From<i64> for SearchValue {
    fn from(n: i64) -> Self {
        SearchValue::One(Value::Int(n))
    }
}

impl From<f64> for SearchValue {
    fn from(f: f64) -> Self {
        SearchValue::One(Value::Decimal(f))
    }
}

impl From<Vec<Value>> for SearchValue {
    fn from(vs: Vec<Value>) -> Self {
        SearchValue::Many(vs)
    }
}

/// Basic comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    In,
    NotIn,
    Gt,
    Gteq,
    Lt,
    Lteq,
    Like,
    NotLike,
}

/// A search operator for one condition key. `All` variants require every
/// stored value of a multi-valued attribute to satisfy the comparison,
/// enforced with an anti-join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Cmp(CmpOp),
    All(CmpOp),
    Null,
    NotNull,
    MultiKey,
    MultiValue,
    Impossible,
}

impl Operator {
    pub fn parse(s: &str) -> Result<Operator> {
        let (all, base) = match s.strip_prefix("all_") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let cmp = match base {
            "eq" => CmpOp::Eq,
            "neq" => CmpOp::Neq,
            "in" => CmpOp::In,
            "not_in" => CmpOp::NotIn,
            "gt" => CmpOp::Gt,
            "gteq" => CmpOp::Gteq,
            "lt" => CmpOp::Lt,
            "lteq" => CmpOp::Lteq,
            "like" => CmpOp::Like,
            "not_like" => CmpOp::NotLike,
            "null" if !all => return Ok(Operator::Null),
            "notnull" if !all => return Ok(Operator::NotNull),
            "multi_key" if !all => return Ok(Operator::MultiKey),
            "multi_value" if !all => return Ok(Operator::MultiValue),
            "impossible" if !all => return Ok(Operator::Impossible),
            other => {
                return Err(EavError::Config(format!("unknown search operator '{other}'")))
            }
        };
        Ok(if all { Operator::All(cmp) } else { Operator::Cmp(cmp) })
    }

    /// Operator defaulting: arrays search as `in`, scalars and null as `eq`.
    fn default_for(value: &SearchValue) -> Operator {
        match value {
            SearchValue::Many(_) => Operator::Cmp(CmpOp::In),
            _ => Operator::Cmp(CmpOp::Eq),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDir {
    Asc,
    Desc,
}

impl OrderDir {
    fn as_sql(&self) -> &'static str {
        match self {
            OrderDir::Asc => "ASC",
            OrderDir::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFunc {
    fn as_sql(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
            AggFunc::Avg => "AVG",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub func: AggFunc,
    pub field: String,
}

/// Search options: paging, ordering, aggregation, fkey auto-joins and the
/// attribute set to hydrate.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order: Vec<(String, OrderDir)>,
    pub group: Option<String>,
    pub aggregate: Option<Aggregate>,
    /// fkey attribute code -> target entity-type code, overriding (or
    /// standing in for) the attribute's own target metadata for dotted
    /// `attr.path` conditions.
    pub fkey_joins: HashMap<String, String>,
    /// Restrict to entities linked to this node and enable LOCAL_ID.
    pub linked_to_node: Option<i64>,
    /// Attribute codes to hydrate; `None` loads every attribute of the type.
    pub load: Option<Vec<String>>,
}

/// A declarative search specification.
#[derive(Debug, Clone)]
pub struct Search {
    pub entity_type_id: i64,
    /// 0 searches all stores.
    pub store_id: i64,
    pub data: Vec<(String, SearchValue)>,
    pub ops: HashMap<String, Operator>,
    pub options: SearchOptions,
}

impl Search {
    pub fn new(entity_type_id: i64) -> Self {
        Search {
            entity_type_id,
            store_id: 0,
            data: Vec::new(),
            ops: HashMap::new(),
            options: SearchOptions::default(),
        }
    }

    pub fn store(mut self, store_id: i64) -> Self {
        self.store_id = store_id;
        self
    }

    pub fn filter(mut self, key: &str, value: impl Into<SearchValue>) -> Self {
        self.data.push((key.to_string(), value.into()));
        self
    }

    pub fn filter_op(mut self, key: &str, op: Operator, value: impl Into<SearchValue>) -> Self {
        self.data.push((key.to_string(), value.into()));
        self.ops.insert(key.to_string(), op);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.options.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, key: &str, dir: OrderDir) -> Self {
        self.options.order.push((key.to_string(), dir));
        self
    }

    pub fn load(mut self, codes: &[&str]) -> Self {
        self.options.load = Some(codes.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn linked_to_node(mut self, node_id: i64) -> Self {
        self.options.linked_to_node = Some(node_id);
        self
    }

    pub fn fkey_join(mut self, attr_code: &str, target_type: &str) -> Self {
        self.options
            .fkey_joins
            .insert(attr_code.to_string(), target_type.to_string());
        self
    }
}

// ── Join graph ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    Inner,
    Left,
}

/// One aliased table node with its ON-condition edge. The graph is built
/// fully before any SQL is emitted; aliases are allocated explicitly, never
/// derived from string conventions.
#[derive(Debug)]
struct Join {
    kind: JoinKind,
    table: String,
    alias: String,
    on: String,
    params: SqlParams,
}

#[derive(Debug, Default)]
struct JoinGraph {
    joins: Vec<Join>,
    used_aliases: HashSet<String>,
}

impl JoinGraph {
    fn alias(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 1;
        while self.used_aliases.contains(&candidate) {
            n += 1;
            candidate = format!("{base}_{n}");
        }
        self.used_aliases.insert(candidate.clone());
        candidate
    }

    fn add(&mut self, join: Join) {
        self.joins.push(join);
    }

    fn sql(&self, out: &mut String, params: &mut SqlParams) {
        for join in &self.joins {
            let kw = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            out.push_str(&format!(" {kw} {} {} ON {}", join.table, join.alias, join.on));
            params.extend(join.params.iter().cloned());
        }
    }
}

// ── Compilation ──────────────────────────────────────────────────────

struct CompiledSearch {
    joins: JoinGraph,
    wheres: Vec<String>,
    where_params: SqlParams,
    order_sql: String,
    base_where_params: SqlParams,
    base_where: Vec<String>,
}

fn compile(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<CompiledSearch> {
    let mut joins = JoinGraph::default();
    let mut wheres: Vec<String> = Vec::new();
    let mut where_params: SqlParams = Vec::new();

    let mut base_where = vec!["e.type_id = ?".to_string()];
    let mut base_where_params: SqlParams =
        vec![rusqlite::types::Value::Integer(search.entity_type_id)];
    if search.store_id != 0 {
        base_where.push("e.store_id = ?".to_string());
        base_where_params.push(rusqlite::types::Value::Integer(search.store_id));
    }

    let ident_alias = if let Some(node_id) = search.options.linked_to_node {
        let alias = joins.alias("ident");
        joins.add(Join {
            kind: JoinKind::Inner,
            table: "entity_identifier".to_string(),
            alias: alias.clone(),
            on: format!("{alias}.entity_id = e.entity_id AND {alias}.node_id = ?"),
            params: vec![rusqlite::types::Value::Integer(node_id)],
        });
        Some(alias)
    } else {
        None
    };

    for (key, value) in &search.data {
        let op = search
            .ops
            .get(key)
            .copied()
            .unwrap_or_else(|| Operator::default_for(value));

        if STATIC_FIELDS.contains(&key.as_str()) {
            let col = static_column(key, ident_alias.as_deref())?;
            if matches!(op, Operator::All(_)) {
                return Err(EavError::Config(format!(
                    "all_* operators are not applicable to static field {key}"
                )));
            }
            let cond = render_condition(&col, op, value, &mut where_params)?;
            wheres.push(cond);
        } else if key.contains('.') {
            compile_fkey_path(
                db, reg, search, &mut joins, &mut wheres, &mut where_params, key, op, value,
            )?;
        } else {
            let attr = reg.attribute_by_code(db, search.entity_type_id, key)?;
            compile_attribute_condition(
                db, reg, &mut joins, &mut wheres, &mut where_params, "e", &attr, op, value,
            )?;
        }
    }

    // Ordering may reference attributes that are not filtered on; those get
    // their own LEFT join.
    let mut order_parts = Vec::new();
    for (key, dir) in &search.options.order {
        let expr = order_expr(db, reg, search, &mut joins, ident_alias.as_deref(), key)?;
        order_parts.push(format!("{expr} {}", dir.as_sql()));
    }
    let order_sql = if order_parts.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order_parts.join(", "))
    };

    Ok(CompiledSearch {
        joins,
        wheres,
        where_params,
        order_sql,
        base_where_params,
        base_where,
    })
}

fn static_column(key: &str, ident_alias: Option<&str>) -> Result<String> {
    Ok(match key {
        "ENTITY_ID" => "e.entity_id".to_string(),
        "UNIQUE_ID" => "e.unique_id".to_string(),
        "PARENT_ID" => "e.parent_id".to_string(),
        "STORE_ID" => "e.store_id".to_string(),
        "UPDATED_AT" => "e.updated_at".to_string(),
        "LOCAL_ID" => {
            let alias = ident_alias.ok_or_else(|| {
                EavError::Config(
                    "LOCAL_ID requires the linked_to_node option".to_string(),
                )
            })?;
            format!("{alias}.local_id")
        }
        other => return Err(EavError::Config(format!("unknown static field '{other}'"))),
    })
}

/// Emit the join + condition for one attribute filter. Positive filters
/// fold into an INNER join; null-screening uses a LEFT join so the absence
/// test composes; `all_*` adds an anti-join.
#[allow(clippy::too_many_arguments)]
fn compile_attribute_condition(
    _db: &EavDb,
    _reg: &AttributeRegistry,
    joins: &mut JoinGraph,
    wheres: &mut Vec<String>,
    where_params: &mut SqlParams,
    entity_alias: &str,
    attr: &Attribute,
    op: Operator,
    value: &SearchValue,
) -> Result<()> {
    let table = attr.storage.table();
    let value = normalize_search_value(value, attr.storage)?;

    match op {
        Operator::Impossible => {
            wheres.push("1 = 0".to_string());
        }
        Operator::Null => {
            let alias = joins.alias(&format!("att_{}", attr.id));
            joins.add(Join {
                kind: JoinKind::Left,
                table: table.to_string(),
                alias: alias.clone(),
                on: format!(
                    "{alias}.entity_id = {entity_alias}.entity_id AND {alias}.attribute_id = ?"
                ),
                params: vec![rusqlite::types::Value::Integer(attr.id)],
            });
            wheres.push(format!("{alias}.entity_id IS NULL"));
        }
        Operator::NotNull => {
            let alias = joins.alias(&format!("att_{}", attr.id));
            joins.add(Join {
                kind: JoinKind::Inner,
                table: table.to_string(),
                alias: alias.clone(),
                on: format!(
                    "{alias}.entity_id = {entity_alias}.entity_id AND {alias}.attribute_id = ?"
                ),
                params: vec![rusqlite::types::Value::Integer(attr.id)],
            });
        }
        Operator::MultiKey | Operator::MultiValue => {
            if attr.storage != StorageType::Multi {
                return Err(EavError::Config(format!(
                    "operator multi_key/multi_value requires a multi attribute, '{}' is {}",
                    attr.code,
                    attr.storage.as_str()
                )));
            }
            let col = if op == Operator::MultiKey { "key" } else { "value" };
            let alias = joins.alias(&format!("att_{}", attr.id));
            let mut on_params = vec![rusqlite::types::Value::Integer(attr.id)];
            let cond = render_condition(
                &format!("{alias}.{col}"),
                Operator::default_for(&value),
                &value,
                &mut on_params,
            )?;
            joins.add(Join {
                kind: JoinKind::Inner,
                table: table.to_string(),
                alias: alias.clone(),
                on: format!(
                    "{alias}.entity_id = {entity_alias}.entity_id AND {alias}.attribute_id = ? AND {cond}"
                ),
                params: on_params,
            });
        }
        Operator::Cmp(cmp) => {
            let alias = joins.alias(&format!("att_{}", attr.id));
            let mut on_params = vec![rusqlite::types::Value::Integer(attr.id)];
            let cond = render_condition(
                &format!("{alias}.value"),
                Operator::Cmp(cmp),
                &value,
                &mut on_params,
            )?;
            joins.add(Join {
                kind: JoinKind::Inner,
                table: table.to_string(),
                alias: alias.clone(),
                on: format!(
                    "{alias}.entity_id = {entity_alias}.entity_id AND {alias}.attribute_id = ? AND {cond}"
                ),
                params: on_params,
            });
        }
        Operator::All(cmp) => {
            // INNER join guarantees at least one stored value; the
            // anti-join rejects entities with any violating value.
            let alias = joins.alias(&format!("att_{}", attr.id));
            joins.add(Join {
                kind: JoinKind::Inner,
                table: table.to_string(),
                alias: alias.clone(),
                on: format!(
                    "{alias}.entity_id = {entity_alias}.entity_id AND {alias}.attribute_id = ?"
                ),
                params: vec![rusqlite::types::Value::Integer(attr.id)],
            });
            where_params.push(rusqlite::types::Value::Integer(attr.id));
            let cond = render_condition("av.value", Operator::Cmp(cmp), &value, where_params)?;
            wheres.push(format!(
                "NOT EXISTS (SELECT 1 FROM {table} av \
                 WHERE av.entity_id = {entity_alias}.entity_id \
                 AND av.attribute_id = ? AND NOT ({cond}))"
            ));
        }
    }
    Ok(())
}

/// Dotted `attr.path` search: each hop joins the fkey value table and the
/// target entity table; the final segment is resolved against the target
/// type (attribute or static field).
#[allow(clippy::too_many_arguments)]
fn compile_fkey_path(
    db: &EavDb,
    reg: &AttributeRegistry,
    search: &Search,
    joins: &mut JoinGraph,
    wheres: &mut Vec<String>,
    where_params: &mut SqlParams,
    key: &str,
    op: Operator,
    value: &SearchValue,
) -> Result<()> {
    let segments: Vec<&str> = key.split('.').collect();
    let mut current_type = search.entity_type_id;
    let mut current_alias = "e".to_string();

    for hop in &segments[..segments.len() - 1] {
        let attr = reg.attribute_by_code(db, current_type, hop)?;
        if !attr.storage.is_reference() {
            return Err(EavError::Config(format!(
                "attribute '{hop}' in path '{key}' is not a foreign-key attribute"
            )));
        }
        let target_code = search
            .options
            .fkey_joins
            .get(*hop)
            .cloned()
            .or_else(|| attr.fetch_data.clone())
            .ok_or_else(|| {
                EavError::Config(format!(
                    "fkey attribute '{hop}' has no target-type metadata"
                ))
            })?;
        let target_type =
            reg.resolve_entity_type(db, crate::registry::TypeRef::Code(&target_code))?;

        let value_alias = joins.alias(&format!("att_{}", attr.id));
        joins.add(Join {
            kind: JoinKind::Inner,
            table: attr.storage.table().to_string(),
            alias: value_alias.clone(),
            on: format!(
                "{value_alias}.entity_id = {current_alias}.entity_id AND {value_alias}.attribute_id = ?"
            ),
            params: vec![rusqlite::types::Value::Integer(attr.id)],
        });
        let entity_alias = joins.alias(&format!("ent_{}", attr.id));
        joins.add(Join {
            kind: JoinKind::Inner,
            table: "entity".to_string(),
            alias: entity_alias.clone(),
            on: format!(
                "{entity_alias}.entity_id = {value_alias}.value AND {entity_alias}.type_id = ?"
            ),
            params: vec![rusqlite::types::Value::Integer(target_type)],
        });

        current_type = target_type;
        current_alias = entity_alias;
    }

    let last = segments[segments.len() - 1];
    if STATIC_FIELDS.contains(&last) {
        if last == "LOCAL_ID" {
            return Err(EavError::Config(
                "LOCAL_ID is not addressable through a foreign-key path".to_string(),
            ));
        }
        let col = format!(
            "{current_alias}.{}",
            match last {
                "ENTITY_ID" => "entity_id",
                "UNIQUE_ID" => "unique_id",
                "PARENT_ID" => "parent_id",
                "STORE_ID" => "store_id",
                _ => "updated_at",
            }
        );
        let cond = render_condition(&col, op, value, where_params)?;
        wheres.push(cond);
    } else {
        let attr = reg.attribute_by_code(db, current_type, last)?;
        compile_attribute_condition(
            db,
            reg,
            joins,
            wheres,
            where_params,
            &current_alias,
            &attr,
            op,
            value,
        )?;
    }
    Ok(())
}

fn normalize_search_value(value: &SearchValue, storage: StorageType) -> Result<SearchValue> {
    Ok(match value {
        SearchValue::Null => SearchValue::Null,
        SearchValue::One(v) => SearchValue::One(v.normalize(storage)?),
        SearchValue::Many(vs) => {
            let mut out = Vec::with_capacity(vs.len());
            for v in vs {
                out.push(v.normalize(storage)?);
            }
            SearchValue::Many(out)
        }
    })
}

/// Render a comparison on a column expression, pushing parameters.
fn render_condition(
    col: &str,
    op: Operator,
    value: &SearchValue,
    params: &mut SqlParams,
) -> Result<String> {
    let cmp = match op {
        Operator::Cmp(c) => c,
        Operator::Null => return Ok(format!("{col} IS NULL")),
        Operator::NotNull => return Ok(format!("{col} IS NOT NULL")),
        Operator::Impossible => return Ok("1 = 0".to_string()),
        other => {
            return Err(EavError::Config(format!(
                "operator {other:?} cannot be rendered as a plain condition"
            )))
        }
    };

    // eq/neq against null degrade to IS NULL / IS NOT NULL.
    if matches!(value, SearchValue::Null) {
        return match cmp {
            CmpOp::Eq => Ok(format!("{col} IS NULL")),
            CmpOp::Neq => Ok(format!("{col} IS NOT NULL")),
            other => Err(EavError::Config(format!(
                "operator {other:?} requires a value"
            ))),
        };
    }

    match cmp {
        CmpOp::In | CmpOp::NotIn => {
            let list = match value {
                SearchValue::Many(vs) => vs.clone(),
                SearchValue::One(v) => vec![v.clone()],
                SearchValue::Null => unreachable!(),
            };
            if list.is_empty() {
                // An empty in-list matches nothing; an empty not_in
                // excludes nothing. Neither is an error.
                return Ok(if cmp == CmpOp::In { "1 = 0" } else { "1 = 1" }.to_string());
            }
            let placeholders = vec!["?"; list.len()].join(", ");
            for v in list {
                params.push(v.to_sql());
            }
            let kw = if cmp == CmpOp::In { "IN" } else { "NOT IN" };
            Ok(format!("{col} {kw} ({placeholders})"))
        }
        scalar_cmp => {
            let v = match value {
                SearchValue::One(v) => v.clone(),
                SearchValue::Many(vs) => vs.first().cloned().ok_or_else(|| {
                    EavError::Config(format!("operator {scalar_cmp:?} requires a value"))
                })?,
                SearchValue::Null => unreachable!(),
            };
            params.push(v.to_sql());
            let sym = match scalar_cmp {
                CmpOp::Eq => "=",
                CmpOp::Neq => "!=",
                CmpOp::Gt => ">",
                CmpOp::Gteq => ">=",
                CmpOp::Lt => "<",
                CmpOp::Lteq => "<=",
                CmpOp::Like => "LIKE",
                CmpOp::NotLike => "NOT LIKE",
                CmpOp::In | CmpOp::NotIn => unreachable!(),
            };
            Ok(format!("{col} {sym} ?"))
        }
    }
}

fn order_expr(
    db: &EavDb,
    reg: &AttributeRegistry,
    search: &Search,
    joins: &mut JoinGraph,
    ident_alias: Option<&str>,
    key: &str,
) -> Result<String> {
    if STATIC_FIELDS.contains(&key) {
        return static_column(key, ident_alias);
    }
    let attr = reg.attribute_by_code(db, search.entity_type_id, key)?;
    let alias = joins.alias(&format!("ord_{}", attr.id));
    joins.add(Join {
        kind: JoinKind::Left,
        table: attr.storage.table().to_string(),
        alias: alias.clone(),
        on: format!("{alias}.entity_id = e.entity_id AND {alias}.attribute_id = ?"),
        params: vec![rusqlite::types::Value::Integer(attr.id)],
    });
    Ok(format!("{alias}.value"))
}

fn assemble(
    compiled: &CompiledSearch,
    select: &str,
    group_by: Option<&str>,
    limit: Option<u64>,
    offset: Option<u64>,
    with_order: bool,
) -> (String, SqlParams) {
    let mut sql = format!("SELECT {select} FROM entity e");
    let mut params: SqlParams = Vec::new();
    compiled.joins.sql(&mut sql, &mut params);

    let mut wheres = compiled.base_where.clone();
    params.extend(compiled.base_where_params.iter().cloned());
    wheres.extend(compiled.wheres.iter().cloned());
    params.extend(compiled.where_params.iter().cloned());
    sql.push_str(&format!(" WHERE {}", wheres.join(" AND ")));

    if let Some(group) = group_by {
        sql.push_str(&format!(" GROUP BY {group}"));
    }
    if with_order {
        sql.push_str(&compiled.order_sql);
    }
    if let Some(l) = limit {
        sql.push_str(&format!(" LIMIT {l}"));
        if let Some(o) = offset {
            sql.push_str(&format!(" OFFSET {o}"));
        }
    } else if let Some(o) = offset {
        sql.push_str(&format!(" LIMIT -1 OFFSET {o}"));
    }
    (sql, params)
}

// ── Execution ────────────────────────────────────────────────────────

/// Run the search and hydrate the requested attributes.
pub fn search(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<Vec<Entity>> {
    let mut entities = search_static(db, reg, search)?;
    let attrs = attrs_to_load(db, reg, search)?;
    hydrate(db, &mut entities, &attrs)?;
    Ok(entities)
}

/// Run the search returning entities with static fields only.
pub fn search_static(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<Vec<Entity>> {
    let compiled = compile(db, reg, search)?;
    let (sql, params) = assemble(
        &compiled,
        "e.entity_id, e.type_id, e.store_id, e.unique_id, e.updated_at, e.parent_id",
        Some("e.entity_id"),
        search.options.limit,
        search.options.offset,
        true,
    );
    log::debug!("search sql: {sql}");

    let mut stmt = db.conn().prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        let updated: String = row.get(4)?;
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<String>>(3)?,
            updated,
            row.get::<_, Option<i64>>(5)?,
        ))
    })?;

    let mut entities = Vec::new();
    for row in rows {
        let (id, type_id, store_id, unique_id, updated, parent_id) = row?;
        let updated_at = parse_timestamp(&updated)?;
        entities.push(Entity::new(id, type_id, store_id, unique_id, updated_at, parent_id));
    }
    Ok(entities)
}

/// Run the search returning matching entity ids only.
pub fn search_ids(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<Vec<i64>> {
    let compiled = compile(db, reg, search)?;
    let (sql, params) = assemble(
        &compiled,
        "e.entity_id",
        Some("e.entity_id"),
        search.options.limit,
        search.options.offset,
        true,
    );
    let mut stmt = db.conn().prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

/// Count matching entities.
pub fn count(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<i64> {
    let compiled = compile(db, reg, search)?;
    let (sql, params) = assemble(
        &compiled,
        "COUNT(DISTINCT e.entity_id)",
        None,
        None,
        None,
        false,
    );
    let n = db
        .conn()
        .query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(n)
}

/// Evaluate the aggregate option to a single scalar. More than one result
/// row (a grouped aggregate with several groups) is an integrity error.
pub fn aggregate(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<serde_json::Value> {
    let agg = search
        .options
        .aggregate
        .as_ref()
        .ok_or_else(|| EavError::Config("aggregate search without aggregate option".into()))?;
    let mut compiled = compile(db, reg, search)?;

    let field_expr = aggregate_field_expr(db, reg, search, &mut compiled, &agg.field)?;
    let select = if agg.func == AggFunc::Count {
        format!("COUNT(DISTINCT {field_expr})")
    } else {
        format!("{}({field_expr})", agg.func.as_sql())
    };

    let group_expr = match &search.options.group {
        Some(key) => Some(aggregate_field_expr(db, reg, search, &mut compiled, key)?),
        None => None,
    };
    let (sql, params) = assemble(&compiled, &select, group_expr.as_deref(), None, None, false);
    log::debug!("aggregate sql: {sql}");

    let rows = db.query_json(&sql, &params)?;
    if rows.len() > 1 {
        return Err(EavError::Integrity(format!(
            "aggregate produced {} rows where exactly one was required",
            rows.len()
        )));
    }
    let row = rows.into_iter().next().unwrap_or(serde_json::Value::Null);
    match row {
        serde_json::Value::Object(map) => {
            Ok(map.into_iter().next().map(|(_, v)| v).unwrap_or(serde_json::Value::Null))
        }
        other => Ok(other),
    }
}

fn aggregate_field_expr(
    db: &EavDb,
    reg: &AttributeRegistry,
    search: &Search,
    compiled: &mut CompiledSearch,
    field: &str,
) -> Result<String> {
    if STATIC_FIELDS.contains(&field) {
        return static_column(field, None);
    }
    let attr = reg.attribute_by_code(db, search.entity_type_id, field)?;
    let alias = compiled.joins.alias(&format!("agg_{}", attr.id));
    compiled.joins.add(Join {
        kind: JoinKind::Left,
        table: attr.storage.table().to_string(),
        alias: alias.clone(),
        on: format!("{alias}.entity_id = e.entity_id AND {alias}.attribute_id = ?"),
        params: vec![rusqlite::types::Value::Integer(attr.id)],
    });
    Ok(format!("{alias}.value"))
}

/// Load a single entity by id, hydrating the given attribute codes
/// (or all of them).
pub fn load_entity(
    db: &EavDb,
    reg: &AttributeRegistry,
    entity_type_id: i64,
    entity_id: i64,
    attributes: Option<&[String]>,
) -> Result<Option<Entity>> {
    let mut q = Search::new(entity_type_id).filter("ENTITY_ID", entity_id);
    q.options.load = attributes.map(|a| a.to_vec());
    Ok(search(db, reg, &q)?.into_iter().next())
}

fn attrs_to_load(db: &EavDb, reg: &AttributeRegistry, search: &Search) -> Result<Vec<Attribute>> {
    match &search.options.load {
        None => reg.attributes_for_type(db, search.entity_type_id),
        Some(codes) => {
            let mut attrs = Vec::with_capacity(codes.len());
            for code in codes {
                attrs.push(reg.attribute_by_code(db, search.entity_type_id, code)?);
            }
            Ok(attrs)
        }
    }
}

/// The fill query: one UNION-ALL select across the distinct value tables
/// needed, folded into the entities client-side. Avoids one query per
/// storage type.
pub(crate) fn hydrate(db: &EavDb, entities: &mut [Entity], attrs: &[Attribute]) -> Result<()> {
    if entities.is_empty() || attrs.is_empty() {
        return Ok(());
    }

    // Every requested attribute counts as loaded even when no rows exist.
    for entity in entities.iter_mut() {
        for attr in attrs {
            entity.mark_loaded(attr.id);
        }
    }

    let mut by_storage: HashMap<StorageType, Vec<i64>> = HashMap::new();
    let mut storage_of: HashMap<i64, StorageType> = HashMap::new();
    for attr in attrs {
        by_storage.entry(attr.storage).or_default().push(attr.id);
        storage_of.insert(attr.id, attr.storage);
    }

    let ids: Vec<i64> = entities.iter().map(|e| e.id).collect();
    let id_placeholders = vec!["?"; ids.len()].join(", ");

    let mut selects = Vec::new();
    let mut params: SqlParams = Vec::new();
    // Deterministic branch order keeps the SQL stable for logging.
    let mut storages: Vec<&StorageType> = by_storage.keys().collect();
    storages.sort_by_key(|s| s.as_str());
    for storage in storages {
        let attr_ids = &by_storage[storage];
        let attr_placeholders = vec!["?"; attr_ids.len()].join(", ");
        let key_expr = if storage.keyed() { "key" } else { "NULL" };
        selects.push(format!(
            "SELECT entity_id, attribute_id, {key_expr} AS key, value FROM {} \
             WHERE entity_id IN ({id_placeholders}) AND attribute_id IN ({attr_placeholders})",
            storage.table()
        ));
        for id in &ids {
            params.push(rusqlite::types::Value::Integer(*id));
        }
        for attr_id in attr_ids {
            params.push(rusqlite::types::Value::Integer(*attr_id));
        }
    }
    let sql = selects.join(" UNION ALL ");
    log::debug!("fill sql: {sql}");

    let mut index: HashMap<i64, usize> = HashMap::new();
    for (i, entity) in entities.iter().enumerate() {
        index.insert(entity.id, i);
    }

    let mut stmt = db.conn().prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, rusqlite::types::Value>(3)?,
        ))
    })?;

    for row in rows {
        let (entity_id, attribute_id, key, raw) = row?;
        let Some(&i) = index.get(&entity_id) else { continue };
        let Some(&storage) = storage_of.get(&attribute_id) else { continue };
        if let Some(value) = Value::from_sql(raw, storage) {
            entities[i].absorb_row(attribute_id, key, value);
        }
    }
    Ok(())
}

/// Fetch the stored value of one attribute on one entity, if any.
pub(crate) fn current_value(
    db: &EavDb,
    entity_id: i64,
    attr: &Attribute,
) -> Result<Option<AttrValue>> {
    let key_expr = if attr.storage.keyed() { "key" } else { "NULL" };
    let sql = format!(
        "SELECT {key_expr} AS key, value FROM {} \
         WHERE entity_id = ?1 AND attribute_id = ?2 ORDER BY rowid",
        attr.storage.table()
    );
    let mut stmt = db.conn().prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![entity_id, attr.id], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, rusqlite::types::Value>(1)?,
        ))
    })?;

    let mut shell = Entity::new(entity_id, 0, 0, None, Utc::now(), None);
    let mut any = false;
    for row in rows {
        let (key, raw) = row?;
        if let Some(value) = Value::from_sql(raw, attr.storage) {
            shell.absorb_row(attr.id, key, value);
            any = true;
        }
    }
    if !any {
        return Ok(None);
    }
    Ok(shell.get(attr.id)?.cloned())
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EavError::Integrity(format!("unparsable updated_at '{raw}'")))
}
