// The embedded mini query language: compiles tokens of the form
//   {type:alias[:col1,col2|ALL][:attr<op>value,...][:opt=val,...]}
// into parenthesized, aliased SQL subselects over the value tables, and
// shapes result sets for ad hoc reporting.

use crate::error::{EavError, Result};
use crate::locator::{self, CmpOp, Search, SearchValue};
use crate::registry::{Attribute, AttributeRegistry, TypeRef};
use crate::storage::EavDb;
use crate::value::{AttrValue, Entity, StorageType, Value};
use regex::Regex;
use std::collections::BTreeMap;

/// A parsed filter: attribute code, operator, raw literal.
#[derive(Debug, Clone, PartialEq)]
struct Filter {
    attr: String,
    op: CmpOp,
    value: String,
}

/// How unfoldable filter clauses combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

/// A parsed token, before attribute resolution.
#[derive(Debug, Clone)]
struct Token {
    type_code: String,
    alias: String,
    columns: Columns,
    filters: Vec<Filter>,
    limit: Option<u64>,
    offset: Option<u64>,
    order: Option<(String, bool)>,
    store_id: Option<i64>,
    combine: Combinator,
}

#[derive(Debug, Clone, PartialEq)]
enum Columns {
    All,
    Listed(Vec<String>),
}

/// A compiled token: a subselect usable anywhere a table reference is.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub alias: String,
    /// `(SELECT ...) AS alias`
    pub sql: String,
    /// Projected attribute codes, in token order.
    pub columns: Vec<String>,
}

impl CompiledQuery {
    /// The bare SELECT, without the wrapping parentheses and alias.
    fn inner(&self) -> &str {
        &self.sql[1..self.sql.rfind(')').unwrap_or(self.sql.len() - 1)]
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

fn token_regex() -> Regex {
    // {type:alias[:section][:section][:section]}
    Regex::new(r"^\{([a-z][a-z0-9_]*):([A-Za-z][A-Za-z0-9_]*)((?::[^:{}]*){0,3})\}$")
        .expect("token regex is valid")
}

fn parse_token(raw: &str) -> Result<Token> {
    let re = token_regex();
    let caps = re
        .captures(raw.trim())
        .ok_or_else(|| EavError::Config(format!("malformed query token '{raw}'")))?;

    let type_code = caps[1].to_string();
    let alias = caps[2].to_string();
    let mut sections = caps[3]
        .split(':')
        .skip(1)
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    sections.resize(3, String::new());

    let columns = if sections[0].is_empty() {
        Columns::Listed(Vec::new())
    } else if sections[0] == "ALL" {
        Columns::All
    } else {
        Columns::Listed(
            sections[0]
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        )
    };

    let mut filters = Vec::new();
    if !sections[1].is_empty() {
        for part in sections[1].split(',') {
            filters.push(parse_filter(part)?);
        }
    }

    let mut token = Token {
        type_code,
        alias,
        columns,
        filters,
        limit: None,
        offset: None,
        order: None,
        store_id: None,
        combine: Combinator::And,
    };

    if !sections[2].is_empty() {
        for opt in sections[2].split(',') {
            let (key, val) = opt
                .split_once('=')
                .ok_or_else(|| EavError::Config(format!("malformed query option '{opt}'")))?;
            match key.trim() {
                "limit" => token.limit = Some(parse_num(val)?),
                "offset" => token.offset = Some(parse_num(val)?),
                "store" => token.store_id = Some(parse_num(val)? as i64),
                "order" => {
                    let (col, desc) = match val.trim().strip_suffix(".desc") {
                        Some(col) => (col, true),
                        None => (val.trim(), false),
                    };
                    token.order = Some((col.to_string(), desc));
                }
                "combine" => {
                    token.combine = match val.trim() {
                        "and" => Combinator::And,
                        "or" => Combinator::Or,
                        other => {
                            return Err(EavError::Config(format!(
                                "unknown combinator '{other}'"
                            )))
                        }
                    }
                }
                other => {
                    return Err(EavError::Config(format!("unknown query option '{other}'")))
                }
            }
        }
    }
    Ok(token)
}

fn parse_num(s: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| EavError::Config(format!("invalid numeric option value '{s}'")))
}

/// Filter operators, longest first so `!=` never parses as `=` and the
/// word operators require surrounding whitespace.
const FILTER_OPS: [(&str, CmpOp); 8] = [
    ("!like", CmpOp::NotLike),
    ("!in", CmpOp::NotIn),
    ("!=", CmpOp::Neq),
    (" like ", CmpOp::Like),
    (" in ", CmpOp::In),
    ("=", CmpOp::Eq),
    ("<", CmpOp::Lt),
    (">", CmpOp::Gt),
];

fn parse_filter(raw: &str) -> Result<Filter> {
    for (tok, op) in FILTER_OPS {
        if let Some(i) = raw.find(tok) {
            let attr = raw[..i].trim();
            let value = raw[i + tok.len()..].trim();
            if attr.is_empty() {
                break;
            }
            return Ok(Filter {
                attr: attr.to_string(),
                op,
                value: value.to_string(),
            });
        }
    }
    Err(EavError::Config(format!("malformed query filter '{raw}'")))
}

// ── Compilation ──────────────────────────────────────────────────────

/// Compile one token into a subselect. Unknown types, unknown attributes
/// and malformed tokens all fail fast with a config error.
pub fn compile(db: &EavDb, reg: &AttributeRegistry, raw: &str) -> Result<CompiledQuery> {
    compile_token(db, reg, &parse_token(raw)?, false)
}

/// Compile for the key/value execution shape: the first two columns are
/// projected literally as `k` and `v`.
fn compile_pairs(db: &EavDb, reg: &AttributeRegistry, raw: &str) -> Result<CompiledQuery> {
    let token = parse_token(raw)?;
    match &token.columns {
        Columns::Listed(cols) if cols.len() >= 2 => {}
        _ => {
            return Err(EavError::Config(
                "key/value execution requires a token with two columns".to_string(),
            ))
        }
    }
    compile_token(db, reg, &token, true)
}

fn compile_token(
    db: &EavDb,
    reg: &AttributeRegistry,
    token: &Token,
    pair_mode: bool,
) -> Result<CompiledQuery> {
    let type_id = reg.resolve_entity_type(db, TypeRef::Code(&token.type_code))?;

    let columns: Vec<Attribute> = match &token.columns {
        Columns::All => reg.attributes_for_type(db, type_id)?,
        Columns::Listed(codes) => {
            let mut attrs = Vec::with_capacity(codes.len());
            for code in codes {
                attrs.push(reg.attribute_by_code(db, type_id, code)?);
            }
            attrs
        }
    };

    // One join per referenced attribute, aliased att_<id>; a positive
    // equality filter folds into the join condition and makes it INNER.
    #[derive(Debug)]
    struct AttrJoin {
        attr: Attribute,
        inner: bool,
        folded: Option<String>,
    }
    let mut joins: Vec<AttrJoin> = Vec::new();
    let mut join_index: BTreeMap<i64, usize> = BTreeMap::new();
    for attr in &columns {
        if join_index.contains_key(&attr.id) {
            continue;
        }
        join_index.insert(attr.id, joins.len());
        joins.push(AttrJoin {
            attr: attr.clone(),
            inner: false,
            folded: None,
        });
    }

    let mut wheres: Vec<String> = Vec::new();
    for filter in &token.filters {
        let attr = reg.attribute_by_code(db, type_id, &filter.attr)?;
        let i = *join_index.entry(attr.id).or_insert_with(|| {
            joins.push(AttrJoin {
                attr: attr.clone(),
                inner: false,
                folded: None,
            });
            joins.len() - 1
        });
        let col = format!("att_{}.value", attr.id);
        let clause = render_filter(&col, filter, attr.storage)?;
        // Only a positive equality on a still-LEFT join folds; everything
        // else screens in the WHERE clause.
        if filter.op == CmpOp::Eq
            && filter.value != "NULL"
            && joins[i].folded.is_none()
            && token.combine == Combinator::And
        {
            joins[i].inner = true;
            joins[i].folded = Some(clause);
        } else {
            wheres.push(clause);
        }
    }

    // The order attribute joins like any other, so the FROM clause is
    // assembled in one pass.
    let mut order_sql = String::new();
    if let Some((col, desc)) = &token.order {
        let attr = reg.attribute_by_code(db, type_id, col)?;
        if !join_index.contains_key(&attr.id) {
            join_index.insert(attr.id, joins.len());
            joins.push(AttrJoin {
                attr: attr.clone(),
                inner: false,
                folded: None,
            });
        }
        order_sql = format!(
            " ORDER BY att_{}.value {}",
            attr.id,
            if *desc { "DESC" } else { "ASC" }
        );
    }

    let mut projections = vec!["e.entity_id AS entity_id".to_string()];
    let mut projected_codes = Vec::new();
    for (n, attr) in columns.iter().enumerate() {
        let alias = if pair_mode && n == 0 {
            "k".to_string()
        } else if pair_mode && n == 1 {
            "v".to_string()
        } else {
            attr.code.clone()
        };
        projections.push(format!("att_{}.value AS {alias}", attr.id));
        if attr.storage == StorageType::Multi {
            projections.push(format!("att_{}.key AS {}_key", attr.id, attr.code));
        }
        projected_codes.push(attr.code.clone());
    }

    let mut sql = format!("SELECT {} FROM entity e", projections.join(", "));
    for join in &joins {
        let kw = if join.inner { "INNER JOIN" } else { "LEFT JOIN" };
        let alias = format!("att_{}", join.attr.id);
        sql.push_str(&format!(
            " {kw} {} {alias} ON {alias}.entity_id = e.entity_id AND {alias}.attribute_id = {}",
            join.attr.storage.table(),
            join.attr.id
        ));
        if let Some(folded) = &join.folded {
            sql.push_str(&format!(" AND {folded}"));
        }
    }

    sql.push_str(&format!(" WHERE e.type_id = {type_id}"));
    if let Some(store) = token.store_id {
        sql.push_str(&format!(" AND e.store_id = {store}"));
    }
    if !wheres.is_empty() {
        let glue = match token.combine {
            Combinator::And => " AND ",
            Combinator::Or => " OR ",
        };
        sql.push_str(&format!(" AND ({})", wheres.join(glue)));
    }

    sql.push_str(&order_sql);
    if let Some(limit) = token.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = token.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    log::debug!("mlql token {{{}:{}}} compiled: {sql}", token.type_code, token.alias);
    Ok(CompiledQuery {
        alias: token.alias.clone(),
        sql: format!("({sql}) AS {}", token.alias),
        columns: projected_codes,
    })
}

/// Render one filter clause with the literal inlined (the subselect must
/// embed anywhere, so no bind parameters).
fn render_filter(col: &str, filter: &Filter, storage: StorageType) -> Result<String> {
    // =NULL / !=NULL normalize to IS NULL / IS NOT NULL.
    if filter.value == "NULL" {
        return match filter.op {
            CmpOp::Eq => Ok(format!("{col} IS NULL")),
            CmpOp::Neq => Ok(format!("{col} IS NOT NULL")),
            other => Err(EavError::Config(format!(
                "operator {other:?} cannot compare against NULL"
            ))),
        };
    }

    match filter.op {
        CmpOp::In | CmpOp::NotIn => {
            let items: Vec<String> = filter
                .value
                .split('|')
                .map(|v| literal(v.trim(), storage))
                .collect::<Result<_>>()?;
            if items.is_empty() {
                return Ok(if filter.op == CmpOp::In { "1 = 0" } else { "1 = 1" }.to_string());
            }
            let kw = if filter.op == CmpOp::In { "IN" } else { "NOT IN" };
            Ok(format!("{col} {kw} ({})", items.join(", ")))
        }
        op => {
            let sym = match op {
                CmpOp::Eq => "=",
                CmpOp::Neq => "!=",
                CmpOp::Lt => "<",
                CmpOp::Gt => ">",
                CmpOp::Like => "LIKE",
                CmpOp::NotLike => "NOT LIKE",
                CmpOp::Gteq | CmpOp::Lteq | CmpOp::In | CmpOp::NotIn => unreachable!(),
            };
            Ok(format!("{col} {sym} {}", literal(&filter.value, storage)?))
        }
    }
}

/// Inline a literal for the declared storage type, quoting text with
/// doubled single quotes.
fn literal(raw: &str, storage: StorageType) -> Result<String> {
    let value = Value::Text(raw.to_string()).normalize(storage)?;
    Ok(match value {
        Value::Int(n) => n.to_string(),
        Value::Decimal(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::DateTime(dt) => format!("'{}'", dt.to_rfc3339()),
    })
}

// ── Template expansion ───────────────────────────────────────────────

/// Replace every embedded `{...}` token in a SQL template with its
/// compiled subselect. Any malformed token fails the whole template.
pub fn expand(db: &EavDb, reg: &AttributeRegistry, template: &str) -> Result<String> {
    let embedded = Regex::new(r"\{[^{}]*\}").expect("embedded token regex is valid");
    let mut out = String::new();
    let mut last = 0;
    for m in embedded.find_iter(template) {
        out.push_str(&template[last..m.start()]);
        let compiled = compile(db, reg, m.as_str())?;
        out.push_str(&compiled.sql);
        last = m.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

// ── Execution shapes ─────────────────────────────────────────────────

/// Execute a token, returning every row as a JSON object.
pub fn fetch_rows(
    db: &EavDb,
    reg: &AttributeRegistry,
    raw: &str,
) -> Result<Vec<serde_json::Value>> {
    let compiled = compile(db, reg, raw)?;
    db.query_json(compiled.inner(), &vec![])
}

/// Execute a token, returning the first column of the first row.
pub fn fetch_one(db: &EavDb, reg: &AttributeRegistry, raw: &str) -> Result<serde_json::Value> {
    let compiled = compile(db, reg, raw)?;
    let rows = db.query_json(compiled.inner(), &vec![])?;
    let Some(row) = rows.into_iter().next() else {
        return Ok(serde_json::Value::Null);
    };
    Ok(first_data_column(&compiled, &row))
}

/// Execute a token, returning one column across all rows.
pub fn fetch_column(
    db: &EavDb,
    reg: &AttributeRegistry,
    raw: &str,
) -> Result<Vec<serde_json::Value>> {
    let compiled = compile(db, reg, raw)?;
    let rows = db.query_json(compiled.inner(), &vec![])?;
    Ok(rows.iter().map(|r| first_data_column(&compiled, r)).collect())
}

fn first_data_column(compiled: &CompiledQuery, row: &serde_json::Value) -> serde_json::Value {
    match compiled.columns.first() {
        Some(code) => row.get(code).cloned().unwrap_or(serde_json::Value::Null),
        None => row.get("entity_id").cloned().unwrap_or(serde_json::Value::Null),
    }
}

/// Execute a token with two columns as a key -> value map.
pub fn fetch_pairs(
    db: &EavDb,
    reg: &AttributeRegistry,
    raw: &str,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let compiled = compile_pairs(db, reg, raw)?;
    let rows = db.query_json(compiled.inner(), &vec![])?;
    let mut map = BTreeMap::new();
    for row in rows {
        let key = match row.get("k") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => continue,
        };
        map.insert(key, row.get("v").cloned().unwrap_or(serde_json::Value::Null));
    }
    Ok(map)
}

/// Execute a token and hydrate the matching entities through the locator,
/// preserving the result row order.
pub fn fetch_entities(db: &EavDb, reg: &AttributeRegistry, raw: &str) -> Result<Vec<Entity>> {
    let token = parse_token(raw)?;
    fetch_token_entities(db, reg, &token)
}

/// Like [`fetch_entities`], keyed by one of the token's projected columns.
/// Entities whose key column is null are skipped.
pub fn fetch_entities_keyed(
    db: &EavDb,
    reg: &AttributeRegistry,
    raw: &str,
    key_column: &str,
) -> Result<BTreeMap<String, Entity>> {
    let token = parse_token(raw)?;
    let type_id = reg.resolve_entity_type(db, TypeRef::Code(&token.type_code))?;
    let key_attr = reg.attribute_by_code(db, type_id, key_column)?;

    let mut map = BTreeMap::new();
    for entity in fetch_token_entities(db, reg, &token)? {
        let key = match entity.get(key_attr.id)? {
            Some(AttrValue::One(v)) => v.render(),
            _ => continue,
        };
        map.insert(key, entity);
    }
    Ok(map)
}

fn fetch_token_entities(
    db: &EavDb,
    reg: &AttributeRegistry,
    token: &Token,
) -> Result<Vec<Entity>> {
    let type_id = reg.resolve_entity_type(db, TypeRef::Code(&token.type_code))?;
    let compiled = compile_token(db, reg, token, false)?;
    let rows = db.query_json(compiled.inner(), &vec![])?;

    let mut ids = Vec::new();
    for row in &rows {
        if let Some(id) = row.get("entity_id").and_then(|v| v.as_i64()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut q = Search::new(type_id).filter(
        "ENTITY_ID",
        SearchValue::Many(ids.iter().map(|id| Value::Int(*id)).collect()),
    );
    q.options.load = match &token.columns {
        Columns::All => None,
        Columns::Listed(cols) => Some(cols.clone()),
    };
    let mut entities = locator::search(db, reg, &q)?;

    // Round-tripped ids come back in storage order; restore row order.
    entities.sort_by_key(|e| ids.iter().position(|id| *id == e.id).unwrap_or(usize::MAX));
    Ok(entities)
}
