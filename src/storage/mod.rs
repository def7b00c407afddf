use crate::error::{EavError, Result};
use crate::value::StorageType;
use rusqlite::Connection;
use std::cell::RefCell;
use std::path::Path;

/// Dynamic parameter list for generated SQL.
pub type SqlParams = Vec<rusqlite::types::Value>;

/// The database handle for the EAV core: one SQLite connection plus the
/// transaction context for label-scoped nested transactions.
///
/// Nested logical transactions coalesce onto one physical transaction: the
/// physical BEGIN fires on the 0-to-1 push, the physical COMMIT on the
/// 1-to-0 pop. The stack is per-connection state, not process-global, so
/// each worker confines its own instance.
pub struct EavDb {
    conn: Connection,
    tx: RefCell<TxStack>,
}

#[derive(Default)]
struct TxStack {
    labels: Vec<String>,
    /// Set when an inner label rolled back; the outermost pop must then
    /// roll back instead of committing.
    poisoned: bool,
}

impl EavDb {
    /// Open or create the store database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = EavDb {
            conn,
            tx: RefCell::new(TxStack::default()),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = EavDb {
            conn,
            tx: RefCell::new(TxStack::default()),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    fn initialize_tables(&self) -> Result<()> {
        let mut ddl = String::from(
            "
            CREATE TABLE IF NOT EXISTS entity (
                entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_id INTEGER NOT NULL,
                store_id INTEGER NOT NULL DEFAULT 0,
                unique_id TEXT,
                updated_at TEXT NOT NULL,
                parent_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_entity_type ON entity(type_id, store_id);
            CREATE INDEX IF NOT EXISTS idx_entity_unique ON entity(unique_id);

            CREATE TABLE IF NOT EXISTS entity_type (
                entity_type_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                name_human TEXT NOT NULL,
                internal INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS entity_attribute (
                attribute_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type_id INTEGER NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                metadata INTEGER NOT NULL DEFAULT 0,
                comment TEXT,
                fetch_data TEXT,
                display_data TEXT,
                UNIQUE (entity_type_id, code)
            );

            CREATE TABLE IF NOT EXISTS entity_identifier (
                entity_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                store_id INTEGER NOT NULL DEFAULT 0,
                local_id TEXT NOT NULL,
                PRIMARY KEY (entity_id, node_id)
            );
            CREATE INDEX IF NOT EXISTS idx_identifier_local ON entity_identifier(node_id, local_id);

            CREATE TABLE IF NOT EXISTS entity_comment (
                comment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL,
                reference_id TEXT,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                customer_visible INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_comment_entity ON entity_comment(entity_id);

            CREATE TABLE IF NOT EXISTS entity_update (
                update_id INTEGER PRIMARY KEY AUTOINCREMENT,
                log_id INTEGER NOT NULL DEFAULT 0,
                entity_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source_node INTEGER NOT NULL,
                affected_nodes TEXT NOT NULL,
                affected_attributes TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_update_entity ON entity_update(entity_id, done);

            CREATE TABLE IF NOT EXISTS entity_action (
                action_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL,
                node_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_action_entity ON entity_action(entity_id, done);
            ",
        );

        // One value table per storage type; the enum owns the routing.
        for storage in StorageType::ALL {
            let table = storage.table();
            let affinity = storage.sql_affinity();
            let key_col = if storage.keyed() { "key TEXT NOT NULL," } else { "" };
            ddl.push_str(&format!(
                "
                CREATE TABLE IF NOT EXISTS {table} (
                    entity_id INTEGER NOT NULL,
                    attribute_id INTEGER NOT NULL,
                    {key_col}
                    value {affinity},
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_entity ON {table}(entity_id, attribute_id);
                CREATE INDEX IF NOT EXISTS idx_{table}_value ON {table}(attribute_id, value);
                "
            ));
        }

        self.conn.execute_batch(&ddl)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Label-scoped nested transactions ─────────────────────────────

    /// Push a transaction label. Fires the physical BEGIN only when the
    /// stack was empty.
    pub fn begin(&self, label: &str) -> Result<()> {
        let mut tx = self.tx.borrow_mut();
        if tx.labels.is_empty() {
            self.conn.execute_batch("BEGIN")?;
            tx.poisoned = false;
        }
        tx.labels.push(label.to_string());
        Ok(())
    }

    /// Pop a transaction label. Fires the physical COMMIT only when the
    /// stack empties; a label mismatch is a fatal programming error that
    /// forces a full rollback.
    pub fn commit(&self, label: &str) -> Result<()> {
        let mut tx = self.tx.borrow_mut();
        self.check_label(&mut tx, label, "commit")?;
        tx.labels.pop();
        if tx.labels.is_empty() {
            if tx.poisoned {
                tx.poisoned = false;
                self.conn.execute_batch("ROLLBACK")?;
                return Err(EavError::Storage(format!(
                    "transaction '{label}' rolled back: an inner scope failed"
                )));
            }
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Roll back a transaction label. Inner labels poison the physical
    /// transaction; the outermost pop performs the physical ROLLBACK.
    pub fn rollback(&self, label: &str) -> Result<()> {
        let mut tx = self.tx.borrow_mut();
        self.check_label(&mut tx, label, "rollback")?;
        tx.labels.pop();
        if tx.labels.is_empty() {
            tx.poisoned = false;
            self.conn.execute_batch("ROLLBACK")?;
        } else {
            tx.poisoned = true;
        }
        Ok(())
    }

    fn check_label(&self, tx: &mut TxStack, label: &str, op: &str) -> Result<()> {
        let top = tx.labels.last().cloned();
        if top.as_deref() == Some(label) {
            return Ok(());
        }
        // Mismatched label: the call stack and the transaction stack have
        // diverged. Abandon the whole physical transaction.
        log::error!(
            "transaction label mismatch on {op}: expected {top:?}, got '{label}'; forcing full rollback"
        );
        tx.labels.clear();
        tx.poisoned = false;
        let _ = self.conn.execute_batch("ROLLBACK");
        Err(EavError::Storage(format!(
            "transaction label mismatch: cannot {op} '{label}', top of stack was {top:?}"
        )))
    }

    pub fn transaction_depth(&self) -> usize {
        self.tx.borrow().labels.len()
    }

    /// Run `f` inside a SQLite savepoint. On failure the savepoint is
    /// rolled back and released, physically undoing the attempt's writes
    /// while leaving any enclosing labeled transaction open and clean.
    /// Outside a transaction the savepoint behaves as BEGIN/COMMIT.
    pub fn with_savepoint<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        match f() {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(unwind) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    log::error!("unwind of savepoint '{name}' failed: {unwind}");
                }
                Err(e)
            }
        }
    }

    /// Run `f` inside a labeled transaction scope.
    pub fn with_transaction<T>(&self, label: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin(label)?;
        match f() {
            Ok(value) => {
                self.commit(label)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self.rollback(label) {
                    log::error!("rollback of '{label}' failed: {rb}");
                }
                Err(e)
            }
        }
    }

    // ── Query helpers ────────────────────────────────────────────────

    /// Execute a statement with dynamically built parameters.
    pub(crate) fn execute(&self, sql: &str, params: &SqlParams) -> Result<usize> {
        let n = self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(n)
    }

    /// Run a query and convert every row to a JSON object keyed by the
    /// statement's column names.
    pub fn query_json(&self, sql: &str, params: &SqlParams) -> Result<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_names: Vec<String> = (0..stmt.column_count())
            .map(|i| stmt.column_name(i).unwrap_or("?").to_string())
            .collect();

        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let val: rusqlite::types::Value = row.get(i)?;
                obj.insert(name.clone(), sql_value_to_json(val));
            }
            Ok(serde_json::Value::Object(obj))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

/// Convert a raw SQLite value into JSON.
pub(crate) fn sql_value_to_json(val: rusqlite::types::Value) -> serde_json::Value {
    match val {
        rusqlite::types::Value::Null => serde_json::Value::Null,
        rusqlite::types::Value::Integer(n) => serde_json::Value::Number(n.into()),
        rusqlite::types::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        rusqlite::types::Value::Text(s) => serde_json::Value::String(s),
        rusqlite::types::Value::Blob(b) => {
            serde_json::Value::String(String::from_utf8_lossy(&b).into())
        }
    }
}
