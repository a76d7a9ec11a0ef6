use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::debug;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use shapedb_core::{
    BackingStore, CatalogEntry, ColumnKind, ColumnSpec, ColumnTag, ForeignKeyRef, StoreValue,
    TableRows, TableSpec, UpsertRow,
};

const CATALOG_TABLE: &str = "shapedb_catalog";

const CREATE_CATALOG_SQL: &str = "
CREATE TABLE IF NOT EXISTS shapedb_catalog (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  unique_keys TEXT NOT NULL,
  name TEXT,
  column_types TEXT NOT NULL DEFAULT '{}',
  UNIQUE(unique_keys)
);
";

/// SQLite-backed implementation of the engine's store adapter. All SQL
/// text lives here; identifiers are validated before they are quoted into
/// a statement and every value travels through a bound parameter.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a database file and configure the runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database, useful for tests and scratch
    /// work.
    ///
    /// # Errors
    /// Returns an error when the connection cannot be established.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// The underlying connection, exposed so hosts can wrap a commit in
    /// their own transaction scope.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Look up the identity of the row matching the upsert on the given
    /// columns. `IS` comparison so null-valued columns still match.
    fn probe_identity(&self, row: &UpsertRow, probe_columns: &[String]) -> Result<Option<i64>> {
        let mut clauses = Vec::with_capacity(probe_columns.len());
        let mut probe_values = Vec::with_capacity(probe_columns.len());
        for column in probe_columns {
            let idx = row
                .columns
                .iter()
                .position(|candidate| candidate == column)
                .ok_or_else(|| anyhow!("probe column `{column}` is not part of the upsert"))?;
            clauses.push(format!("{} IS ?{}", quoted(column)?, clauses.len() + 1));
            probe_values.push(bind_value(&row.values[idx]));
        }
        let select = format!(
            "SELECT id FROM {} WHERE {} ORDER BY id LIMIT 1",
            quoted(&row.table)?,
            clauses.join(" AND ")
        );
        self.conn
            .query_row(&select, params_from_iter(probe_values.iter()), |r| r.get(0))
            .optional()
            .with_context(|| format!("failed to recover identity from `{}`", row.table))
    }
}

impl BackingStore for SqliteStore {
    fn catalog_exists(&self) -> Result<bool> {
        table_exists(&self.conn, CATALOG_TABLE)
    }

    fn ensure_catalog(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_CATALOG_SQL)
            .context("failed to create catalog table")
    }

    fn register_table(&mut self, unique_keys: &str, name: Option<&str>) -> Result<i64> {
        self.conn
            .query_row(
                "INSERT INTO shapedb_catalog(unique_keys, name) VALUES (?1, ?2)
                 ON CONFLICT(unique_keys) DO UPDATE
                 SET name = COALESCE(excluded.name, shapedb_catalog.name)
                 RETURNING id",
                params![unique_keys, name],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to register table identity for `{unique_keys}`"))
    }

    fn record_column_types(
        &mut self,
        table_id: i64,
        tags: &BTreeMap<String, ColumnTag>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(tags).context("failed to serialize column types")?;
        let updated = self
            .conn
            .execute(
                "UPDATE shapedb_catalog SET column_types = ?1 WHERE id = ?2",
                params![encoded, table_id],
            )
            .context("failed to record column types")?;
        if updated == 0 {
            return Err(anyhow!("no catalog row for table id {table_id}"));
        }
        Ok(())
    }

    fn read_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, unique_keys, name, column_types FROM shapedb_catalog ORDER BY id ASC")
            .context("failed to read catalog")?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let table_id: i64 = row.get(0)?;
            let unique_keys_raw: String = row.get(1)?;
            let name: Option<String> = row.get(2)?;
            let column_types_raw: String = row.get(3)?;
            let unique_keys = if unique_keys_raw.is_empty() {
                Vec::new()
            } else {
                unique_keys_raw.split(',').map(ToString::to_string).collect()
            };
            let column_types = serde_json::from_str(&column_types_raw)
                .with_context(|| format!("failed to decode column types for table {table_id}"))?;
            entries.push(CatalogEntry {
                table_id,
                unique_keys,
                name,
                column_types,
            });
        }
        Ok(entries)
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<()> {
        let mut defs = Vec::with_capacity(spec.columns.len() + 1);
        for column in &spec.columns {
            defs.push(column_def(column)?);
        }
        if !spec.unique_columns.is_empty() {
            let constrained = quote_all(&spec.unique_columns)?.join(", ");
            defs.push(format!("UNIQUE({constrained})"));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quoted(&spec.name)?,
            defs.join(", ")
        );
        debug!("create table: {sql}");
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("failed to create table `{}`", spec.name))
    }

    fn add_columns(&mut self, table: &str, columns: &[ColumnSpec]) -> Result<()> {
        let table_ident = quoted(table)?;
        for column in columns {
            if matches!(column.kind, ColumnKind::Identity) {
                return Err(anyhow!("cannot add an identity column to an existing table"));
            }
            let sql = format!("ALTER TABLE {table_ident} ADD COLUMN {}", column_def(column)?);
            debug!("alter table: {sql}");
            self.conn.execute_batch(&sql).with_context(|| {
                format!("failed to add column `{}` to `{table}`", column.name)
            })?;
        }
        Ok(())
    }

    fn upsert_row(&mut self, row: &UpsertRow) -> Result<i64> {
        if row.columns.len() != row.values.len() {
            return Err(anyhow!(
                "upsert into `{}` has {} columns but {} values",
                row.table,
                row.columns.len(),
                row.values.len()
            ));
        }
        if row.columns.is_empty() {
            return Err(anyhow!("upsert into `{}` carries no columns", row.table));
        }

        let table_ident = quoted(&row.table)?;

        // No uniqueness constraint to conflict against: deduplicate by
        // full row value before inserting.
        if row.conflict_columns.is_empty() {
            if !row.update_columns.is_empty() {
                return Err(anyhow!(
                    "upsert into `{}` updates columns without a conflict target",
                    row.table
                ));
            }
            if let Some(id) = self.probe_identity(row, &row.columns)? {
                return Ok(id);
            }
        }

        let column_idents = quote_all(&row.columns)?;
        let placeholders: Vec<String> =
            (1..=row.columns.len()).map(|n| format!("?{n}")).collect();
        let mut sql = format!(
            "INSERT INTO {table_ident} ({}) VALUES ({})",
            column_idents.join(", "),
            placeholders.join(", ")
        );
        if row.update_columns.is_empty() {
            if !row.conflict_columns.is_empty() {
                let target = quote_all(&row.conflict_columns)?.join(", ");
                sql.push_str(&format!(" ON CONFLICT({target}) DO NOTHING"));
            }
        } else {
            let target = quote_all(&row.conflict_columns)?.join(", ");
            let mut assignments = Vec::with_capacity(row.update_columns.len());
            for column in &row.update_columns {
                let ident = quoted(column)?;
                assignments.push(format!("{ident} = excluded.{ident}"));
            }
            sql.push_str(&format!(
                " ON CONFLICT({target}) DO UPDATE SET {}",
                assignments.join(", ")
            ));
        }
        sql.push_str(" RETURNING id");
        debug!("upsert: {sql}");

        let values: Vec<Value> = row.values.iter().map(bind_value).collect();
        let inserted: Option<i64> = self
            .conn
            .query_row(&sql, params_from_iter(values.iter()), |r| r.get(0))
            .optional()
            .with_context(|| format!("failed to upsert into `{}`", row.table))?;
        if let Some(id) = inserted {
            return Ok(id);
        }

        // The conflict resolved to "do nothing", which returns no row;
        // recover the previously assigned identity.
        self.probe_identity(row, &row.conflict_columns)?
            .ok_or_else(|| anyhow!("conflicting row vanished from `{}` during upsert", row.table))
    }

    fn fetch_rows(&self, table: &str) -> Result<TableRows> {
        let table_ident = quoted(table)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {table_ident} ORDER BY id ASC"))
            .with_context(|| format!("failed to read table `{table}`"))?;
        let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
        let mut fetched = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(read_value(row.get_ref(idx)?));
            }
            fetched.push(values);
        }
        Ok(TableRows {
            columns,
            rows: fetched,
        })
    }

    fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyRef>> {
        let table_ident = quoted(table)?;
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA foreign_key_list({table_ident})"))
            .with_context(|| format!("failed to introspect foreign keys of `{table}`"))?;
        let found = stmt
            .query_map([], |row| {
                Ok(ForeignKeyRef {
                    referenced_table: row.get(2)?,
                    column: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read foreign keys of `{table}`"))?;
        Ok(found)
    }
}

/// Validate and quote an identifier. Identifiers cannot travel as bound
/// parameters, so anything outside `[A-Za-z_][A-Za-z0-9_]*` is refused
/// before it reaches statement text.
fn quoted(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow!(
            "identifier `{name}` is not safe to quote into a statement"
        ));
    }
    Ok(format!("\"{name}\""))
}

fn quote_all(names: &[String]) -> Result<Vec<String>> {
    names.iter().map(|name| quoted(name.as_str())).collect()
}

fn column_def(column: &ColumnSpec) -> Result<String> {
    let name = quoted(&column.name)?;
    let def = match &column.kind {
        ColumnKind::Identity => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
        ColumnKind::Ref { referenced_table } => {
            format!("{name} INTEGER REFERENCES {}(id)", quoted(referenced_table)?)
        }
        ColumnKind::Data => format!("{name} TEXT"),
    };
    Ok(def)
}

fn bind_value(value: &StoreValue) -> Value {
    match value {
        StoreValue::Null => Value::Null,
        StoreValue::Integer(v) => Value::Integer(*v),
        StoreValue::Real(v) => Value::Real(*v),
        StoreValue::Text(v) => Value::Text(v.clone()),
    }
}

fn read_value(value: ValueRef<'_>) -> StoreValue {
    match value {
        ValueRef::Null => StoreValue::Null,
        ValueRef::Integer(v) => StoreValue::Integer(v),
        ValueRef::Real(v) => StoreValue::Real(v),
        ValueRef::Text(v) | ValueRef::Blob(v) => {
            StoreValue::Text(String::from_utf8_lossy(v).into_owned())
        }
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}
