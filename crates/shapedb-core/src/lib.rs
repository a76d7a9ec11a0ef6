use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Prefix for physical table names; the catalog id is appended to it, so
/// the same logical collection maps to the same table across restarts.
pub const TABLE_PREFIX: &str = "shapedb__";

/// Canonical wire rendering for timestamp fields.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema conflict: {0}")]
    SchemaConflict(String),
    #[error("field `{field}` references an item with no committed identity")]
    UnresolvedReference { field: String },
    #[error("rehydration order violated: {0}")]
    RehydrationOrder(String),
    #[error("unique key field `{0}` cannot be reassigned after creation")]
    UniqueKeyImmutable(String),
    #[error("backing store failure")]
    Store(#[from] anyhow::Error),
}

/// Handle to an item in a [`Registry`]. Two equal keys are the same
/// logical record, not merely equal-valued copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey(usize);

/// Handle to a collection in a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionKey(usize);

/// Declared persisted type of a column, recorded in the catalog at commit
/// time so reads decode deterministically instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTag {
    Text,
    Integer,
    Real,
    Timestamp,
    Ref,
}

/// A field value: a scalar, a timestamp, or a reference to another item.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Timestamp(OffsetDateTime),
    Ref(ItemKey),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn tag(&self) -> ColumnTag {
        match self {
            Self::Text(_) => ColumnTag::Text,
            Self::Integer(_) => ColumnTag::Integer,
            Self::Real(_) => ColumnTag::Real,
            Self::Timestamp(_) => ColumnTag::Timestamp,
            Self::Ref(_) => ColumnTag::Ref,
        }
    }
}

/// Derive the physical table name for a catalog id.
#[must_use]
pub fn table_name(table_id: i64) -> String {
    format!("{TABLE_PREFIX}{table_id}")
}

fn parse_table_name(table: &str) -> Option<i64> {
    table.strip_prefix(TABLE_PREFIX)?.parse().ok()
}

fn render_timestamp(value: OffsetDateTime) -> Result<String, MapperError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .map_err(|err| MapperError::Store(err.into()))
}

fn parse_timestamp(text: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn validate_field_name(name: &str) -> Result<(), MapperError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MapperError::Validation(format!(
            "field name `{name}` is not a valid identifier"
        )));
    }
    if name == "id" {
        return Err(MapperError::Validation(
            "field name `id` is reserved for the identity column".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backing store adapter interface
// ---------------------------------------------------------------------------

/// A value crossing the adapter boundary. Scalars and timestamps travel as
/// their canonical text rendering; references travel as row ids.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Serial identity column.
    Identity,
    /// Foreign-key column holding the referenced table's row id.
    Ref { referenced_table: String },
    /// Loosely typed data column.
    Data,
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    /// Columns under the table's uniqueness constraint; empty means no
    /// constraint is declared.
    pub unique_columns: Vec<String>,
}

/// One parameterized upsert. `conflict_columns` name the uniqueness
/// constraint to upsert against; `update_columns` are refreshed from the
/// incoming values on conflict. When `update_columns` is empty the
/// conflict resolves to "do nothing" and the adapter must still recover
/// and return the previously assigned row id. When `conflict_columns` is
/// empty no constraint exists to conflict against and the adapter
/// deduplicates by full row value instead.
#[derive(Debug, Clone)]
pub struct UpsertRow {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<StoreValue>,
    pub conflict_columns: Vec<String>,
    pub update_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub table_id: i64,
    pub unique_keys: Vec<String>,
    pub name: Option<String>,
    pub column_types: BTreeMap<String, ColumnTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub column: String,
    pub referenced_table: String,
}

#[derive(Debug, Clone)]
pub struct TableRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<StoreValue>>,
}

/// The backing relational store, supplied by the host. The engine never
/// assumes a dialect beyond what these operations express; all statement
/// text lives behind this trait.
pub trait BackingStore {
    fn catalog_exists(&self) -> anyhow::Result<bool>;
    fn ensure_catalog(&mut self) -> anyhow::Result<()>;
    /// Upsert a catalog row keyed by the joined sorted unique-key string,
    /// returning the (stable) numeric table id.
    fn register_table(&mut self, unique_keys: &str, name: Option<&str>) -> anyhow::Result<i64>;
    fn record_column_types(
        &mut self,
        table_id: i64,
        tags: &BTreeMap<String, ColumnTag>,
    ) -> anyhow::Result<()>;
    fn read_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>>;
    /// Create the table if it does not already exist.
    fn create_table(&mut self, spec: &TableSpec) -> anyhow::Result<()>;
    fn add_columns(&mut self, table: &str, columns: &[ColumnSpec]) -> anyhow::Result<()>;
    /// Execute one upsert and return the row's identity, recovering the
    /// existing id when the conflict resolved to "do nothing".
    fn upsert_row(&mut self, row: &UpsertRow) -> anyhow::Result<i64>;
    fn fetch_rows(&self, table: &str) -> anyhow::Result<TableRows>;
    /// Introspect the store's constraint catalog for one table.
    fn foreign_keys(&self, table: &str) -> anyhow::Result<Vec<ForeignKeyRef>>;
}

// ---------------------------------------------------------------------------
// External loader interface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TabularData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<FieldValue>>,
}

/// Lazily resolves a logical name to externally stored tabular data, used
/// by hosts to seed item fields. Outside the schema/commit protocol.
pub trait ExternalLoader {
    fn resolve(&mut self, name: &str) -> anyhow::Result<Option<TabularData>>;
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// An identity-bearing record: a fixed set of unique-key fields plus an
/// open, ordered map of data and reference fields.
#[derive(Debug)]
pub struct Item {
    unique_keys: Vec<String>,
    fields: BTreeMap<String, FieldValue>,
    row_id: Option<i64>,
    collection: CollectionKey,
}

impl Item {
    #[must_use]
    pub fn unique_keys(&self) -> &[String] {
        &self.unique_keys
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Store-assigned identity; `None` until the first commit.
    #[must_use]
    pub fn row_id(&self) -> Option<i64> {
        self.row_id
    }

    #[must_use]
    pub fn collection(&self) -> CollectionKey {
        self.collection
    }

    fn matches_unique(&self, unique_keys: &[String], fields: &BTreeMap<String, FieldValue>) -> bool {
        self.unique_keys == unique_keys
            && unique_keys
                .iter()
                .all(|key| self.fields.get(key) == fields.get(key))
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Schema descriptor for one table: the unique-key signature, the
/// foreign-key field map, and the superset of field names seen so far.
#[derive(Debug)]
pub struct Collection {
    unique_keys: Vec<String>,
    foreign_keys: BTreeMap<String, CollectionKey>,
    fields: Vec<String>,
    tags: BTreeMap<String, ColumnTag>,
    table_id: Option<i64>,
    name: Option<String>,
}

impl Collection {
    #[must_use]
    pub fn unique_keys(&self) -> &[String] {
        &self.unique_keys
    }

    #[must_use]
    pub fn foreign_keys(&self) -> &BTreeMap<String, CollectionKey> {
        &self.foreign_keys
    }

    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Catalog id; `None` until the first commit or rehydration, immutable
    /// afterwards.
    #[must_use]
    pub fn table_id(&self) -> Option<i64> {
        self.table_id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name this collection answers to: the explicit name when set,
    /// otherwise the derived table name once an id is assigned.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = &self.name {
            return Some(name.clone());
        }
        self.table_id.map(table_name)
    }

    fn signature(&self) -> String {
        self.unique_keys.join(",")
    }
}

fn merge_tag(
    field: &str,
    old: Option<ColumnTag>,
    new: ColumnTag,
) -> Result<ColumnTag, MapperError> {
    match old {
        None => Ok(new),
        Some(prior) if prior == new => Ok(prior),
        Some(ColumnTag::Ref) => Err(MapperError::SchemaConflict(format!(
            "field `{field}` holds a scalar but its column is a reference"
        ))),
        Some(_) if new == ColumnTag::Ref => Err(MapperError::SchemaConflict(format!(
            "field `{field}` holds a reference but its column is a scalar"
        ))),
        // Mixed scalar kinds widen to text.
        Some(_) => Ok(ColumnTag::Text),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide catalog of known items and collections. Owns both arenas;
/// one registry per store connection, serialized by the host.
#[derive(Debug, Default)]
pub struct Registry {
    collections: Vec<Collection>,
    items: Vec<Item>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct collections and items from an existing backing store.
    /// A store with no catalog table yields an empty registry.
    ///
    /// # Errors
    /// Returns an error when the store fails, when a foreign key points at
    /// a table missing from the catalog, or when a reference column value
    /// has no materialized referent.
    pub fn bootstrap<S: BackingStore>(store: &S) -> Result<Self, MapperError> {
        let mut registry = Self::new();
        if !store.catalog_exists()? {
            return Ok(registry);
        }

        let entries = store.read_catalog()?;
        info!("rehydrating {} collections from catalog", entries.len());

        for entry in entries {
            let mut unique_keys = entry.unique_keys;
            unique_keys.sort();
            let mut fields = unique_keys.clone();
            for field in entry.column_types.keys() {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
            registry.collections.push(Collection {
                unique_keys,
                foreign_keys: BTreeMap::new(),
                fields,
                tags: entry.column_types,
                table_id: Some(entry.table_id),
                name: entry.name,
            });
        }

        let mut discovered = Vec::new();
        for (idx, collection) in registry.collections.iter().enumerate() {
            let Some(table_id) = collection.table_id else {
                continue;
            };
            let table = table_name(table_id);
            for fk in store.foreign_keys(&table)? {
                let target = parse_table_name(&fk.referenced_table)
                    .and_then(|id| registry.collection_by_table_id(id))
                    .ok_or_else(|| {
                        MapperError::RehydrationOrder(format!(
                            "table `{table}` references `{}` which is not in the catalog",
                            fk.referenced_table
                        ))
                    })?;
                discovered.push((idx, fk.column, target));
            }
        }
        for (idx, column, target) in discovered {
            registry.collections[idx].foreign_keys.insert(column, target);
        }

        for key in registry.dependency_order()? {
            registry.read_table(key, store)?;
        }

        Ok(registry)
    }

    /// Construct or reuse the item identified by the given unique fields.
    /// The field names become the item's unique-key signature; a second
    /// call with the same names and equal values returns the existing
    /// item.
    ///
    /// # Errors
    /// Returns an error on invalid field names or when a reference-valued
    /// field collides with the collection's existing foreign-key shape.
    pub fn new_item(&mut self, unique_fields: &[(&str, FieldValue)]) -> Result<ItemKey, MapperError> {
        let mut fields = BTreeMap::new();
        for (name, value) in unique_fields {
            validate_field_name(name)?;
            fields.insert((*name).to_string(), value.clone());
        }
        let unique_keys: Vec<String> = fields.keys().cloned().collect();

        if let Some(existing) = self.reconcile(&unique_keys, &fields) {
            return Ok(existing);
        }

        let mut foreign_keys = BTreeMap::new();
        for (name, value) in &fields {
            if let FieldValue::Ref(target) = value {
                foreign_keys.insert(name.clone(), self.items[target.0].collection);
            }
        }

        let collection = self.resolve_collection(&unique_keys, &foreign_keys)?;
        self.items.push(Item {
            unique_keys,
            fields,
            row_id: None,
            collection,
        });
        Ok(ItemKey(self.items.len() - 1))
    }

    /// Assign a data field. Unique-key fields are fixed at creation;
    /// reassigning one with a different value fails fast.
    ///
    /// # Errors
    /// Returns an error on invalid field names, unique-key reassignment,
    /// or a reference that contradicts the collection's foreign-key shape.
    pub fn set_field(
        &mut self,
        item: ItemKey,
        field: &str,
        value: FieldValue,
    ) -> Result<(), MapperError> {
        validate_field_name(field)?;

        let collection = {
            let existing = &self.items[item.0];
            if existing.unique_keys.iter().any(|key| key == field)
                && existing.fields.get(field) != Some(&value)
            {
                return Err(MapperError::UniqueKeyImmutable(field.to_string()));
            }
            existing.collection
        };

        if let FieldValue::Ref(target) = &value {
            let target_collection = self.items[target.0].collection;
            match self.collections[collection.0].foreign_keys.get(field) {
                None => {
                    self.collections[collection.0]
                        .foreign_keys
                        .insert(field.to_string(), target_collection);
                }
                Some(current) if *current != target_collection => {
                    return Err(MapperError::SchemaConflict(format!(
                        "field `{field}` already references a different collection"
                    )));
                }
                Some(_) => {}
            }
        }

        self.items[item.0].fields.insert(field.to_string(), value);
        Ok(())
    }

    /// Assign several data fields; see [`Registry::set_field`].
    ///
    /// # Errors
    /// Propagates the first failing assignment.
    pub fn set_fields(
        &mut self,
        item: ItemKey,
        fields: &[(&str, FieldValue)],
    ) -> Result<(), MapperError> {
        for (name, value) in fields {
            self.set_field(item, name, value.clone())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn item(&self, key: ItemKey) -> &Item {
        &self.items[key.0]
    }

    #[must_use]
    pub fn collection(&self, key: CollectionKey) -> &Collection {
        &self.collections[key.0]
    }

    /// Attach a human-readable name, persisted with the catalog row on the
    /// next commit.
    pub fn set_collection_name(&mut self, collection: CollectionKey, name: &str) {
        self.collections[collection.0].name = Some(name.to_string());
    }

    /// Look up the collection whose unique-key signature matches,
    /// regardless of declaration order.
    #[must_use]
    pub fn find_collection(&self, unique_keys: &[&str]) -> Option<CollectionKey> {
        let mut sorted: Vec<String> = unique_keys.iter().map(ToString::to_string).collect();
        sorted.sort();
        self.collections
            .iter()
            .position(|collection| collection.unique_keys == sorted)
            .map(CollectionKey)
    }

    #[must_use]
    pub fn collection_by_table_id(&self, table_id: i64) -> Option<CollectionKey> {
        self.collections
            .iter()
            .position(|collection| collection.table_id == Some(table_id))
            .map(CollectionKey)
    }

    /// Match a collection by its explicit name or its derived table name.
    #[must_use]
    pub fn collection_by_name(&self, name: &str) -> Option<CollectionKey> {
        self.collections
            .iter()
            .position(|collection| collection.display_name().as_deref() == Some(name))
            .map(CollectionKey)
    }

    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.collections
            .iter()
            .filter_map(Collection::display_name)
            .collect()
    }

    /// Number of items in the collection with the given signature, or
    /// `None` when no such collection exists.
    #[must_use]
    pub fn collection_len(&self, unique_keys: &[&str]) -> Option<usize> {
        let key = self.find_collection(unique_keys)?;
        Some(self.items_in(key).len())
    }

    /// Exact lookup by (collection, identity); matches by identity only,
    /// never by content across collections.
    #[must_use]
    pub fn find_item(&self, collection: CollectionKey, row_id: i64) -> Option<ItemKey> {
        self.items
            .iter()
            .position(|item| item.collection == collection && item.row_id == Some(row_id))
            .map(ItemKey)
    }

    #[must_use]
    pub fn items(&self) -> Vec<ItemKey> {
        (0..self.items.len()).map(ItemKey).collect()
    }

    #[must_use]
    pub fn items_in(&self, collection: CollectionKey) -> Vec<ItemKey> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.collection == collection)
            .map(|(idx, _)| ItemKey(idx))
            .collect()
    }

    /// Items whose fields are a superset of the given filter mapping.
    #[must_use]
    pub fn items_matching(&self, filter: &[(&str, FieldValue)]) -> Vec<ItemKey> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                filter
                    .iter()
                    .all(|(name, value)| item.fields.get(*name) == Some(value))
            })
            .map(|(idx, _)| ItemKey(idx))
            .collect()
    }

    /// Seed items from externally resolved tabular data: one item per
    /// row, unique-keyed on the named columns, with the remaining
    /// columns landing as data fields. A name the loader cannot resolve
    /// yields no items.
    ///
    /// # Errors
    /// Returns an error when the loader fails, when `unique_columns`
    /// names a column absent from the data, or when a row does not match
    /// the column list.
    pub fn seed_from<L: ExternalLoader>(
        &mut self,
        loader: &mut L,
        name: &str,
        unique_columns: &[&str],
    ) -> Result<Vec<ItemKey>, MapperError> {
        let Some(data) = loader.resolve(name)? else {
            return Ok(Vec::new());
        };
        let mut positions = Vec::with_capacity(unique_columns.len());
        for column in unique_columns {
            let idx = data
                .columns
                .iter()
                .position(|candidate| candidate == column)
                .ok_or_else(|| {
                    MapperError::Validation(format!(
                        "loaded data for `{name}` has no column `{column}`"
                    ))
                })?;
            positions.push(idx);
        }

        let mut created = Vec::with_capacity(data.rows.len());
        for row in &data.rows {
            if row.len() != data.columns.len() {
                return Err(MapperError::Validation(format!(
                    "loaded data for `{name}` has a row of width {}, expected {}",
                    row.len(),
                    data.columns.len()
                )));
            }
            let unique_fields: Vec<(&str, FieldValue)> = positions
                .iter()
                .zip(unique_columns)
                .map(|(idx, column)| (*column, row[*idx].clone()))
                .collect();
            let item = self.new_item(&unique_fields)?;
            for (idx, column) in data.columns.iter().enumerate() {
                if !positions.contains(&idx) {
                    self.set_field(item, column, row[idx].clone())?;
                }
            }
            created.push(item);
        }
        debug!("seeded {} items from `{name}`", created.len());
        Ok(created)
    }

    /// Two-phase commit: synchronize every collection's schema in
    /// dependency order, then upsert every item's row, writing the
    /// store-assigned identity back onto the item.
    ///
    /// # Errors
    /// Any store failure aborts the remainder of the commit and surfaces
    /// unchanged; there is no partial-commit compensation. Callers needing
    /// atomicity wrap this in the store's own transaction scope.
    pub fn commit<S: BackingStore>(&mut self, store: &mut S) -> Result<(), MapperError> {
        store.ensure_catalog()?;
        let order = self.dependency_order()?;
        info!(
            "committing {} collections, {} items",
            self.collections.len(),
            self.items.len()
        );

        for key in &order {
            self.ensure_schema(*key, store)?;
        }

        for key in &order {
            for item in self.items_in(*key) {
                self.grow_schema(*key, item, store)?;
                self.upsert_item(item, store)?;
            }
        }

        for key in &order {
            let collection = &self.collections[key.0];
            if let Some(table_id) = collection.table_id {
                store.record_column_types(table_id, &collection.tags)?;
            }
        }

        Ok(())
    }

    fn reconcile(
        &self,
        unique_keys: &[String],
        fields: &BTreeMap<String, FieldValue>,
    ) -> Option<ItemKey> {
        self.items
            .iter()
            .position(|item| item.matches_unique(unique_keys, fields))
            .map(ItemKey)
    }

    fn resolve_collection(
        &mut self,
        unique_keys: &[String],
        foreign_keys: &BTreeMap<String, CollectionKey>,
    ) -> Result<CollectionKey, MapperError> {
        if let Some(idx) = self
            .collections
            .iter()
            .position(|collection| collection.unique_keys == unique_keys)
        {
            for (field, target) in foreign_keys {
                match self.collections[idx].foreign_keys.get(field) {
                    None => {
                        self.collections[idx]
                            .foreign_keys
                            .insert(field.clone(), *target);
                    }
                    Some(current) if current != target => {
                        return Err(MapperError::SchemaConflict(format!(
                            "field `{field}` already references a different collection"
                        )));
                    }
                    Some(_) => {}
                }
            }
            return Ok(CollectionKey(idx));
        }

        self.collections.push(Collection {
            unique_keys: unique_keys.to_vec(),
            foreign_keys: foreign_keys.clone(),
            fields: unique_keys.to_vec(),
            tags: BTreeMap::new(),
            table_id: None,
            name: None,
        });
        Ok(CollectionKey(self.collections.len() - 1))
    }

    /// Referenced-before-referencing order over the collection reference
    /// graph. Self-references are permitted; cycles between distinct
    /// collections are not, since no table creation order satisfies them.
    fn dependency_order(&self) -> Result<Vec<CollectionKey>, MapperError> {
        let total = self.collections.len();
        let mut done = vec![false; total];
        let mut order = Vec::with_capacity(total);

        while order.len() < total {
            let mut progressed = false;
            for idx in 0..total {
                if done[idx] {
                    continue;
                }
                let ready = self.collections[idx]
                    .foreign_keys
                    .values()
                    .all(|target| target.0 == idx || done[target.0]);
                if ready {
                    done[idx] = true;
                    order.push(CollectionKey(idx));
                    progressed = true;
                }
            }
            if !progressed {
                return Err(MapperError::SchemaConflict(
                    "collections form a reference cycle; no table creation order satisfies it"
                        .to_string(),
                ));
            }
        }

        Ok(order)
    }

    fn ensure_schema<S: BackingStore>(
        &mut self,
        key: CollectionKey,
        store: &mut S,
    ) -> Result<(), MapperError> {
        let (signature, name) = {
            let collection = &self.collections[key.0];
            (collection.signature(), collection.name.clone())
        };

        let table_id = store.register_table(&signature, name.as_deref())?;
        match self.collections[key.0].table_id {
            None => self.collections[key.0].table_id = Some(table_id),
            Some(existing) if existing != table_id => {
                return Err(MapperError::SchemaConflict(format!(
                    "collection `{signature}` is registered as table {existing} but the catalog returned {table_id}"
                )));
            }
            Some(_) => {}
        }

        let collection = &self.collections[key.0];
        let table = table_name(table_id);
        let mut columns = vec![ColumnSpec {
            name: "id".to_string(),
            kind: ColumnKind::Identity,
        }];
        for field in &collection.fields {
            columns.push(ColumnSpec {
                name: field.clone(),
                kind: self.column_kind(collection, field)?,
            });
        }
        let unique_columns = collection.unique_keys.clone();

        debug!("synchronizing table `{table}` ({signature})");
        store.create_table(&TableSpec {
            name: table,
            columns,
            unique_columns,
        })?;
        Ok(())
    }

    fn column_kind(&self, collection: &Collection, field: &str) -> Result<ColumnKind, MapperError> {
        let Some(target) = collection.foreign_keys.get(field) else {
            return Ok(ColumnKind::Data);
        };
        let Some(table_id) = self.collections[target.0].table_id else {
            return Err(MapperError::SchemaConflict(format!(
                "field `{field}` references a collection whose table is not yet registered"
            )));
        };
        Ok(ColumnKind::Ref {
            referenced_table: table_name(table_id),
        })
    }

    fn grow_schema<S: BackingStore>(
        &mut self,
        key: CollectionKey,
        item: ItemKey,
        store: &mut S,
    ) -> Result<(), MapperError> {
        let new_fields: Vec<String> = self.items[item.0]
            .fields
            .keys()
            .filter(|field| !self.collections[key.0].fields.contains(field))
            .cloned()
            .collect();
        if new_fields.is_empty() {
            return Ok(());
        }

        let collection = &self.collections[key.0];
        let Some(table_id) = collection.table_id else {
            return Err(MapperError::SchemaConflict(
                "cannot grow a collection before its table is registered".to_string(),
            ));
        };
        let table = table_name(table_id);
        let mut specs = Vec::with_capacity(new_fields.len());
        for field in &new_fields {
            specs.push(ColumnSpec {
                name: field.clone(),
                kind: self.column_kind(collection, field)?,
            });
        }

        debug!("growing table `{table}` with columns {new_fields:?}");
        store.add_columns(&table, &specs)?;
        self.collections[key.0].fields.extend(new_fields);
        Ok(())
    }

    fn upsert_item<S: BackingStore>(
        &mut self,
        item: ItemKey,
        store: &mut S,
    ) -> Result<(), MapperError> {
        let collection_key = self.items[item.0].collection;
        let Some(table_id) = self.collections[collection_key.0].table_id else {
            return Err(MapperError::SchemaConflict(
                "cannot upsert into a collection before its table is registered".to_string(),
            ));
        };

        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut tag_updates = Vec::new();
        {
            let record = &self.items[item.0];
            let collection = &self.collections[collection_key.0];
            for (field, value) in &record.fields {
                let merged = merge_tag(field, collection.tags.get(field).copied(), value.tag())?;
                tag_updates.push((field.clone(), merged));
                let rendered = match value {
                    FieldValue::Ref(target) => {
                        let row_id = self.items[target.0].row_id.ok_or_else(|| {
                            MapperError::UnresolvedReference {
                                field: field.clone(),
                            }
                        })?;
                        StoreValue::Integer(row_id)
                    }
                    FieldValue::Timestamp(ts) => StoreValue::Text(render_timestamp(*ts)?),
                    FieldValue::Integer(v) => StoreValue::Text(v.to_string()),
                    FieldValue::Real(v) => StoreValue::Text(v.to_string()),
                    FieldValue::Text(v) => StoreValue::Text(v.clone()),
                };
                columns.push(field.clone());
                values.push(rendered);
            }
        }

        let unique_keys = self.items[item.0].unique_keys.clone();
        let update_columns = if unique_keys.is_empty() {
            Vec::new()
        } else {
            columns
                .iter()
                .filter(|column| !unique_keys.contains(column))
                .cloned()
                .collect()
        };

        let row_id = store.upsert_row(&UpsertRow {
            table: table_name(table_id),
            columns,
            values,
            conflict_columns: unique_keys,
            update_columns,
        })?;

        for (field, tag) in tag_updates {
            self.collections[collection_key.0].tags.insert(field, tag);
        }
        self.items[item.0].row_id = Some(row_id);
        Ok(())
    }

    fn read_table<S: BackingStore>(
        &mut self,
        key: CollectionKey,
        store: &S,
    ) -> Result<(), MapperError> {
        let Some(table_id) = self.collections[key.0].table_id else {
            return Ok(());
        };
        let table = table_name(table_id);
        let data = store.fetch_rows(&table)?;

        for column in &data.columns {
            if column != "id" && !self.collections[key.0].fields.contains(column) {
                self.collections[key.0].fields.push(column.clone());
            }
        }

        let unique_keys = self.collections[key.0].unique_keys.clone();
        let foreign_keys = self.collections[key.0].foreign_keys.clone();
        let tags = self.collections[key.0].tags.clone();
        let row_count = data.rows.len();

        for row in data.rows {
            let mut decoded = BTreeMap::new();
            let mut row_id = None;
            for (column, value) in data.columns.iter().zip(row) {
                if column == "id" {
                    if let StoreValue::Integer(id) = value {
                        row_id = Some(id);
                    }
                    continue;
                }
                if matches!(value, StoreValue::Null) {
                    continue;
                }
                if let Some(target) = foreign_keys.get(column) {
                    let referent = match value {
                        StoreValue::Integer(id) => id,
                        other => {
                            return Err(MapperError::RehydrationOrder(format!(
                                "reference column `{column}` in `{table}` holds {other:?}, not a row id"
                            )));
                        }
                    };
                    let referent_item = self.find_item(*target, referent).ok_or_else(|| {
                        MapperError::RehydrationOrder(format!(
                            "reference column `{column}` in `{table}` points at row {referent} which is not materialized"
                        ))
                    })?;
                    decoded.insert(column.clone(), FieldValue::Ref(referent_item));
                } else {
                    decoded.insert(column.clone(), decode_value(value, tags.get(column).copied()));
                }
            }

            let row_id = row_id.ok_or_else(|| {
                MapperError::SchemaConflict(format!("table `{table}` has no identity column"))
            })?;
            for field in &unique_keys {
                if !decoded.contains_key(field) {
                    return Err(MapperError::RehydrationOrder(format!(
                        "row {row_id} of `{table}` is missing unique key `{field}`"
                    )));
                }
            }

            if let Some(existing) = self.reconcile(&unique_keys, &decoded) {
                let record = &mut self.items[existing.0];
                record.row_id = Some(row_id);
                for (field, value) in decoded {
                    record.fields.insert(field, value);
                }
            } else {
                self.items.push(Item {
                    unique_keys: unique_keys.clone(),
                    fields: decoded,
                    row_id: Some(row_id),
                    collection: key,
                });
            }
        }

        debug!("rehydrated {row_count} rows from `{table}`");
        Ok(())
    }
}

fn decode_value(value: StoreValue, tag: Option<ColumnTag>) -> FieldValue {
    match value {
        StoreValue::Null => FieldValue::Text(String::new()),
        StoreValue::Integer(v) => match tag {
            Some(ColumnTag::Integer) => FieldValue::Integer(v),
            _ => FieldValue::Text(v.to_string()),
        },
        StoreValue::Real(v) => match tag {
            Some(ColumnTag::Real) => FieldValue::Real(v),
            _ => FieldValue::Text(v.to_string()),
        },
        StoreValue::Text(text) => match tag {
            Some(ColumnTag::Integer) => text
                .parse()
                .map_or_else(|_| FieldValue::Text(text.clone()), FieldValue::Integer),
            Some(ColumnTag::Real) => text
                .parse()
                .map_or_else(|_| FieldValue::Text(text.clone()), FieldValue::Real),
            Some(ColumnTag::Timestamp) => match parse_timestamp(&text) {
                Some(ts) => FieldValue::Timestamp(ts),
                None => FieldValue::Text(text),
            },
            _ => FieldValue::Text(text),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use time::macros::datetime;

    /// In-memory backing store fixture with a coarse operation log, used
    /// to exercise the commit and rehydration protocols without a real
    /// database.
    #[derive(Debug, Default)]
    struct MemoryStore {
        catalog: Vec<CatalogRow>,
        tables: BTreeMap<String, MemoryTable>,
        ops: Vec<String>,
        catalog_ready: bool,
    }

    #[derive(Debug)]
    struct CatalogRow {
        unique_keys: String,
        name: Option<String>,
        column_types: BTreeMap<String, ColumnTag>,
    }

    #[derive(Debug)]
    struct MemoryTable {
        columns: Vec<ColumnSpec>,
        rows: Vec<BTreeMap<String, StoreValue>>,
        next_id: i64,
    }

    impl MemoryStore {
        fn op_count(&self, prefix: &str) -> usize {
            self.ops.iter().filter(|op| op.starts_with(prefix)).count()
        }

        fn rows(&self, table: &str) -> Result<&Vec<BTreeMap<String, StoreValue>>> {
            Ok(&self
                .tables
                .get(table)
                .ok_or_else(|| anyhow!("no such table: {table}"))?
                .rows)
        }
    }

    impl BackingStore for MemoryStore {
        fn catalog_exists(&self) -> Result<bool> {
            Ok(self.catalog_ready)
        }

        fn ensure_catalog(&mut self) -> Result<()> {
            self.ops.push("catalog".to_string());
            self.catalog_ready = true;
            Ok(())
        }

        fn register_table(&mut self, unique_keys: &str, name: Option<&str>) -> Result<i64> {
            self.ops.push(format!("register:{unique_keys}"));
            if let Some(idx) = self
                .catalog
                .iter()
                .position(|row| row.unique_keys == unique_keys)
            {
                if let Some(name) = name {
                    self.catalog[idx].name = Some(name.to_string());
                }
                return Ok(i64::try_from(idx)? + 1);
            }
            self.catalog.push(CatalogRow {
                unique_keys: unique_keys.to_string(),
                name: name.map(ToString::to_string),
                column_types: BTreeMap::new(),
            });
            Ok(i64::try_from(self.catalog.len())?)
        }

        fn record_column_types(
            &mut self,
            table_id: i64,
            tags: &BTreeMap<String, ColumnTag>,
        ) -> Result<()> {
            let idx = usize::try_from(table_id)? - 1;
            let row = self
                .catalog
                .get_mut(idx)
                .ok_or_else(|| anyhow!("no catalog row for table id {table_id}"))?;
            row.column_types = tags.clone();
            Ok(())
        }

        fn read_catalog(&self) -> Result<Vec<CatalogEntry>> {
            let mut entries = Vec::new();
            for (idx, row) in self.catalog.iter().enumerate() {
                entries.push(CatalogEntry {
                    table_id: i64::try_from(idx)? + 1,
                    unique_keys: if row.unique_keys.is_empty() {
                        Vec::new()
                    } else {
                        row.unique_keys.split(',').map(ToString::to_string).collect()
                    },
                    name: row.name.clone(),
                    column_types: row.column_types.clone(),
                });
            }
            Ok(entries)
        }

        fn create_table(&mut self, spec: &TableSpec) -> Result<()> {
            self.ops.push(format!("create:{}", spec.name));
            self.tables.entry(spec.name.clone()).or_insert(MemoryTable {
                columns: spec.columns.clone(),
                rows: Vec::new(),
                next_id: 1,
            });
            Ok(())
        }

        fn add_columns(&mut self, table: &str, columns: &[ColumnSpec]) -> Result<()> {
            self.ops.push(format!("alter:{table}"));
            let entry = self
                .tables
                .get_mut(table)
                .ok_or_else(|| anyhow!("no such table: {table}"))?;
            entry.columns.extend(columns.iter().cloned());
            Ok(())
        }

        fn upsert_row(&mut self, row: &UpsertRow) -> Result<i64> {
            self.ops.push(format!("upsert:{}", row.table));
            let mut values: BTreeMap<String, StoreValue> = BTreeMap::new();
            for (column, value) in row.columns.iter().zip(&row.values) {
                values.insert(column.clone(), value.clone());
            }

            let table = self
                .tables
                .get_mut(&row.table)
                .ok_or_else(|| anyhow!("no such table: {}", row.table))?;
            let probe: Vec<&String> = if row.conflict_columns.is_empty() {
                row.columns.iter().collect()
            } else {
                row.conflict_columns.iter().collect()
            };

            if let Some(existing) = table
                .rows
                .iter_mut()
                .find(|candidate| probe.iter().all(|col| candidate.get(*col) == values.get(*col)))
            {
                for column in &row.update_columns {
                    if let Some(value) = values.get(column) {
                        existing.insert(column.clone(), value.clone());
                    }
                }
                let Some(StoreValue::Integer(id)) = existing.get("id") else {
                    return Err(anyhow!("stored row has no identity"));
                };
                return Ok(*id);
            }

            let id = table.next_id;
            table.next_id += 1;
            values.insert("id".to_string(), StoreValue::Integer(id));
            table.rows.push(values);
            Ok(id)
        }

        fn fetch_rows(&self, table: &str) -> Result<TableRows> {
            let entry = self
                .tables
                .get(table)
                .ok_or_else(|| anyhow!("no such table: {table}"))?;
            let columns: Vec<String> = entry.columns.iter().map(|col| col.name.clone()).collect();
            let rows = entry
                .rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|col| row.get(col).cloned().unwrap_or(StoreValue::Null))
                        .collect()
                })
                .collect();
            Ok(TableRows { columns, rows })
        }

        fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKeyRef>> {
            let entry = self
                .tables
                .get(table)
                .ok_or_else(|| anyhow!("no such table: {table}"))?;
            Ok(entry
                .columns
                .iter()
                .filter_map(|col| match &col.kind {
                    ColumnKind::Ref { referenced_table } => Some(ForeignKeyRef {
                        column: col.name.clone(),
                        referenced_table: referenced_table.clone(),
                    }),
                    _ => None,
                })
                .collect())
        }
    }

    fn row_id_of(registry: &Registry, item: ItemKey) -> Result<i64> {
        registry
            .item(item)
            .row_id()
            .ok_or_else(|| anyhow!("item has no identity"))
    }

    #[test]
    fn creating_the_same_unique_fields_reuses_the_item() -> Result<()> {
        let mut registry = Registry::new();
        let first = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        let second = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        assert_eq!(first, second);
        assert_eq!(registry.items().len(), 1);

        registry.set_field(second, "score", FieldValue::Integer(7))?;
        assert_eq!(registry.item(first).get("score"), Some(&FieldValue::Integer(7)));

        let third = registry.new_item(&[("param", FieldValue::text("2005"))])?;
        assert_ne!(first, third);
        assert_eq!(registry.items().len(), 2);
        Ok(())
    }

    #[test]
    fn unique_key_order_does_not_affect_collection_identity() -> Result<()> {
        let mut registry = Registry::new();
        let ab = registry.new_item(&[
            ("a", FieldValue::text("1")),
            ("b", FieldValue::text("2")),
        ])?;
        let ba = registry.new_item(&[
            ("b", FieldValue::text("3")),
            ("a", FieldValue::text("4")),
        ])?;
        let ac = registry.new_item(&[
            ("a", FieldValue::text("5")),
            ("c", FieldValue::text("6")),
        ])?;

        assert_eq!(registry.item(ab).collection(), registry.item(ba).collection());
        assert_ne!(registry.item(ab).collection(), registry.item(ac).collection());
        assert_eq!(registry.find_collection(&["b", "a"]), Some(registry.item(ab).collection()));
        Ok(())
    }

    #[test]
    fn unique_key_reassignment_fails_fast() -> Result<()> {
        let mut registry = Registry::new();
        let item = registry.new_item(&[("param", FieldValue::text("2004"))])?;

        // Re-setting the same value is a harmless no-op.
        registry.set_field(item, "param", FieldValue::text("2004"))?;

        let err = registry
            .set_field(item, "param", FieldValue::text("2005"))
            .err()
            .ok_or_else(|| anyhow!("expected rejection"))?;
        assert!(matches!(err, MapperError::UniqueKeyImmutable(field) if field == "param"));
        Ok(())
    }

    #[test]
    fn reserved_and_malformed_field_names_are_rejected() -> Result<()> {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.new_item(&[("id", FieldValue::Integer(1))]),
            Err(MapperError::Validation(_))
        ));
        assert!(matches!(
            registry.new_item(&[("no spaces", FieldValue::Integer(1))]),
            Err(MapperError::Validation(_))
        ));
        assert!(matches!(
            registry.new_item(&[("drop\"table", FieldValue::Integer(1))]),
            Err(MapperError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn reference_fields_register_foreign_keys() -> Result<()> {
        let mut registry = Registry::new();
        let run = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        let span = registry.new_item(&[
            ("run", FieldValue::Ref(run)),
            ("start", FieldValue::text("t0")),
        ])?;

        let collection = registry.collection(registry.item(span).collection());
        assert_eq!(
            collection.foreign_keys().get("run"),
            Some(&registry.item(run).collection())
        );
        Ok(())
    }

    #[test]
    fn conflicting_reference_targets_are_rejected() -> Result<()> {
        let mut registry = Registry::new();
        let run = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        let other = registry.new_item(&[("label", FieldValue::text("x"))])?;
        let span = registry.new_item(&[("start", FieldValue::text("t0"))])?;

        registry.set_field(span, "origin", FieldValue::Ref(run))?;
        let err = registry
            .set_field(span, "origin", FieldValue::Ref(other))
            .err()
            .ok_or_else(|| anyhow!("expected rejection"))?;
        assert!(matches!(err, MapperError::SchemaConflict(_)));
        Ok(())
    }

    #[test]
    fn dependency_order_puts_referenced_collections_first() -> Result<()> {
        let mut registry = Registry::new();
        let leaf = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        let middle = registry.new_item(&[("run", FieldValue::Ref(leaf))])?;
        let top = registry.new_item(&[("span", FieldValue::Ref(middle))])?;

        let order = registry.dependency_order()?;
        let pos = |key: CollectionKey| -> Result<usize> {
            order
                .iter()
                .position(|candidate| *candidate == key)
                .ok_or_else(|| anyhow!("collection missing from order"))
        };
        let leaf_pos = pos(registry.item(leaf).collection())?;
        let middle_pos = pos(registry.item(middle).collection())?;
        let top_pos = pos(registry.item(top).collection())?;
        assert!(leaf_pos < middle_pos);
        assert!(middle_pos < top_pos);
        Ok(())
    }

    #[test]
    fn reference_cycles_are_rejected_at_commit() -> Result<()> {
        let mut registry = Registry::new();
        let a = registry.new_item(&[("left", FieldValue::text("1"))])?;
        let b = registry.new_item(&[("right", FieldValue::text("2"))])?;
        registry.set_field(a, "peer", FieldValue::Ref(b))?;
        registry.set_field(b, "peer_back", FieldValue::Ref(a))?;

        let mut store = MemoryStore::default();
        let err = registry
            .commit(&mut store)
            .err()
            .ok_or_else(|| anyhow!("expected cycle rejection"))?;
        assert!(matches!(err, MapperError::SchemaConflict(_)));
        Ok(())
    }

    #[test]
    fn commit_assigns_identities_and_upserts_in_place() -> Result<()> {
        let mut registry = Registry::new();
        let mut store = MemoryStore::default();

        let run = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        let span = registry.new_item(&[
            ("run", FieldValue::Ref(run)),
            ("start", FieldValue::text("t0")),
            ("end", FieldValue::text("t1")),
        ])?;
        registry.set_field(span, "score", FieldValue::Integer(10))?;

        registry.commit(&mut store)?;
        let run_id = row_id_of(&registry, run)?;
        let span_id = row_id_of(&registry, span)?;

        // Re-commit with a changed data field: same identities, same row
        // count, refreshed value, no further schema changes.
        registry.set_field(span, "score", FieldValue::Integer(11))?;
        let alters_before = store.op_count("alter:");
        registry.commit(&mut store)?;
        assert_eq!(row_id_of(&registry, run)?, run_id);
        assert_eq!(row_id_of(&registry, span)?, span_id);
        assert_eq!(store.op_count("alter:"), alters_before);

        let span_table = registry
            .collection(registry.item(span).collection())
            .table_id()
            .map(table_name)
            .ok_or_else(|| anyhow!("span collection has no table"))?;
        let rows = store.rows(&span_table)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("score"), Some(&StoreValue::Text("11".to_string())));
        assert_eq!(rows[0].get("run"), Some(&StoreValue::Integer(run_id)));
        Ok(())
    }

    #[test]
    fn schema_growth_is_additive_and_idempotent() -> Result<()> {
        let mut registry = Registry::new();
        let mut store = MemoryStore::default();

        let item = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        registry.set_field(item, "score", FieldValue::Integer(1))?;
        registry.commit(&mut store)?;
        registry.commit(&mut store)?;
        let alters_before = store.op_count("alter:");

        registry.set_field(item, "comment", FieldValue::text("late arrival"))?;
        registry.commit(&mut store)?;
        assert_eq!(store.op_count("alter:"), alters_before + 1);

        let table = registry
            .collection(registry.item(item).collection())
            .table_id()
            .map(table_name)
            .ok_or_else(|| anyhow!("collection has no table"))?;
        let rows = store.rows(&table)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("score"), Some(&StoreValue::Text("1".to_string())));
        assert_eq!(
            rows[0].get("comment"),
            Some(&StoreValue::Text("late arrival".to_string()))
        );
        Ok(())
    }

    #[test]
    fn references_to_uncommitted_identities_fail() -> Result<()> {
        let mut registry = Registry::new();
        let first = registry.new_item(&[("node", FieldValue::text("a"))])?;
        let second = registry.new_item(&[("node", FieldValue::text("b"))])?;
        // Self-referencing collection: the earlier item points forward at
        // the later one, which has no identity when the row is written.
        registry.set_field(first, "next", FieldValue::Ref(second))?;

        let mut store = MemoryStore::default();
        let err = registry
            .commit(&mut store)
            .err()
            .ok_or_else(|| anyhow!("expected unresolved reference"))?;
        assert!(matches!(err, MapperError::UnresolvedReference { field } if field == "next"));
        Ok(())
    }

    #[test]
    fn bootstrap_round_trip_preserves_identity_and_references() -> Result<()> {
        let mut registry = Registry::new();
        let mut store = MemoryStore::default();

        let run = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        let span = registry.new_item(&[
            ("run", FieldValue::Ref(run)),
            ("start", FieldValue::Timestamp(datetime!(2004-05-01 10:00:00 UTC))),
            ("end", FieldValue::Timestamp(datetime!(2004-05-01 11:30:00 UTC))),
        ])?;
        registry.set_field(span, "score", FieldValue::Integer(42))?;
        registry.set_field(span, "weight", FieldValue::Real(2.5))?;
        registry.commit(&mut store)?;

        let run_id = row_id_of(&registry, run)?;
        let span_id = row_id_of(&registry, span)?;

        let rehydrated = Registry::bootstrap(&store)?;
        assert_eq!(rehydrated.collection_names().len(), 2);
        assert_eq!(rehydrated.items().len(), 2);

        let run_collection = rehydrated
            .find_collection(&["param"])
            .ok_or_else(|| anyhow!("run collection missing"))?;
        let span_collection = rehydrated
            .find_collection(&["run", "start", "end"])
            .ok_or_else(|| anyhow!("span collection missing"))?;
        let new_run = rehydrated
            .find_item(run_collection, run_id)
            .ok_or_else(|| anyhow!("run item missing"))?;
        let new_span = rehydrated
            .find_item(span_collection, span_id)
            .ok_or_else(|| anyhow!("span item missing"))?;

        // The reference resolves to the same reconstructed instance, not
        // an equal-valued copy.
        assert_eq!(
            rehydrated.item(new_span).get("run"),
            Some(&FieldValue::Ref(new_run))
        );
        // Declared column tags decode values back to their variants.
        assert_eq!(
            rehydrated.item(new_span).get("score"),
            Some(&FieldValue::Integer(42))
        );
        assert_eq!(
            rehydrated.item(new_span).get("weight"),
            Some(&FieldValue::Real(2.5))
        );
        assert_eq!(
            rehydrated.item(new_span).get("start"),
            Some(&FieldValue::Timestamp(datetime!(2004-05-01 10:00:00 UTC)))
        );
        Ok(())
    }

    #[test]
    fn bootstrap_of_a_fresh_store_is_empty() -> Result<()> {
        let store = MemoryStore::default();
        let registry = Registry::bootstrap(&store)?;
        assert!(registry.items().is_empty());
        assert!(registry.collection_names().is_empty());
        Ok(())
    }

    #[test]
    fn items_matching_filters_by_field_superset() -> Result<()> {
        let mut registry = Registry::new();
        let a = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        registry.set_field(a, "kind", FieldValue::text("baseline"))?;
        let b = registry.new_item(&[("param", FieldValue::text("2005"))])?;
        registry.set_field(b, "kind", FieldValue::text("baseline"))?;
        let _c = registry.new_item(&[("label", FieldValue::text("other"))])?;

        let baseline = registry.items_matching(&[("kind", FieldValue::text("baseline"))]);
        assert_eq!(baseline, vec![a, b]);

        let narrowed = registry.items_matching(&[
            ("kind", FieldValue::text("baseline")),
            ("param", FieldValue::text("2005")),
        ]);
        assert_eq!(narrowed, vec![b]);

        assert_eq!(registry.collection_len(&["param"]), Some(2));
        assert_eq!(registry.collection_len(&["missing"]), None);
        Ok(())
    }

    #[test]
    fn empty_unique_key_commit_stays_single_row() -> Result<()> {
        let mut registry = Registry::new();
        let mut store = MemoryStore::default();

        let singleton = registry.new_item(&[])?;
        registry.set_field(singleton, "note", FieldValue::text("only row"))?;
        registry.commit(&mut store)?;
        registry.commit(&mut store)?;

        let table = registry
            .collection(registry.item(singleton).collection())
            .table_id()
            .map(table_name)
            .ok_or_else(|| anyhow!("collection has no table"))?;
        assert_eq!(store.rows(&table)?.len(), 1);

        // Re-declaring the empty signature resolves to the same item.
        let again = registry.new_item(&[])?;
        assert_eq!(again, singleton);
        Ok(())
    }

    #[test]
    fn collection_names_survive_commit_and_bootstrap() -> Result<()> {
        let mut registry = Registry::new();
        let mut store = MemoryStore::default();

        let run = registry.new_item(&[("param", FieldValue::text("2004"))])?;
        registry.set_collection_name(registry.item(run).collection(), "runs");
        let span = registry.new_item(&[("start", FieldValue::text("t0"))])?;
        registry.commit(&mut store)?;

        let names = registry.collection_names();
        assert!(names.contains(&"runs".to_string()));
        let span_table = registry
            .collection(registry.item(span).collection())
            .table_id()
            .map(table_name)
            .ok_or_else(|| anyhow!("span collection has no table"))?;
        assert!(names.contains(&span_table));

        let rehydrated = Registry::bootstrap(&store)?;
        let by_name = rehydrated
            .collection_by_name("runs")
            .ok_or_else(|| anyhow!("named collection missing"))?;
        assert_eq!(rehydrated.collection(by_name).unique_keys(), ["param"]);
        assert_eq!(rehydrated.collection_by_name(&span_table), rehydrated.find_collection(&["start"]));
        Ok(())
    }

    #[test]
    fn seeding_from_a_loader_creates_and_reconciles_items() -> Result<()> {
        struct FixtureLoader;

        impl ExternalLoader for FixtureLoader {
            fn resolve(&mut self, name: &str) -> Result<Option<TabularData>> {
                if name != "runs" {
                    return Ok(None);
                }
                Ok(Some(TabularData {
                    columns: vec!["param".to_string(), "score".to_string()],
                    rows: vec![
                        vec![FieldValue::text("2004"), FieldValue::Integer(10)],
                        vec![FieldValue::text("2005"), FieldValue::Integer(11)],
                    ],
                }))
            }
        }

        let mut registry = Registry::new();
        let mut loader = FixtureLoader;
        let seeded = registry.seed_from(&mut loader, "runs", &["param"])?;
        assert_eq!(seeded.len(), 2);
        assert_eq!(registry.item(seeded[0]).get("score"), Some(&FieldValue::Integer(10)));

        // Reseeding reconciles instead of duplicating.
        let again = registry.seed_from(&mut loader, "runs", &["param"])?;
        assert_eq!(again, seeded);
        assert_eq!(registry.items().len(), 2);

        assert!(registry.seed_from(&mut loader, "absent", &["param"])?.is_empty());
        assert!(matches!(
            registry.seed_from(&mut loader, "runs", &["missing"]),
            Err(MapperError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn timestamp_rendering_round_trips() -> Result<()> {
        let original = datetime!(2019-11-03 08:15:30 UTC);
        let rendered = render_timestamp(original)?;
        assert_eq!(rendered, "2019-11-03 08:15:30");
        assert_eq!(parse_timestamp(&rendered), Some(original));
        assert_eq!(parse_timestamp("not a timestamp"), None);
        Ok(())
    }

    #[test]
    fn mixed_scalar_tags_widen_to_text() -> Result<()> {
        assert_eq!(
            merge_tag("score", Some(ColumnTag::Integer), ColumnTag::Text)?,
            ColumnTag::Text
        );
        assert!(merge_tag("score", Some(ColumnTag::Integer), ColumnTag::Ref).is_err());
        assert!(merge_tag("score", Some(ColumnTag::Ref), ColumnTag::Integer).is_err());
        Ok(())
    }
}
