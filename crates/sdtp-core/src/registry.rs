//! The table registry: type tags to factories, names to live tables.
//!
//! Both maps are published as immutable snapshots behind an `Arc`. Readers
//! clone the current `Arc` under a read lock held only for that clone, so a
//! lookup never waits on a writer doing real work. Writers serialize on a
//! separate mutex, copy the snapshot, modify the copy and swap it in. A
//! reader therefore sees either the map before a write or the map after it.
//!
//! Building a table from a descriptor can do I/O (warehouse schema lookups),
//! so it happens before any lock is taken.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use log::info;
use snafu::prelude::*;

use crate::{
    descriptor::{TableBody, TableDescriptor},
    table::{Table, TableError},
};

mod factory;

pub use factory::{
    BlobTableFactory, FrameTableFactory, RemoteQueryTableFactory, RowTableFactory, TableFactory,
};

/// Errors raised by registry operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// No table is registered under the name.
    #[snafu(display("Table '{name}' not found"))]
    TableNotFound {
        /// Requested name.
        name: String,
    },

    /// No factory is registered for the descriptor's type tag.
    #[snafu(display("Unknown table type '{table_type}'; known types: {known}"))]
    UnknownTableType {
        /// Requested type tag.
        table_type: String,
        /// Comma-separated registered tags.
        known: String,
    },

    /// The factory cannot build tables of the tag it is registered under.
    #[snafu(display("Factory for '{table_type}' builds '{builds}' tables"))]
    InvalidFactory {
        /// Tag the factory was registered under.
        table_type: String,
        /// Tag the factory reports.
        builds: String,
    },

    /// The factory failed to build the table.
    #[snafu(display("Cannot build table '{name}': {source}"))]
    Build {
        /// Table name.
        name: String,
        /// Factory error.
        source: TableError,
    },
}

type Snapshot<V> = Arc<HashMap<String, V>>;

/// Copy-on-write map with atomic snapshot swaps.
#[derive(Debug)]
struct SnapshotMap<V> {
    current: RwLock<Snapshot<V>>,
    writer: Mutex<()>,
}

impl<V> Default for SnapshotMap<V> {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
        }
    }
}

impl<V: Clone> SnapshotMap<V> {
    fn snapshot(&self) -> Snapshot<V> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<R>(&self, f: impl FnOnce(&mut HashMap<String, V>) -> R) -> R {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&self.snapshot());
        let out = f(&mut next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        out
    }
}

/// Registry of table factories and named tables.
///
/// Constructed explicitly and shared by reference (typically in an `Arc`);
/// there is no global instance.
#[derive(Debug, Default)]
pub struct TableRegistry {
    factories: SnapshotMap<Arc<dyn TableFactory>>,
    tables: SnapshotMap<Arc<dyn Table>>,
}

impl TableRegistry {
    /// An empty registry with no factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-process factories (`RowTable`, `FrameTable`)
    /// registered.
    pub fn with_builtin_factories() -> Self {
        let registry = Self::new();
        for factory in [
            Arc::new(RowTableFactory) as Arc<dyn TableFactory>,
            Arc::new(FrameTableFactory),
        ] {
            let tag = factory.table_type().to_string();
            registry.factories.update(|map| map.insert(tag, factory));
        }
        registry
    }

    /// Register `factory` for `table_type`, replacing any previous factory.
    ///
    /// Fails with `InvalidFactory` when the tag is empty or the factory
    /// builds a different type.
    pub fn add_table_factory(
        &self,
        table_type: &str,
        factory: Arc<dyn TableFactory>,
    ) -> Result<(), RegistryError> {
        ensure!(
            !table_type.is_empty() && factory.table_type() == table_type,
            InvalidFactorySnafu {
                table_type,
                builds: factory.table_type(),
            }
        );
        self.factories
            .update(|map| map.insert(table_type.to_string(), factory));
        info!("registered factory for {table_type}");
        Ok(())
    }

    /// Registered type tags, sorted.
    pub fn factory_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.factories.snapshot().keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Build a table from `body` and register it as `name`, replacing any
    /// table of that name. Returns the new table.
    pub async fn add_table_from_descriptor(
        &self,
        name: &str,
        body: &TableBody,
    ) -> Result<Arc<dyn Table>, RegistryError> {
        let factories = self.factories.snapshot();
        let factory = factories
            .get(&body.table_type)
            .with_context(|| UnknownTableTypeSnafu {
                table_type: body.table_type.clone(),
                known: sorted_keys(&factories).join(", "),
            })?;
        let table = factory.build(body).await.context(BuildSnafu { name })?;
        self.add_table(name, Arc::clone(&table));
        Ok(table)
    }

    /// Register a full descriptor under its own name.
    pub async fn add_descriptor(
        &self,
        descriptor: &TableDescriptor,
    ) -> Result<Arc<dyn Table>, RegistryError> {
        self.add_table_from_descriptor(&descriptor.name, &descriptor.table)
            .await
    }

    /// Register an already built table as `name`, replacing any previous one.
    pub fn add_table(&self, name: &str, table: Arc<dyn Table>) {
        let replaced = self
            .tables
            .update(|map| map.insert(name.to_string(), table))
            .is_some();
        info!(
            "{} table {name}",
            if replaced { "replaced" } else { "registered" }
        );
    }

    /// The table registered as `name`.
    pub fn get_table(&self, name: &str) -> Result<Arc<dyn Table>, RegistryError> {
        self.tables
            .snapshot()
            .get(name)
            .cloned()
            .context(TableNotFoundSnafu { name })
    }

    /// Registered table names at the time of the call, sorted.
    pub fn list_table_names(&self) -> Vec<String> {
        sorted_keys(&self.tables.snapshot())
    }

    /// Remove `name`, returning its table if it was registered.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Table>> {
        let removed = self.tables.update(|map| map.remove(name));
        if removed.is_some() {
            info!("unregistered table {name}");
        }
        removed
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::Schema,
        table::{Row, TableResult},
    };
    use async_trait::async_trait;
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn rows_body(rows: serde_json::Value) -> TableBody {
        let schema = Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER")])
            .expect("schema");
        TableBody::new(schema, "RowTable").with_field("rows", rows)
    }

    #[derive(Debug)]
    struct Mislabelled;

    #[async_trait]
    impl TableFactory for Mislabelled {
        fn table_type(&self) -> &str {
            "FrameTable"
        }

        async fn build(&self, body: &TableBody) -> TableResult<Arc<dyn Table>> {
            RowTableFactory.build(body).await
        }
    }

    #[tokio::test]
    async fn register_and_look_up() -> TestResult {
        let registry = TableRegistry::with_builtin_factories();
        registry
            .add_table_from_descriptor("cases", &rows_body(json!([["Jan", 1200]])))
            .await?;
        let table = registry.get_table("cases")?;
        assert_eq!(table.get_rows().await?.len(), 1);
        assert_eq!(registry.list_table_names(), vec!["cases"]);
        Ok(())
    }

    #[test]
    fn missing_table_is_not_found() {
        let registry = TableRegistry::new();
        assert!(matches!(
            registry.get_table("missing"),
            Err(RegistryError::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let registry = TableRegistry::with_builtin_factories();
        let body = TableBody::new(Schema::new(Vec::new()).expect("schema"), "BigQueryTable");
        let err = registry
            .add_table_from_descriptor("x", &body)
            .await
            .expect_err("no warehouse factory");
        assert!(matches!(err, RegistryError::UnknownTableType { .. }));
        assert!(registry.list_table_names().is_empty());
    }

    #[tokio::test]
    async fn build_failures_leave_registry_unchanged() -> TestResult {
        let registry = TableRegistry::with_builtin_factories();
        registry
            .add_table_from_descriptor("cases", &rows_body(json!([["Jan", 1200]])))
            .await?;
        let err = registry
            .add_table_from_descriptor("cases", &rows_body(json!([["Jan"]])))
            .await
            .expect_err("ragged rows");
        assert!(matches!(err, RegistryError::Build { .. }));
        assert_eq!(registry.get_table("cases")?.get_rows().await?.len(), 1);
        Ok(())
    }

    #[test]
    fn factory_must_build_its_tag() {
        let registry = TableRegistry::new();
        assert!(matches!(
            registry.add_table_factory("RowTable", Arc::new(Mislabelled)),
            Err(RegistryError::InvalidFactory { .. })
        ));
        assert!(matches!(
            registry.add_table_factory("", Arc::new(RowTableFactory)),
            Err(RegistryError::InvalidFactory { .. })
        ));
        assert!(registry.factory_types().is_empty());
    }

    #[tokio::test]
    async fn factories_can_be_replaced() -> TestResult {
        let registry = TableRegistry::with_builtin_factories();
        registry.add_table_factory("FrameTable", Arc::new(Mislabelled))?;
        assert_eq!(registry.factory_types(), vec!["FrameTable", "RowTable"]);
        let mut body = rows_body(json!([["Jun", 800]]));
        body.table_type = "FrameTable".into();
        let table = registry.add_table_from_descriptor("t", &body).await?;
        let rows: Vec<Row> = table.get_rows().await?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unregister_removes_table() -> TestResult {
        let registry = TableRegistry::with_builtin_factories();
        registry
            .add_table_from_descriptor("cases", &rows_body(json!([])))
            .await?;
        assert!(registry.unregister("cases").is_some());
        assert!(registry.unregister("cases").is_none());
        assert!(registry.get_table("cases").is_err());
        Ok(())
    }
}
