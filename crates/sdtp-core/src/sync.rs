//! Publishing uploaded tables through a blob bucket.
//!
//! An upload becomes two blobs and one registry entry:
//!
//! 1. the full descriptor body under `rowtables/<user>/<name>.sdml`;
//! 2. a `GCSTable` reference to that blob, registered as `<user>/<name>`;
//! 3. the same reference under `gcstables/<user>/<name>.sdml`, which is what
//!    the startup loader scans.
//!
//! Nothing is registered unless the row blob was written, and the reference
//! blob is written only after registration succeeded.
use std::sync::Arc;

use log::info;
use snafu::prelude::*;

use crate::{
    blob::{BLOB_TABLE_PREFIX, BlobError, DescriptorBucket, ROW_TABLE_PREFIX},
    descriptor::TableDescriptor,
    registry::{RegistryError, TableRegistry},
    table::{BlobBackedTable, Table},
    upload::namespaced_name,
};

/// Errors raised while publishing an upload.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    /// Writing a blob failed.
    #[snafu(display("Cannot publish '{name}': {source}"))]
    Blob {
        /// Published table name.
        name: String,
        /// Blob error.
        source: BlobError,
    },

    /// Registering the reference failed.
    #[snafu(display("Cannot register '{name}': {source}"))]
    Register {
        /// Published table name.
        name: String,
        /// Registry error.
        source: RegistryError,
    },
}

/// Outcome of [`publish_upload`].
#[derive(Debug, Clone)]
pub struct PublishedTable {
    /// Registry name, namespaced by user.
    pub name: String,
    /// Blob holding the full descriptor.
    pub row_blob: String,
    /// Blob holding the reference descriptor.
    pub reference_blob: String,
    /// The registered table.
    pub table: Arc<dyn Table>,
}

/// Publish `descriptor` for `user` through `bucket` and register it.
///
/// `registry` needs a `GCSTable` factory that resolves `bucket`.
pub async fn publish_upload(
    registry: &TableRegistry,
    bucket: &DescriptorBucket,
    descriptor: &TableDescriptor,
    user: Option<&str>,
) -> Result<PublishedTable, SyncError> {
    let name = namespaced_name(user, &descriptor.name);
    let full = TableDescriptor::new(name.clone(), descriptor.table.clone());
    let row_blob = bucket
        .upload(ROW_TABLE_PREFIX, &full)
        .await
        .context(BlobSnafu { name: name.clone() })?;

    let reference = TableDescriptor::new(
        name.clone(),
        BlobBackedTable::reference_body(full.table.schema.clone(), bucket.bucket(), &row_blob),
    );
    let table = registry
        .add_descriptor(&reference)
        .await
        .context(RegisterSnafu { name: name.clone() })?;

    let reference_blob = bucket
        .upload(BLOB_TABLE_PREFIX, &reference)
        .await
        .context(BlobSnafu { name: name.clone() })?;

    info!("published {name} as {row_blob} and {reference_blob}");
    Ok(PublishedTable {
        name,
        row_blob,
        reference_blob,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::{BlobStore, MemoryBlobStore},
        descriptor::TableBody,
        registry::BlobTableFactory,
        retry::RemoteOptions,
        schema::Schema,
        value::Value,
    };
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn upload() -> TableDescriptor {
        let schema = Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER")])
            .expect("schema");
        TableDescriptor::new(
            "cases",
            TableBody::new(schema, "RowTable").with_field("rows", json!([["Jan", 1200]])),
        )
    }

    #[tokio::test]
    async fn publishes_rows_reference_and_registry_entry() -> TestResult {
        let store = Arc::new(MemoryBlobStore::new("wiki"));
        let bucket = DescriptorBucket::new(store.clone(), RemoteOptions::default());
        let registry = TableRegistry::with_builtin_factories();
        registry.add_table_factory(
            "GCSTable",
            Arc::new(BlobTableFactory::new().with_bucket(bucket.clone())),
        )?;

        let published = publish_upload(&registry, &bucket, &upload(), Some("alice")).await?;
        assert_eq!(published.name, "alice/cases");
        assert_eq!(published.row_blob, "rowtables/alice/cases.sdml");
        assert_eq!(published.reference_blob, "gcstables/alice/cases.sdml");
        assert_eq!(
            store.list(None).await?,
            vec!["gcstables/alice/cases.sdml", "rowtables/alice/cases.sdml"]
        );

        let reference = bucket.fetch(&published.reference_blob).await?;
        assert_eq!(reference.table.table_type, "GCSTable");
        assert_eq!(reference.table.str_field("blob")?, published.row_blob);

        let table = registry.get_table("alice/cases")?;
        assert_eq!(
            table.get_rows().await?,
            vec![vec![Value::String("Jan".into()), Value::Number(1200.0)]]
        );
        Ok(())
    }

    #[tokio::test]
    async fn without_blob_factory_nothing_is_registered() -> TestResult {
        let store = Arc::new(MemoryBlobStore::new("wiki"));
        let bucket = DescriptorBucket::new(store.clone(), RemoteOptions::default());
        let registry = TableRegistry::with_builtin_factories();

        let err = publish_upload(&registry, &bucket, &upload(), None)
            .await
            .expect_err("no GCSTable factory");
        assert!(matches!(err, SyncError::Register { .. }));
        assert!(registry.list_table_names().is_empty());
        assert_eq!(store.list(Some(BLOB_TABLE_PREFIX)).await?, Vec::<String>::new());
        Ok(())
    }
}
