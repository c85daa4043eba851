//! Tables whose descriptor lives in a blob store.
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use snafu::prelude::*;
use tokio::sync::OnceCell;

use super::{
    DescriptorSnafu, FrameTable, InvalidDataSnafu, Row, RowTable, Table, TableError, TableResult,
};
use crate::{
    blob::{BlobError, DescriptorBucket},
    descriptor::TableBody,
    filter::FilterSpec,
    retry::RemoteError,
    schema::Schema,
    value::Value,
};

/// A table loaded from a descriptor blob on first use.
///
/// The referenced blob must hold a `RowTable` or `FrameTable` body whose
/// schema equals the declared one. A failed load is not cached, so the next
/// call retries. Store failures surface as `BackendUnavailable`, bad content
/// as `InvalidData`.
#[derive(Debug)]
pub struct BlobBackedTable {
    schema: Schema,
    blob: String,
    bucket: DescriptorBucket,
    loaded: OnceCell<Arc<dyn Table>>,
}

impl BlobBackedTable {
    /// Descriptor type tag.
    pub const TYPE_TAG: &'static str = "GCSTable";

    /// Reference `blob` in `bucket`, declaring its schema.
    pub fn new(schema: Schema, bucket: DescriptorBucket, blob: impl Into<String>) -> Self {
        Self {
            schema,
            blob: blob.into(),
            bucket,
            loaded: OnceCell::new(),
        }
    }

    /// Build from a body with `bucket` and `blob` payload fields. The caller
    /// resolves `bucket` to a store.
    pub fn from_body(body: &TableBody, bucket: DescriptorBucket) -> TableResult<Self> {
        let blob = body.str_field("blob").context(DescriptorSnafu)?;
        Ok(Self::new(body.schema.clone(), bucket, blob))
    }

    /// Reference body pointing at `blob` in `bucket_name`.
    pub fn reference_body(schema: Schema, bucket_name: &str, blob: &str) -> TableBody {
        TableBody::new(schema, Self::TYPE_TAG)
            .with_field("bucket", bucket_name)
            .with_field("blob", blob)
    }

    /// Name of the referenced blob.
    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// Whether the blob has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    async fn inner(&self) -> TableResult<&Arc<dyn Table>> {
        self.loaded.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> TableResult<Arc<dyn Table>> {
        let descriptor = self
            .bucket
            .fetch(&self.blob)
            .await
            .map_err(|e| load_error(&self.blob, e))?;
        let body = descriptor.table;
        ensure!(
            body.schema == self.schema,
            InvalidDataSnafu {
                message: format!(
                    "blob {} has schema {}, declared {}",
                    self.blob, body.schema, self.schema
                ),
            }
        );
        let table: Arc<dyn Table> = match body.table_type.as_str() {
            RowTable::TYPE_TAG => Arc::new(RowTable::from_body(&body)?),
            FrameTable::TYPE_TAG => Arc::new(FrameTable::from_body(&body)?),
            other => {
                return InvalidDataSnafu {
                    message: format!("blob {} holds unsupported table type {other}", self.blob),
                }
                .fail();
            }
        };
        info!("loaded {} from {}", self.blob, self.bucket.bucket());
        Ok(table)
    }
}

fn load_error(blob: &str, err: BlobError) -> TableError {
    match err {
        BlobError::InvalidData { source, .. } => match source.downcast::<RemoteError>() {
            Ok(remote) => TableError::BackendUnavailable { source: *remote },
            Err(other) => TableError::InvalidData {
                message: format!("blob {blob}: {other}"),
            },
        },
        other => TableError::InvalidData {
            message: format!("blob {blob}: {other}"),
        },
    }
}

#[async_trait]
impl Table for BlobBackedTable {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn get_rows(&self) -> TableResult<Vec<Row>> {
        self.inner().await?.get_rows().await
    }

    async fn get_filtered_rows(
        &self,
        filter: Option<&FilterSpec>,
        columns: Option<&[String]>,
    ) -> TableResult<Vec<Row>> {
        self.inner().await?.get_filtered_rows(filter, columns).await
    }

    async fn all_values(&self, column: &str) -> TableResult<Vec<Value>> {
        self.inner().await?.all_values(column).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::{BlobStore, MemoryBlobStore},
        descriptor::TableDescriptor,
        filter::parse,
        retry::RemoteOptions,
    };
    use serde_json::json;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn schema() -> Schema {
        Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER")]).expect("schema")
    }

    async fn bucket_with_rows() -> Result<DescriptorBucket, Box<dyn std::error::Error>> {
        let bucket = DescriptorBucket::new(
            Arc::new(MemoryBlobStore::new("wiki")),
            RemoteOptions {
                timeout_ms: 1_000,
                max_attempts: 1,
                initial_backoff_ms: 1,
            },
        );
        let body = TableBody::new(schema(), "RowTable")
            .with_field("rows", json!([["Jan", 1200], ["Jun", 800]]));
        bucket
            .upload("rowtables", &TableDescriptor::new("alice/cases", body))
            .await?;
        Ok(bucket)
    }

    #[tokio::test]
    async fn loads_lazily_and_delegates() -> TestResult {
        let bucket = bucket_with_rows().await?;
        let table = BlobBackedTable::new(schema(), bucket, "rowtables/alice/cases.sdml");
        assert!(!table.is_loaded());

        let filter = parse("IN_LIST('Month', ['Jun'])")?;
        let rows = table.get_filtered_rows(Some(&filter), None).await?;
        assert_eq!(rows, vec![vec![Value::String("Jun".into()), Value::Number(800.0)]]);
        assert!(table.is_loaded());
        assert_eq!(table.range_spec("Disease").await?.max, Value::Number(1200.0));
        Ok(())
    }

    #[tokio::test]
    async fn schema_mismatch_is_invalid_data() -> TestResult {
        let bucket = bucket_with_rows().await?;
        let declared = Schema::from_pairs([("Month", "STRING")])?;
        let table = BlobBackedTable::new(declared, bucket, "rowtables/alice/cases.sdml");
        assert!(matches!(
            table.get_rows().await,
            Err(TableError::InvalidData { .. })
        ));
        assert!(!table.is_loaded());
        Ok(())
    }

    #[tokio::test]
    async fn missing_blob_fails_until_it_appears() -> TestResult {
        let bucket = bucket_with_rows().await?;
        let table = BlobBackedTable::new(schema(), bucket.clone(), "rowtables/late.sdml");
        assert!(matches!(
            table.get_rows().await,
            Err(TableError::BackendUnavailable { .. })
        ));

        let body = TableBody::new(schema(), "RowTable").with_field("rows", json!([["Aug", 1]]));
        bucket.store().put("rowtables/late.sdml", body.to_vec()?).await?;
        assert_eq!(table.get_rows().await?.len(), 1);
        Ok(())
    }
}
