//! Table factories: decoders from descriptor bodies to live tables.
use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use snafu::prelude::*;

use crate::{
    blob::DescriptorBucket,
    descriptor::TableBody,
    retry::RemoteOptions,
    table::{
        BlobBackedTable, DescriptorSnafu, FrameTable, InvalidDataSnafu, RemoteQueryTable, RowTable,
        Table, TableResult, Warehouse, WarehouseTableRef,
    },
};

/// Builds tables of one descriptor type.
///
/// `build` may perform I/O; the registry always calls it before taking its
/// write lock.
#[async_trait]
pub trait TableFactory: Send + Sync + fmt::Debug {
    /// The type tag this factory builds.
    fn table_type(&self) -> &str;

    /// Build a table from a descriptor body.
    async fn build(&self, body: &TableBody) -> TableResult<Arc<dyn Table>>;
}

/// Factory for [`RowTable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RowTableFactory;

#[async_trait]
impl TableFactory for RowTableFactory {
    fn table_type(&self) -> &str {
        RowTable::TYPE_TAG
    }

    async fn build(&self, body: &TableBody) -> TableResult<Arc<dyn Table>> {
        Ok(Arc::new(RowTable::from_body(body)?))
    }
}

/// Factory for [`FrameTable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameTableFactory;

#[async_trait]
impl TableFactory for FrameTableFactory {
    fn table_type(&self) -> &str {
        FrameTable::TYPE_TAG
    }

    async fn build(&self, body: &TableBody) -> TableResult<Arc<dyn Table>> {
        Ok(Arc::new(FrameTable::from_body(body)?))
    }
}

/// Factory for [`RemoteQueryTable`] over one warehouse client.
///
/// A body with an empty schema is completed from the warehouse.
#[derive(Debug, Clone)]
pub struct RemoteQueryTableFactory {
    warehouse: Arc<dyn Warehouse>,
    options: RemoteOptions,
}

impl RemoteQueryTableFactory {
    /// Build tables against `warehouse`.
    pub fn new(warehouse: Arc<dyn Warehouse>, options: RemoteOptions) -> Self {
        Self { warehouse, options }
    }
}

#[async_trait]
impl TableFactory for RemoteQueryTableFactory {
    fn table_type(&self) -> &str {
        RemoteQueryTable::TYPE_TAG
    }

    async fn build(&self, body: &TableBody) -> TableResult<Arc<dyn Table>> {
        let table_ref = WarehouseTableRef::from_body(body)?;
        let table = if body.schema.is_empty() {
            RemoteQueryTable::discover(table_ref, Arc::clone(&self.warehouse), self.options).await?
        } else {
            RemoteQueryTable::new(
                body.schema.clone(),
                table_ref,
                Arc::clone(&self.warehouse),
                self.options,
            )
        };
        Ok(Arc::new(table))
    }
}

/// Factory for [`BlobBackedTable`], resolving bucket names to stores.
#[derive(Debug, Clone, Default)]
pub struct BlobTableFactory {
    buckets: HashMap<String, DescriptorBucket>,
}

impl BlobTableFactory {
    /// A factory with no known buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bucket` resolvable under its store's bucket name.
    pub fn with_bucket(mut self, bucket: DescriptorBucket) -> Self {
        self.buckets.insert(bucket.bucket().to_string(), bucket);
        self
    }
}

#[async_trait]
impl TableFactory for BlobTableFactory {
    fn table_type(&self) -> &str {
        BlobBackedTable::TYPE_TAG
    }

    async fn build(&self, body: &TableBody) -> TableResult<Arc<dyn Table>> {
        let name = body.str_field("bucket").context(DescriptorSnafu)?;
        let bucket = self.buckets.get(name).with_context(|| InvalidDataSnafu {
            message: format!("unknown bucket '{name}'"),
        })?;
        Ok(Arc::new(BlobBackedTable::from_body(body, bucket.clone())?))
    }
}
