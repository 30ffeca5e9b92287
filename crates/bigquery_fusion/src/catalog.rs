//! Project-level catalog and its registration into a DataFusion session.
//!
//! Datasets become DataFusion schemas of the session's default catalog and
//! tables become [`BigQueryTableProvider`]s inside them. Registration is
//! idempotent so startup attach and periodic sync can share one code path.
//! A pass also swaps providers whose remote schema changed and removes
//! providers of tables that vanished from an attached dataset. Schemas of
//! datasets that vanished entirely stay registered.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::catalog::memory::MemorySchemaProvider;
use datafusion::catalog::{SchemaProvider, TableProvider};
use datafusion::datasource::sink::DataSink;
use datafusion::prelude::{DataFrame, SessionContext};
use datafusion::sql::TableReference;
use tracing::{info, warn};

use crate::catalog_set::{CatalogSet, EntryLoader};
use crate::error::BigQueryError;
use crate::metadata::{DatasetDescriptor, DatasetEntry, TableDescriptor};
use crate::provider::{BigQueryDataSink, BigQueryTableProvider};
use crate::remote::BigQueryConnection;

struct DatasetLoader {
    connection: BigQueryConnection,
}

#[async_trait]
impl EntryLoader<DatasetEntry> for DatasetLoader {
    async fn load_entries(&self) -> anyhow::Result<Vec<DatasetEntry>> {
        let datasets: Vec<DatasetDescriptor> = self
            .connection
            .client()
            .list_datasets(self.connection.storage_project())
            .await?;
        Ok(datasets
            .into_iter()
            .map(|descriptor| DatasetEntry::new(self.connection.clone(), descriptor))
            .collect())
    }

    fn namespace(&self) -> String {
        format!("datasets of project `{}`", self.connection.storage_project())
    }
}

/// Cached view of one storage project: datasets, each with its tables.
pub struct BigQueryCatalog {
    connection: BigQueryConnection,
    datasets: CatalogSet<DatasetEntry>,
    dataset_filter: Option<Vec<String>>,
    scan_batch_rows: Option<usize>,
}

impl BigQueryCatalog {
    /// Creates an unloaded catalog over every dataset of the storage project.
    pub fn new(connection: BigQueryConnection) -> Self {
        let loader = Arc::new(DatasetLoader {
            connection: connection.clone(),
        });
        let datasets = CatalogSet::new(loader, Arc::clone(connection.metrics()));
        Self {
            connection,
            datasets,
            dataset_filter: None,
            scan_batch_rows: None,
        }
    }

    /// Restricts attachment to the named datasets.
    pub fn with_dataset_filter(mut self, datasets: Option<Vec<String>>) -> Self {
        self.dataset_filter = datasets;
        self
    }

    /// Rows requested per scan step by providers built from this catalog.
    pub fn with_scan_batch_rows(mut self, rows: Option<usize>) -> Self {
        self.scan_batch_rows = rows;
        self
    }

    /// Connection shared by every cache and provider of this catalog.
    pub fn connection(&self) -> &BigQueryConnection {
        &self.connection
    }

    /// Looks up a dataset; `None` when the project has no such dataset.
    pub async fn get_dataset(&self, name: &str) -> crate::error::Result<Option<Arc<DatasetEntry>>> {
        self.datasets.get_entry(name).await
    }

    /// Looks up a dataset the caller cannot proceed without.
    pub async fn require_dataset(&self, name: &str) -> crate::error::Result<Arc<DatasetEntry>> {
        self.get_dataset(name)
            .await?
            .ok_or_else(|| BigQueryError::NotFound(format!("dataset `{name}`")))
    }

    /// Datasets selected for attachment.
    pub async fn datasets(&self) -> crate::error::Result<Vec<Arc<DatasetEntry>>> {
        let Some(filter) = &self.dataset_filter else {
            let mut all = self.datasets.entries().await?;
            all.sort_by(|a, b| a.descriptor().name.cmp(&b.descriptor().name));
            return Ok(all);
        };
        let mut selected = Vec::with_capacity(filter.len());
        for name in filter {
            match self.get_dataset(name).await? {
                Some(dataset) => selected.push(dataset),
                // Decision: a missing configured dataset is skipped so the
                // remaining ones still attach.
                None => warn!(dataset = %name, "configured dataset does not exist remotely"),
            }
        }
        Ok(selected)
    }

    /// Looks up a table; a missing dataset is treated like a missing table.
    pub async fn get_table(
        &self,
        dataset: &str,
        table: &str,
    ) -> crate::error::Result<Option<Arc<TableDescriptor>>> {
        match self.get_dataset(dataset).await? {
            Some(entry) => entry.tables().get_table(table).await,
            None => Ok(None),
        }
    }

    /// Invalidates the dataset listing and every nested table cache.
    pub async fn refresh(&self) {
        self.datasets.clear_entries().await;
    }

    /// Builds the provider for a cached table.
    pub fn provider_for(&self, table: Arc<TableDescriptor>) -> BigQueryTableProvider {
        BigQueryTableProvider::new(self.connection.clone(), table)
            .with_scan_batch_rows(self.scan_batch_rows)
    }
}

/// Summary of tables registered during one attach or sync pass.
#[derive(Debug, Clone, Default)]
pub struct CatalogSyncResult {
    /// `dataset.table` names registered (or re-registered) in this pass.
    pub registered_tables: Vec<String>,
    /// `dataset.table` names deregistered because they vanished remotely.
    pub removed_tables: Vec<String>,
}

/// Registers every selected dataset and table into `session_context`.
pub async fn attach_catalog(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
) -> Result<CatalogSyncResult> {
    let datasets = catalog
        .datasets()
        .await
        .context("load bigquery datasets")?;

    let mut result = CatalogSyncResult::default();
    for dataset in datasets {
        let dataset_name = &dataset.descriptor().name;
        let schema = ensure_schema(session_context, dataset_name)?;
        let tables = dataset
            .tables()
            .tables()
            .await
            .with_context(|| format!("load tables of dataset {dataset_name}"))?;
        let mut listed = HashSet::with_capacity(tables.len());
        for table in tables {
            listed.insert(table.name.to_lowercase());
            // Decision: include table names only when registration happened in this pass.
            if register_table(session_context, catalog, table.clone()).await? {
                result
                    .registered_tables
                    .push(format!("{}.{}", table.dataset, table.name));
            }
        }
        for name in schema.table_names() {
            if listed.contains(&name) {
                continue;
            }
            let registered = schema
                .table(&name)
                .await
                .with_context(|| format!("look up registered table {dataset_name}.{name}"))?;
            if registered.as_deref().is_some_and(is_bigquery_provider) {
                session_context
                    .deregister_table(table_reference(dataset_name, &name))
                    .with_context(|| format!("deregister table {dataset_name}.{name}"))?;
                info!(dataset = %dataset_name, table = %name, "removed vanished table");
                result.removed_tables.push(format!("{dataset_name}.{name}"));
            }
        }
    }
    info!(
        project = %catalog.connection().storage_project(),
        registered = result.registered_tables.len(),
        removed = result.removed_tables.len(),
        "attached bigquery catalog"
    );
    Ok(result)
}

/// Re-lists the remote project, then registers new tables, swaps changed
/// ones and removes vanished ones.
pub async fn sync_catalog(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
) -> Result<CatalogSyncResult> {
    catalog.refresh().await;
    attach_catalog(session_context, catalog)
        .await
        .context("sync bigquery catalog")
}

/// Registers one table.
///
/// Returns `Ok(false)` when an equal provider is already present. A BigQuery
/// provider built from an older descriptor is replaced; any other provider
/// under the same name is left alone.
pub async fn register_table(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
    table: Arc<TableDescriptor>,
) -> Result<bool> {
    let reference = table_reference(&table.dataset, &table.name);
    if let Ok(existing) = session_context.table_provider(reference.clone()).await {
        let Some(current) = existing.as_any().downcast_ref::<BigQueryTableProvider>() else {
            return Ok(false);
        };
        if current.table().as_ref() == table.as_ref() {
            return Ok(false);
        }
        session_context
            .deregister_table(reference.clone())
            .with_context(|| format!("deregister stale table {}.{}", table.dataset, table.name))?;
        info!(
            dataset = %table.dataset,
            table = %table.name,
            columns = table.columns.len(),
            "re-registering table with changed schema"
        );
    }

    ensure_schema(session_context, &table.dataset)?;
    let provider: Arc<dyn TableProvider> = Arc::new(catalog.provider_for(Arc::clone(&table)));
    match session_context.register_table(reference.clone(), provider) {
        Ok(_) => Ok(true),
        Err(err) => {
            // Another concurrent registrar may have won the race.
            if session_context.table_provider(reference).await.is_ok() {
                Ok(false)
            } else {
                Err(err).with_context(|| format!("register table {}.{}", table.dataset, table.name))
            }
        }
    }
}

/// Re-fetches one table and brings its registration up to date.
///
/// Returns the fresh descriptor, or `None` after deregistering a table that
/// no longer exists remotely.
pub async fn refresh_table(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
    dataset: &str,
    table: &str,
) -> Result<Option<Arc<TableDescriptor>>> {
    let entry = catalog.require_dataset(dataset).await?;
    let refreshed = entry
        .tables()
        .refresh_table(table)
        .await
        .with_context(|| format!("refresh table {dataset}.{table}"))?;
    match refreshed {
        Some(descriptor) => {
            register_table(session_context, catalog, Arc::clone(&descriptor)).await?;
            Ok(Some(descriptor))
        }
        None => {
            session_context
                .deregister_table(table_reference(dataset, table))
                .with_context(|| format!("deregister table {dataset}.{table}"))?;
            Ok(None)
        }
    }
}

/// Creates a remote table and registers its provider.
pub async fn create_table(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
    definition: TableDescriptor,
) -> Result<Arc<TableDescriptor>> {
    let dataset = catalog.require_dataset(&definition.dataset).await?;
    let label = format!("{}.{}", definition.dataset, definition.name);
    let table = dataset
        .tables()
        .create_table(definition)
        .await
        .with_context(|| format!("create table {label}"))?;
    register_table(session_context, catalog, Arc::clone(&table)).await?;
    Ok(table)
}

/// Drops a remote table and removes its provider from the session.
pub async fn drop_table(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
    dataset: &str,
    table: &str,
) -> Result<()> {
    let entry = catalog.require_dataset(dataset).await?;
    entry
        .tables()
        .drop_table(table)
        .await
        .with_context(|| format!("drop table {dataset}.{table}"))?;
    session_context
        .deregister_table(table_reference(dataset, table))
        .with_context(|| format!("deregister table {dataset}.{table}"))?;
    Ok(())
}

/// `CREATE TABLE dataset.table AS <query>`: creates the table from the
/// query's schema, writes every row and registers the new table.
pub async fn create_table_as(
    session_context: &SessionContext,
    catalog: &BigQueryCatalog,
    dataset: &str,
    table: &str,
    query: DataFrame,
) -> Result<u64> {
    let entry = catalog.require_dataset(dataset).await?;
    let schema = query.schema().as_arrow().clone();
    let definition = TableDescriptor::from_schema(
        catalog.connection().storage_project(),
        &entry.descriptor().name,
        table,
        &schema,
    );
    let sink = BigQueryDataSink::create_table_as(
        catalog.connection().clone(),
        Arc::clone(&entry),
        definition,
    );

    let task_context = session_context.task_ctx();
    let stream = query
        .execute_stream()
        .await
        .with_context(|| format!("execute query for {dataset}.{table}"))?;
    let rows = sink
        .write_all(stream, &task_context)
        .await
        .with_context(|| format!("write {dataset}.{table}"))?;

    let created = entry
        .tables()
        .require_table(table)
        .await
        .with_context(|| format!("load created table {dataset}.{table}"))?;
    register_table(session_context, catalog, created).await?;
    Ok(rows)
}

// Unquoted SQL identifiers are normalized to lowercase by the planner.
fn table_reference(dataset: &str, table: &str) -> TableReference {
    TableReference::partial(dataset.to_lowercase(), table.to_lowercase())
}

fn is_bigquery_provider(provider: &dyn TableProvider) -> bool {
    provider
        .as_any()
        .downcast_ref::<BigQueryTableProvider>()
        .is_some()
}

fn ensure_schema(
    session_context: &SessionContext,
    dataset: &str,
) -> Result<Arc<dyn SchemaProvider>> {
    let catalog_name = session_context
        .copied_config()
        .options()
        .catalog
        .default_catalog
        .clone();
    let catalog = session_context
        .catalog(&catalog_name)
        .with_context(|| format!("default catalog {catalog_name} is not registered"))?;
    let schema_name = dataset.to_lowercase();
    if let Some(schema) = catalog.schema(&schema_name) {
        return Ok(schema);
    }
    let schema: Arc<dyn SchemaProvider> = Arc::new(MemorySchemaProvider::new());
    catalog
        .register_schema(&schema_name, Arc::clone(&schema))
        .with_context(|| format!("register schema {schema_name}"))?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::datatypes::DataType;

    use super::*;
    use crate::memory::InMemoryBigQuery;
    use crate::metadata::ColumnDescriptor;
    use crate::remote::BigQueryClient;

    fn table(dataset: &str, name: &str) -> TableDescriptor {
        TableDescriptor::new(
            "storage-p",
            dataset,
            name,
            vec![ColumnDescriptor::new("id", DataType::Int64)],
        )
    }

    fn catalog(remote: &Arc<InMemoryBigQuery>) -> BigQueryCatalog {
        BigQueryCatalog::new(BigQueryConnection::new(remote.clone(), "exec-p", "storage-p"))
    }

    #[tokio::test]
    async fn attach_is_idempotent() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(table("sales", "orders"), Vec::new());
        remote.seed_table(table("sales", "Refunds"), Vec::new());
        let catalog = catalog(&remote);
        let ctx = SessionContext::new();

        let first = attach_catalog(&ctx, &catalog).await.expect("attach");
        assert_eq!(first.registered_tables.len(), 2);
        assert!(ctx.table_provider("sales.refunds").await.is_ok());

        let second = attach_catalog(&ctx, &catalog).await.expect("re-attach");
        assert!(second.registered_tables.is_empty());
        assert_eq!(remote.calls().list_datasets, 1);
    }

    #[tokio::test]
    async fn dataset_filter_skips_unknown_datasets() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(table("sales", "orders"), Vec::new());
        remote.seed_table(table("hr", "people"), Vec::new());
        let catalog = catalog(&remote)
            .with_dataset_filter(Some(vec!["SALES".to_string(), "missing".to_string()]));
        let ctx = SessionContext::new();

        let result = attach_catalog(&ctx, &catalog).await.expect("attach");
        assert_eq!(result.registered_tables, vec!["sales.orders".to_string()]);
        assert!(ctx.table_provider("hr.people").await.is_err());
    }

    #[tokio::test]
    async fn sync_registers_new_remote_tables() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(table("sales", "orders"), Vec::new());
        let catalog = catalog(&remote);
        let ctx = SessionContext::new();
        attach_catalog(&ctx, &catalog).await.expect("attach");

        remote.seed_table(table("sales", "invoices"), Vec::new());
        let synced = sync_catalog(&ctx, &catalog).await.expect("sync");
        assert_eq!(synced.registered_tables, vec!["sales.invoices".to_string()]);
    }

    #[tokio::test]
    async fn sync_swaps_changed_tables_and_removes_vanished_ones() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(table("sales", "orders"), Vec::new());
        remote.seed_table(table("sales", "refunds"), Vec::new());
        let catalog = catalog(&remote);
        let ctx = SessionContext::new();
        attach_catalog(&ctx, &catalog).await.expect("attach");

        let mut widened = table("sales", "orders");
        widened
            .columns
            .push(ColumnDescriptor::new("status", DataType::Utf8));
        remote.seed_table(widened, Vec::new());
        remote
            .drop_table("storage-p", "sales", "refunds")
            .await
            .expect("remote drop");

        let synced = sync_catalog(&ctx, &catalog).await.expect("sync");
        assert_eq!(synced.registered_tables, vec!["sales.orders".to_string()]);
        assert_eq!(synced.removed_tables, vec!["sales.refunds".to_string()]);
        let orders = ctx.table_provider("sales.orders").await.expect("orders");
        assert_eq!(orders.schema().fields().len(), 2);
        assert!(ctx.table_provider("sales.refunds").await.is_err());
    }

    #[tokio::test]
    async fn refresh_table_updates_one_registration() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(table("sales", "orders"), Vec::new());
        let catalog = catalog(&remote);
        let ctx = SessionContext::new();
        attach_catalog(&ctx, &catalog).await.expect("attach");

        let mut widened = table("sales", "orders");
        widened
            .columns
            .push(ColumnDescriptor::new("status", DataType::Utf8));
        remote.seed_table(widened, Vec::new());
        let refreshed = refresh_table(&ctx, &catalog, "sales", "orders")
            .await
            .expect("refresh")
            .expect("exists");
        assert_eq!(refreshed.columns.len(), 2);
        let orders = ctx.table_provider("sales.orders").await.expect("orders");
        assert_eq!(orders.schema().fields().len(), 2);
        assert_eq!(remote.calls().list_tables, 1);

        remote
            .drop_table("storage-p", "sales", "orders")
            .await
            .expect("remote drop");
        let gone = refresh_table(&ctx, &catalog, "sales", "orders")
            .await
            .expect("refresh");
        assert!(gone.is_none());
        assert!(ctx.table_provider("sales.orders").await.is_err());
    }

    #[tokio::test]
    async fn listing_failure_surfaces_remote_message() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.fail_next_listing("permission denied on project storage-p");
        let ctx = SessionContext::new();
        let err = attach_catalog(&ctx, &catalog(&remote))
            .await
            .expect_err("listing fails");
        assert!(format!("{err:#}").contains("permission denied"), "{err:#}");
    }

    #[tokio::test]
    async fn create_and_drop_update_the_session() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.create_dataset("storage-p", "sales");
        let catalog = catalog(&remote);
        let ctx = SessionContext::new();

        create_table(&ctx, &catalog, table("sales", "orders"))
            .await
            .expect("create");
        assert!(ctx.table_provider("sales.orders").await.is_ok());

        drop_table(&ctx, &catalog, "sales", "orders").await.expect("drop");
        assert!(ctx.table_provider("sales.orders").await.is_err());
        assert!(remote.table("storage-p", "sales", "orders").is_none());
    }
}
