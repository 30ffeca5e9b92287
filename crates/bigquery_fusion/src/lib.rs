//! DataFusion bridge for BigQuery-style remote columnar tables.
//!
//! The bridge exposes remote datasets as DataFusion schemas and remote tables
//! as table providers:
//! - reads open one single-stream read session per scan and materialize
//!   Arrow batches under a row limit,
//! - writes are rendered into batched `INSERT` statements,
//! - dataset and table metadata is cached per namespace and loaded in bulk
//!   on the first miss.
//!
//! Everything remote goes through the [`BigQueryClient`] trait, so transports
//! (and the in-process [`memory::InMemoryBigQuery`]) plug in at one seam.

use std::sync::Arc;

use anyhow::{Context, Result};
use datafusion::prelude::SessionContext;
use tracing::info;

pub mod catalog;
pub mod catalog_set;
pub mod codec;
pub mod error;
pub mod insert;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod provider;
pub mod remote;
pub mod scan;
pub mod value;

pub use catalog::{attach_catalog, sync_catalog, BigQueryCatalog, CatalogSyncResult};
pub use codec::BigQueryLogicalExtensionCodec;
pub use error::{BigQueryError, Result as BigQueryResult};
pub use insert::{BatchedInsertSink, InsertSummary, INSERT_FLUSH_SIZE};
pub use metrics::{BridgeMetrics, BridgeMetricsSnapshot};
pub use provider::{BigQueryDataSink, BigQueryTableProvider};
pub use remote::{BigQueryClient, BigQueryConnection};
pub use scan::{ScanBindData, ScanSessionController};
pub use value::{to_literal_string, to_output_value};

/// Bridge configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigQueryConfig {
    /// Project billed for read sessions and insert jobs.
    pub execution_project: String,
    /// Project that owns the attached datasets.
    pub storage_project: String,
    /// Datasets to attach; `None` attaches every dataset of the storage project.
    pub datasets: Option<Vec<String>>,
    /// Rows per scan step; `None` uses the DataFusion session batch size.
    pub scan_batch_rows: Option<usize>,
}

impl BigQueryConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let execution_project = lookup("BIGQUERY_EXECUTION_PROJECT")
            .filter(|value| !value.trim().is_empty())
            .context("BIGQUERY_EXECUTION_PROJECT must be set")?;
        // Decision: reading from the billing project is the common setup, so
        // the storage project falls back to it.
        let storage_project = lookup("BIGQUERY_STORAGE_PROJECT")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| execution_project.clone());
        let datasets = parse_list(lookup("BIGQUERY_DATASETS"));
        let scan_batch_rows = parse_optional_usize(lookup("BIGQUERY_SCAN_BATCH_ROWS"))?;
        if scan_batch_rows == Some(0) {
            anyhow::bail!("BIGQUERY_SCAN_BATCH_ROWS must be greater than zero");
        }

        Ok(Self {
            execution_project,
            storage_project,
            datasets,
            scan_batch_rows,
        })
    }

    /// Builds a catalog for `client` following this configuration.
    pub fn catalog(&self, client: Arc<dyn BigQueryClient>) -> BigQueryCatalog {
        let connection =
            BigQueryConnection::new(client, &self.execution_project, &self.storage_project);
        BigQueryCatalog::new(connection)
            .with_dataset_filter(self.datasets.clone())
            .with_scan_batch_rows(self.scan_batch_rows)
    }
}

/// Builds the catalog described by `config` and registers it into
/// `session_context`.
pub async fn attach(
    session_context: &SessionContext,
    client: Arc<dyn BigQueryClient>,
    config: &BigQueryConfig,
) -> Result<Arc<BigQueryCatalog>> {
    let catalog = Arc::new(config.catalog(client));
    let attached = attach_catalog(session_context, &catalog)
        .await
        .with_context(|| format!("attach bigquery project {}", config.storage_project))?;
    info!(
        execution_project = %config.execution_project,
        storage_project = %config.storage_project,
        tables = attached.registered_tables.len(),
        "bigquery catalog ready"
    );
    Ok(catalog)
}

/// Parses a comma separated list; blank entries are dropped.
fn parse_list(value: Option<String>) -> Option<Vec<String>> {
    let items: Vec<String> = value?
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

/// Parses an optional `usize`.
fn parse_optional_usize(value: Option<String>) -> Result<Option<usize>> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(None),
    }
}
