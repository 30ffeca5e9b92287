//! Transport seam towards the remote BigQuery-style service.
//!
//! The bridge never talks to the network directly. Everything remote goes
//! through [`BigQueryClient`], shared via the reference-counted
//! [`BigQueryConnection`] handle between the catalog caches, active scans and
//! insert sinks. Transport implementations own retries, auth and timeouts.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;

use crate::metadata::{DatasetDescriptor, TableDescriptor};
use crate::metrics::BridgeMetrics;

/// Columnar payload format requested for read sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Arrow record batches.
    Arrow,
}

/// Request for one read session over a remote table snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReadSessionRequest {
    /// Billing parent, `projects/{execution_project}`.
    pub parent: String,
    /// Fully qualified table resource name.
    pub table: String,
    /// Payload format of the streamed batches.
    pub data_format: DataFormat,
    /// Columns to read, in output order.
    pub selected_fields: Vec<String>,
    /// Upper bound on streams the service may hand out.
    pub max_stream_count: usize,
}

/// One partition of a read session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStream {
    /// Stream resource name passed back to `read_rows`.
    pub name: String,
}

/// Read session handed out by the service.
#[derive(Debug, Clone)]
pub struct ReadSession {
    /// Session resource name.
    pub name: String,
    /// Arrow schema every streamed batch is encoded against.
    pub schema: SchemaRef,
    /// Streams of the session; the bridge only consumes the first one.
    pub streams: Vec<ReadStream>,
}

/// Ordered sequence of batches read from one stream.
#[async_trait]
pub trait RowStream: Send {
    /// Returns the next batch, or `None` once the stream is exhausted.
    async fn next_batch(&mut self) -> anyhow::Result<Option<RecordBatch>>;
}

/// Remote operations the bridge depends on.
#[async_trait]
pub trait BigQueryClient: Send + Sync + fmt::Debug {
    /// Lists the datasets of a project.
    async fn list_datasets(&self, project: &str) -> anyhow::Result<Vec<DatasetDescriptor>>;

    /// Lists every table (with its columns) of one dataset.
    async fn list_tables(&self, project: &str, dataset: &str)
        -> anyhow::Result<Vec<TableDescriptor>>;

    /// Fetches one table, `None` when it does not exist.
    async fn get_table(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> anyhow::Result<Option<TableDescriptor>>;

    /// Creates a table and returns the descriptor the service settled on.
    async fn create_table(
        &self,
        project: &str,
        definition: &TableDescriptor,
    ) -> anyhow::Result<TableDescriptor>;

    /// Drops a table.
    async fn drop_table(&self, project: &str, dataset: &str, table: &str) -> anyhow::Result<()>;

    /// Opens a read session.
    async fn create_read_session(
        &self,
        request: CreateReadSessionRequest,
    ) -> anyhow::Result<ReadSession>;

    /// Opens a stream of batches starting at `offset` rows into the stream.
    async fn read_rows(&self, stream: &str, offset: u64) -> anyhow::Result<Box<dyn RowStream>>;

    /// Runs one SQL statement as a job billed to `project`.
    async fn execute_statement(&self, project: &str, sql: &str) -> anyhow::Result<()>;
}

/// Shared handle to a remote service plus the project pair it operates on.
///
/// Cloning is cheap; the client lives as long as the longest holder among
/// catalog caches and in-flight scan/insert state.
#[derive(Clone)]
pub struct BigQueryConnection {
    client: Arc<dyn BigQueryClient>,
    execution_project: String,
    storage_project: String,
    metrics: Arc<BridgeMetrics>,
}

impl BigQueryConnection {
    /// Creates a connection that reads and bills against the given projects.
    pub fn new(
        client: Arc<dyn BigQueryClient>,
        execution_project: impl Into<String>,
        storage_project: impl Into<String>,
    ) -> Self {
        Self {
            client,
            execution_project: execution_project.into(),
            storage_project: storage_project.into(),
            metrics: Arc::new(BridgeMetrics::default()),
        }
    }

    /// Replaces the metrics recorder, e.g. to share one across connections.
    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Remote client.
    pub fn client(&self) -> &Arc<dyn BigQueryClient> {
        &self.client
    }

    /// Project that sessions and jobs are billed to.
    pub fn execution_project(&self) -> &str {
        &self.execution_project
    }

    /// Project that owns the datasets.
    pub fn storage_project(&self) -> &str {
        &self.storage_project
    }

    /// Shared metrics recorder.
    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }
}

impl fmt::Debug for BigQueryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryConnection")
            .field("execution_project", &self.execution_project)
            .field("storage_project", &self.storage_project)
            .finish_non_exhaustive()
    }
}

/// Builds `projects/{project}/datasets/{dataset}/tables/{table}`.
pub fn table_resource_name(project: &str, dataset: &str, table: &str) -> String {
    format!("projects/{project}/datasets/{dataset}/tables/{table}")
}

/// Splits a table resource name back into `(project, dataset, table)`.
pub fn parse_table_resource_name(name: &str) -> Option<(&str, &str, &str)> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "datasets", dataset, "tables", table]
            if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
        {
            Some((*project, *dataset, *table))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_round_trip() {
        let name = table_resource_name("storage-p", "analytics", "events");
        assert_eq!(name, "projects/storage-p/datasets/analytics/tables/events");
        assert_eq!(
            parse_table_resource_name(&name),
            Some(("storage-p", "analytics", "events"))
        );
    }

    #[test]
    fn malformed_resource_names_are_rejected() {
        assert_eq!(parse_table_resource_name("projects/p/datasets/d"), None);
        assert_eq!(
            parse_table_resource_name("projects/p/datasets/d/tables/t/extra"),
            None
        );
        assert_eq!(parse_table_resource_name("projects//datasets/d/tables/t"), None);
    }
}
