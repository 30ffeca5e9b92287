//! DataFusion `TableProvider` and `DataSink` over remote BigQuery tables.
//!
//! Scans are planned as one lazy partition: the read session is opened on the
//! first poll of the output stream and each poll materializes at most one
//! capacity-bounded chunk. Inserts stream input batches through a
//! [`BatchedInsertSink`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::array::ArrayRef;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::catalog::{Session, TableProvider};
use datafusion::common::{
    not_impl_err, DataFusionError, Result as DFResult, ScalarValue, SchemaExt,
};
use datafusion::datasource::sink::{DataSink, DataSinkExec};
use datafusion::execution::TaskContext;
use datafusion::logical_expr::dml::InsertOp;
use datafusion::logical_expr::{Expr, TableType};
use datafusion::physical_expr::expressions::{CastExpr, Literal, TryCastExpr};
use datafusion::physical_expr::{LexOrdering, PhysicalExpr};
use datafusion::physical_plan::display::{DisplayAs, DisplayFormatType};
use datafusion::physical_plan::projection::ProjectionExec;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::streaming::{PartitionStream, StreamingTableExec};
use datafusion::physical_plan::{ExecutionPlan, SendableRecordBatchStream};
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::error::{BigQueryError, Result};
use crate::insert::BatchedInsertSink;
use crate::metadata::{DatasetEntry, TableDescriptor};
use crate::remote::BigQueryConnection;
use crate::scan::{OutputChunk, ScanBindData, ScanSessionController};

/// Table provider for one remote table.
#[derive(Debug, Clone)]
pub struct BigQueryTableProvider {
    connection: BigQueryConnection,
    table: Arc<TableDescriptor>,
    schema: SchemaRef,
    scan_batch_rows: Option<usize>,
}

impl BigQueryTableProvider {
    /// Creates a provider for a cached table descriptor.
    pub fn new(connection: BigQueryConnection, table: Arc<TableDescriptor>) -> Self {
        Self {
            schema: table.schema(),
            connection,
            table,
            scan_batch_rows: None,
        }
    }

    /// Overrides the rows requested per materialization step.
    ///
    /// `None` uses the session's `batch_size`.
    pub fn with_scan_batch_rows(mut self, rows: Option<usize>) -> Self {
        self.scan_batch_rows = rows;
        self
    }

    /// Remote table this provider reads and writes.
    pub fn table(&self) -> &Arc<TableDescriptor> {
        &self.table
    }

    /// Connection shared with the catalog.
    pub fn connection(&self) -> &BigQueryConnection {
        &self.connection
    }

    /// Binds the single partition reading the projected columns.
    ///
    /// An empty projection still reads one column remotely to count rows;
    /// the produced batches then carry only a row count.
    fn scan_partition(
        &self,
        projection: Option<&Vec<usize>>,
        limit: Option<usize>,
        capacity: usize,
    ) -> Result<BigQueryScanPartition> {
        let schema = match projection {
            Some(indices) => Arc::new(self.schema.project(indices).map_err(|err| {
                BigQueryError::InvalidInput(format!(
                    "project scan of `{}`.`{}`: {err}",
                    self.table.dataset, self.table.name
                ))
            })?),
            None => Arc::clone(&self.schema),
        };
        let column_names: Vec<String> = if schema.fields().is_empty() {
            // Decision: any column works for counting; the first is always present.
            self.table
                .columns
                .first()
                .map(|column| vec![column.name.clone()])
                .unwrap_or_default()
        } else {
            schema
                .fields()
                .iter()
                .map(|field| field.name().clone())
                .collect()
        };

        let bind = ScanBindData::new(
            self.connection.execution_project(),
            self.connection.storage_project(),
            &self.table.dataset,
            &self.table.name,
            column_names,
        )
        .with_limit(limit.map(|limit| limit as u64));
        Ok(BigQueryScanPartition {
            connection: self.connection.clone(),
            bind,
            schema,
            capacity,
        })
    }
}

/// The one output partition of a remote table scan.
#[derive(Debug)]
struct BigQueryScanPartition {
    connection: BigQueryConnection,
    bind: ScanBindData,
    schema: SchemaRef,
    capacity: usize,
}

impl PartitionStream for BigQueryScanPartition {
    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn execute(&self, _ctx: Arc<TaskContext>) -> SendableRecordBatchStream {
        let reader = ScanReader {
            connection: self.connection.clone(),
            bind: self.bind.clone(),
            schema: Arc::clone(&self.schema),
            capacity: self.capacity,
            controller: None,
        };
        let batches = stream::try_unfold(reader, |mut reader| async move {
            let batch = reader.next_batch().await?;
            Ok::<_, DataFusionError>(batch.map(|batch| (batch, reader)))
        });
        Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.schema),
            batches,
        ))
    }
}

/// Pull-driven state of one executing scan.
struct ScanReader {
    connection: BigQueryConnection,
    bind: ScanBindData,
    schema: SchemaRef,
    capacity: usize,
    controller: Option<ScanSessionController>,
}

impl ScanReader {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.controller.is_none() {
            // LIMIT 0 never opens a read session.
            if self.bind.limit == Some(0) {
                self.connection.metrics().record_short_circuit();
                return Ok(None);
            }
            let controller =
                ScanSessionController::init(self.connection.clone(), &self.bind).await?;
            self.controller = Some(controller);
        }
        let Some(controller) = self.controller.as_mut() else {
            return Ok(None);
        };

        let chunk = controller.next_chunk(self.capacity).await?;
        if chunk.is_empty() {
            debug!(
                dataset = %self.bind.dataset,
                table = %self.bind.table,
                rows = controller.cursor().global_row_count,
                "bigquery table scan finished"
            );
            return Ok(None);
        }
        let batch = if self.schema.fields().is_empty() {
            count_only_batch(&self.schema, chunk.row_count)?
        } else {
            chunk_to_batch(&self.schema, chunk)?
        };
        Ok(Some(batch))
    }
}

fn chunk_to_batch(schema: &SchemaRef, chunk: OutputChunk) -> Result<RecordBatch> {
    let arrays = chunk
        .columns
        .into_iter()
        .zip(schema.fields().iter())
        .map(|(values, field)| {
            ScalarValue::iter_to_array(values).map_err(|err| {
                BigQueryError::conversion(
                    field.data_type(),
                    format!("build column `{}`: {err}", field.name()),
                )
            })
        })
        .collect::<Result<Vec<ArrayRef>>>()?;
    RecordBatch::try_new(Arc::clone(schema), arrays).map_err(|err| {
        BigQueryError::conversion("RecordBatch", format!("build scan batch: {err}"))
    })
}

fn count_only_batch(schema: &SchemaRef, rows: usize) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    RecordBatch::try_new_with_options(Arc::clone(schema), Vec::new(), &options).map_err(|err| {
        BigQueryError::conversion("RecordBatch", format!("build count batch: {err}"))
    })
}

/// Narrows an insert input to the columns its column list named.
///
/// The SQL planner fills every column left out of `INSERT INTO t (..)` with a
/// NULL literal cast to the column type. Those columns are dropped from the
/// input so the remote table applies its own defaults. Returns `None` when
/// every column carries a value.
fn split_omitted_columns(
    input: &Arc<dyn ExecutionPlan>,
) -> DFResult<Option<(Arc<dyn ExecutionPlan>, Vec<Option<usize>>)>> {
    let Some(projection) = input.as_any().downcast_ref::<ProjectionExec>() else {
        return Ok(None);
    };
    let mut kept = Vec::new();
    let mut column_index_map = Vec::with_capacity(projection.expr().len());
    for (expr, name) in projection.expr() {
        if is_null_literal(expr) {
            column_index_map.push(None);
        } else {
            column_index_map.push(Some(kept.len()));
            kept.push((Arc::clone(expr), name.clone()));
        }
    }
    if kept.is_empty() || kept.len() == column_index_map.len() {
        return Ok(None);
    }
    let narrowed = ProjectionExec::try_new(kept, Arc::clone(projection.input()))?;
    Ok(Some((Arc::new(narrowed), column_index_map)))
}

fn is_null_literal(expr: &Arc<dyn PhysicalExpr>) -> bool {
    let any = expr.as_any();
    if let Some(cast) = any.downcast_ref::<CastExpr>() {
        return is_null_literal(cast.expr());
    }
    if let Some(cast) = any.downcast_ref::<TryCastExpr>() {
        return is_null_literal(cast.expr());
    }
    any.downcast_ref::<Literal>()
        .is_some_and(|literal| literal.value().is_null())
}

#[async_trait]
impl TableProvider for BigQueryTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let capacity = self
            .scan_batch_rows
            .unwrap_or_else(|| state.config().batch_size());
        debug!(
            dataset = %self.table.dataset,
            table = %self.table.name,
            projection = ?projection,
            limit = ?limit,
            capacity,
            "planning bigquery table scan"
        );
        let partition = self.scan_partition(projection, limit, capacity)?;
        let schema = Arc::clone(partition.schema());
        let exec = StreamingTableExec::try_new(
            schema,
            vec![Arc::new(partition)],
            None,
            Vec::<LexOrdering>::new(),
            false,
            limit,
        )?;
        Ok(Arc::new(exec))
    }

    async fn insert_into(
        &self,
        _state: &dyn Session,
        input: Arc<dyn ExecutionPlan>,
        insert_op: InsertOp,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        self.schema()
            .logically_equivalent_names_and_types(&input.schema())?;
        if insert_op != InsertOp::Append {
            return not_impl_err!("{insert_op} is not supported for BigQuery tables");
        }

        let (input, sink) = match split_omitted_columns(&input)? {
            Some((narrowed, column_index_map)) => {
                debug!(
                    dataset = %self.table.dataset,
                    table = %self.table.name,
                    written = narrowed.schema().fields().len(),
                    "insert names a subset of the table columns"
                );
                let sink = BigQueryDataSink::with_column_mapping(
                    self.connection.clone(),
                    Arc::clone(&self.table),
                    column_index_map,
                )?;
                (narrowed, sink)
            }
            None => (
                input,
                BigQueryDataSink::for_table(self.connection.clone(), Arc::clone(&self.table)),
            ),
        };
        Ok(Arc::new(DataSinkExec::new(input, Arc::new(sink), None)))
    }
}

#[derive(Debug)]
enum SinkTarget {
    Existing {
        table: Arc<TableDescriptor>,
        column_index_map: Vec<Option<usize>>,
    },
    Create {
        dataset: Arc<DatasetEntry>,
        definition: TableDescriptor,
    },
}

/// `DataSink` feeding a [`BatchedInsertSink`].
#[derive(Debug)]
pub struct BigQueryDataSink {
    connection: BigQueryConnection,
    target: SinkTarget,
    schema: SchemaRef,
}

impl BigQueryDataSink {
    /// Appends full-width rows to an existing table.
    pub fn for_table(connection: BigQueryConnection, table: Arc<TableDescriptor>) -> Self {
        Self {
            schema: table.schema(),
            connection,
            target: SinkTarget::Existing {
                table,
                column_index_map: Vec::new(),
            },
        }
    }

    /// Appends rows that only carry the mapped columns.
    ///
    /// See [`crate::insert::resolve_insert_columns`] for the mapping shape.
    pub fn with_column_mapping(
        connection: BigQueryConnection,
        table: Arc<TableDescriptor>,
        column_index_map: Vec<Option<usize>>,
    ) -> Result<Self> {
        let names = crate::insert::resolve_insert_columns(&table, &column_index_map)?;
        let schema = if names.is_empty() {
            table.schema()
        } else {
            let full = table.schema();
            let indices: Vec<usize> = names
                .iter()
                .filter_map(|name| table.column_index(name))
                .collect();
            Arc::new(full.project(&indices).map_err(|err| {
                BigQueryError::InvalidInput(format!("project insert columns: {err}"))
            })?)
        };
        Ok(Self {
            connection,
            target: SinkTarget::Existing {
                table,
                column_index_map,
            },
            schema,
        })
    }

    /// Creates `definition` when the write starts, then fills it.
    pub fn create_table_as(
        connection: BigQueryConnection,
        dataset: Arc<DatasetEntry>,
        definition: TableDescriptor,
    ) -> Self {
        Self {
            schema: definition.schema(),
            connection,
            target: SinkTarget::Create {
                dataset,
                definition,
            },
        }
    }

    fn target_label(&self) -> String {
        match &self.target {
            SinkTarget::Existing { table, .. } => format!("{}.{}", table.dataset, table.name),
            SinkTarget::Create { definition, .. } => {
                format!("{}.{}", definition.dataset, definition.name)
            }
        }
    }

    async fn open_sink(&self) -> Result<BatchedInsertSink> {
        match &self.target {
            SinkTarget::Existing {
                table,
                column_index_map,
            } => BatchedInsertSink::for_existing(
                self.connection.clone(),
                Arc::clone(table),
                column_index_map,
            ),
            SinkTarget::Create {
                dataset,
                definition,
            } => {
                BatchedInsertSink::for_new_table(
                    self.connection.clone(),
                    dataset.tables(),
                    definition.clone(),
                )
                .await
            }
        }
    }
}

impl DisplayAs for BigQueryDataSink {
    fn fmt_as(&self, t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match t {
            DisplayFormatType::Default | DisplayFormatType::Verbose => {
                let kind = match self.target {
                    SinkTarget::Existing { .. } => "BigQueryInsert",
                    SinkTarget::Create { .. } => "BigQueryCreateTableAs",
                };
                write!(f, "{kind}(table={})", self.target_label())
            }
            DisplayFormatType::TreeRender => write!(f, "table={}", self.target_label()),
        }
    }
}

#[async_trait]
impl DataSink for BigQueryDataSink {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    async fn write_all(
        &self,
        mut data: SendableRecordBatchStream,
        _context: &Arc<TaskContext>,
    ) -> DFResult<u64> {
        let mut sink = self.open_sink().await?;
        while let Some(batch) = data.next().await.transpose()? {
            self.schema
                .logically_equivalent_names_and_types(&batch.schema())?;
            sink.sink(&batch).await?;
        }
        let summary = sink.finalize().await?;
        Ok(summary.inserted_rows)
    }
}
