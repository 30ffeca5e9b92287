//! Single-stream read session driver.
//!
//! A [`ScanSessionController`] owns one remote read session for one scan
//! execution. It keeps a row cursor over the session's first stream and
//! materializes remote Arrow batches into engine values, bounded by an
//! optional row limit and by the capacity the caller asks for per step.

use std::sync::Arc;

use datafusion::arrow::datatypes::{Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;
use tracing::{debug, info};

use crate::error::{BigQueryError, Result};
use crate::remote::{
    table_resource_name, BigQueryConnection, CreateReadSessionRequest, DataFormat, RowStream,
};
use crate::value::to_output_value;

/// Bind-time parameters of one remote scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBindData {
    /// Project billed for the read session.
    pub execution_project: String,
    /// Project that owns the dataset.
    pub storage_project: String,
    /// Dataset of the scanned table.
    pub dataset: String,
    /// Scanned table.
    pub table: String,
    /// Selected columns in output order.
    pub column_names: Vec<String>,
    /// Maximum rows to produce; `None` means unbounded.
    pub limit: Option<u64>,
    /// Rows of the stream to skip before the first produced row.
    pub offset: u64,
    /// Streams requested from the service.
    pub max_stream_count: usize,
}

impl ScanBindData {
    /// Binds an unbounded single-stream scan of `dataset.table`.
    pub fn new(
        execution_project: impl Into<String>,
        storage_project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
        column_names: Vec<String>,
    ) -> Self {
        Self {
            execution_project: execution_project.into(),
            storage_project: storage_project.into(),
            dataset: dataset.into(),
            table: table.into(),
            column_names,
            limit: None,
            offset: 0,
            max_stream_count: 1,
        }
    }

    /// Caps the number of produced rows.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Skips `offset` rows of the stream.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Requests `count` streams; only one is supported.
    pub fn with_max_stream_count(mut self, count: usize) -> Self {
        self.max_stream_count = count;
        self
    }

    /// Whether a row limit is in effect.
    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }
}

/// Immutable identity of the remote session a scan reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSessionDescriptor {
    pub execution_project: String,
    pub storage_project: String,
    pub dataset: String,
    pub table: String,
    pub selected_columns: Vec<String>,
}

impl ReadSessionDescriptor {
    /// Derives the descriptor from bind data.
    pub fn from_bind(bind: &ScanBindData) -> Self {
        Self {
            execution_project: bind.execution_project.clone(),
            storage_project: bind.storage_project.clone(),
            dataset: bind.dataset.clone(),
            table: bind.table.clone(),
            selected_columns: bind.column_names.clone(),
        }
    }

    /// Fully qualified table resource name.
    pub fn table_resource(&self) -> String {
        table_resource_name(&self.storage_project, &self.dataset, &self.table)
    }

    /// Billing parent of the session.
    pub fn parent(&self) -> String {
        format!("projects/{}", self.execution_project)
    }
}

/// Row position of a scan inside its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    /// Stream being read; empty when the session had no stream.
    pub stream_name: String,
    /// Stream offset of the next unread row.
    pub current_offset: u64,
    /// Maximum rows to produce.
    pub row_limit: Option<u64>,
    /// Rows produced so far.
    pub global_row_count: u64,
}

impl ScanCursor {
    fn remaining_limit(&self) -> Option<u64> {
        self.row_limit
            .map(|limit| limit.saturating_sub(self.global_row_count))
    }

    fn limit_reached(&self) -> bool {
        self.remaining_limit() == Some(0)
    }

    fn advance(&mut self, rows: u64) {
        self.current_offset += rows;
        self.global_row_count += rows;
    }
}

/// Values produced by one materialization step, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    /// One vector per selected column, each `row_count` long.
    pub columns: Vec<Vec<ScalarValue>>,
    /// Rows in this chunk.
    pub row_count: usize,
}

impl OutputChunk {
    fn empty(column_count: usize, capacity: usize) -> Self {
        Self {
            columns: (0..column_count)
                .map(|_| Vec::with_capacity(capacity))
                .collect(),
            row_count: 0,
        }
    }

    /// Whether the step produced no rows (the scan is finished).
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }
}

struct PendingBatch {
    batch: RecordBatch,
    next_row: usize,
}

impl PendingBatch {
    fn remaining(&self) -> usize {
        self.batch.num_rows().saturating_sub(self.next_row)
    }
}

enum ScanState {
    Active,
    Exhausted,
    Failed(BigQueryError),
}

/// Drives one read session from init to exhaustion.
pub struct ScanSessionController {
    connection: BigQueryConnection,
    descriptor: ReadSessionDescriptor,
    session_name: String,
    output_schema: SchemaRef,
    column_indices: Vec<usize>,
    cursor: ScanCursor,
    stream: Option<Box<dyn RowStream>>,
    pending: Option<PendingBatch>,
    state: ScanState,
    short_circuit_recorded: bool,
}

impl ScanSessionController {
    /// Opens the read session and positions the cursor at the bind offset.
    pub async fn init(connection: BigQueryConnection, bind: &ScanBindData) -> Result<Self> {
        if bind.max_stream_count != 1 {
            return Err(BigQueryError::Unsupported(format!(
                "parallel scans with {} streams",
                bind.max_stream_count
            )));
        }
        if bind.column_names.is_empty() {
            return Err(BigQueryError::InvalidInput(format!(
                "scan of `{}`.`{}` selects no columns",
                bind.dataset, bind.table
            )));
        }

        let descriptor = ReadSessionDescriptor::from_bind(bind);
        let table = descriptor.table_resource();
        let request = CreateReadSessionRequest {
            parent: descriptor.parent(),
            table: table.clone(),
            data_format: DataFormat::Arrow,
            selected_fields: descriptor.selected_columns.clone(),
            max_stream_count: 1,
        };
        let session = connection
            .client()
            .create_read_session(request)
            .await
            .map_err(|err| {
                BigQueryError::remote(&format!("create read session for {table}"), err)
            })?;
        connection.metrics().record_read_session();

        // Session schema is resolved once; every batch is encoded against it.
        let column_indices = descriptor
            .selected_columns
            .iter()
            .map(|name| {
                session
                    .schema
                    .fields()
                    .iter()
                    .position(|field| field.name().eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        BigQueryError::RemoteConnection(format!(
                            "read session {} does not expose column `{name}`",
                            session.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let fields: Vec<Field> = column_indices
            .iter()
            .map(|index| session.schema.field(*index).clone())
            .collect();
        let output_schema = Arc::new(Schema::new(fields));

        // Decision: the service hands out zero streams for an empty table;
        // that is an exhausted scan, not an error.
        let (stream_name, state) = match session.streams.first() {
            Some(stream) => (stream.name.clone(), ScanState::Active),
            None => (String::new(), ScanState::Exhausted),
        };
        info!(
            table = %table,
            session = %session.name,
            stream = %stream_name,
            columns = column_indices.len(),
            limit = ?bind.limit,
            offset = bind.offset,
            "opened read session"
        );

        Ok(Self {
            connection,
            descriptor,
            session_name: session.name,
            output_schema,
            column_indices,
            cursor: ScanCursor {
                stream_name,
                current_offset: bind.offset,
                row_limit: bind.limit,
                global_row_count: 0,
            },
            stream: None,
            pending: None,
            state,
            short_circuit_recorded: false,
        })
    }

    /// Scans always run on a single stream.
    pub fn max_threads(&self) -> usize {
        1
    }

    /// Session identity.
    pub fn descriptor(&self) -> &ReadSessionDescriptor {
        &self.descriptor
    }

    /// Remote session resource name.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Schema of the selected columns as the session reports them.
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Current cursor position.
    pub fn cursor(&self) -> &ScanCursor {
        &self.cursor
    }

    /// Whether no further rows will be produced.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, ScanState::Exhausted) || self.cursor.limit_reached()
    }

    /// Produces up to `capacity` rows; an empty chunk means the scan is done.
    ///
    /// Any failure poisons the controller: every later call returns the same
    /// error instead of rows.
    pub async fn next_chunk(&mut self, capacity: usize) -> Result<OutputChunk> {
        if let ScanState::Failed(err) = &self.state {
            return Err(err.clone());
        }
        // Decision: a zero capacity would never make progress, treat it as one.
        let capacity = capacity.max(1);
        match self.materialize(capacity).await {
            Ok(chunk) => Ok(chunk),
            Err(err) => {
                self.pending = None;
                self.stream = None;
                self.state = ScanState::Failed(err.clone());
                Err(err)
            }
        }
    }

    async fn materialize(&mut self, capacity: usize) -> Result<OutputChunk> {
        let mut chunk = OutputChunk::empty(self.column_indices.len(), capacity);
        if self.cursor.row_limit == Some(0) {
            if !self.short_circuit_recorded {
                self.short_circuit_recorded = true;
                self.connection.metrics().record_short_circuit();
                debug!(session = %self.session_name, "limit zero scan short-circuited");
            }
            return Ok(chunk);
        }

        loop {
            if self.is_finished() {
                return Ok(chunk);
            }
            let mut pending = match self.pending.take() {
                Some(pending) => pending,
                None => match self.pull_batch().await? {
                    Some(batch) => PendingBatch { batch, next_row: 0 },
                    None => {
                        self.state = ScanState::Exhausted;
                        debug!(
                            session = %self.session_name,
                            rows = self.cursor.global_row_count,
                            "read stream exhausted"
                        );
                        return Ok(chunk);
                    }
                },
            };
            // Empty batches carry no rows; they do not end the stream.
            if pending.remaining() == 0 {
                continue;
            }

            let mut take = pending.remaining().min(capacity);
            if let Some(remaining) = self.cursor.remaining_limit() {
                take = take.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
            for (slot, column_index) in self.column_indices.iter().enumerate() {
                let array = pending.batch.column(*column_index);
                let values = &mut chunk.columns[slot];
                for row in pending.next_row..pending.next_row + take {
                    values.push(to_output_value(array.as_ref(), row)?);
                }
            }
            chunk.row_count = take;
            pending.next_row += take;
            self.cursor.advance(take as u64);
            if pending.remaining() > 0 {
                self.pending = Some(pending);
            }

            self.connection
                .metrics()
                .record_rows_materialized(take as u64);
            debug!(
                session = %self.session_name,
                rows = take,
                offset = self.cursor.current_offset,
                total = self.cursor.global_row_count,
                "materialized scan chunk"
            );
            return Ok(chunk);
        }
    }

    async fn pull_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.stream.is_none() {
            let stream = self
                .connection
                .client()
                .read_rows(&self.cursor.stream_name, self.cursor.current_offset)
                .await
                .map_err(|err| {
                    BigQueryError::remote(
                        &format!("read rows from {}", self.cursor.stream_name),
                        err,
                    )
                })?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let batch = stream.next_batch().await.map_err(|err| {
            BigQueryError::remote(&format!("read rows from {}", self.cursor.stream_name), err)
        })?;
        if batch.is_some() {
            self.connection.metrics().record_stream_batch();
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::array::{Date32Array, Int64Array, StringArray};
    use datafusion::arrow::datatypes::DataType;

    use super::*;
    use crate::memory::InMemoryBigQuery;
    use crate::metadata::{ColumnDescriptor, TableDescriptor};

    fn wide_table() -> TableDescriptor {
        TableDescriptor::new(
            "storage-p",
            "analytics",
            "events",
            vec![
                ColumnDescriptor::new("id", DataType::Int64),
                ColumnDescriptor::new("name", DataType::Utf8),
                ColumnDescriptor::new("score", DataType::Int64),
            ],
        )
    }

    fn wide_batch(start: i64, rows: i64) -> RecordBatch {
        let ids: Vec<i64> = (start..start + rows).collect();
        let names: Vec<String> = ids.iter().map(|id| format!("row-{id}")).collect();
        let scores: Vec<i64> = ids.iter().map(|id| id * 10).collect();
        RecordBatch::try_new(
            wide_table().schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
                Arc::new(Int64Array::from(scores)),
            ],
        )
        .expect("batch")
    }

    fn seeded(batches: Vec<RecordBatch>) -> (Arc<InMemoryBigQuery>, BigQueryConnection) {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(wide_table(), batches);
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        (remote, connection)
    }

    fn bind(columns: &[&str]) -> ScanBindData {
        ScanBindData::new(
            "exec-p",
            "storage-p",
            "analytics",
            "events",
            columns.iter().map(|c| c.to_string()).collect(),
        )
    }

    async fn drain(controller: &mut ScanSessionController, capacity: usize) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        loop {
            let chunk = controller.next_chunk(capacity).await.expect("chunk");
            if chunk.is_empty() {
                return chunks;
            }
            chunks.push(chunk);
        }
    }

    #[tokio::test]
    async fn limit_bounds_rows_across_steps() {
        let batches = (0..5).map(|i| wide_batch(i * 500, 500)).collect();
        let (remote, connection) = seeded(batches);
        let bind = bind(&["id", "name", "score"]).with_limit(Some(1000));
        let mut controller = ScanSessionController::init(connection, &bind)
            .await
            .expect("init");

        let chunks = drain(&mut controller, 300).await;
        let total: usize = chunks.iter().map(|chunk| chunk.row_count).sum();
        assert_eq!(total, 1000);
        assert!(chunks.iter().all(|chunk| chunk.row_count <= 300));
        assert!(chunks.iter().all(|chunk| chunk.columns.len() == 3));
        assert_eq!(controller.cursor().global_row_count, 1000);
        assert_eq!(controller.cursor().current_offset, 1000);
        assert_eq!(chunks[0].columns[1][0], ScalarValue::Utf8(Some("row-0".into())));

        let request = &remote.session_requests()[0];
        assert_eq!(request.parent, "projects/exec-p");
        assert_eq!(request.table, "projects/storage-p/datasets/analytics/tables/events");
        assert_eq!(request.max_stream_count, 1);
        assert_eq!(request.data_format, DataFormat::Arrow);
        assert_eq!(controller.max_threads(), 1);
    }

    #[tokio::test]
    async fn unbounded_scan_reads_every_row() {
        let (_remote, connection) = seeded(vec![wide_batch(0, 7), wide_batch(7, 3)]);
        let mut controller = ScanSessionController::init(connection, &bind(&["score"]))
            .await
            .expect("init");
        let chunks = drain(&mut controller, 4).await;
        let rows: Vec<usize> = chunks.iter().map(|chunk| chunk.row_count).collect();
        // The 7-row batch spans two steps; the second step stops at its end.
        assert_eq!(rows, vec![4, 3, 3]);
        assert_eq!(controller.cursor().current_offset, 10);
        assert!(controller.is_finished());
    }

    #[tokio::test]
    async fn offset_skips_leading_rows() {
        let (_remote, connection) = seeded(vec![wide_batch(0, 10)]);
        let bind = bind(&["id"]).with_offset(4).with_limit(Some(3));
        let mut controller = ScanSessionController::init(connection, &bind)
            .await
            .expect("init");
        let chunk = controller.next_chunk(100).await.expect("chunk");
        assert_eq!(
            chunk.columns[0],
            vec![
                ScalarValue::Int64(Some(4)),
                ScalarValue::Int64(Some(5)),
                ScalarValue::Int64(Some(6))
            ]
        );
        assert_eq!(controller.cursor().current_offset, 7);
        assert_eq!(controller.cursor().global_row_count, 3);
    }

    #[tokio::test]
    async fn limit_zero_never_reads_the_stream() {
        let (remote, connection) = seeded(vec![wide_batch(0, 10)]);
        let metrics = Arc::clone(connection.metrics());
        let bind = bind(&["id"]).with_limit(Some(0));
        let mut controller = ScanSessionController::init(connection, &bind)
            .await
            .expect("init");
        assert!(controller.next_chunk(10).await.expect("chunk").is_empty());
        assert!(controller.next_chunk(10).await.expect("chunk").is_empty());
        assert_eq!(remote.calls().read_rows, 0);
        assert_eq!(metrics.snapshot().scans_short_circuited, 1);
    }

    #[tokio::test]
    async fn empty_batches_do_not_end_the_scan() {
        let empty = wide_batch(0, 0);
        let (_remote, connection) = seeded(vec![wide_batch(0, 2), empty, wide_batch(2, 2)]);
        let mut controller = ScanSessionController::init(connection, &bind(&["id"]))
            .await
            .expect("init");
        let chunks = drain(&mut controller, 10).await;
        let total: usize = chunks.iter().map(|chunk| chunk.row_count).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn conversion_failure_poisons_the_controller() {
        let table = TableDescriptor::new(
            "storage-p",
            "analytics",
            "days",
            vec![ColumnDescriptor::new("day", DataType::Date32)],
        );
        let batch = RecordBatch::try_new(
            table.schema(),
            vec![Arc::new(Date32Array::from(vec![19_000, 19_001]))],
        )
        .expect("batch");
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(table, vec![batch]);
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let bind =
            ScanBindData::new("exec-p", "storage-p", "analytics", "days", vec!["day".into()]);
        let mut controller = ScanSessionController::init(connection, &bind)
            .await
            .expect("init");

        let err = controller.next_chunk(10).await.expect_err("date32 unsupported");
        assert!(matches!(err, BigQueryError::Conversion { .. }));
        assert!(err.to_string().contains("Date32"), "{err}");
        let again = controller.next_chunk(10).await.expect_err("still poisoned");
        assert!(matches!(again, BigQueryError::Conversion { .. }));
        assert_eq!(remote.calls().read_rows, 1);
    }

    #[tokio::test]
    async fn session_failure_surfaces_remote_message() {
        let (remote, connection) = seeded(vec![wide_batch(0, 1)]);
        remote.fail_next_session("quota exceeded for project exec-p");
        let result = ScanSessionController::init(connection, &bind(&["id"])).await;
        let Err(err) = result else {
            panic!("session creation should fail");
        };
        assert!(matches!(err, BigQueryError::RemoteConnection(_)));
        assert!(err.to_string().contains("quota exceeded"), "{err}");
    }

    #[tokio::test]
    async fn parallel_streams_are_refused_before_any_call() {
        let (remote, connection) = seeded(vec![wide_batch(0, 1)]);
        let bind = bind(&["id"]).with_max_stream_count(4);
        let result = ScanSessionController::init(connection, &bind).await;
        assert!(matches!(result, Err(BigQueryError::Unsupported(_))));
        assert_eq!(remote.calls().create_read_session, 0);
    }

    #[tokio::test]
    async fn unknown_column_fails_at_init() {
        let (_remote, connection) = seeded(vec![wide_batch(0, 1)]);
        let result = ScanSessionController::init(connection, &bind(&["missing"])).await;
        assert!(result.is_err());
    }
}
