//! Batched `INSERT` statement writer.
//!
//! Rows are rendered into literal tuples and appended to a pending `VALUES`
//! list. Once the pending text reaches [`INSERT_FLUSH_SIZE`] characters the
//! statement is executed remotely and the buffer starts over. `finalize`
//! flushes whatever is left and exposes the total row count.

use std::sync::Arc;

use datafusion::arrow::array::UInt64Array;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;
use tracing::{debug, info, warn};

use crate::error::{BigQueryError, Result};
use crate::metadata::{TableDescriptor, TableSet};
use crate::remote::BigQueryConnection;
use crate::value::{to_literal_string, write_identifier};

/// Pending `VALUES` text size that triggers a flush.
pub const INSERT_FLUSH_SIZE: usize = 8000;

/// Resolves the explicit insert column list from a column-index mapping.
///
/// `column_index_map[table_column]` holds the input position feeding that
/// table column, or `None` when the column is not written. The result lists
/// table column names in input order. An empty mapping yields an empty list,
/// meaning every column in table order with no column list in the statement.
pub fn resolve_insert_columns(
    table: &TableDescriptor,
    column_index_map: &[Option<usize>],
) -> Result<Vec<String>> {
    if column_index_map.is_empty() {
        return Ok(Vec::new());
    }
    if column_index_map.len() != table.columns.len() {
        return Err(BigQueryError::InvalidInput(format!(
            "column mapping covers {} columns but `{}`.`{}` has {}",
            column_index_map.len(),
            table.dataset,
            table.name,
            table.columns.len()
        )));
    }

    let mapped = column_index_map.iter().filter(|slot| slot.is_some()).count();
    let mut by_input: Vec<Option<&str>> = vec![None; mapped];
    for (table_column, slot) in column_index_map.iter().enumerate() {
        let Some(input) = slot else {
            continue;
        };
        match by_input.get_mut(*input) {
            Some(target) if target.is_none() => {
                *target = Some(table.columns[table_column].name.as_str())
            }
            _ => {
                return Err(BigQueryError::InvalidInput(format!(
                    "input position {input} is out of range or mapped twice for `{}`.`{}`",
                    table.dataset, table.name
                )))
            }
        }
    }
    if mapped == 0 {
        return Err(BigQueryError::InvalidInput(format!(
            "column mapping for `{}`.`{}` writes no columns",
            table.dataset, table.name
        )));
    }
    // Every slot is filled: `mapped` distinct positions all below `mapped`.
    Ok(by_input.into_iter().flatten().map(str::to_string).collect())
}

/// Builds ``INSERT INTO `dataset`.`table` [(`col`, ...)] VALUES ``.
pub fn insert_template(table: &TableDescriptor, columns: &[String]) -> String {
    let mut query = format!(
        "INSERT INTO {}.{} ",
        write_identifier(&table.dataset),
        write_identifier(&table.name)
    );
    if !columns.is_empty() {
        let list: Vec<String> = columns.iter().map(|name| write_identifier(name)).collect();
        query.push('(');
        query.push_str(&list.join(", "));
        query.push_str(") ");
    }
    query.push_str("VALUES ");
    query
}

/// Pending statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertBuffer {
    template: String,
    tuples: String,
    pending_rows: usize,
}

impl InsertBuffer {
    /// Creates an empty buffer for statements starting with `template`.
    pub fn new(template: String) -> Self {
        Self {
            template,
            tuples: String::new(),
            pending_rows: 0,
        }
    }

    /// Statement prefix.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Appends one rendered `(...)` tuple.
    pub fn push_tuple(&mut self, tuple: &str) {
        if !self.tuples.is_empty() {
            self.tuples.push_str(", ");
        }
        self.tuples.push_str(tuple);
        self.pending_rows += 1;
    }

    /// Characters of tuple text waiting to be sent.
    pub fn pending_chars(&self) -> usize {
        self.tuples.len()
    }

    /// Rows waiting to be sent.
    pub fn pending_rows(&self) -> usize {
        self.pending_rows
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Whether the pending text reached the flush threshold.
    pub fn should_flush(&self) -> bool {
        self.tuples.len() >= INSERT_FLUSH_SIZE
    }

    /// Returns the full statement and resets the buffer.
    pub fn take_statement(&mut self) -> String {
        let mut statement = String::with_capacity(self.template.len() + self.tuples.len());
        statement.push_str(&self.template);
        statement.push_str(&self.tuples);
        self.tuples.clear();
        self.pending_rows = 0;
        statement
    }
}

/// Result row of a finished insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertSummary {
    /// Rows accepted across every flush.
    pub inserted_rows: u64,
}

impl InsertSummary {
    /// Single `count` column, as the engine reports DML results.
    pub fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("count", DataType::UInt64, false)]))
    }

    /// One-row batch carrying the count.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        RecordBatch::try_new(
            Self::schema(),
            vec![Arc::new(UInt64Array::from(vec![self.inserted_rows]))],
        )
        .map_err(|err| BigQueryError::conversion("UInt64", format!("insert summary: {err}")))
    }
}

enum SinkState {
    Accumulating,
    Finalized(InsertSummary),
    Failed(BigQueryError),
}

/// Accumulates rows for one target table and writes them in batches.
pub struct BatchedInsertSink {
    connection: BigQueryConnection,
    table: Arc<TableDescriptor>,
    insert_columns: Vec<String>,
    buffer: InsertBuffer,
    inserted_rows: u64,
    flushes: usize,
    state: SinkState,
}

impl BatchedInsertSink {
    /// Writes into an existing table through an optional column mapping.
    pub fn for_existing(
        connection: BigQueryConnection,
        table: Arc<TableDescriptor>,
        column_index_map: &[Option<usize>],
    ) -> Result<Self> {
        let insert_columns = resolve_insert_columns(&table, column_index_map)?;
        Ok(Self::new(connection, table, insert_columns))
    }

    /// Creates the target table first, then writes every column in table order.
    pub async fn for_new_table(
        connection: BigQueryConnection,
        tables: &TableSet,
        definition: TableDescriptor,
    ) -> Result<Self> {
        let table = tables.create_table(definition).await?;
        Ok(Self::new(connection, table, Vec::new()))
    }

    fn new(
        connection: BigQueryConnection,
        table: Arc<TableDescriptor>,
        insert_columns: Vec<String>,
    ) -> Self {
        let buffer = InsertBuffer::new(insert_template(&table, &insert_columns));
        Self {
            connection,
            table,
            insert_columns,
            buffer,
            inserted_rows: 0,
            flushes: 0,
            state: SinkState::Accumulating,
        }
    }

    /// Target table.
    pub fn table(&self) -> &Arc<TableDescriptor> {
        &self.table
    }

    /// Explicit column list; empty when every column is written.
    pub fn insert_columns(&self) -> &[String] {
        &self.insert_columns
    }

    /// Columns every input batch must carry.
    pub fn expected_column_count(&self) -> usize {
        if self.insert_columns.is_empty() {
            self.table.columns.len()
        } else {
            self.insert_columns.len()
        }
    }

    /// Statement prefix every flush starts with.
    pub fn template(&self) -> &str {
        self.buffer.template()
    }

    /// Rows accepted so far, flushed or pending.
    pub fn inserted_rows(&self) -> u64 {
        self.inserted_rows
    }

    /// Statements executed so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Renders every row of `batch`, flushing whenever the threshold is hit.
    pub async fn sink(&mut self, batch: &RecordBatch) -> Result<()> {
        self.ensure_accumulating()?;
        if batch.num_columns() != self.expected_column_count() {
            return Err(BigQueryError::InvalidInput(format!(
                "insert into `{}`.`{}` expects {} columns, got {}",
                self.table.dataset,
                self.table.name,
                self.expected_column_count(),
                batch.num_columns()
            )));
        }

        let schema = batch.schema();
        let mut tuple = String::new();
        for row in 0..batch.num_rows() {
            tuple.clear();
            tuple.push('(');
            for (index, column) in batch.columns().iter().enumerate() {
                if index > 0 {
                    tuple.push_str(", ");
                }
                let data_type = schema.field(index).data_type();
                let value = ScalarValue::try_from_array(column.as_ref(), row).map_err(|err| {
                    BigQueryError::conversion(data_type, format!("read insert value: {err}"))
                })?;
                tuple.push_str(&to_literal_string(&value, data_type)?);
            }
            tuple.push(')');
            self.buffer.push_tuple(&tuple);
            if self.buffer.should_flush() {
                self.flush().await?;
            }
        }

        let rows = batch.num_rows() as u64;
        self.inserted_rows += rows;
        self.connection.metrics().record_rows_inserted(rows);
        Ok(())
    }

    /// Flushes the remainder and freezes the row count.
    ///
    /// Calling it again returns the same summary without remote calls.
    pub async fn finalize(&mut self) -> Result<InsertSummary> {
        match &self.state {
            SinkState::Finalized(summary) => return Ok(*summary),
            SinkState::Failed(err) => return Err(err.clone()),
            SinkState::Accumulating => {}
        }
        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        let summary = InsertSummary {
            inserted_rows: self.inserted_rows,
        };
        self.state = SinkState::Finalized(summary);
        info!(
            dataset = %self.table.dataset,
            table = %self.table.name,
            rows = summary.inserted_rows,
            statements = self.flushes,
            "insert finalized"
        );
        Ok(summary)
    }

    /// Result row, available once finalized.
    pub fn summary(&self) -> Option<InsertSummary> {
        match self.state {
            SinkState::Finalized(summary) => Some(summary),
            _ => None,
        }
    }

    fn ensure_accumulating(&self) -> Result<()> {
        match &self.state {
            SinkState::Accumulating => Ok(()),
            SinkState::Failed(err) => Err(err.clone()),
            SinkState::Finalized(_) => Err(BigQueryError::InvalidInput(format!(
                "insert into `{}`.`{}` is already finalized",
                self.table.dataset, self.table.name
            ))),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let rows = self.buffer.pending_rows();
        let chars = self.buffer.pending_chars();
        let statement = self.buffer.take_statement();
        let outcome = self
            .connection
            .client()
            .execute_statement(self.connection.execution_project(), &statement)
            .await;
        self.connection.metrics().record_insert_flush(outcome.is_ok());
        match outcome {
            Ok(()) => {
                self.flushes += 1;
                debug!(
                    dataset = %self.table.dataset,
                    table = %self.table.name,
                    rows,
                    chars,
                    "flushed insert statement"
                );
                Ok(())
            }
            Err(err) => {
                // Earlier statements stay applied; there is no rollback.
                let err = BigQueryError::remote(
                    &format!("insert into `{}`.`{}`", self.table.dataset, self.table.name),
                    err,
                );
                warn!(
                    dataset = %self.table.dataset,
                    table = %self.table.name,
                    applied_statements = self.flushes,
                    error = %err,
                    "insert flush failed"
                );
                self.state = SinkState::Failed(err.clone());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::array::{BinaryArray, Int64Array, StringArray};

    use super::*;
    use crate::memory::InMemoryBigQuery;
    use crate::metadata::ColumnDescriptor;

    fn notes_table() -> TableDescriptor {
        TableDescriptor::new(
            "storage-p",
            "analytics",
            "notes",
            vec![ColumnDescriptor::new("body", DataType::Utf8)],
        )
    }

    fn people_table() -> TableDescriptor {
        TableDescriptor::new(
            "storage-p",
            "analytics",
            "people",
            vec![
                ColumnDescriptor::new("id", DataType::Int64),
                ColumnDescriptor::new("name", DataType::Utf8),
                ColumnDescriptor::new("avatar", DataType::Binary),
            ],
        )
    }

    fn text_batch(values: &[String]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("body", DataType::Utf8, true)]));
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(values))]).expect("batch")
    }

    fn notes_sink() -> (Arc<InMemoryBigQuery>, BatchedInsertSink) {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(notes_table(), Vec::new());
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let sink = BatchedInsertSink::for_existing(connection, Arc::new(notes_table()), &[])
            .expect("sink");
        (remote, sink)
    }

    #[test]
    fn column_mapping_orders_columns_by_input_position() {
        let table = people_table();
        let columns =
            resolve_insert_columns(&table, &[Some(1), None, Some(0)]).expect("mapping");
        assert_eq!(columns, vec!["avatar".to_string(), "id".to_string()]);
        assert_eq!(
            insert_template(&table, &columns),
            "INSERT INTO `analytics`.`people` (`avatar`, `id`) VALUES "
        );
        assert_eq!(
            insert_template(&table, &[]),
            "INSERT INTO `analytics`.`people` VALUES "
        );
    }

    #[test]
    fn invalid_column_mappings_are_rejected() {
        let table = people_table();
        for mapping in [
            vec![Some(0), Some(0), None],
            vec![Some(0), Some(2), None],
            vec![None, None, None],
            vec![Some(0)],
        ] {
            assert!(
                matches!(
                    resolve_insert_columns(&table, &mapping),
                    Err(BigQueryError::InvalidInput(_))
                ),
                "{mapping:?}"
            );
        }
    }

    #[tokio::test]
    async fn flush_happens_exactly_at_threshold() {
        let (remote, mut sink) = notes_sink();
        // Each tuple is `('…')`: value length + 4 characters; two tuples plus
        // the `, ` separator make exactly 8000.
        let value = "x".repeat(3995);
        sink.sink(&text_batch(&[value.clone()])).await.expect("first row");
        assert!(remote.statements().is_empty());

        sink.sink(&text_batch(&[value])).await.expect("second row");
        let statements = remote.statements();
        assert_eq!(statements.len(), 1);
        let values = statements[0]
            .sql
            .strip_prefix("INSERT INTO `analytics`.`notes` VALUES ")
            .expect("template prefix");
        assert_eq!(values.len(), INSERT_FLUSH_SIZE);
        assert_eq!(statements[0].project, "exec-p");

        let summary = sink.finalize().await.expect("finalize");
        assert_eq!(summary.inserted_rows, 2);
        assert_eq!(remote.statements().len(), 1);
    }

    #[tokio::test]
    async fn one_below_threshold_waits_for_finalize() {
        let (remote, mut sink) = notes_sink();
        sink.sink(&text_batch(&["y".repeat(7995)])).await.expect("row");
        assert!(remote.statements().is_empty());
        sink.finalize().await.expect("finalize");
        assert_eq!(remote.statements().len(), 1);
    }

    #[tokio::test]
    async fn empty_finalize_makes_no_remote_call() {
        let (remote, mut sink) = notes_sink();
        assert!(sink.summary().is_none());
        let summary = sink.finalize().await.expect("finalize");
        assert_eq!(summary.inserted_rows, 0);
        assert_eq!(remote.calls().execute_statement, 0);
        assert_eq!(sink.summary(), Some(summary));

        let batch = summary.to_record_batch().expect("summary batch");
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema().field(0).name(), "count");
    }

    #[tokio::test]
    async fn literals_follow_column_types() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(people_table(), Vec::new());
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let mut sink = BatchedInsertSink::for_existing(connection, Arc::new(people_table()), &[])
            .expect("sink");

        let batch = RecordBatch::try_new(
            people_table().schema(),
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None])),
                Arc::new(StringArray::from(vec![Some("O'Brien"), Some("ann")])),
                Arc::new(BinaryArray::from(vec![Some(&[0xCA_u8, 0xFE][..]), None])),
            ],
        )
        .expect("batch");
        sink.sink(&batch).await.expect("sink");
        sink.finalize().await.expect("finalize");

        assert_eq!(
            remote.statements()[0].sql,
            "INSERT INTO `analytics`.`people` VALUES (1, 'O\\'Brien', 0xCAFE), (NULL, 'ann', NULL)"
        );
    }

    #[tokio::test]
    async fn flush_failure_is_fatal_and_keeps_earlier_statements() {
        let (remote, mut sink) = notes_sink();
        remote.fail_statement_at(1, "table is being deleted");
        let big = "z".repeat(INSERT_FLUSH_SIZE);

        sink.sink(&text_batch(&[big.clone()])).await.expect("first flush");
        let err = sink.sink(&text_batch(&[big.clone()])).await.expect_err("second flush");
        assert!(err.to_string().contains("table is being deleted"), "{err}");

        assert_eq!(remote.statements().len(), 1);
        assert!(sink.sink(&text_batch(&[big])).await.is_err());
        assert!(sink.finalize().await.is_err());
        assert!(sink.summary().is_none());
    }

    #[tokio::test]
    async fn column_count_mismatch_is_rejected() {
        let remote = Arc::new(InMemoryBigQuery::new());
        let connection = BigQueryConnection::new(remote, "exec-p", "storage-p");
        let mut sink = BatchedInsertSink::for_existing(
            connection,
            Arc::new(people_table()),
            &[Some(0), None, None],
        )
        .expect("sink");
        assert_eq!(sink.expected_column_count(), 1);
        let batch = RecordBatch::try_new(
            people_table().schema(),
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(StringArray::from(vec!["a"])),
                Arc::new(BinaryArray::from(vec![&b"b"[..]])),
            ],
        )
        .expect("batch");
        assert!(matches!(
            sink.sink(&batch).await,
            Err(BigQueryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn missing_table_is_created_before_writing() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.create_dataset("storage-p", "analytics");
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let tables = TableSet::new(connection.clone(), "analytics");

        let mut sink = BatchedInsertSink::for_new_table(connection, &tables, notes_table())
            .await
            .expect("create");
        assert!(remote.table("storage-p", "analytics", "notes").is_some());
        assert!(sink.insert_columns().is_empty());

        sink.sink(&text_batch(&["hello".to_string()])).await.expect("sink");
        let summary = sink.finalize().await.expect("finalize");
        assert_eq!(summary.inserted_rows, 1);
        assert_eq!(
            remote.statements()[0].sql,
            "INSERT INTO `analytics`.`notes` VALUES ('hello')"
        );
    }
}
