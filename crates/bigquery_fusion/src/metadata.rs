//! Remote dataset/table descriptors and the per-dataset table cache.
//!
//! Descriptors mirror the remote catalog: a table is a named list of columns
//! whose types are already mapped to Arrow. The REST `Table` resource shape
//! (`tableReference` + `schema.fields`) is supported in both directions so
//! transport implementations can hand listings over as raw JSON.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog_set::{CatalogEntry, CatalogSet, EntryLoader};
use crate::error::{BigQueryError, Result};
use crate::remote::{table_resource_name, BigQueryConnection};

/// Time zone attached to `TIMESTAMP` columns, which are UTC instants remotely.
const UTC: &str = "UTC";

/// One column of a remote table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Column name as stored remotely.
    pub name: String,
    /// Arrow type the remote column is read and written as.
    pub data_type: DataType,
    /// `false` for `REQUIRED` columns.
    pub nullable: bool,
}

impl ColumnDescriptor {
    /// Creates a nullable column.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// Marks the column as `REQUIRED`.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Remote table mirrored into the local catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// Project owning the dataset.
    pub project: String,
    /// Dataset (namespace) the table lives in.
    pub dataset: String,
    /// Table name.
    pub name: String,
    /// Columns in table order.
    pub columns: Vec<ColumnDescriptor>,
}

impl CatalogEntry for TableDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
}

impl TableDescriptor {
    /// Creates a descriptor from its parts.
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            name: name.into(),
            columns,
        }
    }

    /// Creates a descriptor whose columns follow an Arrow schema.
    pub fn from_schema(
        project: impl Into<String>,
        dataset: impl Into<String>,
        name: impl Into<String>,
        schema: &Schema,
    ) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|field| ColumnDescriptor {
                name: field.name().clone(),
                data_type: field.data_type().clone(),
                nullable: field.is_nullable(),
            })
            .collect();
        Self::new(project, dataset, name, columns)
    }

    /// Arrow schema of the full table.
    pub fn schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|column| Field::new(&column.name, column.data_type.clone(), column.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// `projects/{project}/datasets/{dataset}/tables/{name}`.
    pub fn resource_name(&self) -> String {
        table_resource_name(&self.project, &self.dataset, &self.name)
    }

    /// Column position by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// Validates names before the descriptor is cached or sent remotely.
    pub fn validate(&self) -> Result<()> {
        // Decision: reject empty identifiers so no generated statement or
        // resource name can contain an empty path segment.
        if self.dataset.trim().is_empty() || self.name.trim().is_empty() {
            return Err(BigQueryError::InvalidInput(format!(
                "table descriptor `{}`.`{}` has an empty dataset or table name",
                self.dataset, self.name
            )));
        }
        if self.columns.is_empty() {
            return Err(BigQueryError::InvalidInput(format!(
                "table `{}`.`{}` has no columns",
                self.dataset, self.name
            )));
        }
        let mut seen = HashSet::with_capacity(self.columns.len());
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(BigQueryError::InvalidInput(format!(
                    "table `{}`.`{}` has an empty column name",
                    self.dataset, self.name
                )));
            }
            if !seen.insert(column.name.to_lowercase()) {
                return Err(BigQueryError::InvalidInput(format!(
                    "table `{}`.`{}` has duplicate column `{}`",
                    self.dataset, self.name, column.name
                )));
            }
        }
        Ok(())
    }

    /// Parses a REST `Table` resource.
    pub fn from_table_resource_json(bytes: &[u8]) -> Result<Self> {
        let resource: TableResource = serde_json::from_slice(bytes).map_err(|err| {
            BigQueryError::InvalidInput(format!("decode table resource json: {err}"))
        })?;
        let fields = resource.schema.map(|schema| schema.fields).unwrap_or_default();
        let columns = fields
            .iter()
            .map(|field| {
                Ok(ColumnDescriptor {
                    name: field.name.clone(),
                    data_type: field_schema_to_arrow(field)?,
                    nullable: !field.is_required(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            resource.table_reference.project_id,
            resource.table_reference.dataset_id,
            resource.table_reference.table_id,
            columns,
        ))
    }

    /// Renders the descriptor as a REST `Table` resource.
    pub fn to_table_resource_json(&self) -> Result<Vec<u8>> {
        let fields = self
            .columns
            .iter()
            .map(|column| arrow_to_field_schema(&column.name, &column.data_type, column.nullable))
            .collect::<Result<Vec<_>>>()?;
        let resource = TableResource {
            table_reference: TableReferenceResource {
                project_id: self.project.clone(),
                dataset_id: self.dataset.clone(),
                table_id: self.name.clone(),
            },
            schema: Some(TableSchemaResource { fields }),
        };
        serde_json::to_vec(&resource).map_err(|err| {
            BigQueryError::InvalidInput(format!("encode table resource json: {err}"))
        })
    }
}

/// Remote dataset (namespace of tables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    /// Project owning the dataset.
    pub project: String,
    /// Dataset name.
    pub name: String,
}

impl DatasetDescriptor {
    /// Creates a descriptor.
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    table_reference: TableReferenceResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<TableSchemaResource>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReferenceResource {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableSchemaResource {
    #[serde(default)]
    fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableFieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<TableFieldSchema>,
}

impl TableFieldSchema {
    fn mode_is(&self, expected: &str) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|mode| mode.eq_ignore_ascii_case(expected))
    }

    fn is_required(&self) -> bool {
        self.mode_is("REQUIRED")
    }
}

fn field_schema_to_arrow(field: &TableFieldSchema) -> Result<DataType> {
    let base = match field.field_type.to_ascii_uppercase().as_str() {
        "INT64" | "INTEGER" => DataType::Int64,
        "FLOAT64" | "FLOAT" => DataType::Float64,
        "BOOL" | "BOOLEAN" => DataType::Boolean,
        "STRING" | "JSON" | "GEOGRAPHY" => DataType::Utf8,
        "BYTES" => DataType::Binary,
        "DATE" => DataType::Date32,
        "DATETIME" => DataType::Timestamp(TimeUnit::Microsecond, None),
        "TIMESTAMP" => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
        "TIME" => DataType::Time64(TimeUnit::Microsecond),
        "NUMERIC" => DataType::Decimal128(38, 9),
        "BIGNUMERIC" => DataType::Decimal256(76, 38),
        "RECORD" | "STRUCT" => {
            let children = field
                .fields
                .iter()
                .map(|child| {
                    Ok(Field::new(
                        &child.name,
                        field_schema_to_arrow(child)?,
                        !child.is_required(),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            DataType::Struct(Fields::from(children))
        }
        other => {
            return Err(BigQueryError::conversion(
                other,
                format!("column `{}` has no Arrow mapping", field.name),
            ))
        }
    };
    if field.mode_is("REPEATED") {
        return Ok(DataType::new_list(base, true));
    }
    Ok(base)
}

fn arrow_to_field_schema(
    name: &str,
    data_type: &DataType,
    nullable: bool,
) -> Result<TableFieldSchema> {
    let mut nested = Vec::new();
    let mode = if nullable { "NULLABLE" } else { "REQUIRED" };
    let field_type = match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => "INT64",
        // Decision: u64 exceeds INT64, NUMERIC holds the full range.
        DataType::UInt64 => "NUMERIC",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "FLOAT64",
        DataType::Boolean => "BOOL",
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "STRING",
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => "BYTES",
        DataType::Date32 | DataType::Date64 => "DATE",
        DataType::Timestamp(_, None) => "DATETIME",
        DataType::Timestamp(_, Some(_)) => "TIMESTAMP",
        DataType::Time32(_) | DataType::Time64(_) => "TIME",
        DataType::Decimal128(_, _) => "NUMERIC",
        DataType::Decimal256(_, _) => "BIGNUMERIC",
        DataType::List(item) | DataType::LargeList(item) => {
            let mut inner = arrow_to_field_schema(name, item.data_type(), true)?;
            inner.mode = Some("REPEATED".to_string());
            return Ok(inner);
        }
        DataType::Struct(children) => {
            for child in children.iter() {
                nested.push(arrow_to_field_schema(
                    child.name(),
                    child.data_type(),
                    child.is_nullable(),
                )?);
            }
            "RECORD"
        }
        other => {
            return Err(BigQueryError::conversion(
                other,
                format!("column `{name}` cannot be created remotely"),
            ))
        }
    };
    Ok(TableFieldSchema {
        name: name.to_string(),
        field_type: field_type.to_string(),
        mode: Some(mode.to_string()),
        fields: nested,
    })
}

struct TableLoader {
    connection: BigQueryConnection,
    dataset: String,
}

#[async_trait]
impl EntryLoader<TableDescriptor> for TableLoader {
    async fn load_entries(&self) -> anyhow::Result<Vec<TableDescriptor>> {
        self.connection
            .client()
            .list_tables(self.connection.storage_project(), &self.dataset)
            .await
    }

    fn namespace(&self) -> String {
        format!("tables of dataset `{}`", self.dataset)
    }
}

/// Cached tables of one dataset plus the remote DDL that keeps them in sync.
pub struct TableSet {
    dataset: String,
    connection: BigQueryConnection,
    entries: CatalogSet<TableDescriptor>,
}

impl TableSet {
    /// Creates an unloaded table cache for `dataset`.
    pub fn new(connection: BigQueryConnection, dataset: impl Into<String>) -> Self {
        let dataset = dataset.into();
        let loader = Arc::new(TableLoader {
            connection: connection.clone(),
            dataset: dataset.clone(),
        });
        let entries = CatalogSet::new(loader, Arc::clone(connection.metrics()));
        Self {
            dataset,
            connection,
            entries,
        }
    }

    /// Dataset this set mirrors.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Looks up a table; `None` when it does not exist remotely.
    pub async fn get_table(&self, name: &str) -> Result<Option<Arc<TableDescriptor>>> {
        self.entries.get_entry(name).await
    }

    /// Looks up a table the caller cannot proceed without.
    pub async fn require_table(&self, name: &str) -> Result<Arc<TableDescriptor>> {
        self.get_table(name).await?.ok_or_else(|| {
            BigQueryError::NotFound(format!("table `{}`.`{name}`", self.dataset))
        })
    }

    /// Every table of the dataset.
    pub async fn tables(&self) -> Result<Vec<Arc<TableDescriptor>>> {
        self.entries.entries().await
    }

    /// Calls `callback` once per cached table, loading first when needed.
    pub async fn scan<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&Arc<TableDescriptor>),
    {
        self.entries.scan(callback).await
    }

    /// Creates the table remotely, then caches the descriptor the service returned.
    pub async fn create_table(&self, definition: TableDescriptor) -> Result<Arc<TableDescriptor>> {
        definition.validate()?;
        if !definition.dataset.eq_ignore_ascii_case(&self.dataset) {
            return Err(BigQueryError::InvalidInput(format!(
                "table `{}` targets dataset `{}` but was created through `{}`",
                definition.name, definition.dataset, self.dataset
            )));
        }
        if self.get_table(&definition.name).await?.is_some() {
            return Err(BigQueryError::AlreadyExists(format!(
                "table `{}`.`{}`",
                self.dataset, definition.name
            )));
        }

        let created = self
            .connection
            .client()
            .create_table(self.connection.storage_project(), &definition)
            .await
            .map_err(|err| {
                BigQueryError::remote(&format!("create table {}", definition.resource_name()), err)
            })?;
        info!(
            dataset = %self.dataset,
            table = %created.name,
            columns = created.columns.len(),
            "created remote table"
        );
        let name = created.name.clone();
        self.entries.create_entry(created).await.ok_or_else(|| {
            BigQueryError::AlreadyExists(format!("table `{}`.`{name}`", self.dataset))
        })
    }

    /// Drops the table remotely and evicts it; unknown tables are `NotFound`.
    pub async fn drop_table(&self, name: &str) -> Result<()> {
        let table = self.require_table(name).await?;
        self.connection
            .client()
            .drop_table(self.connection.storage_project(), &self.dataset, &table.name)
            .await
            .map_err(|err| {
                BigQueryError::remote(&format!("drop table {}", table.resource_name()), err)
            })?;
        self.entries.drop_entry(&table.name).await;
        info!(dataset = %self.dataset, table = %table.name, "dropped remote table");
        Ok(())
    }

    /// Invalidates the cache; the next access reloads the whole dataset.
    pub async fn refresh(&self) {
        self.entries.clear_entries().await;
    }

    /// Re-fetches one table and replaces its cached descriptor.
    ///
    /// Returns `None` and evicts the entry when the table no longer exists
    /// remotely. The rest of the cache is left as is.
    pub async fn refresh_table(&self, name: &str) -> Result<Option<Arc<TableDescriptor>>> {
        let fetched = self
            .connection
            .client()
            .get_table(self.connection.storage_project(), &self.dataset, name)
            .await
            .map_err(|err| {
                BigQueryError::remote(&format!("get table `{}`.`{name}`", self.dataset), err)
            })?;
        match fetched {
            Some(table) => {
                let table = self.entries.replace_entry(table).await;
                info!(
                    dataset = %self.dataset,
                    table = %table.name,
                    columns = table.columns.len(),
                    "refreshed remote table"
                );
                Ok(Some(table))
            }
            None => {
                self.entries.drop_entry(name).await;
                info!(dataset = %self.dataset, table = %name, "table vanished remotely");
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSet")
            .field("dataset", &self.dataset)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Dataset entry of the project-level cache, owning its table cache.
pub struct DatasetEntry {
    descriptor: DatasetDescriptor,
    tables: TableSet,
}

impl DatasetEntry {
    /// Wraps a listed dataset with a fresh, unloaded table cache.
    pub fn new(connection: BigQueryConnection, descriptor: DatasetDescriptor) -> Self {
        let tables = TableSet::new(connection, descriptor.name.clone());
        Self { descriptor, tables }
    }

    /// Listed dataset.
    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    /// Tables of this dataset.
    pub fn tables(&self) -> &TableSet {
        &self.tables
    }
}

impl fmt::Debug for DatasetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetEntry")
            .field("descriptor", &self.descriptor)
            .field("tables", &self.tables)
            .finish()
    }
}

impl CatalogEntry for DatasetEntry {
    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBigQuery;
    use crate::remote::BigQueryClient;

    const TABLE_JSON: &str = r#"{
        "tableReference": {"projectId": "storage-p", "datasetId": "analytics", "tableId": "events"},
        "schema": {"fields": [
            {"name": "id", "type": "INTEGER", "mode": "REQUIRED"},
            {"name": "payload", "type": "BYTES"},
            {"name": "seen_at", "type": "TIMESTAMP", "mode": "NULLABLE"},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "origin", "type": "RECORD", "fields": [
                {"name": "country", "type": "STRING"}
            ]}
        ]}
    }"#;

    #[test]
    fn table_resource_json_maps_to_arrow_columns() {
        let table =
            TableDescriptor::from_table_resource_json(TABLE_JSON.as_bytes()).expect("parse");
        assert_eq!(table.resource_name(), "projects/storage-p/datasets/analytics/tables/events");
        assert_eq!(table.columns[0].data_type, DataType::Int64);
        assert!(!table.columns[0].nullable);
        assert_eq!(table.columns[1].data_type, DataType::Binary);
        assert_eq!(
            table.columns[2].data_type,
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert_eq!(table.columns[3].data_type, DataType::new_list(DataType::Utf8, true));
        assert!(matches!(table.columns[4].data_type, DataType::Struct(_)));
        assert_eq!(table.column_index("SEEN_AT"), Some(2));
    }

    #[test]
    fn table_resource_json_survives_a_write_and_reparse() {
        let table =
            TableDescriptor::from_table_resource_json(TABLE_JSON.as_bytes()).expect("parse");
        let json = table.to_table_resource_json().expect("encode");
        let reparsed = TableDescriptor::from_table_resource_json(&json).expect("reparse");
        assert_eq!(reparsed, table);
    }

    #[test]
    fn unknown_remote_type_is_named_in_the_error() {
        let json = r#"{"tableReference": {"projectId": "p", "datasetId": "d", "tableId": "t"},
            "schema": {"fields": [{"name": "r", "type": "RANGE"}]}}"#;
        let err = TableDescriptor::from_table_resource_json(json.as_bytes()).expect_err("range");
        assert!(err.to_string().contains("RANGE"), "{err}");
    }

    #[test]
    fn validate_rejects_duplicate_columns() {
        let table = TableDescriptor::new(
            "p",
            "d",
            "t",
            vec![
                ColumnDescriptor::new("id", DataType::Int64),
                ColumnDescriptor::new("ID", DataType::Utf8),
            ],
        );
        assert!(matches!(table.validate(), Err(BigQueryError::InvalidInput(_))));
    }

    fn events_table() -> TableDescriptor {
        TableDescriptor::new(
            "storage-p",
            "analytics",
            "events",
            vec![ColumnDescriptor::new("id", DataType::Int64).required()],
        )
    }

    #[tokio::test]
    async fn create_and_drop_keep_cache_and_remote_in_sync() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.create_dataset("storage-p", "analytics");
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let tables = TableSet::new(connection, "analytics");

        let created = tables.create_table(events_table()).await.expect("create");
        assert_eq!(created.name, "events");
        assert!(remote.table("storage-p", "analytics", "events").is_some());

        let duplicate = tables.create_table(events_table()).await;
        assert!(matches!(duplicate, Err(BigQueryError::AlreadyExists(_))));

        tables.drop_table("EVENTS").await.expect("drop");
        assert!(remote.table("storage-p", "analytics", "events").is_none());
        assert!(tables.get_table("events").await.expect("lookup").is_none());

        let missing = tables.drop_table("events").await;
        assert!(matches!(missing, Err(BigQueryError::NotFound(_))));
    }

    #[tokio::test]
    async fn refresh_table_replaces_one_descriptor() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.seed_table(events_table(), Vec::new());
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let tables = TableSet::new(connection, "analytics");
        let before = tables.require_table("events").await.expect("lookup");
        assert_eq!(before.columns.len(), 1);

        let mut widened = events_table();
        widened.columns.push(ColumnDescriptor::new("kind", DataType::Utf8));
        remote.seed_table(widened.clone(), Vec::new());
        let refreshed = tables
            .refresh_table("EVENTS")
            .await
            .expect("refresh")
            .expect("still exists");
        assert_eq!(refreshed.as_ref(), &widened);
        assert_eq!(tables.require_table("events").await.expect("lookup").columns.len(), 2);
        assert_eq!(remote.calls().list_tables, 1);
        assert_eq!(remote.calls().get_table, 1);

        remote.drop_table("storage-p", "analytics", "events").await.expect("drop");
        assert!(tables.refresh_table("events").await.expect("refresh").is_none());
        assert!(tables.get_table("events").await.expect("lookup").is_none());
    }

    #[test]
    fn debug_output_names_the_dataset() {
        let connection =
            BigQueryConnection::new(Arc::new(InMemoryBigQuery::new()), "exec-p", "storage-p");
        let entry = DatasetEntry::new(connection, DatasetDescriptor::new("storage-p", "analytics"));
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("DatasetEntry"), "{rendered}");
        assert!(rendered.contains("analytics"), "{rendered}");
    }

    #[tokio::test]
    async fn refresh_picks_up_remote_changes() {
        let remote = Arc::new(InMemoryBigQuery::new());
        remote.create_dataset("storage-p", "analytics");
        let connection = BigQueryConnection::new(remote.clone(), "exec-p", "storage-p");
        let tables = TableSet::new(connection, "analytics");
        assert!(tables.tables().await.expect("load").is_empty());

        remote.seed_table(events_table(), Vec::new());
        assert!(tables.get_table("events").await.expect("lookup").is_none());

        tables.refresh().await;
        assert!(tables.get_table("events").await.expect("lookup").is_some());
        assert_eq!(remote.calls().list_tables, 2);
    }
}
