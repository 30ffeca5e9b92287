//! In-process [`BigQueryClient`] for tests and local development.
//!
//! Tables are kept as Arrow batches exactly as seeded, so tests control batch
//! boundaries (including empty batches). Statements are recorded verbatim and
//! never applied to stored data. Created tables pass through the REST `Table`
//! resource JSON, so their columns come back with the types the service
//! stores rather than the ones requested.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use datafusion::arrow::record_batch::RecordBatch;

use crate::metadata::{DatasetDescriptor, TableDescriptor};
use crate::remote::{
    parse_table_resource_name, BigQueryClient, CreateReadSessionRequest, ReadSession, ReadStream,
    RowStream,
};

/// Calls received per remote operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list_datasets: usize,
    pub list_tables: usize,
    pub get_table: usize,
    pub create_table: usize,
    pub drop_table: usize,
    pub create_read_session: usize,
    pub read_rows: usize,
    pub execute_statement: usize,
}

/// Statement accepted by [`BigQueryClient::execute_statement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStatement {
    /// Project the job was billed to.
    pub project: String,
    /// Statement text.
    pub sql: String,
}

#[derive(Debug, Clone)]
struct StoredTable {
    descriptor: TableDescriptor,
    batches: Vec<RecordBatch>,
}

type DatasetKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    datasets: BTreeMap<DatasetKey, BTreeMap<String, StoredTable>>,
    streams: HashMap<String, Vec<RecordBatch>>,
    next_session: u64,
    calls: CallCounts,
    session_requests: Vec<CreateReadSessionRequest>,
    statements: Vec<RecordedStatement>,
    statement_attempts: usize,
    fail_next_session: Option<String>,
    fail_next_listing: Option<String>,
    fail_statement_at: Option<(usize, String)>,
}

/// Remote service emulator backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryBigQuery {
    state: Mutex<MemoryState>,
}

impl InMemoryBigQuery {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an empty dataset; existing datasets are left untouched.
    pub fn create_dataset(&self, project: &str, dataset: &str) {
        self.lock()
            .datasets
            .entry((project.to_string(), dataset.to_string()))
            .or_default();
    }

    /// Stores a table with its batches, creating the dataset when needed.
    ///
    /// Batches must match `descriptor.schema()`; they are served as given.
    pub fn seed_table(&self, descriptor: TableDescriptor, batches: Vec<RecordBatch>) {
        let key = (descriptor.project.clone(), descriptor.dataset.clone());
        self.lock().datasets.entry(key).or_default().insert(
            descriptor.name.clone(),
            StoredTable {
                descriptor,
                batches,
            },
        );
    }

    /// Current remote descriptor of a table.
    pub fn table(&self, project: &str, dataset: &str, table: &str) -> Option<TableDescriptor> {
        self.lock()
            .datasets
            .get(&(project.to_string(), dataset.to_string()))
            .and_then(|tables| tables.get(table))
            .map(|stored| stored.descriptor.clone())
    }

    /// Call counters so far.
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Every read session request received, in order.
    pub fn session_requests(&self) -> Vec<CreateReadSessionRequest> {
        self.lock().session_requests.clone()
    }

    /// Statements that executed successfully, in order.
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.lock().statements.clone()
    }

    /// Makes the next read session creation fail with `message`.
    pub fn fail_next_session(&self, message: impl Into<String>) {
        self.lock().fail_next_session = Some(message.into());
    }

    /// Makes the next dataset or table listing fail with `message`.
    pub fn fail_next_listing(&self, message: impl Into<String>) {
        self.lock().fail_next_listing = Some(message.into());
    }

    /// Makes the statement attempt with zero-based `index` fail with `message`.
    pub fn fail_statement_at(&self, index: usize, message: impl Into<String>) {
        self.lock().fail_statement_at = Some((index, message.into()));
    }
}

#[async_trait]
impl BigQueryClient for InMemoryBigQuery {
    async fn list_datasets(&self, project: &str) -> anyhow::Result<Vec<DatasetDescriptor>> {
        let mut state = self.lock();
        state.calls.list_datasets += 1;
        if let Some(message) = state.fail_next_listing.take() {
            bail!(message);
        }
        Ok(state
            .datasets
            .keys()
            .filter(|(owner, _)| owner == project)
            .map(|(owner, dataset)| DatasetDescriptor::new(owner.clone(), dataset.clone()))
            .collect())
    }

    async fn list_tables(
        &self,
        project: &str,
        dataset: &str,
    ) -> anyhow::Result<Vec<TableDescriptor>> {
        let mut state = self.lock();
        state.calls.list_tables += 1;
        if let Some(message) = state.fail_next_listing.take() {
            bail!(message);
        }
        let tables = state
            .datasets
            .get(&(project.to_string(), dataset.to_string()))
            .with_context(|| format!("dataset {project}.{dataset} not found"))?;
        Ok(tables
            .values()
            .map(|stored| stored.descriptor.clone())
            .collect())
    }

    async fn get_table(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> anyhow::Result<Option<TableDescriptor>> {
        let mut state = self.lock();
        state.calls.get_table += 1;
        let tables = state
            .datasets
            .get(&(project.to_string(), dataset.to_string()))
            .with_context(|| format!("dataset {project}.{dataset} not found"))?;
        Ok(tables.get(table).map(|stored| stored.descriptor.clone()))
    }

    async fn create_table(
        &self,
        project: &str,
        definition: &TableDescriptor,
    ) -> anyhow::Result<TableDescriptor> {
        let resource = definition
            .to_table_resource_json()
            .with_context(|| format!("encode table {}", definition.resource_name()))?;
        let mut created = TableDescriptor::from_table_resource_json(&resource)
            .with_context(|| format!("decode table {}", definition.resource_name()))?;
        created.project = project.to_string();

        let mut state = self.lock();
        state.calls.create_table += 1;
        let tables = state
            .datasets
            .get_mut(&(project.to_string(), definition.dataset.clone()))
            .with_context(|| format!("dataset {project}.{} not found", definition.dataset))?;
        if tables.contains_key(&definition.name) {
            bail!("table {}.{} already exists", definition.dataset, definition.name);
        }
        tables.insert(
            created.name.clone(),
            StoredTable {
                descriptor: created.clone(),
                batches: Vec::new(),
            },
        );
        Ok(created)
    }

    async fn drop_table(&self, project: &str, dataset: &str, table: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.calls.drop_table += 1;
        state
            .datasets
            .get_mut(&(project.to_string(), dataset.to_string()))
            .and_then(|tables| tables.remove(table))
            .map(|_| ())
            .with_context(|| format!("table {project}.{dataset}.{table} not found"))
    }

    async fn create_read_session(
        &self,
        request: CreateReadSessionRequest,
    ) -> anyhow::Result<ReadSession> {
        let mut state = self.lock();
        state.calls.create_read_session += 1;
        state.session_requests.push(request.clone());
        if let Some(message) = state.fail_next_session.take() {
            bail!(message);
        }

        let (project, dataset, table) = parse_table_resource_name(&request.table)
            .with_context(|| format!("malformed table resource {}", request.table))?;
        let stored = state
            .datasets
            .get(&(project.to_string(), dataset.to_string()))
            .and_then(|tables| tables.get(table))
            .with_context(|| format!("table {} not found", request.table))?;

        let table_schema = stored.descriptor.schema();
        let indices = request
            .selected_fields
            .iter()
            .map(|name| {
                table_schema
                    .fields()
                    .iter()
                    .position(|field| field.name() == name)
                    .ok_or_else(|| anyhow!("field {name} not found in {}", request.table))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let schema = table_schema
            .project(&indices)
            .context("project session schema")?;
        let batches = stored
            .batches
            .iter()
            .map(|batch| batch.project(&indices))
            .collect::<Result<Vec<_>, _>>()
            .context("project stored batches")?;

        state.next_session += 1;
        let session = format!(
            "{}/locations/memory/sessions/{}",
            request.parent, state.next_session
        );
        let stream = format!("{session}/streams/0");
        state.streams.insert(stream.clone(), batches);
        Ok(ReadSession {
            name: session,
            schema: schema.into(),
            streams: vec![ReadStream { name: stream }],
        })
    }

    async fn read_rows(&self, stream: &str, offset: u64) -> anyhow::Result<Box<dyn RowStream>> {
        let mut state = self.lock();
        state.calls.read_rows += 1;
        let batches = state
            .streams
            .get(stream)
            .with_context(|| format!("stream {stream} not found"))?;

        let mut skip = usize::try_from(offset).context("offset exceeds address space")?;
        let mut served = VecDeque::with_capacity(batches.len());
        for batch in batches {
            if skip > 0 {
                if skip >= batch.num_rows() {
                    skip -= batch.num_rows();
                    continue;
                }
                served.push_back(batch.slice(skip, batch.num_rows() - skip));
                skip = 0;
                continue;
            }
            served.push_back(batch.clone());
        }
        Ok(Box::new(MemoryRowStream { batches: served }))
    }

    async fn execute_statement(&self, project: &str, sql: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.calls.execute_statement += 1;
        let attempt = state.statement_attempts;
        state.statement_attempts += 1;
        if let Some((index, message)) = &state.fail_statement_at {
            if *index == attempt {
                bail!("{message}");
            }
        }
        state.statements.push(RecordedStatement {
            project: project.to_string(),
            sql: sql.to_string(),
        });
        Ok(())
    }
}

struct MemoryRowStream {
    batches: VecDeque<RecordBatch>,
}

#[async_trait]
impl RowStream for MemoryRowStream {
    async fn next_batch(&mut self) -> anyhow::Result<Option<RecordBatch>> {
        Ok(self.batches.pop_front())
    }
}
