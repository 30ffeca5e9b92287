//! Logical extension codec that keeps BigQuery providers in-process.
//!
//! A serialized plan would need live remote sessions on the other side of
//! the process boundary. Encoding a BigQuery table is therefore refused with
//! a `NotImplemented` error. Since no BigQuery payload is ever written,
//! decoding and every other extension are delegated to the default codec.

use std::sync::Arc;

use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::TableProvider;
use datafusion::common::{not_impl_err, Result as DFResult};
use datafusion::datasource::file_format::FileFormatFactory;
use datafusion::logical_expr::{AggregateUDF, Extension, LogicalPlan, ScalarUDF, WindowUDF};
use datafusion::prelude::SessionContext;
use datafusion::sql::TableReference;
use datafusion_proto::logical_plan::{DefaultLogicalExtensionCodec, LogicalExtensionCodec};
use tracing::warn;

use crate::provider::BigQueryTableProvider;

/// Codec refusing to move BigQuery tables across a process boundary.
#[derive(Debug)]
pub struct BigQueryLogicalExtensionCodec {
    inner: DefaultLogicalExtensionCodec,
}

impl BigQueryLogicalExtensionCodec {
    pub fn new() -> Self {
        Self {
            inner: DefaultLogicalExtensionCodec {},
        }
    }
}

impl Default for BigQueryLogicalExtensionCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalExtensionCodec for BigQueryLogicalExtensionCodec {
    fn try_decode(
        &self,
        buf: &[u8],
        inputs: &[LogicalPlan],
        ctx: &SessionContext,
    ) -> DFResult<Extension> {
        self.inner.try_decode(buf, inputs, ctx)
    }

    fn try_encode(&self, node: &Extension, buf: &mut Vec<u8>) -> DFResult<()> {
        self.inner.try_encode(node, buf)
    }

    fn try_decode_table_provider(
        &self,
        buf: &[u8],
        table_ref: &TableReference,
        schema: SchemaRef,
        ctx: &SessionContext,
    ) -> DFResult<Arc<dyn TableProvider>> {
        self.inner.try_decode_table_provider(buf, table_ref, schema, ctx)
    }

    fn try_encode_table_provider(
        &self,
        table_ref: &TableReference,
        node: Arc<dyn TableProvider>,
        buf: &mut Vec<u8>,
    ) -> DFResult<()> {
        if node
            .as_any()
            .downcast_ref::<BigQueryTableProvider>()
            .is_some()
        {
            warn!(table = %table_ref, "refusing to serialize bigquery table provider");
            return not_impl_err!("BigQuery table {table_ref} cannot be serialized");
        }
        self.inner.try_encode_table_provider(table_ref, node, buf)
    }

    fn try_decode_file_format(
        &self,
        buf: &[u8],
        ctx: &SessionContext,
    ) -> DFResult<Arc<dyn FileFormatFactory>> {
        self.inner.try_decode_file_format(buf, ctx)
    }

    fn try_encode_file_format(
        &self,
        buf: &mut Vec<u8>,
        node: Arc<dyn FileFormatFactory>,
    ) -> DFResult<()> {
        self.inner.try_encode_file_format(buf, node)
    }

    fn try_decode_udf(&self, name: &str, buf: &[u8]) -> DFResult<Arc<ScalarUDF>> {
        self.inner.try_decode_udf(name, buf)
    }

    fn try_encode_udf(&self, node: &ScalarUDF, buf: &mut Vec<u8>) -> DFResult<()> {
        self.inner.try_encode_udf(node, buf)
    }

    fn try_decode_udaf(&self, name: &str, buf: &[u8]) -> DFResult<Arc<AggregateUDF>> {
        self.inner.try_decode_udaf(name, buf)
    }

    fn try_encode_udaf(&self, node: &AggregateUDF, buf: &mut Vec<u8>) -> DFResult<()> {
        self.inner.try_encode_udaf(node, buf)
    }

    fn try_decode_udwf(&self, name: &str, buf: &[u8]) -> DFResult<Arc<WindowUDF>> {
        self.inner.try_decode_udwf(name, buf)
    }

    fn try_encode_udwf(&self, node: &WindowUDF, buf: &mut Vec<u8>) -> DFResult<()> {
        self.inner.try_encode_udwf(node, buf)
    }
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::datatypes::DataType;
    use datafusion::common::DataFusionError;

    use super::*;
    use crate::memory::InMemoryBigQuery;
    use crate::metadata::{ColumnDescriptor, TableDescriptor};
    use crate::remote::BigQueryConnection;

    fn provider() -> Arc<dyn TableProvider> {
        let connection =
            BigQueryConnection::new(Arc::new(InMemoryBigQuery::new()), "exec-p", "storage-p");
        let table = TableDescriptor::new(
            "storage-p",
            "d",
            "t",
            vec![ColumnDescriptor::new("id", DataType::Int64)],
        );
        Arc::new(BigQueryTableProvider::new(connection, Arc::new(table)))
    }

    #[test]
    fn encoding_a_bigquery_table_is_not_implemented() {
        let codec = BigQueryLogicalExtensionCodec::new();
        let mut buf = Vec::new();
        let err = codec
            .try_encode_table_provider(&TableReference::bare("t"), provider(), &mut buf)
            .expect_err("refused");
        assert!(matches!(err, DataFusionError::NotImplemented(_)), "{err}");
        assert!(buf.is_empty());
    }

    #[test]
    fn decoding_a_table_payload_is_not_implemented() {
        let codec = BigQueryLogicalExtensionCodec::new();
        let ctx = SessionContext::new();
        let buf = b"projects/storage-p/datasets/d/tables/t".to_vec();
        let schema = provider().schema();
        let err = codec
            .try_decode_table_provider(&buf, &TableReference::bare("t"), schema, &ctx)
            .expect_err("refused");
        assert!(matches!(err, DataFusionError::NotImplemented(_)), "{err}");
    }
}
