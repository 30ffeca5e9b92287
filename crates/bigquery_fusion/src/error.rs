//! Error taxonomy for the BigQuery bridge.
//!
//! Transport implementations report failures as `anyhow::Error`; the bridge
//! wraps them into [`BigQueryError::RemoteConnection`] so the remote-supplied
//! message survives up to the query that triggered the call.

use datafusion::common::DataFusionError;
use thiserror::Error;

/// Errors surfaced by the cache, scan, value and insert layers.
#[derive(Debug, Clone, Error)]
pub enum BigQueryError {
    /// Session, stream, listing or write call failed on the remote side.
    #[error("remote connection error: {0}")]
    RemoteConnection(String),

    /// A scalar or literal could not be converted for the named type.
    #[error("conversion error: unsupported type {type_name}: {detail}")]
    Conversion {
        /// Offending remote or engine type.
        type_name: String,
        /// What was being converted when the failure happened.
        detail: String,
    },

    /// A dataset or table the caller requires is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with the same case-insensitive name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Intentionally unimplemented path, raised before any remote call.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Caller supplied inconsistent arguments (e.g. an invalid column mapping).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result alias used across the crate.
pub type Result<T, E = BigQueryError> = std::result::Result<T, E>;

impl BigQueryError {
    /// Wraps a transport error, keeping the whole context chain in the message.
    pub fn remote(context: &str, err: anyhow::Error) -> Self {
        Self::RemoteConnection(format!("{context}: {err:#}"))
    }

    /// Builds a conversion error naming the offending type.
    pub fn conversion(type_name: impl ToString, detail: impl Into<String>) -> Self {
        Self::Conversion {
            type_name: type_name.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<BigQueryError> for DataFusionError {
    fn from(err: BigQueryError) -> Self {
        match err {
            BigQueryError::Unsupported(message) => DataFusionError::NotImplemented(message),
            other => DataFusionError::External(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_keeps_context_chain() {
        let err = anyhow::anyhow!("permission denied").context("create read session");
        let wrapped = BigQueryError::remote("open scan", err);
        assert_eq!(
            wrapped.to_string(),
            "remote connection error: open scan: create read session: permission denied"
        );
    }

    #[test]
    fn unsupported_maps_to_not_implemented() {
        let err: DataFusionError = BigQueryError::Unsupported("RETURNING".to_string()).into();
        assert!(matches!(err, DataFusionError::NotImplemented(_)));

        let err: DataFusionError = BigQueryError::conversion("Date32", "scan column").into();
        assert!(matches!(err, DataFusionError::External(_)));
    }
}
