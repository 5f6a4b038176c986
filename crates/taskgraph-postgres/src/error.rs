// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! A thin, backend-specific error kind surfaced alongside
//! `taskgraph::Error::RepositoryError` for callers that want to inspect
//! the underlying `tokio_postgres` failure mode directly.

use thiserror::Error;

/// PostgreSQL-specific failure, finer-grained than the flattened message
/// carried in `taskgraph::Error::RepositoryError`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PostgresError {
    /// Failed to establish or maintain the connection.
    #[error("postgres connection error: {0}")]
    Connection(String),

    /// A query failed (DDL or DML).
    #[error("postgres query error: {0}")]
    Query(String),

    /// A `table`/column identifier failed validation before any SQL was
    /// sent.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl From<tokio_postgres::Error> for PostgresError {
    fn from(err: tokio_postgres::Error) -> Self {
        PostgresError::Query(err.to_string())
    }
}

impl From<PostgresError> for taskgraph::error::Error {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::InvalidIdentifier(msg) => taskgraph::error::Error::workflow(msg),
            PostgresError::Connection(msg) | PostgresError::Query(msg) => {
                taskgraph::error::Error::repository(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_displays_its_message() {
        let err = PostgresError::Connection("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn invalid_identifier_maps_to_workflow_error() {
        let err = PostgresError::InvalidIdentifier("1bad".to_string());
        let mapped: taskgraph::error::Error = err.into();
        assert!(matches!(mapped, taskgraph::error::Error::WorkflowError(_)));
    }

    #[test]
    fn query_error_maps_to_repository_error() {
        let err = PostgresError::Query("syntax error".to_string());
        let mapped: taskgraph::error::Error = err.into();
        assert!(matches!(mapped, taskgraph::error::Error::RepositoryError(_)));
    }
}
