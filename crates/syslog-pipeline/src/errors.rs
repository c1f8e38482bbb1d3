// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the pipeline.
//!
//! Only [`ConfigError`], [`ListenerError`] and a [`PersistenceError::Connect`] at startup are
//! fatal. Everything else is recovered at the granularity of a single record or batch.

use std::net::Ipv4Addr;

/// Reasons a raw record cannot be turned into a typed record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognized tag: {0:?}")]
    UnrecognizedTag(String),
    #[error("field {field} has an unexpected type")]
    FieldTypeMismatch { field: &'static str },
    #[error("required field {field} is missing")]
    MissingRequiredField { field: &'static str },
    #[error("client address {0:?} is not an IPv4 address")]
    InvalidClientAddress(String),
}

/// Failures of the SNMP fallback lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("failed to connect to {ip}: {message}")]
    Connect { ip: Ipv4Addr, message: String },
    #[error("sysName query against {ip} failed: {message}")]
    Query { ip: Ipv4Addr, message: String },
    #[error("sysName reply from {ip} is not an octet string")]
    UnexpectedType { ip: Ipv4Addr },
    #[error("reply from {ip} carries unexpected OID {oid}")]
    UnexpectedOid { ip: Ipv4Addr, oid: String },
    #[error("lookup task failed: {0}")]
    Task(String),
}

/// Storage engine failures, one variant per step of the write path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to connect to database: {0}")]
    Connect(String),
    #[error("failed to begin transaction: {0}")]
    Begin(String),
    #[error("failed to prepare statement: {0}")]
    Prepare(String),
    #[error("failed to execute statement: {0}")]
    Execute(String),
    #[error("failed to commit transaction: {0}")]
    Commit(String),
    #[error("failed to roll back transaction: {0}")]
    Rollback(String),
}

/// Failures of the bulk device directory fetch.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("directory responded with status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("couldn't bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
