// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage engine abstraction used by the batch writers.
//!
//! The write path is modelled as a connection that begins transactions, and a transaction that
//! prepares statements, executes them with bound parameters, and ends with a commit or a
//! rollback. Each batch writer owns its own connection.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use crate::errors::PersistenceError;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    UInt8(u8),
    Ipv4(Ipv4Addr),
    DateTime(DateTime<FixedOffset>),
}

impl Value {
    /// Renders the value the way the analytics store expects it in JSON input.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::UInt8(n) => serde_json::Value::from(*n),
            Value::Ipv4(ip) => serde_json::Value::String(ip.to_string()),
            Value::DateTime(ts) => serde_json::Value::String(ts.format(DATETIME_FORMAT).to_string()),
        }
    }
}

pub type Row = Vec<Value>;

/// A fixed insert into one table, with the column order parameters are bound in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertStatement {
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

impl InsertStatement {
    #[must_use]
    pub fn sql(&self) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            self.columns.join(", "),
            vec!["?"; self.columns.len()].join(", ")
        )
    }
}

/// Handle to a statement prepared inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub id: u64,
    pub insert: InsertStatement,
}

#[async_trait]
pub trait StorageConnection: Send {
    async fn begin(&mut self) -> Result<Box<dyn StorageTransaction>, PersistenceError>;
}

#[async_trait]
pub trait StorageTransaction: Send {
    async fn prepare(
        &mut self,
        insert: &InsertStatement,
    ) -> Result<PreparedStatement, PersistenceError>;

    async fn execute(
        &mut self,
        statement: &PreparedStatement,
        row: Row,
    ) -> Result<(), PersistenceError>;

    /// Releases a prepared statement. Called before commit.
    async fn close_statement(&mut self, statement: PreparedStatement);

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError>;
}
