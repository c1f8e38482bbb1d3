// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ClickHouse storage over the HTTP interface.
//!
//! A transaction buffers executed rows per prepared statement as `JSONEachRow` lines and ships
//! each statement's rows with a single `INSERT` request on commit. Rolling back discards the
//! buffer, so nothing from a failed batch ever reaches the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING};
use tracing::debug;

use crate::errors::PersistenceError;
use crate::storage::{InsertStatement, PreparedStatement, Row, StorageConnection, StorageTransaction};

pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://127.0.0.1:8123`.
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
    /// zstd level for insert bodies, 0 sends them uncompressed.
    pub compression_level: i32,
}

pub struct ClickHouseConnection {
    client: reqwest::Client,
    config: Arc<ClickHouseConfig>,
}

impl ClickHouseConnection {
    /// Opens a connection and checks that the server answers.
    pub async fn connect(config: ClickHouseConfig) -> Result<Self, PersistenceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PersistenceError::Connect(e.to_string()))?;

        let url = format!("{}/ping", config.url.trim_end_matches('/'));
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| PersistenceError::Connect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PersistenceError::Connect(format!(
                "{} answered {}",
                url,
                resp.status()
            )));
        }
        debug!("Connected to ClickHouse at {}", config.url);

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl StorageConnection for ClickHouseConnection {
    async fn begin(&mut self) -> Result<Box<dyn StorageTransaction>, PersistenceError> {
        Ok(Box::new(ClickHouseTransaction {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            pending: Vec::new(),
        }))
    }
}

struct PendingInsert {
    statement: PreparedStatement,
    open: bool,
    rows: usize,
    body: Vec<u8>,
}

pub struct ClickHouseTransaction {
    client: reqwest::Client,
    config: Arc<ClickHouseConfig>,
    pending: Vec<PendingInsert>,
}

impl ClickHouseTransaction {
    async fn send(&self, insert: &PendingInsert) -> Result<(), PersistenceError> {
        let statement = &insert.statement.insert;
        let query = format!(
            "INSERT INTO {} ({}) FORMAT JSONEachRow",
            statement.table,
            statement.columns.join(", ")
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-ClickHouse-User",
            HeaderValue::from_str(&self.config.user)
                .map_err(|e| PersistenceError::Commit(e.to_string()))?,
        );
        headers.insert(
            "X-ClickHouse-Key",
            HeaderValue::from_str(&self.config.password)
                .map_err(|e| PersistenceError::Commit(e.to_string()))?,
        );

        let body = if self.config.compression_level > 0 {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
            zstd::encode_all(insert.body.as_slice(), self.config.compression_level)
                .map_err(|e| PersistenceError::Commit(e.to_string()))?
        } else {
            insert.body.clone()
        };

        let url = format!("{}/", self.config.url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .query(&[
                ("database", self.config.database.as_str()),
                ("query", query.as_str()),
            ])
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| PersistenceError::Commit(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PersistenceError::Commit(format!(
                "{}: {}",
                status,
                text.trim()
            )));
        }
        debug!("Inserted {} rows into {}", insert.rows, statement.table);
        Ok(())
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl StorageTransaction for ClickHouseTransaction {
    async fn prepare(
        &mut self,
        insert: &InsertStatement,
    ) -> Result<PreparedStatement, PersistenceError> {
        if !valid_identifier(insert.table)
            || insert.columns.is_empty()
            || !insert.columns.iter().all(|c| valid_identifier(c))
        {
            return Err(PersistenceError::Prepare(format!(
                "malformed statement: {}",
                insert.sql()
            )));
        }

        let statement = PreparedStatement {
            id: self.pending.len() as u64,
            insert: *insert,
        };
        self.pending.push(PendingInsert {
            statement: statement.clone(),
            open: true,
            rows: 0,
            body: Vec::new(),
        });
        Ok(statement)
    }

    async fn execute(
        &mut self,
        statement: &PreparedStatement,
        row: Row,
    ) -> Result<(), PersistenceError> {
        let pending = self
            .pending
            .iter_mut()
            .find(|p| p.statement.id == statement.id && p.open)
            .ok_or_else(|| PersistenceError::Execute("statement is not prepared".to_string()))?;

        let columns = pending.statement.insert.columns;
        if row.len() != columns.len() {
            return Err(PersistenceError::Execute(format!(
                "expected {} parameters, got {}",
                columns.len(),
                row.len()
            )));
        }

        let object: serde_json::Map<String, serde_json::Value> = columns
            .iter()
            .zip(row.iter())
            .map(|(column, value)| ((*column).to_string(), value.to_json()))
            .collect();
        let line = serde_json::to_vec(&object)
            .map_err(|e| PersistenceError::Execute(e.to_string()))?;
        pending.body.extend_from_slice(&line);
        pending.body.push(b'\n');
        pending.rows += 1;
        Ok(())
    }

    async fn close_statement(&mut self, statement: PreparedStatement) {
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|p| p.statement.id == statement.id)
        {
            pending.open = false;
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        for insert in self.pending.iter().filter(|p| p.rows > 0) {
            self.send(insert).await?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        let discarded: usize = self.pending.iter().map(|p| p.rows).sum();
        debug!("Discarding {} buffered rows", discarded);
        Ok(())
    }
}
