// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory doubles for the pipeline's external dependencies.

#![allow(clippy::unwrap_used)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::directory::{Device, DeviceDirectory};
use crate::errors::{DirectoryError, PersistenceError, ResolutionError};
use crate::resolver::NameLookup;
use crate::storage::{
    InsertStatement, PreparedStatement, Row, StorageConnection, StorageTransaction,
};

/// A name lookup that always gives the same answer and counts how often it was asked.
pub struct ScriptedLookup {
    answer: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedLookup {
    pub fn answering(name: &str) -> Self {
        Self {
            answer: Some(name.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl NameLookup for ScriptedLookup {
    async fn lookup(&self, ip: Ipv4Addr) -> Result<String, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().ok_or(ResolutionError::Query {
            ip,
            message: "request timeout".to_string(),
        })
    }
}

/// Everything a [`RecordingStorage`] saw, shared with the test that created it.
#[derive(Debug, Default)]
pub struct StorageLog {
    pub begins: usize,
    pub prepares: usize,
    pub executes: usize,
    pub closed_statements: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Rows of committed transactions only.
    pub committed: Vec<(&'static str, Row)>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Failures {
    pub begin: bool,
    pub execute: bool,
    /// Fails only the Nth execute seen by the storage, counting from 1.
    pub execute_at: Option<usize>,
    pub commit: bool,
}

#[derive(Clone, Default)]
pub struct RecordingStorage {
    log: Arc<Mutex<StorageLog>>,
    failures: Failures,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: Failures) -> Self {
        Self {
            log: Arc::default(),
            failures,
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, StorageLog> {
        self.log.lock().unwrap()
    }
}

#[async_trait]
impl StorageConnection for RecordingStorage {
    async fn begin(&mut self) -> Result<Box<dyn StorageTransaction>, PersistenceError> {
        self.log().begins += 1;
        if self.failures.begin {
            return Err(PersistenceError::Begin("connection refused".to_string()));
        }
        Ok(Box::new(RecordingTransaction {
            log: Arc::clone(&self.log),
            failures: self.failures,
            next_id: 0,
            rows: Vec::new(),
        }))
    }
}

struct RecordingTransaction {
    log: Arc<Mutex<StorageLog>>,
    failures: Failures,
    next_id: u64,
    rows: Vec<(&'static str, Row)>,
}

#[async_trait]
impl StorageTransaction for RecordingTransaction {
    async fn prepare(
        &mut self,
        insert: &InsertStatement,
    ) -> Result<PreparedStatement, PersistenceError> {
        self.log.lock().unwrap().prepares += 1;
        self.next_id += 1;
        Ok(PreparedStatement {
            id: self.next_id,
            insert: *insert,
        })
    }

    async fn execute(
        &mut self,
        statement: &PreparedStatement,
        row: Row,
    ) -> Result<(), PersistenceError> {
        let executes = {
            let mut log = self.log.lock().unwrap();
            log.executes += 1;
            log.executes
        };
        if self.failures.execute || self.failures.execute_at == Some(executes) {
            return Err(PersistenceError::Execute("column type mismatch".to_string()));
        }
        if row.len() != statement.insert.columns.len() {
            return Err(PersistenceError::Execute(format!(
                "expected {} parameters, got {}",
                statement.insert.columns.len(),
                row.len()
            )));
        }
        self.rows.push((statement.insert.table, row));
        Ok(())
    }

    async fn close_statement(&mut self, _statement: PreparedStatement) {
        self.log.lock().unwrap().closed_statements += 1;
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let RecordingTransaction {
            log, failures, rows, ..
        } = *self;
        let mut log = log.lock().unwrap();
        log.commits += 1;
        if failures.commit {
            return Err(PersistenceError::Commit("server went away".to_string()));
        }
        log.committed.extend(rows);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistenceError> {
        self.log.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

/// A directory that always lists the same devices.
pub struct StaticDirectory(pub Vec<Device>);

impl StaticDirectory {
    pub fn new(devices: &[(&str, &str)]) -> Self {
        Self(
            devices
                .iter()
                .map(|(ip, name)| Device {
                    ipv4_address: (*ip).to_string(),
                    name: (*name).to_string(),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError> {
        Ok(self.0.clone())
    }
}
