// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-category transactional batching.
//!
//! A [`BatchWriter`] is either idle (no transaction) or open (a transaction plus the prepared
//! insert for its table). Rows are executed one at a time inside the open transaction, and the
//! transaction is committed once the configured number of rows is pending or when a flush is
//! forced. Every category gets its own writer and its own storage connection, so a failing
//! batch in one category never touches the others.

use std::marker::PhantomData;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use tracing::{debug, error};

use crate::errors::PersistenceError;
use crate::record::{Category, MailLogRecord, SwitchLogRecord, WebLogRecord};
use crate::storage::{
    InsertStatement, PreparedStatement, Row, StorageConnection, StorageTransaction, Value,
};

pub const SWITCH_INSERT: InsertStatement = InsertStatement {
    table: "switchlogs",
    columns: &[
        "ts_local",
        "sw_name",
        "sw_ip",
        "ts_remote",
        "facility",
        "severity",
        "priority",
        "log_msg",
    ],
};

pub const WEB_INSERT: InsertStatement = InsertStatement {
    table: "nginx",
    columns: &[
        "hostname",
        "timestamp",
        "facility",
        "severity",
        "priority",
        "message",
    ],
};

pub const MAIL_INSERT: InsertStatement = InsertStatement {
    table: "mail",
    columns: &["service", "timestamp", "message"],
};

/// Default correction applied to mail timestamps: the relay tags them four hours ahead.
pub const DEFAULT_MAIL_OFFSET_SECS: i64 = -4 * 3600;

/// Time handling shared by every writer: the local zone used for ingestion stamps and the
/// correction applied to mail timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TimeSettings {
    pub timezone: Tz,
    pub mail_offset: TimeDelta,
}

impl Default for TimeSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Saratov,
            mail_offset: TimeDelta::seconds(DEFAULT_MAIL_OFFSET_SECS),
        }
    }
}

impl TimeSettings {
    fn local(&self, ts: DateTime<Utc>) -> Value {
        Value::DateTime(ts.with_timezone(&self.timezone).fixed_offset())
    }
}

/// A typed record that maps onto a single table.
pub trait BatchRecord: Send {
    const CATEGORY: Category;
    const INSERT: InsertStatement;

    /// Binds the record's fields in the column order of [`Self::INSERT`].
    fn into_row(self, time: &TimeSettings) -> Row;
}

impl BatchRecord for SwitchLogRecord {
    const CATEGORY: Category = Category::Switch;
    const INSERT: InsertStatement = SWITCH_INSERT;

    fn into_row(self, time: &TimeSettings) -> Row {
        vec![
            // Ingestion time, distinct from what the device reported.
            time.local(Utc::now()),
            Value::Str(self.name),
            Value::Ipv4(self.ip),
            time.local(self.timestamp),
            Value::UInt8(self.facility),
            Value::UInt8(self.severity),
            Value::UInt8(self.priority),
            Value::Str(self.message),
        ]
    }
}

impl BatchRecord for WebLogRecord {
    const CATEGORY: Category = Category::Web;
    const INSERT: InsertStatement = WEB_INSERT;

    fn into_row(self, time: &TimeSettings) -> Row {
        vec![
            Value::Str(self.hostname),
            time.local(self.timestamp),
            Value::UInt8(self.facility),
            Value::UInt8(self.severity),
            Value::UInt8(self.priority),
            Value::Str(self.message),
        ]
    }
}

impl BatchRecord for MailLogRecord {
    const CATEGORY: Category = Category::Mail;
    const INSERT: InsertStatement = MAIL_INSERT;

    fn into_row(self, time: &TimeSettings) -> Row {
        // An offset that would overflow leaves the timestamp as reported.
        let corrected = self
            .timestamp
            .checked_add_signed(time.mail_offset)
            .unwrap_or(self.timestamp);
        vec![
            Value::Str(self.service),
            time.local(corrected),
            Value::Str(self.message),
        ]
    }
}

/// The transaction and its prepared statement only ever exist together.
struct OpenBatch {
    tx: Box<dyn StorageTransaction>,
    statement: PreparedStatement,
}

pub struct BatchWriter<R> {
    connection: Box<dyn StorageConnection>,
    open: Option<OpenBatch>,
    pending: usize,
    lost: u64,
    threshold: usize,
    time: TimeSettings,
    _record: PhantomData<fn(R)>,
}

impl<R: BatchRecord> BatchWriter<R> {
    /// Creates an idle writer. A zero threshold is treated as one.
    pub fn new(connection: Box<dyn StorageConnection>, threshold: usize, time: TimeSettings) -> Self {
        Self {
            connection,
            open: None,
            pending: 0,
            lost: 0,
            threshold: threshold.max(1),
            time,
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn category(&self) -> Category {
        R::CATEGORY
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Rows executed in the open transaction and not yet committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Rows that were executed but then discarded by a rollback or a failed commit.
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.lost
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Begins a transaction and prepares the insert if the writer is idle.
    pub async fn ensure_open(&mut self) -> Result<(), PersistenceError> {
        if self.open.is_some() {
            return Ok(());
        }

        let mut tx = self.connection.begin().await?;
        match tx.prepare(&R::INSERT).await {
            Ok(statement) => {
                debug!(category = %R::CATEGORY, "opened transaction");
                self.open = Some(OpenBatch { tx, statement });
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        "{}: rollback after failed prepare also failed: {}",
                        R::CATEGORY,
                        rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Executes one insert, committing the batch if it reached the threshold.
    ///
    /// A failed execute rolls the whole open batch back and leaves the writer idle.
    pub async fn write(&mut self, record: R) -> Result<(), PersistenceError> {
        self.ensure_open().await?;
        let row = record.into_row(&self.time);

        let Some(batch) = self.open.as_mut() else {
            return Err(PersistenceError::Begin("no open transaction".to_string()));
        };
        if let Err(e) = batch.tx.execute(&batch.statement, row).await {
            error!("{}: failed to insert row: {}", R::CATEGORY, e);
            self.abort().await;
            return Err(e);
        }

        self.pending += 1;
        self.flush_if_due().await
    }

    async fn flush_if_due(&mut self) -> Result<(), PersistenceError> {
        if self.pending >= self.threshold {
            self.flush().await
        } else {
            Ok(())
        }
    }

    /// Commits the open batch, if any. The writer is idle afterwards whatever the outcome.
    pub async fn flush(&mut self) -> Result<(), PersistenceError> {
        let Some(OpenBatch { mut tx, statement }) = self.open.take() else {
            return Ok(());
        };
        let rows = std::mem::take(&mut self.pending);

        tx.close_statement(statement).await;
        match tx.commit().await {
            Ok(()) => {
                debug!(category = %R::CATEGORY, rows, "flushed batch");
                Ok(())
            }
            Err(e) => {
                error!("{}: failed to commit {} rows: {}", R::CATEGORY, rows, e);
                self.lost += rows as u64;
                Err(e)
            }
        }
    }

    async fn abort(&mut self) {
        let Some(OpenBatch { tx, .. }) = self.open.take() else {
            return;
        };
        let rows = std::mem::take(&mut self.pending);
        self.lost += rows as u64;
        if let Err(e) = tx.rollback().await {
            error!("{}: rollback failed: {}", R::CATEGORY, e);
        }
        debug!(category = %R::CATEGORY, rows, "rolled back batch");
    }
}
