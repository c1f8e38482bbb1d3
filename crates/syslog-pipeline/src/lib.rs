// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog classification and batched persistence.
//!
//! Datagrams come in through the [`listener`], are decoded by [`format`] and handed to the
//! [`dispatcher`], which classifies them, resolves switch names and writes each record through
//! the [`batch_writer`] of its category.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch_writer;
pub mod classifier;
pub mod clickhouse;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod errors;
pub mod format;
pub mod listener;
pub mod record;
pub mod resolver;
pub mod snmp_lookup;
pub mod storage;

#[cfg(test)]
mod test_support;
