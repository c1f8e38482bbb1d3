// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The single consumer of decoded records.
//!
//! Records are processed strictly one at a time: classify, resolve the switch name when needed,
//! then hand the typed record to its category's batch writer. The dispatcher owns the name cache
//! and every batch writer, so none of them need locking.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batch_writer::BatchWriter;
use crate::classifier::{Classification, Classifier};
use crate::errors::PersistenceError;
use crate::record::{MailLogRecord, RawRecord, SwitchLogRecord, TypedRecord, WebLogRecord};
use crate::resolver::NameResolver;

/// Everything the dispatcher needs, passed in at construction.
pub struct PipelineContext {
    pub classifier: Classifier,
    pub resolver: NameResolver,
    pub switch_writer: BatchWriter<SwitchLogRecord>,
    pub web_writer: BatchWriter<WebLogRecord>,
    pub mail_writer: BatchWriter<MailLogRecord>,
    /// Period of the forced flush of every writer. `None` disables it.
    pub flush_interval: Option<Duration>,
}

/// What happened to each record received so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    /// Accepted by a batch writer.
    pub written: u64,
    /// Valid but discarded by a business rule.
    pub filtered: u64,
    /// Lost to a parse, resolution or persistence error before reaching a batch.
    pub dropped: u64,
    /// Written, then discarded with their batch by a rollback or a failed commit.
    pub lost: u64,
}

/// Outcome of processing a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Filtered,
    Dropped,
}

pub struct Dispatcher {
    context: PipelineContext,
    stats: DispatchStats,
}

impl Dispatcher {
    #[must_use]
    pub fn new(context: PipelineContext) -> Self {
        Self {
            context,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            lost: self.context.switch_writer.lost()
                + self.context.web_writer.lost()
                + self.context.mail_writer.lost(),
            ..self.stats
        }
    }

    #[must_use]
    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Drains `rx` until it closes or `cancel` fires, then flushes every writer.
    ///
    /// On cancellation the channel is closed and the records already queued are still processed.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RawRecord>,
        cancel: CancellationToken,
    ) -> DispatchStats {
        let mut ticker = self.context.flush_interval.map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                maybe_record = rx.recv() => {
                    let Some(record) = maybe_record else {
                        debug!("record channel closed, stopping dispatcher");
                        break;
                    };
                    self.process(record).await;
                }
                () = tick(ticker.as_mut()) => {
                    trace!("periodic flush");
                    self.flush_all().await;
                }
                () = cancel.cancelled() => {
                    debug!("dispatcher cancelled, draining queued records");
                    rx.close();
                    while let Some(record) = rx.recv().await {
                        self.process(record).await;
                    }
                    break;
                }
            }
        }

        self.flush_all().await;
        let stats = self.stats();
        info!(
            received = stats.received,
            written = stats.written,
            filtered = stats.filtered,
            dropped = stats.dropped,
            lost = stats.lost,
            "dispatcher stopped"
        );
        stats
    }

    /// Processes one record to completion, including any SNMP round trip.
    pub async fn process(&mut self, raw: RawRecord) -> Outcome {
        self.stats.received += 1;
        trace!("received record from {:?}", raw.client);

        let outcome = match self.context.classifier.classify(raw) {
            Ok(Classification::Accepted(record)) => self.route(record).await,
            Ok(Classification::Filtered(category)) => {
                trace!("{}: record filtered", category);
                Outcome::Filtered
            }
            Err(e) => {
                warn!("dropping record: {}", e);
                Outcome::Dropped
            }
        };

        match outcome {
            Outcome::Written => self.stats.written += 1,
            Outcome::Filtered => self.stats.filtered += 1,
            Outcome::Dropped => self.stats.dropped += 1,
        }
        outcome
    }

    async fn route(&mut self, record: TypedRecord) -> Outcome {
        let category = record.category();
        let result = match record {
            TypedRecord::Switch(mut switch) => {
                match self.context.resolver.resolve(switch.ip).await {
                    Ok(resolution) => switch.name = resolution.name,
                    Err(e) => {
                        warn!("switch: dropping record from {}: {}", switch.ip, e);
                        return Outcome::Dropped;
                    }
                }
                self.context.switch_writer.write(switch).await
            }
            TypedRecord::Web(web) => self.context.web_writer.write(web).await,
            TypedRecord::Mail(mail) => self.context.mail_writer.write(mail).await,
        };

        match result {
            Ok(()) => Outcome::Written,
            // The record made it into the batch; the writer counts the batch as lost.
            Err(PersistenceError::Commit(_)) => Outcome::Written,
            Err(e) => {
                error!("{}: record not persisted: {}", category, e);
                Outcome::Dropped
            }
        }
    }

    /// Forces a commit of every open batch.
    pub async fn flush_all(&mut self) {
        // Failures are logged by the writers themselves.
        let _ = self.context.switch_writer.flush().await;
        let _ = self.context.web_writer.flush().await;
        let _ = self.context.mail_writer.flush().await;
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch_writer::TimeSettings;
    use crate::resolver::NameCache;
    use crate::storage::Value;
    use crate::test_support::{Failures, RecordingStorage, ScriptedLookup};
    use chrono::DateTime;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    struct Harness {
        dispatcher: Dispatcher,
        switch: RecordingStorage,
        web: RecordingStorage,
        mail: RecordingStorage,
        snmp_calls: Arc<AtomicUsize>,
    }

    fn harness(cache: NameCache, lookup: ScriptedLookup, thresholds: [usize; 3]) -> Harness {
        let switch = RecordingStorage::new();
        let web = RecordingStorage::new();
        let mail = RecordingStorage::new();
        let snmp_calls = lookup.calls();
        let time = TimeSettings::default();
        let context = PipelineContext {
            classifier: Classifier::default(),
            resolver: NameResolver::new(cache, Box::new(lookup)),
            switch_writer: BatchWriter::new(Box::new(switch.clone()), thresholds[0], time),
            web_writer: BatchWriter::new(Box::new(web.clone()), thresholds[1], time),
            mail_writer: BatchWriter::new(Box::new(mail.clone()), thresholds[2], time),
            flush_interval: None,
        };
        Harness {
            dispatcher: Dispatcher::new(context),
            switch,
            web,
            mail,
            snmp_calls,
        }
    }

    fn switch_raw() -> RawRecord {
        RawRecord {
            tag: Some(String::new()),
            client: Some("10.0.0.5:34112".to_string()),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0),
            facility: Some(1),
            severity: Some(6),
            priority: Some(14),
            content: Some("switch log line".to_string()),
            hostname: None,
        }
    }

    fn web_raw(n: usize) -> RawRecord {
        RawRecord {
            tag: Some("nginx".to_string()),
            client: Some("10.0.1.10:514".to_string()),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0),
            facility: Some(23),
            severity: Some(6),
            priority: Some(190),
            content: Some(format!("GET /{n} HTTP/1.1 200")),
            hostname: Some("web-1".to_string()),
        }
    }

    fn mail_raw(tag: &str, content: &str) -> RawRecord {
        RawRecord {
            tag: Some(tag.to_string()),
            client: Some("10.0.2.20:514".to_string()),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0),
            content: Some(content.to_string()),
            ..RawRecord::default()
        }
    }

    #[tokio::test]
    async fn test_known_switch_uses_cache() {
        let cache: NameCache = [(Ipv4Addr::new(10, 0, 0, 5), "core-sw-1".to_string())]
            .into_iter()
            .collect();
        let mut h = harness(cache, ScriptedLookup::failing(), [1, 1, 1]);

        assert_eq!(h.dispatcher.process(switch_raw()).await, Outcome::Written);
        assert_eq!(h.snmp_calls.load(Ordering::SeqCst), 0);

        let log = h.switch.log();
        assert_eq!(log.committed.len(), 1);
        let row = &log.committed[0].1;
        assert_eq!(row[1], Value::Str("core-sw-1".to_string()));
        assert_eq!(row[2], Value::Ipv4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(row[7], Value::Str("switch log line".to_string()));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unresolved_switch_is_dropped() {
        let mut h = harness(NameCache::new(), ScriptedLookup::failing(), [1, 1, 1]);

        assert_eq!(h.dispatcher.process(switch_raw()).await, Outcome::Dropped);
        assert_eq!(h.snmp_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.switch.log().executes, 0);
        assert_eq!(h.switch.log().begins, 0);
        assert_eq!(h.dispatcher.stats().dropped, 1);
        assert!(logs_contain("switch: dropping record from 10.0.0.5"));
    }

    #[tokio::test]
    async fn test_snmp_answer_is_cached() {
        let mut h = harness(NameCache::new(), ScriptedLookup::answering("edge-sw-9"), [10, 10, 10]);

        h.dispatcher.process(switch_raw()).await;
        h.dispatcher.process(switch_raw()).await;
        h.dispatcher.flush_all().await;

        assert_eq!(h.snmp_calls.load(Ordering::SeqCst), 1);
        let log = h.switch.log();
        assert_eq!(log.committed.len(), 2);
        assert!(log
            .committed
            .iter()
            .all(|(_, row)| row[1] == Value::Str("edge-sw-9".to_string())));
    }

    #[tokio::test]
    async fn test_dovecot_without_expunged_never_reaches_writer() {
        let mut h = harness(NameCache::new(), ScriptedLookup::failing(), [1, 1, 1]);

        let outcome = h
            .dispatcher
            .process(mail_raw("dovecot", "imap-login: Login: user=<bob>"))
            .await;
        assert_eq!(outcome, Outcome::Filtered);
        assert_eq!(h.mail.log().begins, 0);
        assert_eq!(h.mail.log().executes, 0);

        let outcome = h
            .dispatcher
            .process(mail_raw("dovecot", "imap(bob): expunged 3 messages"))
            .await;
        assert_eq!(outcome, Outcome::Written);
        assert_eq!(h.mail.log().committed.len(), 1);
    }

    #[tokio::test]
    async fn test_web_batch_commits_at_threshold() {
        let mut h = harness(NameCache::new(), ScriptedLookup::failing(), [1000, 5, 100]);

        for n in 0..4 {
            h.dispatcher.process(web_raw(n)).await;
        }
        assert_eq!(h.web.log().commits, 0);

        h.dispatcher.process(web_raw(4)).await;
        assert_eq!(h.web.log().commits, 1);
        assert_eq!(h.web.log().committed.len(), 5);
        assert_eq!(h.switch.log().begins, 0);
        assert_eq!(h.mail.log().begins, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unrecognized_tag_is_dropped() {
        let mut h = harness(NameCache::new(), ScriptedLookup::failing(), [1, 1, 1]);

        let outcome = h.dispatcher.process(mail_raw("sshd", "Accepted publickey")).await;
        assert_eq!(outcome, Outcome::Dropped);
        assert!(logs_contain("dropping record: unrecognized tag"));
    }

    #[tokio::test]
    async fn test_run_flushes_on_close() {
        let h = harness(NameCache::new(), ScriptedLookup::failing(), [1000, 1000, 100]);
        let (tx, rx) = mpsc::channel(16);

        for n in 0..3 {
            tx.send(web_raw(n)).await.unwrap();
        }
        tx.send(mail_raw("postfix/smtpd", "connect from unknown"))
            .await
            .unwrap();
        tx.send(mail_raw("dovecot", "Login")).await.unwrap();
        drop(tx);

        let stats = h.dispatcher.run(rx, CancellationToken::new()).await;
        assert_eq!(
            stats,
            DispatchStats {
                received: 5,
                written: 4,
                filtered: 1,
                dropped: 0,
                lost: 0,
            }
        );
        assert_eq!(h.web.log().committed.len(), 3);
        assert_eq!(h.mail.log().committed.len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(NameCache::new(), ScriptedLookup::failing(), [1000, 1000, 100]);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        tx.send(web_raw(0)).await.unwrap();
        let handle = tokio::spawn(h.dispatcher.run(rx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(h.web.log().commits, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_cancel_drains_queued_records() {
        let h = harness(NameCache::new(), ScriptedLookup::failing(), [1000, 1000, 100]);
        let (tx, rx) = mpsc::channel(128);
        let cancel = CancellationToken::new();

        for n in 0..100 {
            tx.send(web_raw(n)).await.unwrap();
        }
        cancel.cancel();

        let stats = h.dispatcher.run(rx, cancel).await;
        assert_eq!(stats.received, 100);
        assert_eq!(stats.written, 100);
        assert_eq!(h.web.log().committed.len(), 100);
        // The channel is closed, so the listener side notices the shutdown.
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_failed_commit_counts_batch_as_lost() {
        let mut h = harness(NameCache::new(), ScriptedLookup::failing(), [1000, 2, 100]);
        let web = RecordingStorage::failing(Failures {
            commit: true,
            ..Failures::default()
        });
        h.dispatcher.context.web_writer =
            BatchWriter::new(Box::new(web.clone()), 2, TimeSettings::default());

        h.dispatcher.process(web_raw(0)).await;
        h.dispatcher.process(web_raw(1)).await;
        h.dispatcher.process(web_raw(2)).await;
        h.dispatcher.flush_all().await;

        let stats = h.dispatcher.stats();
        assert_eq!(stats.written, 3);
        assert_eq!(stats.lost, 3);
        assert_eq!(stats.dropped, 0);
        assert!(web.log().committed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let mut h = harness(NameCache::new(), ScriptedLookup::failing(), [1000, 1000, 100]);
        h.dispatcher.context.flush_interval = Some(Duration::from_secs(10));
        let (tx, rx) = mpsc::channel(16);
        let web = h.web.clone();

        let handle = tokio::spawn(h.dispatcher.run(rx, CancellationToken::new()));
        tx.send(web_raw(0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(web.log().commits, 1);

        drop(tx);
        handle.await.unwrap();
    }
}
