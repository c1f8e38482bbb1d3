// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw and typed syslog records.
//!
//! A [`RawRecord`] is what the listener hands to the dispatcher: every field is optional but
//! correctly typed by construction. The classifier turns it into one of the three typed
//! records, each of which maps onto a single storage table.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::errors::ParseError;

/// Source category of a record, derived from its syslog tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Category {
    #[display("switch")]
    Switch,
    #[display("web")]
    Web,
    #[display("mail")]
    Mail,
}

/// A loosely typed field value, as produced by decoders that work on field maps.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    UInt(u64),
    Time(DateTime<Utc>),
}

/// A decoded syslog message. Absent fields are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub tag: Option<String>,
    /// Peer address as `ip:port`.
    pub client: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub facility: Option<u8>,
    pub severity: Option<u8>,
    pub priority: Option<u8>,
    pub content: Option<String>,
    pub hostname: Option<String>,
}

impl RawRecord {
    /// Builds a typed record from a field map.
    ///
    /// Unknown keys are ignored. A known key holding a value of the wrong type (or an integer
    /// that does not fit in a byte) fails the whole record.
    pub fn from_fields<I, K>(fields: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: AsRef<str>,
    {
        let mut raw = RawRecord::default();
        for (key, value) in fields {
            match key.as_ref() {
                "tag" => raw.tag = Some(expect_str("tag", value)?),
                "client" => raw.client = Some(expect_str("client", value)?),
                "content" => raw.content = Some(expect_str("content", value)?),
                "hostname" => raw.hostname = Some(expect_str("hostname", value)?),
                "timestamp" => match value {
                    FieldValue::Time(ts) => raw.timestamp = Some(ts),
                    _ => return Err(ParseError::FieldTypeMismatch { field: "timestamp" }),
                },
                "facility" => raw.facility = Some(expect_u8("facility", value)?),
                "severity" => raw.severity = Some(expect_u8("severity", value)?),
                "priority" => raw.priority = Some(expect_u8("priority", value)?),
                _ => {}
            }
        }
        Ok(raw)
    }
}

fn expect_str(field: &'static str, value: FieldValue) -> Result<String, ParseError> {
    match value {
        FieldValue::Str(s) => Ok(s),
        _ => Err(ParseError::FieldTypeMismatch { field }),
    }
}

fn expect_u8(field: &'static str, value: FieldValue) -> Result<u8, ParseError> {
    match value {
        FieldValue::UInt(n) => u8::try_from(n).map_err(|_| ParseError::FieldTypeMismatch { field }),
        _ => Err(ParseError::FieldTypeMismatch { field }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchLogRecord {
    pub ip: Ipv4Addr,
    pub timestamp: DateTime<Utc>,
    pub facility: u8,
    pub severity: u8,
    pub priority: u8,
    pub message: String,
    /// Filled in by the name resolver, empty until then.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebLogRecord {
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub facility: u8,
    pub severity: u8,
    pub priority: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailLogRecord {
    /// Full syslog tag of the daemon, e.g. `postfix/smtpd` or `dovecot`.
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl MailLogRecord {
    /// Dovecot is only interesting when it reports expunged messages.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        !(self.service == "dovecot" && !self.message.contains("expunged"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedRecord {
    Switch(SwitchLogRecord),
    Web(WebLogRecord),
    Mail(MailLogRecord),
}

impl TypedRecord {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            TypedRecord::Switch(_) => Category::Switch,
            TypedRecord::Web(_) => Category::Web,
            TypedRecord::Mail(_) => Category::Mail,
        }
    }
}
