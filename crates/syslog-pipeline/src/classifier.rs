// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classification of raw records by syslog tag.
//!
//! The category is decided from the tag alone, in this order:
//! 1. the configured web-server tag (exact match) is a web record,
//! 2. a tag containing `postfix` or `dovecot` is a mail record,
//! 3. an empty tag is a switch record (switches don't send one),
//! 4. anything else is rejected.
//!
//! Missing fields other than the tag (and the client address for switches) keep their zero
//! value. This mirrors how the relay has always treated partial messages.

use std::net::Ipv4Addr;

use crate::errors::ParseError;
use crate::record::{
    Category, MailLogRecord, RawRecord, SwitchLogRecord, TypedRecord, WebLogRecord,
};

pub const DEFAULT_WEB_TAG: &str = "nginx";

const MAIL_TAG_MARKERS: [&str; 2] = ["postfix", "dovecot"];

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// The record should be persisted.
    Accepted(TypedRecord),
    /// The record is valid but filtered out by a business rule.
    Filtered(Category),
}

#[derive(Debug, Clone)]
pub struct Classifier {
    web_tag: String,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_WEB_TAG)
    }
}

impl Classifier {
    pub fn new(web_tag: impl Into<String>) -> Self {
        Self {
            web_tag: web_tag.into(),
        }
    }

    /// Determines the category of a tag.
    pub fn category(&self, tag: &str) -> Result<Category, ParseError> {
        if tag == self.web_tag {
            Ok(Category::Web)
        } else if MAIL_TAG_MARKERS.iter().any(|marker| tag.contains(marker)) {
            Ok(Category::Mail)
        } else if tag.is_empty() {
            Ok(Category::Switch)
        } else {
            Err(ParseError::UnrecognizedTag(tag.to_string()))
        }
    }

    /// Classifies a raw record and converts it into its typed form.
    pub fn classify(&self, raw: RawRecord) -> Result<Classification, ParseError> {
        let tag = raw
            .tag
            .as_deref()
            .ok_or(ParseError::MissingRequiredField { field: "tag" })?;

        let record = match self.category(tag)? {
            Category::Switch => TypedRecord::Switch(switch_record(raw)?),
            Category::Web => TypedRecord::Web(web_record(raw)),
            Category::Mail => {
                let mail = mail_record(raw);
                if !mail.is_retained() {
                    return Ok(Classification::Filtered(Category::Mail));
                }
                TypedRecord::Mail(mail)
            }
        };
        Ok(Classification::Accepted(record))
    }
}

/// Extracts the IPv4 address from an `ip:port` client string.
pub fn client_ip(client: &str) -> Result<Ipv4Addr, ParseError> {
    let host = client.split(':').next().unwrap_or_default();
    host.parse()
        .map_err(|_| ParseError::InvalidClientAddress(client.to_string()))
}

fn switch_record(raw: RawRecord) -> Result<SwitchLogRecord, ParseError> {
    let client = raw
        .client
        .ok_or(ParseError::MissingRequiredField { field: "client" })?;
    Ok(SwitchLogRecord {
        ip: client_ip(&client)?,
        timestamp: raw.timestamp.unwrap_or_default(),
        facility: raw.facility.unwrap_or_default(),
        severity: raw.severity.unwrap_or_default(),
        priority: raw.priority.unwrap_or_default(),
        message: raw.content.unwrap_or_default(),
        name: String::new(),
    })
}

fn web_record(raw: RawRecord) -> WebLogRecord {
    WebLogRecord {
        hostname: raw.hostname.unwrap_or_default(),
        timestamp: raw.timestamp.unwrap_or_default(),
        facility: raw.facility.unwrap_or_default(),
        severity: raw.severity.unwrap_or_default(),
        priority: raw.priority.unwrap_or_default(),
        message: raw.content.unwrap_or_default(),
    }
}

fn mail_record(raw: RawRecord) -> MailLogRecord {
    MailLogRecord {
        service: raw.tag.unwrap_or_default(),
        timestamp: raw.timestamp.unwrap_or_default(),
        message: raw.content.unwrap_or_default(),
    }
}
