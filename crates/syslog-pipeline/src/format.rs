// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog wire format decoding.
//!
//! Datagrams are RFC 5424 when the header reads `<PRI>1 `, and are treated as BSD syslog
//! (RFC 3164) otherwise. BSD syslog is decoded leniently because switches rarely follow it:
//! the timestamp is optional, the hostname is only read after a timestamp, and a message with no
//! `tag:` prefix gets an empty tag with the whole remainder as content.

use std::net::SocketAddr;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::ParseError;
use crate::record::RawRecord;

const MAX_PRIORITY: u16 = 191;

lazy_static! {
    static ref PRIORITY: Regex = Regex::new(r"^<([0-9]{1,3})>").expect("failed creating regex");

    /// `VERSION SP TIMESTAMP SP HOSTNAME SP APP-NAME SP PROCID SP MSGID SP SD [SP MSG]`, after the
    /// priority.
    static ref RFC5424: Regex = Regex::new(
        r"(?s)^1 ([^ ]+) ([^ ]+) ([^ ]+) [^ ]+ [^ ]+ (-|(?:\[(?:[^\]\\]|\\.)*\])+)(?: (.*))?$"
    )
    .expect("failed creating regex");

    static ref BSD_TIMESTAMP: Regex =
        Regex::new(r"^([A-Z][a-z]{2}) ([ 0-9]?[0-9]) ([0-9]{2}):([0-9]{2}):([0-9]{2}) ")
            .expect("failed creating regex");

    /// `tag[pid]: `. Tags start with a letter, which keeps Cisco style `%FACILITY-...:` and
    /// sequence numbers out.
    static ref BSD_TAG: Regex =
        Regex::new(r"^([A-Za-z][A-Za-z0-9_./-]{0,47})(?:\[[0-9]+\])?: ?")
            .expect("failed creating regex");
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Decodes one datagram received from `peer`.
pub fn decode(datagram: &[u8], peer: SocketAddr) -> Result<RawRecord, ParseError> {
    let text = String::from_utf8_lossy(datagram);
    let text = text.trim_end_matches(['\n', '\r', '\0']);

    let captures = PRIORITY
        .captures(text)
        .ok_or(ParseError::MissingRequiredField { field: "priority" })?;
    let priority = captures[1]
        .parse::<u16>()
        .ok()
        .filter(|p| *p <= MAX_PRIORITY)
        .ok_or(ParseError::FieldTypeMismatch { field: "priority" })?;
    let rest = &text[captures[0].len()..];

    let mut record = if RFC5424.is_match(rest) {
        decode_rfc5424(rest)
    } else {
        decode_rfc3164(rest, Utc::now())
    };

    // At most 191, so the narrowing cannot fail.
    let priority = u8::try_from(priority).unwrap_or(u8::MAX);
    record.priority = Some(priority);
    record.facility = Some(priority / 8);
    record.severity = Some(priority % 8);
    record.client = Some(peer.to_string());
    Ok(record)
}

fn decode_rfc5424(rest: &str) -> RawRecord {
    let mut record = RawRecord::default();
    let Some(captures) = RFC5424.captures(rest) else {
        return record;
    };

    record.timestamp = nil_value(&captures[1])
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));
    record.hostname = nil_value(&captures[2]).map(str::to_string);
    record.tag = Some(nil_value(&captures[3]).unwrap_or_default().to_string());
    record.content = Some(
        captures
            .get(5)
            .map(|m| m.as_str().trim_start_matches('\u{feff}'))
            .unwrap_or_default()
            .to_string(),
    );
    record
}

fn nil_value(field: &str) -> Option<&str> {
    (field != "-").then_some(field)
}

fn decode_rfc3164(rest: &str, now: DateTime<Utc>) -> RawRecord {
    let mut record = RawRecord::default();
    let mut rest = rest;

    if let Some(captures) = BSD_TIMESTAMP.captures(rest) {
        record.timestamp = bsd_timestamp(&captures, now.year());
        rest = &rest[captures[0].len()..];

        // A hostname is only expected after a header timestamp.
        if let Some((hostname, remainder)) = rest.split_once(' ') {
            if !hostname.is_empty() && !hostname.ends_with(':') {
                record.hostname = Some(hostname.to_string());
                rest = remainder;
            }
        }
    }

    match BSD_TAG.captures(rest) {
        Some(captures) => {
            record.tag = Some(captures[1].to_string());
            record.content = Some(rest[captures[0].len()..].to_string());
        }
        None => {
            record.tag = Some(String::new());
            record.content = Some(rest.to_string());
        }
    }
    record
}

fn bsd_timestamp(captures: &regex::Captures<'_>, year: i32) -> Option<DateTime<Utc>> {
    let month = MONTHS.iter().position(|m| *m == &captures[1])?;
    let day = captures[2].trim().parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()? + 1, day)?.and_hms_opt(
        captures[3].parse().ok()?,
        captures[4].parse().ok()?,
        captures[5].parse().ok()?,
    )?;
    Some(Utc.from_utc_datetime(&naive))
}
