// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SNMP fallback for switch names: a GET of `sysName.0` against the device itself.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use snmp::{ObjIdBuf, SnmpPdu, SyncSession, Value};
use tracing::debug;

use crate::errors::ResolutionError;
use crate::resolver::NameLookup;

/// `.1.3.6.1.2.1.1.5.0`
const SYS_NAME: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];
const SNMP_PORT: u16 = 161;

pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SnmpNameLookup {
    community: String,
    retries: u32,
    timeout: Duration,
}

impl Default for SnmpNameLookup {
    fn default() -> Self {
        Self::new("public", DEFAULT_RETRIES, DEFAULT_TIMEOUT)
    }
}

impl SnmpNameLookup {
    pub fn new(community: impl Into<String>, retries: u32, timeout: Duration) -> Self {
        Self {
            community: community.into(),
            retries,
            timeout,
        }
    }

    fn query(&self, ip: Ipv4Addr) -> Result<String, ResolutionError> {
        let target = SocketAddr::from((ip, SNMP_PORT));
        let mut session = SyncSession::new(target, self.community.as_bytes(), Some(self.timeout), 0)
            .map_err(|e| ResolutionError::Connect {
                ip,
                message: e.to_string(),
            })?;

        let mut attempt = 0;
        loop {
            match session.get(SYS_NAME) {
                Ok(pdu) => return read_sys_name(ip, pdu),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    debug!("sysName query to {} failed ({:?}), retry {}", ip, e, attempt);
                }
                Err(e) => {
                    return Err(ResolutionError::Query {
                        ip,
                        message: format!("{e:?}"),
                    })
                }
            }
        }
    }
}

fn read_sys_name(ip: Ipv4Addr, pdu: SnmpPdu<'_>) -> Result<String, ResolutionError> {
    if pdu.error_status != 0 {
        return Err(ResolutionError::Query {
            ip,
            message: format!("error status {}", pdu.error_status),
        });
    }

    let mut name = None;
    for (oid, value) in pdu.varbinds {
        let mut buf: ObjIdBuf = [0; 128];
        let oid = oid.read_name(&mut buf).map_err(|e| ResolutionError::Query {
            ip,
            message: format!("{e:?}"),
        })?;
        if oid != SYS_NAME {
            let oid = oid
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(".");
            return Err(ResolutionError::UnexpectedOid { ip, oid });
        }
        match value {
            Value::OctetString(bytes) => {
                name = Some(String::from_utf8_lossy(bytes).into_owned());
            }
            _ => return Err(ResolutionError::UnexpectedType { ip }),
        }
    }

    name.ok_or_else(|| ResolutionError::Query {
        ip,
        message: "empty response".to_string(),
    })
}

#[async_trait]
impl NameLookup for SnmpNameLookup {
    async fn lookup(&self, ip: Ipv4Addr) -> Result<String, ResolutionError> {
        let lookup = self.clone();
        tokio::task::spawn_blocking(move || lookup.query(ip))
            .await
            .map_err(|e| ResolutionError::Task(e.to_string()))?
    }
}
