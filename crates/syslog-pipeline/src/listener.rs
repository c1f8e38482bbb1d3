// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP syslog server.
//!
//! Receives datagrams, decodes each one into a [`RawRecord`] and forwards it to the dispatcher
//! over a bounded channel. When the dispatcher falls behind the listener waits for room in the
//! channel, and the kernel socket buffer absorbs (or drops) whatever arrives meanwhile.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::errors::ListenerError;
use crate::format;
use crate::record::RawRecord;

// Same default as most syslog daemons; longer datagrams are truncated by the kernel.
const BUFFER_SIZE: usize = 8192;

pub struct SyslogListenerConfig {
    /// Address to bind the UDP socket to (e.g. "0.0.0.0:514")
    pub listen_address: String,
}

// BufferReader abstracts where datagrams come from.
enum BufferReader {
    UdpSocket(tokio::net::UdpSocket),

    /// Mirror reader for testing - replays a fixed buffer
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),
}

impl BufferReader {
    async fn read(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        match self {
            BufferReader::UdpSocket(socket) => {
                let mut buf = [0; BUFFER_SIZE];
                let (amt, src) = socket.recv_from(&mut buf).await?;
                Ok((buf[..amt].to_owned(), src))
            }
            BufferReader::MirrorTest(data, src) => Ok((data.clone(), *src)),
        }
    }
}

pub struct SyslogListener {
    cancel_token: CancellationToken,
    buffer_reader: BufferReader,
    sender: mpsc::Sender<RawRecord>,
}

impl SyslogListener {
    /// Binds the UDP socket. Records are sent to `sender` until `cancel_token` fires.
    pub async fn new(
        config: &SyslogListenerConfig,
        sender: mpsc::Sender<RawRecord>,
        cancel_token: CancellationToken,
    ) -> Result<SyslogListener, ListenerError> {
        let socket = tokio::net::UdpSocket::bind(&config.listen_address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;
        debug!("syslog-udp: bound to {}", config.listen_address);

        Ok(SyslogListener {
            cancel_token,
            buffer_reader: BufferReader::UdpSocket(socket),
            sender,
        })
    }

    /// Address the socket is bound to, useful when binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.buffer_reader {
            BufferReader::UdpSocket(socket) => socket.local_addr().ok(),
            BufferReader::MirrorTest(..) => None,
        }
    }

    /// Main loop: receives and forwards datagrams until cancelled or the dispatcher goes away.
    pub async fn spin(self) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                keep_going = self.consume() => {
                    if !keep_going {
                        break;
                    }
                }
            }
        }
        debug!("syslog-udp: listener stopped");
    }

    /// Receives one datagram. Returns false once the receiving side of the channel is closed.
    async fn consume(&self) -> bool {
        let (buf, src) = match self.buffer_reader.read().await {
            Ok(read) => read,
            Err(e) => {
                error!("syslog-udp: failed to receive datagram: {}", e);
                return true;
            }
        };
        trace!("Received {} bytes from {}", buf.len(), src);

        let record = match format::decode(&buf, src) {
            Ok(record) => record,
            Err(e) => {
                warn!("syslog-udp: dropping datagram from {}: {}", src, e);
                return true;
            }
        };

        if self.sender.send(record).await.is_err() {
            debug!("syslog-udp: dispatcher is gone");
            return false;
        }
        true
    }
}
