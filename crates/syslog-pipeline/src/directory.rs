// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device directory: the inventory service that knows the name of every managed switch.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::DirectoryError;
use crate::resolver::NameCache;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    pub ipv4_address: String,
    pub name: String,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Lists every device the directory knows about.
    async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError>;
}

pub struct HttpDeviceDirectory {
    client: reqwest::Client,
    url: String,
}

impl HttpDeviceDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/switches", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl DeviceDirectory for HttpDeviceDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status));
        }
        Ok(resp.json::<Vec<Device>>().await?)
    }
}

/// Seeds a name cache from the directory.
///
/// This is best effort: a failing directory leaves the cache empty and every switch is resolved
/// through the fallback on first sight instead.
pub async fn load_name_cache(directory: Option<&dyn DeviceDirectory>) -> NameCache {
    let Some(directory) = directory else {
        debug!("No device directory configured, starting with an empty name cache");
        return NameCache::new();
    };

    match directory.list_devices().await {
        Ok(devices) => {
            let cache: NameCache = devices
                .into_iter()
                .filter_map(|device| match device.ipv4_address.parse::<Ipv4Addr>() {
                    Ok(ip) => Some((ip, device.name)),
                    Err(_) => {
                        warn!(
                            "Skipping device {} with invalid address {:?}",
                            device.name, device.ipv4_address
                        );
                        None
                    }
                })
                .collect();
            debug!("Loaded {} device names from the directory", cache.len());
            cache
        }
        Err(e) => {
            warn!("error getting switches from the device directory: {}", e);
            NameCache::new()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::StaticDirectory;
    use mockito::Server;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_load_name_cache_from_directory() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/switches")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"ipv4_address": "10.0.0.5", "name": "core-sw-1"},
                    {"ipv4_address": "10.0.0.6", "name": "core-sw-2"},
                    {"ipv4_address": "fe80::1", "name": "v6-only"}
                ]"#,
            )
            .create_async()
            .await;

        let directory = HttpDeviceDirectory::new(&server.url(), Duration::from_secs(5)).unwrap();
        let cache = load_name_cache(Some(&directory)).await;

        mock.assert_async().await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&Ipv4Addr::new(10, 0, 0, 5)), Some("core-sw-1"));
        assert_eq!(cache.get(&Ipv4Addr::new(10, 0, 0, 6)), Some("core-sw-2"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_directory_failure_is_not_fatal() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/switches")
            .with_status(500)
            .create_async()
            .await;

        let directory = HttpDeviceDirectory::new(&server.url(), Duration::from_secs(5)).unwrap();
        let cache = load_name_cache(Some(&directory)).await;

        assert!(cache.is_empty());
        assert!(logs_contain("error getting switches from the device directory"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_addresses_are_skipped() {
        let directory = StaticDirectory::new(&[
            ("10.0.0.5", "core-sw-1"),
            ("10.0.0.300", "typo-sw"),
            ("", "unaddressed"),
        ]);
        let cache = load_name_cache(Some(&directory)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&Ipv4Addr::new(10, 0, 0, 5)), Some("core-sw-1"));
        assert!(logs_contain("Skipping device typo-sw"));
    }

    #[tokio::test]
    async fn test_no_directory() {
        assert!(load_name_cache(None).await.is_empty());
    }
}
