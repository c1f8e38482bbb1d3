// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Switch name resolution.
//!
//! Names come from a cache seeded by the device directory at startup. Addresses the directory
//! doesn't know are looked up through a fallback (SNMP in production), and every successful
//! fallback answer is cached so each address is only queried once per process.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use tracing::info;

use crate::errors::ResolutionError;

/// Looks up a device name by address when the cache has no entry for it.
#[async_trait]
pub trait NameLookup: Send + Sync {
    async fn lookup(&self, ip: Ipv4Addr) -> Result<String, ResolutionError>;
}

/// Address to device name mapping. Lives for the whole process and is never persisted.
#[derive(Debug, Clone, Default)]
pub struct NameCache {
    names: HashMap<Ipv4Addr, String, FnvBuildHasher>,
}

impl NameCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, ip: &Ipv4Addr) -> Option<&str> {
        self.names.get(ip).map(String::as_str)
    }

    pub fn insert(&mut self, ip: Ipv4Addr, name: String) {
        self.names.insert(ip, name);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(Ipv4Addr, String)> for NameCache {
    fn from_iter<T: IntoIterator<Item = (Ipv4Addr, String)>>(iter: T) -> Self {
        let mut cache = NameCache::new();
        for (ip, name) in iter {
            cache.insert(ip, name);
        }
        cache
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    pub cache_hit: bool,
}

pub struct NameResolver {
    cache: NameCache,
    fallback: Box<dyn NameLookup>,
}

impl NameResolver {
    pub fn new(cache: NameCache, fallback: Box<dyn NameLookup>) -> Self {
        Self { cache, fallback }
    }

    /// Resolves the device name for `ip`, consulting the fallback on a cache miss.
    pub async fn resolve(&mut self, ip: Ipv4Addr) -> Result<Resolution, ResolutionError> {
        if let Some(name) = self.cache.get(&ip) {
            return Ok(Resolution {
                name: name.to_string(),
                cache_hit: true,
            });
        }

        info!("switch: unknown IP {}, going to find name via SNMP", ip);
        let name = self.fallback.lookup(ip).await?;
        self.cache.insert(ip, name.clone());
        Ok(Resolution {
            name,
            cache_hit: false,
        })
    }

    #[must_use]
    pub fn cache(&self) -> &NameCache {
        &self.cache
    }
}
