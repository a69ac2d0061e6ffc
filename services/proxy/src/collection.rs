//! Every proxy of a process, by name.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::{ProxyConfig, UdpSessionPolicy};
use crate::error::ProxyError;
use crate::proxy::Proxy;

/// Owns the proxies of one process.
///
/// Mutations are serialized; proxies themselves run independently of the
/// collection lock once started.
#[derive(Debug, Default)]
pub struct ProxyCollection {
    proxies: Mutex<HashMap<String, Arc<Proxy>>>,
    udp_policy: UdpSessionPolicy,
}

impl ProxyCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection whose UDP proxies evict idle virtual connections per
    /// `policy`. Applies to proxies built by [`populate`](Self::populate).
    pub fn with_udp_policy(policy: UdpSessionPolicy) -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
            udp_policy: policy,
        }
    }

    /// Register `proxy`, starting it first when `start` is set.
    ///
    /// Nothing is registered if the name is taken or the start fails.
    pub async fn add(&self, proxy: Proxy, start: bool) -> Result<Arc<Proxy>, ProxyError> {
        let mut proxies = self.proxies.lock().await;
        if proxies.contains_key(proxy.name()) {
            return Err(ProxyError::ProxyExists(proxy.name().to_string()));
        }

        if start {
            proxy.start().await?;
        }

        let proxy = Arc::new(proxy);
        proxies.insert(proxy.name().to_string(), Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Register `proxy`, stopping and dropping any proxy of the same name.
    pub async fn add_or_replace(
        &self,
        proxy: Proxy,
        start: bool,
    ) -> Result<Arc<Proxy>, ProxyError> {
        let mut proxies = self.proxies.lock().await;
        if let Some(existing) = proxies.remove(proxy.name()) {
            existing.stop().await;
            info!(name = %existing.name(), "Replaced proxy");
        }

        if start {
            proxy.start().await?;
        }

        let proxy = Arc::new(proxy);
        proxies.insert(proxy.name().to_string(), Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Create or replace a proxy for each record, in order.
    ///
    /// Every record is validated before any proxy is touched. If a start
    /// fails, proxies created earlier in the batch stay registered.
    pub async fn populate(&self, configs: &[ProxyConfig]) -> Result<Vec<Arc<Proxy>>, ProxyError> {
        for config in configs {
            config.validate()?;
        }

        let mut created = Vec::with_capacity(configs.len());
        for config in configs {
            let proxy = Proxy::from_config(config).with_udp_policy(self.udp_policy);
            created.push(self.add_or_replace(proxy, config.enabled).await?);
        }
        Ok(created)
    }

    /// [`populate`](Self::populate) from a JSON array of proxy records.
    pub async fn populate_json<R: Read>(&self, reader: R) -> Result<Vec<Arc<Proxy>>, ProxyError> {
        let configs: Vec<ProxyConfig> = serde_json::from_reader(reader)
            .map_err(|e| ProxyError::InvalidConfig(e.to_string()))?;
        self.populate(&configs).await
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Proxy>, ProxyError> {
        self.proxies
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::ProxyNotFound(name.to_string()))
    }

    /// Registered proxies sorted by name.
    pub async fn list(&self) -> Vec<Arc<Proxy>> {
        let mut proxies: Vec<Arc<Proxy>> = self.proxies.lock().await.values().cloned().collect();
        proxies.sort_by(|a, b| a.name().cmp(b.name()));
        proxies
    }

    /// Stop the proxy named `name` and drop it.
    pub async fn remove(&self, name: &str) -> Result<(), ProxyError> {
        let proxy = self
            .proxies
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| ProxyError::ProxyNotFound(name.to_string()))?;

        proxy.stop().await;
        info!(name = %name, "Removed proxy");
        Ok(())
    }

    /// Stop and drop every proxy.
    pub async fn clear(&self) {
        let drained: Vec<Arc<Proxy>> = self.proxies.lock().await.drain().map(|(_, p)| p).collect();
        for proxy in drained {
            proxy.stop().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.proxies.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.proxies.lock().await.is_empty()
    }
}
