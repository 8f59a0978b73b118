//! In-process network hub: delivers wire requests straight to the destination's
//! [`RequestHandler`], with configurable latency, packet loss and partitions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, trace};

use super::{Connection, Connector, RequestHandler, WireRequest, WireResponse};
use crate::error::TransportError;
use crate::types::{NodeConnectionInfo, NodeName};

/// 模拟网络行为的配置
#[derive(Debug, Clone)]
pub struct MemoryNetworkConfig {
    /// 基础延迟 (毫秒)
    pub base_latency_ms: u64,
    /// 额外随机延迟的最大值 (毫秒)
    pub jitter_max_ms: u64,
    /// 消息丢失的概率 (0.0 - 1.0)
    pub drop_rate: f64,
}

impl Default for MemoryNetworkConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 1,
            jitter_max_ms: 2,
            drop_rate: 0.0,
        }
    }
}

struct MemoryNetworkInner {
    handlers: DashMap<NodeName, Arc<RequestHandler>>,
    isolated: RwLock<HashSet<NodeName>>,
    config: RwLock<MemoryNetworkConfig>,
}

/// 模拟网络的中心枢纽
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<MemoryNetworkInner>,
}

impl MemoryNetwork {
    pub fn new(config: MemoryNetworkConfig) -> Self {
        Self {
            inner: Arc::new(MemoryNetworkInner {
                handlers: DashMap::new(),
                isolated: RwLock::new(HashSet::new()),
                config: RwLock::new(config),
            }),
        }
    }

    /// Makes a node reachable under its handler's name.
    pub fn register(&self, handler: RequestHandler) {
        info!("Registered node {} on the memory network", handler.name());
        self.inner
            .handlers
            .insert(handler.name().clone(), Arc::new(handler));
    }

    pub fn unregister(&self, name: &str) {
        self.inner.handlers.remove(name);
    }

    /// Cuts every link to and from `name`.
    pub fn isolate(&self, name: &str) {
        info!("Isolating node {}", name);
        self.inner.isolated.write().insert(name.to_string());
    }

    pub fn restore(&self, name: &str) {
        info!("Restoring node {}", name);
        self.inner.isolated.write().remove(name);
    }

    pub fn restore_all(&self) {
        self.inner.isolated.write().clear();
    }

    pub fn is_isolated(&self, name: &str) -> bool {
        self.inner.isolated.read().contains(name)
    }

    pub fn update_config(&self, config: MemoryNetworkConfig) {
        *self.inner.config.write() = config;
    }

    /// Connector used by node `from` to reach the others.
    pub fn connector(&self, from: impl Into<NodeName>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            from: from.into(),
            network: self.clone(),
        })
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        let isolated = self.inner.isolated.read();
        !isolated.contains(from) && !isolated.contains(to)
    }

    /// Latency for one delivery, or `None` when the request is lost.
    fn sample_delay(&self) -> Option<Duration> {
        let config = self.inner.config.read();
        let mut rng = rand::rng();
        if config.drop_rate > 0.0 && rng.random::<f64>() < config.drop_rate {
            return None;
        }
        let jitter = if config.jitter_max_ms > 0 {
            rng.random_range(0..=config.jitter_max_ms)
        } else {
            0
        };
        Some(Duration::from_millis(config.base_latency_ms + jitter))
    }
}

struct MemoryConnector {
    from: NodeName,
    network: MemoryNetwork,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        node: &NodeConnectionInfo,
    ) -> Result<Box<dyn Connection>, TransportError> {
        if !self.network.reachable(&self.from, &node.name) {
            return Err(TransportError::Network(format!(
                "{} cannot reach {}",
                self.from, node.name
            )));
        }
        Ok(Box::new(MemoryConnection {
            from: self.from.clone(),
            to: node.name.clone(),
            network: self.network.clone(),
        }))
    }
}

struct MemoryConnection {
    from: NodeName,
    to: NodeName,
    network: MemoryNetwork,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let unreachable = || {
            TransportError::Network(format!("{} cannot reach {}", self.from, self.to))
        };
        if !self.network.reachable(&self.from, &self.to) {
            return Err(unreachable());
        }

        let Some(delay) = self.network.sample_delay() else {
            debug!("Dropped {} from {} to {}", request.route, self.from, self.to);
            return Err(TransportError::Network(format!(
                "request to {} was lost",
                self.to
            )));
        };
        tokio::time::sleep(delay).await;

        let handler = self
            .network
            .inner
            .handlers
            .get(&self.to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Network(format!("{} is not listening", self.to)))?;
        trace!("Delivering {} from {} to {}", request.route, self.from, self.to);
        let response = handler.handle(request).await;

        // A partition that started while the request was in flight loses the reply.
        if !self.network.reachable(&self.from, &self.to) {
            return Err(unreachable());
        }
        Ok(response)
    }

    fn is_healthy(&self) -> bool {
        self.network.reachable(&self.from, &self.to)
    }
}
