use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use itertools::Itertools;
use serde::Serialize;
use serde_json::json;

use crate::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerKind {
    Mqtt,
    Tcp,
}

/// A running network instance.
#[async_trait]
pub trait Server: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ServerKind;

    fn total_connection(&self) -> usize;

    /// Closes the listener and every connection, then unregisters.
    async fn stop(&self);
}

/// Named server registry, owned by whoever starts the networks.
#[derive(Clone, Default)]
pub struct Servers {
    servers: Arc<DashMap<String, Arc<dyn Server>, ahash::RandomState>>,
}

impl Servers {
    pub fn register(&self, server: Arc<dyn Server>) -> Result<()> {
        match self.servers.entry(server.name().to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(GatewayError::ServerExists(e.key().clone()).into())
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(server);
                Ok(())
            }
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Server>> {
        self.servers.get(name).map(|s| s.value().clone())
    }

    #[inline]
    pub(crate) fn unregister(&self, name: &str) -> Option<Arc<dyn Server>> {
        self.servers.remove(name).map(|(_, s)| s)
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let server = self.get(name).ok_or_else(|| GatewayError::ServerNotFound(name.into()))?;
        server.stop().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let servers = self.servers.iter().map(|s| s.value().clone()).collect::<Vec<_>>();
        for server in servers {
            log::info!("stopping {}", server.name());
            server.stop().await;
        }
    }

    pub fn meters(&self, name: &str) -> Result<serde_json::Value> {
        let server = self.get(name).ok_or_else(|| GatewayError::ServerNotFound(name.into()))?;
        Ok(json!({ "TotalConnection": server.total_connection() }))
    }

    #[inline]
    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.key().clone()).sorted().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl fmt::Debug for Servers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Servers {:?}", self.names())
    }
}
