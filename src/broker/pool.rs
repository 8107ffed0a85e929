//! Connection pool
//!
//! Holds one connection per configured broker endpoint. The set is replaced
//! wholesale on (re)initialization and emptied on teardown; readers always
//! see a consistent snapshot.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::balance::LoadBalance;
use crate::broker::dispatcher::InboundDispatcher;
use crate::transport::{Connection, Endpoint, Transport};
use crate::utils::{MqError, Result};

#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: RwLock<Vec<Connection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open one connection per endpoint, replacing the current set. Each
    /// connection's inbound stream is driven by `dispatcher`.
    ///
    /// Returns the number of connections opened. With `verify_reachability`
    /// set, opening none is an error.
    pub async fn initialize(
        &self,
        endpoints: &[Endpoint],
        transport: &dyn Transport,
        dispatcher: &Arc<InboundDispatcher>,
        max_frame_length: usize,
        verify_reachability: bool,
    ) -> Result<usize> {
        self.teardown();

        let mut opened = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match transport.connect(endpoint).await {
                Ok(stream) => {
                    let (conn, inbound) = Connection::open(endpoint.clone(), stream, max_frame_length);
                    tokio::spawn(dispatcher.clone().run(conn.clone(), inbound));
                    info!("connected to broker {} as {}", endpoint, conn.id());
                    opened.push(conn);
                }
                Err(e) => warn!("failed to connect to broker {}: {}", endpoint, e),
            }
        }

        if opened.is_empty() && verify_reachability {
            let all = endpoints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            return Err(MqError::NoReachableBroker(all));
        }

        let count = opened.len();
        *self.connections.write() = opened;
        Ok(count)
    }

    /// Pick a live connection with `balancer`. Torn-down connections are
    /// never returned.
    pub fn select(&self, balancer: &dyn LoadBalance, key: Option<&str>) -> Result<Connection> {
        let live: Vec<Connection> = self
            .connections
            .read()
            .iter()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect();
        let weights: Vec<u32> = live.iter().map(|c| c.endpoint().weight).collect();
        balancer
            .select(&weights, key)
            .and_then(|i| live.get(i).cloned())
            .ok_or_else(|| MqError::NoReachableBroker("no live connection in pool".into()))
    }

    pub fn all(&self) -> Vec<Connection> {
        self.connections.read().clone()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().iter().any(|c| c.id() == connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close and forget every connection. Closing never fails.
    pub fn teardown(&self) {
        let connections = std::mem::take(&mut *self.connections.write());
        for conn in connections {
            info!("closing connection {} to {}", conn.id(), conn.endpoint());
            conn.close();
        }
    }
}
