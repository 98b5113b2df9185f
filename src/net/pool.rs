//! Connection registry with concurrent fan-out

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::time::unix_millis;

use super::transport::Transport;
use super::{Packet, TransportError};

/// Longest a single peer's send may take before it counts as failed
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Identifier of one client channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for an accepted socket
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A registered client channel
pub struct Connection {
    pub id: ConnectionId,
    pub transport: Arc<dyn Transport>,
    pub added_at: u64,
}

/// Membership changes published by the pool
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Added(ConnectionId),
    Removed(ConnectionId),
    /// An add was refused because the pool is at capacity
    Full(ConnectionId),
}

/// Optional narrowing of a broadcast
#[derive(Default)]
pub struct BroadcastOptions<'a> {
    pub exclude: Option<&'a ConnectionId>,
    pub filter: Option<&'a (dyn Fn(&Connection) -> bool + Send + Sync)>,
}

/// Per-target outcome of a multi-target send
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanOutReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<ConnectionId>,
}

impl FanOutReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sole owner of the connection registry
pub struct ConnectionPool {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_connections: usize,
    send_timeout: Duration,
    // Serializes the capacity check with the insert
    admission: Mutex<()>,
    events: broadcast::Sender<PoolEvent>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connections: DashMap::new(),
            max_connections,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            admission: Mutex::new(()),
            events,
        }
    }

    /// Bound every per-peer send, so one stalled peer cannot hold up a fan-out
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Register a connection. Returns false when full or when the id is taken.
    pub fn add(&self, id: ConnectionId, transport: Arc<dyn Transport>) -> bool {
        let _admission = self.admission.lock();

        if self.connections.contains_key(&id) {
            warn!(conn_id = %id, "Refusing duplicate connection id");
            return false;
        }

        if self.connections.len() >= self.max_connections {
            warn!(
                conn_id = %id,
                max_connections = self.max_connections,
                "Connection pool full"
            );
            let _ = self.events.send(PoolEvent::Full(id));
            return false;
        }

        let connection = Arc::new(Connection {
            id: id.clone(),
            transport,
            added_at: unix_millis(),
        });
        self.connections.insert(id.clone(), connection);
        info!(conn_id = %id, total = self.connections.len(), "Connection added");
        let _ = self.events.send(PoolEvent::Added(id));
        true
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            info!(conn_id = %id, total = self.connections.len(), "Connection removed");
            let _ = self.events.send(PoolEvent::Removed(id.clone()));
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Send to every connection, minus the excluded id and anything the filter rejects
    pub async fn broadcast<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        options: BroadcastOptions<'_>,
    ) -> Result<FanOutReport, TransportError> {
        let packet = Packet::message(name, data)?;

        // Snapshot membership first so no map guard is held across an await
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|c| c.value().clone())
            .filter(|c| options.exclude != Some(&c.id))
            .filter(|c| options.filter.map_or(true, |f| f(c.as_ref())))
            .collect();

        let targets = targets.into_iter().map(|c| (c, packet.clone())).collect();
        Ok(send_all(targets, self.send_timeout).await)
    }

    /// Send to exactly one connection
    pub async fn unicast<T: Serialize>(
        &self,
        id: &ConnectionId,
        name: &str,
        data: &T,
    ) -> Result<bool, TransportError> {
        let packet = Packet::message(name, data)?;
        let Some(connection) = self.get(id) else {
            debug!(conn_id = %id, "Unicast to unknown connection");
            return Ok(false);
        };
        Ok(bounded_send(&connection, packet, self.send_timeout).await)
    }

    /// Send the same message to an explicit list of connections.
    /// Unknown ids are reported as failed.
    pub async fn multicast<T: Serialize>(
        &self,
        ids: &[ConnectionId],
        name: &str,
        data: &T,
    ) -> Result<FanOutReport, TransportError> {
        let packet = Packet::message(name, data)?;
        let targets = ids.iter().map(|id| (id.clone(), packet.clone())).collect();
        Ok(self.fan_out(targets).await)
    }

    /// Send a different packet to each target
    pub async fn fan_out(&self, targets: Vec<(ConnectionId, Packet)>) -> FanOutReport {
        let mut missing = Vec::new();
        let mut resolved = Vec::with_capacity(targets.len());
        for (id, packet) in targets {
            match self.get(&id) {
                Some(connection) => resolved.push((connection, packet)),
                None => missing.push(id),
            }
        }

        let mut report = send_all(resolved, self.send_timeout).await;
        report.failed.extend(missing);
        report
    }
}

/// A send that has not resolved by `limit` is abandoned and reported as failed
async fn bounded_send(connection: &Connection, packet: Packet, limit: Duration) -> bool {
    match tokio::time::timeout(limit, connection.transport.send(packet)).await {
        Ok(ok) => ok,
        Err(_) => {
            warn!(
                conn_id = %connection.id,
                timeout_ms = limit.as_millis() as u64,
                "Send timed out"
            );
            false
        }
    }
}

/// Issue every send before awaiting any of them
async fn send_all(targets: Vec<(Arc<Connection>, Packet)>, limit: Duration) -> FanOutReport {
    let sends = targets.into_iter().map(|(connection, packet)| async move {
        let ok = bounded_send(&connection, packet, limit).await;
        (connection.id.clone(), ok)
    });

    let mut report = FanOutReport::default();
    for (id, ok) in join_all(sends).await {
        if ok {
            report.delivered.push(id);
        } else {
            warn!(conn_id = %id, "Send failed");
            report.failed.push(id);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::{ChannelTransport, StalledTransport, TransportEvent};
    use serde_json::json;
    use std::time::Instant;

    /// Registers a server-side endpoint and keeps the client side for inspection
    fn attach(pool: &ConnectionPool, id: &str) -> (bool, ChannelTransport) {
        let (server, client) = ChannelTransport::pair();
        (pool.add(id.into(), Arc::new(server)), client)
    }

    fn drain(rx: &mut broadcast::Receiver<TransportEvent>) -> usize {
        let mut n = 0;
        while let Ok(TransportEvent::Message(_)) = rx.try_recv() {
            n += 1;
        }
        n
    }

    #[test]
    fn capacity_is_enforced() {
        let pool = ConnectionPool::new(2);
        let mut events = pool.subscribe();
        assert!(attach(&pool, "a").0);
        assert!(attach(&pool, "b").0);
        assert!(!attach(&pool, "c").0);
        assert_eq!(pool.len(), 2);

        assert_eq!(events.try_recv().unwrap(), PoolEvent::Added("a".into()));
        assert_eq!(events.try_recv().unwrap(), PoolEvent::Added("b".into()));
        assert_eq!(events.try_recv().unwrap(), PoolEvent::Full("c".into()));
    }

    #[test]
    fn duplicate_ids_are_refused_and_readd_works() {
        let pool = ConnectionPool::new(4);
        assert!(attach(&pool, "a").0);
        assert!(!attach(&pool, "a").0);
        assert_eq!(pool.len(), 1);

        assert!(pool.remove(&"a".into()).is_some());
        assert!(pool.remove(&"a".into()).is_none());
        assert!(attach(&pool, "a").0);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded() {
        let pool = ConnectionPool::new(8);
        let (_, a) = attach(&pool, "a");
        let (_, x) = attach(&pool, "X");
        let mut rx_a = a.subscribe();
        let mut rx_x = x.subscribe();

        let excluded = ConnectionId::from("X");
        let report = pool
            .broadcast(
                "chat",
                &json!("hi"),
                BroadcastOptions {
                    exclude: Some(&excluded),
                    filter: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![ConnectionId::from("a")]);
        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_x), 0);
    }

    #[tokio::test]
    async fn broadcast_filter_and_failures_are_reported() {
        let pool = ConnectionPool::new(8);
        let (_, _a) = attach(&pool, "a");
        let (_, b) = attach(&pool, "b");
        let (_, _c) = attach(&pool, "c");
        b.disconnect().await;

        let skip_c = |c: &Connection| c.id.as_str() != "c";
        let mut report = pool
            .broadcast(
                "tick",
                &json!(1),
                BroadcastOptions {
                    exclude: None,
                    filter: Some(&skip_c),
                },
            )
            .await
            .unwrap();
        report.delivered.sort();

        assert_eq!(report.delivered, vec![ConnectionId::from("a")]);
        assert_eq!(report.failed, vec![ConnectionId::from("b")]);
        assert!(!report.all_delivered());
    }

    #[tokio::test]
    async fn unicast_and_multicast() {
        let pool = ConnectionPool::new(8);
        let (_, a) = attach(&pool, "a");
        let (_, b) = attach(&pool, "b");
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        assert!(pool.unicast(&"a".into(), "hello", &json!(null)).await.unwrap());
        assert!(!pool.unicast(&"zz".into(), "hello", &json!(null)).await.unwrap());
        assert_eq!(drain(&mut rx_a), 1);
        assert_eq!(drain(&mut rx_b), 0);

        let report = pool
            .multicast(&["b".into(), "ghost".into()], "m", &json!(2))
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![ConnectionId::from("b")]);
        assert_eq!(report.failed, vec![ConnectionId::from("ghost")]);
        assert_eq!(drain(&mut rx_b), 1);
    }

    #[tokio::test]
    async fn stalled_peer_fails_without_blocking_others() {
        let pool = ConnectionPool::new(8).with_send_timeout(Duration::from_millis(50));
        let (_, a) = attach(&pool, "a");
        assert!(pool.add("stuck".into(), Arc::new(StalledTransport)));
        let mut rx_a = a.subscribe();

        let started = Instant::now();
        let report = pool
            .broadcast("tick", &json!(1), BroadcastOptions::default())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(report.delivered, vec![ConnectionId::from("a")]);
        assert_eq!(report.failed, vec![ConnectionId::from("stuck")]);
        assert_eq!(drain(&mut rx_a), 1);

        assert!(!pool.unicast(&"stuck".into(), "hello", &json!(null)).await.unwrap());
    }
}
