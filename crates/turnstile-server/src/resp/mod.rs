mod cmd;
mod connection;
#[cfg(test)]
mod fake;

use async_trait::async_trait;
use bytes::Bytes;
use cmd::Command;
use connection::RespConnection;
use parking_lot::Mutex;
use redis_protocol::resp2::types::BytesFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use turnstile_core::store::ttl_seconds;
use turnstile_core::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
pub struct RespSettings {
    pub addr: String,
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

/// Key-value store backed by a RESP2 server (Redis or compatible), reached
/// through a bounded pool of long-lived connections.
///
/// At most `pool_size` connections exist at once. A request task checks one
/// out, runs a single command under `io_timeout`, and hands it back. A
/// connection whose command failed, timed out or was cancelled is dropped
/// instead of returned, and the next checkout dials a fresh one.
pub struct RespStore {
    settings: RespSettings,
    idle: Mutex<Vec<RespConnection>>,
    permits: Arc<Semaphore>,
}

/// Checked-out connection. Returned to the idle list on drop only when its
/// last command completed.
struct PooledConnection<'a> {
    pool: &'a RespStore,
    conn: Option<RespConnection>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if !self.reusable || self.pool.permits.is_closed() {
            return;
        }
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

impl RespStore {
    pub fn new(settings: RespSettings) -> Self {
        let pool_size = settings.pool_size.max(1);
        tracing::info!(
            addr = %settings.addr,
            pool_size,
            connect_timeout_ms = settings.connect_timeout.as_millis() as u64,
            io_timeout_ms = settings.io_timeout.as_millis() as u64,
            "RESP store pool created"
        );
        Self {
            settings,
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    /// Stop handing out connections and drop the idle ones. In-flight
    /// commands finish; their connections are discarded afterwards.
    pub fn close(&self) {
        self.permits.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        tracing::info!(connections = drained.len(), "RESP store pool closed");
    }

    #[cfg(test)]
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    async fn checkout(&self) -> Result<PooledConnection<'_>, StoreError> {
        let permit = tokio::time::timeout(
            self.settings.io_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StoreError::Timeout { op: "checkout" })?
        .map_err(|_| StoreError::Closed)?;

        // Lock released before any await.
        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                tracing::debug!(addr = %self.settings.addr, "opening RESP connection");
                tokio::time::timeout(
                    self.settings.connect_timeout,
                    RespConnection::connect(&self.settings.addr),
                )
                .await
                .map_err(|_| StoreError::Timeout { op: "connect" })??
            }
        };

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            reusable: false,
            _permit: permit,
        })
    }

    async fn execute(&self, command: Command) -> Result<BytesFrame, StoreError> {
        let mut pooled = self.checkout().await?;
        let conn = pooled.conn.as_mut().ok_or(StoreError::Closed)?;

        let reply = tokio::time::timeout(self.settings.io_timeout, conn.request(command.frame()))
            .await
            .map_err(|_| StoreError::Timeout { op: command.op })??;

        pooled.reusable = true;
        Ok(reply)
    }
}

#[async_trait]
impl KeyValueStore for RespStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        cmd::parse_get(self.execute(cmd::get(key)).await?)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let reply = self
            .execute(cmd::set_ex(key, value, ttl_seconds(ttl)))
            .await?;
        cmd::parse_ok(reply, "SET")
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let reply = self
            .execute(cmd::set_nx_ex(key, value, ttl_seconds(ttl)))
            .await?;
        cmd::parse_set_nx(reply)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = cmd::parse_integer(self.execute(cmd::del(key)).await?, "DEL")?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        cmd::parse_pong(self.execute(cmd::ping()).await?)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::FakeServer;

    const MINUTE: Duration = Duration::from_secs(60);

    fn settings(addr: String) -> RespSettings {
        RespSettings {
            addr,
            pool_size: 4,
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn round_trips_through_a_resp_server() {
        let server = FakeServer::start().await;
        let store = RespStore::new(settings(server.addr()));

        store.ping().await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        store
            .set_with_expiry("k", Bytes::from_static(b"v"), MINUTE)
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.name(), "redis");
    }

    #[tokio::test]
    async fn conditional_set_is_first_writer_wins() {
        let server = FakeServer::start().await;
        let store = RespStore::new(settings(server.addr()));

        assert!(store
            .set_if_absent("idem:x", Bytes::from_static(b"a"), MINUTE)
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("idem:x", Bytes::from_static(b"b"), MINUTE)
            .await
            .unwrap());
        assert_eq!(
            store.get("idem:x").await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );
        assert_eq!(server.last_ttl("idem:x"), Some(60));
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let server = FakeServer::start().await;
        let store = RespStore::new(settings(server.addr()));

        for _ in 0..10 {
            store.ping().await.unwrap();
        }
        assert_eq!(server.connections(), 1);
        assert_eq!(store.idle_connections(), 1);
    }

    #[tokio::test]
    async fn pool_is_bounded_under_concurrency() {
        let server = FakeServer::start().await;
        let store = Arc::new(RespStore::new(settings(server.addr())));

        let mut handles = vec![];
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_with_expiry(&format!("k{i}"), Bytes::from_static(b"v"), MINUTE)
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(server.connections() <= 4);
    }

    #[tokio::test]
    async fn error_replies_surface_as_unavailable() {
        let server = FakeServer::start().await;
        let store = RespStore::new(settings(server.addr()));

        server.fail_next_with("ERR injected");
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(ref m) if m == "ERR injected"));

        // The connection is still usable after an error reply.
        store.ping().await.unwrap();
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn unresponsive_server_times_out_and_connection_is_discarded() {
        let server = FakeServer::start().await;
        let store = RespStore::new(RespSettings {
            io_timeout: Duration::from_millis(50),
            ..settings(server.addr())
        });

        server.stall_next();
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { op: "GET" }));
        assert_eq!(store.idle_connections(), 0);

        store.ping().await.unwrap();
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let store = RespStore::new(settings(addr));
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    async fn closed_pool_refuses_work() {
        let server = FakeServer::start().await;
        let store = RespStore::new(settings(server.addr()));
        store.ping().await.unwrap();

        store.close();
        assert_eq!(store.idle_connections(), 0);
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    }
}
