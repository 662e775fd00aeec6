//! Minimal memcached text-protocol client
//!
//! Only `version` (used as a ping) and `set` are spoken. Connections are
//! opened lazily into a fixed number of slots and thrown away after any
//! transport error. A request that fails on a reused connection is sent
//! again once on a fresh one, since the server may have closed it while idle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::CacheClient;
use crate::error::CacheError;

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

type Connection = BufStream<TcpStream>;

/// Pooled client for one memcached address
pub struct MemcacheClient {
    address: String,
    timeout: Duration,
    slots: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
}

impl MemcacheClient {
    /// `pool_size` connections at most are kept open to `address`; every
    /// network step is bounded by `timeout`.
    pub fn new(address: impl Into<String>, pool_size: usize, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            slots: (0..pool_size.max(1)).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Connection, CacheError> {
        let stream = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| CacheError::unreachable(&self.address, "connect timed out"))?
            .map_err(|e| CacheError::unreachable(&self.address, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CacheError::unreachable(&self.address, e))?;

        debug!(address = %self.address, "Opened memcached connection");
        Ok(BufStream::new(stream))
    }

    /// Lock a pool slot, preferring one no other request holds.
    async fn checkout(&self) -> MutexGuard<'_, Option<Connection>> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let len = self.slots.len();
        for offset in 0..len {
            if let Ok(slot) = self.slots[(start + offset) % len].try_lock() {
                return slot;
            }
        }
        self.slots[start % len].lock().await
    }

    /// Send `request` and return the first reply line without its terminator.
    ///
    /// A pooled connection may have been closed by the server since its last
    /// use. When a reused connection fails with an I/O error the request is
    /// sent once more on a fresh connection.
    async fn round_trip(&self, request: &[u8]) -> Result<String, CacheError> {
        let mut slot = self.checkout().await;
        let reused = slot.is_some();
        if !reused {
            *slot = Some(self.connect().await?);
        }

        match self.exchange(&mut slot, request).await {
            Ok(line) => Ok(line),
            Err(Exchange::Io(e)) if reused => {
                debug!(address = %self.address, "Pooled connection is stale ({}), reconnecting", e);
                *slot = Some(self.connect().await?);
                self.exchange(&mut slot, request)
                    .await
                    .map_err(|failure| self.unreachable(failure))
            },
            Err(failure) => Err(self.unreachable(failure)),
        }
    }

    /// One request/reply on the slot's connection; the connection is dropped on failure.
    async fn exchange(&self, slot: &mut Option<Connection>, request: &[u8]) -> Result<String, Exchange> {
        let Some(stream) = slot.as_mut() else {
            return Err(Exchange::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no connection",
            )));
        };

        let io = async {
            stream.write_all(request).await?;
            stream.flush().await?;
            let mut line = String::new();
            if stream.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ));
            }
            Ok(line)
        };
        let result = timeout(self.timeout, io).await;

        match result {
            Ok(Ok(line)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => {
                *slot = None;
                Err(Exchange::Io(e))
            },
            Err(_) => {
                *slot = None;
                Err(Exchange::TimedOut)
            },
        }
    }

    fn unreachable(&self, failure: Exchange) -> CacheError {
        match failure {
            Exchange::Io(e) => CacheError::unreachable(&self.address, e),
            Exchange::TimedOut => CacheError::unreachable(&self.address, "request timed out"),
        }
    }
}

enum Exchange {
    Io(std::io::Error),
    TimedOut,
}

#[async_trait]
impl CacheClient for MemcacheClient {
    async fn ping(&self) -> Result<(), CacheError> {
        let reply = self.round_trip(b"version\r\n").await?;
        if reply.starts_with("VERSION") {
            Ok(())
        } else {
            Err(CacheError::rejected(&self.address, reply))
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut request = Vec::with_capacity(key.len() + value.len() + 32);
        request.extend_from_slice(format!("set {} 0 0 {}\r\n", key, value.len()).as_bytes());
        request.extend_from_slice(value);
        request.extend_from_slice(b"\r\n");

        let reply = self.round_trip(&request).await?;
        trace!(address = %self.address, key, reply = %reply, "memcached set");

        if reply == "STORED" {
            Ok(())
        } else {
            Err(CacheError::rejected(&self.address, reply))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Serve one connection: answer `version`, then answer a single `set`
    /// with `set_reply`. Returns the key and payload the client sent.
    async fn spawn_server(set_reply: &'static str) -> (String, tokio::task::JoinHandle<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);

            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line, "version\r\n");
            socket.get_mut().write_all(b"VERSION 1.6.21\r\n").await.unwrap();

            line.clear();
            socket.read_line(&mut line).await.unwrap();
            let parts: Vec<&str> = line.trim_end().split(' ').collect();
            assert_eq!(parts[0], "set");
            let key = parts[1].to_string();
            let len: usize = parts[4].parse().unwrap();

            let mut payload = vec![0u8; len + 2];
            socket.read_exact(&mut payload).await.unwrap();
            payload.truncate(len);
            socket.get_mut().write_all(set_reply.as_bytes()).await.unwrap();

            (key, payload)
        });

        (address, handle)
    }

    #[tokio::test]
    async fn test_ping_and_set() {
        let (address, server) = spawn_server("STORED\r\n").await;
        let client = MemcacheClient::new(&address, 1, Duration::from_secs(2));

        client.ping().await.unwrap();
        client.set("idfa:abc123", &[1, 2, 3]).await.unwrap();

        let (key, payload) = server.await.unwrap();
        assert_eq!(key, "idfa:abc123");
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_server_error_is_rejection() {
        let (address, server) = spawn_server("SERVER_ERROR out of memory storing object\r\n").await;
        let client = MemcacheClient::new(&address, 1, Duration::from_secs(2));

        client.ping().await.unwrap();
        let err = client.set("idfa:abc123", b"payload").await.unwrap_err();

        assert!(matches!(
            err,
            CacheError::Rejected { ref response, .. } if response.starts_with("SERVER_ERROR")
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = MemcacheClient::new(&address, 2, Duration::from_millis(500));
        let err = client.ping().await.unwrap_err();

        assert!(matches!(err, CacheError::Unreachable { .. }));
        assert_eq!(client.address(), address);
    }

    /// Accept any number of connections. The first one answers a single
    /// request and is then closed by the server; later ones behave.
    async fn spawn_closing_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let index = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        if socket.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        if line.starts_with("set ") {
                            let len: usize = line.trim_end().split(' ').nth(4).unwrap().parse().unwrap();
                            let mut payload = vec![0u8; len + 2];
                            socket.read_exact(&mut payload).await.unwrap();
                            socket.get_mut().write_all(b"STORED\r\n").await.unwrap();
                        } else {
                            socket.get_mut().write_all(b"VERSION 1.6.21\r\n").await.unwrap();
                        }
                        if index == 0 {
                            return;
                        }
                    }
                });
            }
        });

        (address, accepted)
    }

    #[tokio::test]
    async fn test_set_after_server_closed_idle_connection() {
        let (address, accepted) = spawn_closing_server().await;
        let client = MemcacheClient::new(&address, 1, Duration::from_secs(2));

        client.ping().await.unwrap();
        // give the server time to close the pooled connection
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.set("idfa:abc123", b"payload").await.unwrap();

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        client.ping().await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_checkout_skips_busy_slot() {
        let client = MemcacheClient::new("127.0.0.1:1", 2, Duration::from_secs(1));

        let busy = client.slots[0].lock().await;
        let free = timeout(Duration::from_millis(100), client.checkout()).await;
        assert!(free.is_ok());
        drop(free);

        let other = client.slots[1].lock().await;
        let blocked = timeout(Duration::from_millis(100), client.checkout()).await;
        assert!(blocked.is_err());

        drop(busy);
        drop(other);
    }
}
