//! Checks that a bound tunnel port actually forwards to Postgres
//!
//! A port can be held by anything. The probes here tell a live tunnel apart
//! from an unrelated listener or a tunnel whose upstream is broken.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scribedb_core::{ConnectSettings, TUNNEL_HOST};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ProbeError;

/// Postgres SSLRequest: length 8 followed by the magic code 80877103
const SSL_REQUEST: [u8; 8] = [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f];

#[async_trait]
pub trait TunnelProbe: Send + Sync {
    async fn check(&self, port: u16) -> Result<(), ProbeError>;
}

/// Protocol-level check that needs no credentials.
///
/// Sends an SSLRequest and expects the single-byte `S`/`N` answer a Postgres
/// server gives. A tunnel that cannot reach its instance closes the socket.
#[derive(Debug, Clone)]
pub struct HandshakeProbe {
    timeout: Duration,
}

impl HandshakeProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn handshake(port: u16) -> Result<(), ProbeError> {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(ProbeError::Connect)?;
        stream
            .write_all(&SSL_REQUEST)
            .await
            .map_err(ProbeError::Connect)?;

        let mut reply = [0u8; 1];
        let read = stream.read(&mut reply).await.map_err(ProbeError::Connect)?;
        match (read, reply[0]) {
            (0, _) => Err(ProbeError::Protocol("connection closed before reply".into())),
            (_, b'S') | (_, b'N') => Ok(()),
            (_, other) => Err(ProbeError::Protocol(format!(
                "expected S or N, got 0x{:02x}",
                other
            ))),
        }
    }
}

#[async_trait]
impl TunnelProbe for HandshakeProbe {
    async fn check(&self, port: u16) -> Result<(), ProbeError> {
        tokio::time::timeout(self.timeout, Self::handshake(port))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}

/// Full check: authenticate through the tunnel and run `SELECT 1`
#[derive(Debug, Clone)]
pub struct SqlProbe {
    user: String,
    password: String,
    database: String,
    timeout: Duration,
}

impl SqlProbe {
    pub fn new(settings: &ConnectSettings, timeout: Duration) -> Self {
        Self {
            user: settings.user.clone(),
            password: settings.password.clone(),
            database: settings.database.clone(),
            timeout,
        }
    }

    async fn select_one(&self, port: u16) -> Result<(), ProbeError> {
        let mut conn = PgConnectOptions::new()
            .host(TUNNEL_HOST)
            .port(port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(PgSslMode::Disable)
            .connect()
            .await
            .map_err(|e| ProbeError::Query(e.to_string()))?;

        let result = sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| ProbeError::Query(e.to_string()));
        let _ = conn.close().await;
        result.map(|_| ())
    }
}

#[async_trait]
impl TunnelProbe for SqlProbe {
    async fn check(&self, port: u16) -> Result<(), ProbeError> {
        tokio::time::timeout(self.timeout, self.select_one(port))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
    }
}

/// Scripted probe for tests
#[derive(Debug, Default)]
pub struct MockProbe {
    healthy: AtomicBool,
    calls: AtomicUsize,
}

impl MockProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelProbe for MockProbe {
    async fn check(&self, _port: u16) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeError::Protocol("mock probe configured unhealthy".into()))
        }
    }
}
