//! Transport boundary

use beacon_core::{BeaconError, InstanceAddress, Result};
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

/// An established outbound connection
pub trait Connection: Send + Sync + 'static {
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens connections to resolved instances
pub trait Dialer: Send + Sync + 'static {
    type Connection: Connection;

    fn dial(
        &self,
        instance: &InstanceAddress,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// Plain TCP dialer with a connect timeout
#[derive(Clone, Debug)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Dialer for TcpDialer {
    type Connection = TcpConnection;

    async fn dial(&self, instance: &InstanceAddress) -> Result<TcpConnection> {
        let failed = |reason: String| BeaconError::DialFailed {
            service: instance.server_name.clone(),
            addr: instance.addr.clone(),
            reason,
        };

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&instance.addr))
            .await
            .map_err(|_| failed(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| failed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| failed(format!("set TCP_NODELAY: {e}")))?;

        Ok(TcpConnection {
            peer: instance.clone(),
            stream: Mutex::new(Some(stream)),
        })
    }
}

/// TCP stream to one instance
pub struct TcpConnection {
    peer: InstanceAddress,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConnection {
    pub fn peer(&self) -> &InstanceAddress {
        &self.peer
    }

    /// Exclusive access to the stream; `None` once closed
    pub async fn stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().await
    }

    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }
}

impl Connection for TcpConnection {
    async fn close(&self) -> Result<()> {
        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .finish()
    }
}
