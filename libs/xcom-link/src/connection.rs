//! Xcom gateway connection
//!
//! Opens the single TCP stream a link runs on, either by dialing the gateway
//! or by accepting the gateway's own outgoing connection.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use xcom_protocol::{Result, XcomError};

use crate::config::{LinkConfig, LinkMode};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("TCP_NODELAY: {}", e);
    }
}

fn next_backoff(delay: Duration) -> Duration {
    delay.saturating_mul(2).min(MAX_BACKOFF)
}

/// Dial `addr` once
pub async fn connect_tcp(addr: &str, timeout_duration: Duration) -> Result<TcpStream> {
    debug!("TCP connecting: {}", addr);

    match timeout(timeout_duration, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            configure(&stream);
            info!("TCP connected: {}", addr);
            Ok(stream)
        },
        Ok(Err(e)) => {
            error!("TCP err: {} - {}", addr, e);
            Err(XcomError::connect(format!("Failed to connect to {addr}: {e}")))
        },
        Err(_) => {
            warn!("TCP timeout: {}", addr);
            Err(XcomError::connect(format!("Connection to {addr} timed out")))
        },
    }
}

/// Dial with exponential backoff
pub async fn connect_with_retry(
    addr: &str,
    timeout_duration: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
) -> Result<TcpStream> {
    let mut attempts = 0;
    let mut delay = initial_backoff.min(MAX_BACKOFF);

    loop {
        match connect_tcp(addr, timeout_duration).await {
            Ok(stream) => {
                info!("Connected (#{} attempts)", attempts + 1);
                return Ok(stream);
            },
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    error!("Giving up after {} attempts: {}", attempts, e);
                    return Err(e);
                }

                warn!(
                    "Retry {}/{}: {} ({}ms)",
                    attempts,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                sleep(delay).await;
                delay = next_backoff(delay);
            },
        }
    }
}

/// Bound socket waiting for the gateway to dial in
#[derive(Debug)]
pub struct GatewayListener {
    listener: TcpListener,
}

impl GatewayListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| XcomError::connect(format!("Failed to bind {addr}: {e}")))?;
        info!("Listening for gateway on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the first gateway connection
    pub async fn accept(&self, timeout_duration: Duration) -> Result<TcpStream> {
        match timeout(timeout_duration, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                configure(&stream);
                info!("Gateway connected from {}", peer);
                Ok(stream)
            },
            Ok(Err(e)) => {
                error!("Accept err: {}", e);
                Err(XcomError::connect(format!("Accept failed: {e}")))
            },
            Err(_) => {
                warn!("No gateway connection within {:?}", timeout_duration);
                Err(XcomError::connect("No gateway connected before timeout"))
            },
        }
    }
}

/// Open the stream described by `config`
pub async fn open(config: &LinkConfig) -> Result<TcpStream> {
    let endpoint = config.endpoint();
    match config.mode {
        LinkMode::Connect => {
            connect_with_retry(
                &endpoint,
                config.connect_timeout(),
                config.connect_attempts,
                config.connect_backoff(),
            )
            .await
        },
        LinkMode::Listen => {
            let listener = GatewayListener::bind(&endpoint).await?;
            listener.accept(config.connect_timeout()).await
        },
    }
}
