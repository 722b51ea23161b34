//! TCP connect/accept helpers.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::debug;

/// Well-known snapvault port.
pub const DEFAULT_PORT: u16 = 20406;

/// `host` or `host:port`, with IPv6 literals in brackets.
fn with_default_port(address: &str) -> String {
    let has_port = match address.rsplit_once(':') {
        // `[::1]:20406` or `host:20406`, but not a bare `::1`.
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        address.to_string()
    } else if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, DEFAULT_PORT)
    } else {
        format!("{}:{}", address, DEFAULT_PORT)
    }
}

/// Resolve a configured remote address to every candidate socket address.
pub async fn resolve(address: &str) -> Result<Vec<SocketAddr>> {
    let target = with_default_port(address);
    let addrs: Vec<SocketAddr> = lookup_host(&target)
        .await
        .with_context(|| format!("Failed to resolve {}", target))?
        .collect();
    if addrs.is_empty() {
        anyhow::bail!("{} resolved to no addresses", target);
    }
    Ok(addrs)
}

/// Connect to `address`, trying each resolved address in turn.
pub async fn connect(address: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in resolve(address).await? {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "connect failed");
                last_err = Some(anyhow::Error::from(e).context(format!("connect to {}", addr)));
            }
            Err(_) => {
                debug!(%addr, "connect timed out");
                last_err = Some(anyhow::anyhow!("connect to {} timed out", addr));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no address to connect to for {}", address)))
}

/// Bind the daemon listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("backup01"), "backup01:20406");
        assert_eq!(with_default_port("backup01:9000"), "backup01:9000");
        assert_eq!(with_default_port("::1"), "[::1]:20406");
        assert_eq!(with_default_port("[::1]:9000"), "[::1]:9000");
        assert_eq!(with_default_port("[::1]"), "[::1]:20406");
    }

    #[tokio::test]
    async fn test_connect_loopback() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let stream = connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then close it.
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(connect(&addr.to_string(), Duration::from_secs(2)).await.is_err());
    }
}
