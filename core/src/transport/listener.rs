//! TCP accept loop and connection worker.
//!
//! One task per accepted socket. The task owns the read half; the write half
//! moves into the session so replies and takeover closes go through the same
//! serialized writer.

use super::TransportError;
use crate::registry::LifecycleManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept, so a persistent fault does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of reading one line
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Eof,
    TooLong,
}

/// Read up to and including the next `\n` into `buf`, refusing lines longer
/// than `limit` bytes.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = reader
        .take((limit as u64).saturating_add(1))
        .read_until(b'\n', buf)
        .await?;

    if read == 0 {
        Ok(LineRead::Eof)
    } else if buf.ends_with(b"\n") || buf.len() <= limit {
        Ok(LineRead::Line)
    } else {
        Ok(LineRead::TooLong)
    }
}

/// Bind the client listener. Failure here is fatal for the server.
pub async fn bind(addr: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr).await.map_err(|source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Accept clients forever, one task each. Accept errors are logged and the
/// loop keeps going.
pub async fn serve(listener: TcpListener, manager: Arc<LifecycleManager>) {
    let local_port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!("Accepting legacy clients on port {}", local_port);

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", remote, e);
                }
                let manager = manager.clone();
                tokio::spawn(async move {
                    handle_connection(stream, remote, local_port, manager).await;
                });
            }
            Err(e) => {
                error!("{}", TransportError::Accept(e));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Drive one client connection until EOF, a read or write error, an
/// oversized line, or the session being closed from elsewhere.
pub async fn handle_connection<S>(stream: S, remote: SocketAddr, local_port: u16, manager: Arc<LifecycleManager>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let session = manager.open_session(remote, local_port, Box::new(write_half));
    let limit = manager.config().max_line_bytes;

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);

    loop {
        let read = tokio::select! {
            read = read_line(&mut reader, &mut buf, limit) => read,
            _ = session.closed() => break,
        };

        match read {
            Ok(LineRead::Line) => {}
            Ok(LineRead::Eof) => {
                debug!("{} disconnected", session.label());
                break;
            }
            Ok(LineRead::TooLong) => {
                warn!("{} sent a line over {} bytes; dropping connection", session.label(), limit);
                break;
            }
            Err(e) => {
                debug!("Read from {} failed: {}", session.label(), e);
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        trace!("<- {}: {}", session.label(), line);

        let reply = manager.handle_line(&session, line).await;
        if let Err(e) = session.send(&reply).await {
            debug!("Write to {} failed: {}", session.label(), e);
            break;
        }
    }

    manager.close_session(&session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::crypto::KeyOverrides;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_line_variants() {
        let data: &[u8] = b"PING\r\nlast";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert_eq!(read_line(&mut reader, &mut buf, 64).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"PING\r\n");
        assert_eq!(read_line(&mut reader, &mut buf, 64).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"last");
        assert_eq!(read_line(&mut reader, &mut buf, 64).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn test_read_line_limit() {
        let data: &[u8] = b"0123456789\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        assert_eq!(read_line(&mut reader, &mut buf, 4).await.unwrap(), LineRead::TooLong);

        let data: &[u8] = b"0123\n";
        let mut reader = BufReader::new(data);
        assert_eq!(read_line(&mut reader, &mut buf, 4).await.unwrap(), LineRead::Line);
    }

    #[tokio::test]
    async fn test_read_line_unbounded_limit() {
        let data: &[u8] = b"PING\r\n";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();
        assert_eq!(read_line(&mut reader, &mut buf, usize::MAX).await.unwrap(), LineRead::Line);
        assert_eq!(buf, b"PING\r\n");
    }

    #[tokio::test]
    async fn test_connection_over_pipe() {
        let manager = Arc::new(LifecycleManager::new(ManagerConfig::default(), KeyOverrides::default()));
        let (server_side, mut client) = tokio::io::duplex(4096);
        let addr: SocketAddr = "192.168.1.20:50000".parse().unwrap();

        let worker = tokio::spawn(handle_connection(server_side, addr, 4000, manager.clone()));

        client.write_all(b"PING\r\n\r\nbogus\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "200\r\n503 Unknown command BOGUS\r\n");

        worker.await.unwrap();
        assert_eq!(manager.registry().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_line_drops_connection() {
        let config = ManagerConfig {
            max_line_bytes: 16,
            ..ManagerConfig::default()
        };
        let manager = Arc::new(LifecycleManager::new(config, KeyOverrides::default()));
        let (server_side, mut client) = tokio::io::duplex(4096);
        let addr: SocketAddr = "192.168.1.21:50000".parse().unwrap();

        let worker = tokio::spawn(handle_connection(server_side, addr, 4000, manager.clone()));
        client.write_all(&[b'A'; 64]).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        worker.await.unwrap();
        assert_eq!(manager.registry().pending_count(), 0);
    }
}
