// Shared helpers for the loopback integration tests

#![allow(dead_code)]

use repcol_core::transport;
use repcol_core::{compress, derive_key, KeyOverrides, LifecycleManager, ManagerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Length of an INIT reply: `200-KEY=XXXX\r\n200 LEN=n`
const INIT_REPLY_LEN: usize = 23;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("repcol_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Start a server on an ephemeral loopback port
pub async fn start_server(config: ManagerConfig) -> (SocketAddr, Arc<LifecycleManager>) {
    init_tracing();
    let listener = transport::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind loopback listener");
    let addr = listener.local_addr().expect("Failed to read local address");
    let manager = Arc::new(LifecycleManager::new(config, KeyOverrides::default()));
    tokio::spawn(transport::serve(listener, manager.clone()));
    (addr, manager)
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A scripted legacy client
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pub crypto_key: String,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            crypto_key: String::new(),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("Failed to write line");
    }

    /// Next reply line without its terminator; empty at EOF
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for reply")
            .expect("Failed to read reply");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    pub async fn request(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_line().await
    }

    /// Send INIT and return the raw reply
    pub async fn init_raw(&mut self, host: &str, class_id: u8) -> String {
        self.send(&format!("INIT HST={} ATP=POS AVR=1.0 ID={}", host, class_id))
            .await;
        let mut reply = vec![0u8; INIT_REPLY_LEN];
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_exact(&mut reply))
            .await
            .expect("Timed out waiting for INIT reply")
            .expect("Failed to read INIT reply");
        String::from_utf8(reply).expect("INIT reply is not UTF-8")
    }

    /// INIT and derive the key the way a deployed client does
    pub async fn init(&mut self, host: &str, class_id: u8) -> (String, usize) {
        let reply = self.init_raw(host, class_id).await;
        let server_key = reply[8..12].to_string();
        let key_length: usize = reply[22..].parse().expect("Bad LEN in INIT reply");
        self.crypto_key =
            derive_key(&server_key, class_id, key_length, host).expect("Failed to derive key");
        (server_key, key_length)
    }

    /// INFO with the given client id; returns the reply line
    pub async fn info(&mut self, client_id: &str) -> String {
        let body = format!("TT=Test\r\nCID={}\r\nNAME=Register {}", client_id, client_id);
        let data = compress(&body, &self.crypto_key).expect("Failed to encrypt INFO body");
        self.request(&format!("INFO DATA={}", data)).await
    }

    /// Full handshake as class 3 from host PCAB
    pub async fn login(addr: SocketAddr, client_id: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.init("PCAB", 3).await;
        let reply = client.info(client_id).await;
        assert!(reply.starts_with("200 DATA="), "INFO failed: {}", reply);
        client
    }
}
