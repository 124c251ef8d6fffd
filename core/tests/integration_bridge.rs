// Integration test: report requests bridged to a polling client over TCP

mod common;

use common::{start_server, wait_until, TestClient};
use repcol_core::{decompress, BridgeError, ManagerConfig};
use std::time::Duration;

#[tokio::test]
async fn test_report_request_roundtrip() {
    let (addr, manager) = start_server(ManagerConfig::default()).await;
    let mut client = TestClient::login(addr, "STORE-7").await;

    assert_eq!(client.request("GREQ").await, "200");

    let caller = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_request("STORE-7", "TT=Test\r\nRPT=DailySales", Duration::from_secs(5))
                .await
        })
    };

    // Poll like a deployed client until work shows up
    let work = loop {
        let reply = client.request("GREQ").await;
        if reply != "200" {
            break reply;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let data = work.strip_prefix("200 CMD=1 DATA=").expect("first request has sequence 1");
    let request = decompress(data, &client.crypto_key).expect("Failed to decrypt request");
    assert!(request.contains("RPT=DailySales"));

    assert_eq!(client.request("SRSP CMD=1 DATA={\"total\":1250}").await, "200");

    let reply = caller.await.expect("caller panicked");
    assert_eq!(reply, Ok("{\"total\":1250}".to_string()));

    let info = manager.client_stat("STORE-7").expect("client still active");
    assert!(!info.busy);
    assert_eq!(info.requests, 1);
}

#[tokio::test]
async fn test_request_timeout_clears_busy() {
    let (addr, manager) = start_server(ManagerConfig::default()).await;
    let mut client = TestClient::login(addr, "QUIET").await;

    let result = manager
        .send_request("QUIET", "TT=Test\r\nRPT=X", Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(BridgeError::RequestTimedOut(_))));
    assert!(!manager.client_stat("QUIET").expect("client still active").busy);

    // The withdrawn request is never handed out
    assert_eq!(client.request("GREQ").await, "200");

    // A late answer is still acknowledged
    assert_eq!(client.request("SRSP CMD=1 DATA=late").await, "200");
}

#[tokio::test]
async fn test_busy_client_rejected() {
    let (addr, manager) = start_server(ManagerConfig::default()).await;
    let _client = TestClient::login(addr, "BUSY").await;

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_request("BUSY", "TT=Test", Duration::from_millis(500)).await })
    };
    assert!(wait_until(|| manager.client_stat("BUSY").map_or(false, |c| c.busy)).await);

    let second = manager.send_request("BUSY", "TT=Test", Duration::from_secs(5)).await;
    assert_eq!(second, Err(BridgeError::ClientBusy("BUSY".to_string())));

    let first = first.await.expect("first caller panicked");
    assert!(matches!(first, Err(BridgeError::RequestTimedOut(_))));
}

#[tokio::test]
async fn test_offline_client() {
    let (_addr, manager) = start_server(ManagerConfig::default()).await;
    let result = manager.send_request("NOBODY", "TT=Test", Duration::from_secs(1)).await;
    assert_eq!(result, Err(BridgeError::ClientNotFound("NOBODY".to_string())));
}

#[tokio::test]
async fn test_takeover_closes_earlier_connection() {
    let (addr, manager) = start_server(ManagerConfig::default()).await;
    let mut first = TestClient::login(addr, "TWIN").await;
    let mut second = TestClient::login(addr, "TWIN").await;

    // The first socket is closed by the server
    assert_eq!(first.read_line().await, "");

    assert_eq!(manager.registry().active_count(), 1);
    assert_eq!(second.request("PING").await, "200");
    assert_eq!(second.request("GREQ").await, "200");

    // Cleanup of the displaced connection leaves the new one registered
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.registry().is_active("TWIN"));
}

#[tokio::test]
async fn test_idle_client_evicted() {
    let config = ManagerConfig {
        idle_timeout: Duration::from_millis(100),
        pending_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
        ..ManagerConfig::default()
    };
    let (addr, manager) = start_server(config).await;
    tokio::spawn(manager.clone().run_sweeper());

    let mut client = TestClient::login(addr, "NAPPING").await;
    assert!(wait_until(|| manager.registry().active_count() == 0).await);
    assert_eq!(client.read_line().await, "");
}
