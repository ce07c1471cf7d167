//! Loopback discovery test: a broadcast-shaped datagram on the listening
//! port must surface as a discovered device.

use pioneer_wyt::{Discovery, Version};
use serde_json::json;
use std::time::Duration;
use tokio::net::UdpSocket;

#[tokio::test]
async fn scan_hears_a_cleartext_broadcast() {
    let mut discovery = Discovery::new().with_timeout(Duration::from_secs(2));
    discovery.bind_addr = "127.0.0.1".to_string();
    discovery.ports = vec![36666];

    let scan = tokio::spawn(async move { discovery.scan().await });

    // Give the listener a moment to bind, then announce a device.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let report = serde_json::to_vec(&json!({
        "gwId": "bf1234567890abcdef12",
        "ip": "10.0.0.20",
        "version": "3.3",
        "productKey": "keydeadbeef"
    }))
    .unwrap();
    sender.send_to(&report, ("127.0.0.1", 36666)).await.unwrap();

    let found = scan.await.unwrap().unwrap();
    let device = found
        .iter()
        .find(|d| d.id == "bf1234567890abcdef12")
        .expect("broadcast device should be discovered");
    assert_eq!(device.ip, "10.0.0.20");
    assert_eq!(device.version, Some(Version::V3_3));
    assert_eq!(device.product_key.as_deref(), Some("keydeadbeef"));
}

#[tokio::test]
async fn find_returns_early_for_the_target_device() {
    let mut discovery = Discovery::new().with_timeout(Duration::from_secs(5));
    discovery.bind_addr = "127.0.0.1".to_string();
    discovery.ports = vec![36667];

    let find = tokio::spawn(async move { discovery.find("bf1234567890abcdef12").await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let report = serde_json::to_vec(&json!({
        "gwId": "bf1234567890abcdef12",
        "ip": "10.0.0.21",
        "version": "3.4"
    }))
    .unwrap();
    let started = std::time::Instant::now();
    sender.send_to(&report, ("127.0.0.1", 36667)).await.unwrap();

    let device = find.await.unwrap().unwrap().expect("target device found");
    assert_eq!(device.ip, "10.0.0.21");
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "find should return before the scan timeout"
    );
}
