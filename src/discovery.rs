//! LAN discovery: listens for the UDP broadcasts Tuya devices emit every
//! few seconds and decodes `{deviceId, ip, version}` out of them.
//!
//! v3.1 devices broadcast bare JSON on port 6666; later firmware sends a
//! 55AA-framed, AES-ECB-encrypted report on 6667 under a well-known key.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{Version, unpack_frame};
use log::{debug, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Broadcast decryption key used by v3.3 firmware.
const UDP_KEY_33: &[u8] = b"yG9shRKIBrIBUjc3";
/// Broadcast decryption key used by v3.4 firmware.
const UDP_KEY_34: &[u8] = &[
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];

/// One device heard on the broadcast ports.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub ip: String,
    pub version: Option<Version>,
    pub product_key: Option<String>,
}

/// Passive UDP listener for Tuya device broadcasts.
pub struct Discovery {
    /// How long to listen
    pub timeout: Duration,
    /// Local address to bind to
    pub bind_addr: String,
    /// Broadcast ports (6666 cleartext, 6667 encrypted)
    pub ports: Vec<u16>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            bind_addr: "0.0.0.0".to_string(),
            ports: vec![6666, 6667],
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Listen until the timeout and return every device heard, newest
    /// report per device id.
    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        info!(
            "Listening for Tuya broadcasts on {} ports {:?}",
            self.bind_addr, self.ports
        );
        let found = self.listen(None).await?;
        info!("Discovery finished, {} device(s) heard", found.len());
        Ok(found.into_values().collect())
    }

    /// Listen until a specific device id shows up, or the timeout passes.
    pub async fn find(&self, device_id: &str) -> Result<Option<DiscoveredDevice>> {
        let mut found = self.listen(Some(device_id)).await?;
        Ok(found.remove(device_id))
    }

    async fn listen(&self, target: Option<&str>) -> Result<HashMap<String, DiscoveredDevice>> {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push(Arc::new(s)),
                Err(e) => warn!("Cannot listen on UDP {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(TuyaError::Io("no broadcast port could be bound".into()));
        }

        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(64);
        let cancel = CancellationToken::new();
        for socket in &sockets {
            let tx = tx.clone();
            let socket = socket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = socket.recv_from(&mut buf) => match res {
                            Ok((len, addr)) => {
                                if tx.send((buf[..len].to_vec(), addr)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        },
                    }
                }
            });
        }

        let mut found = HashMap::new();
        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                recv = rx.recv() => match recv {
                    Some((data, addr)) => {
                        debug!("UDP broadcast from {}: {} bytes", addr, data.len());
                        if let Some(device) = self.parse_packet(&data) {
                            let is_target = target == Some(device.id.as_str());
                            found.insert(device.id.clone(), device);
                            if is_target {
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        cancel.cancel();
        Ok(found)
    }

    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| TuyaError::Io(format!("bad bind address: {e}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Decode one broadcast datagram: cleartext JSON, a framed report, or
    /// a whole-packet ECB blob, in that order.
    fn parse_packet(&self, data: &[u8]) -> Option<DiscoveredDevice> {
        if let Ok(body) = serde_json::from_slice::<Value>(data) {
            return parse_report(&body);
        }

        if let Ok(frame) = unpack_frame(data, None, None) {
            if let Ok(body) = serde_json::from_slice::<Value>(&frame.payload) {
                return parse_report(&body);
            }
            for key in [UDP_KEY_33, UDP_KEY_34] {
                if let Ok(cipher) = TuyaCipher::new(key)
                    && let Ok(plain) = cipher.decrypt(&frame.payload, false)
                    && let Ok(body) = serde_json::from_slice::<Value>(&plain)
                {
                    return parse_report(&body);
                }
            }
        }

        for key in [UDP_KEY_33, UDP_KEY_34] {
            if let Ok(cipher) = TuyaCipher::new(key)
                && let Ok(plain) = cipher.decrypt(data, false)
                && let Ok(body) = serde_json::from_slice::<Value>(&plain)
            {
                return parse_report(&body);
            }
        }

        debug!("Unparseable broadcast packet ({} bytes)", data.len());
        None
    }
}

fn parse_report(body: &Value) -> Option<DiscoveredDevice> {
    let id = body
        .get("gwId")
        .or_else(|| body.get("devId"))
        .or_else(|| body.get("id"))
        .and_then(Value::as_str)?;
    let ip = body.get("ip").and_then(Value::as_str)?;

    Some(DiscoveredDevice {
        id: id.to_string(),
        ip: ip.to_string(),
        version: body
            .get("version")
            .and_then(Value::as_str)
            .and_then(|s| Version::from_str(s).ok()),
        product_key: body
            .get("productKey")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameType, TuyaFrame, pack_frame};
    use serde_json::json;

    #[test]
    fn parses_cleartext_broadcast() {
        let discovery = Discovery::new();
        let packet = serde_json::to_vec(&json!({
            "gwId": "bf1234567890abcdef12",
            "ip": "10.0.0.20",
            "version": "3.1",
            "productKey": "keyabc"
        }))
        .unwrap();

        let device = discovery.parse_packet(&packet).unwrap();
        assert_eq!(device.id, "bf1234567890abcdef12");
        assert_eq!(device.ip, "10.0.0.20");
        assert_eq!(device.version, Some(Version::V3_1));
        assert_eq!(device.product_key.as_deref(), Some("keyabc"));
    }

    #[test]
    fn parses_encrypted_framed_broadcast() {
        let report = serde_json::to_vec(&json!({
            "gwId": "bf1234567890abcdef12",
            "ip": "10.0.0.21",
            "version": "3.3"
        }))
        .unwrap();
        let cipher = TuyaCipher::new(UDP_KEY_33).unwrap();
        // Device broadcasts carry a return code ahead of the ciphertext
        let mut body = 0u32.to_be_bytes().to_vec();
        body.extend_from_slice(&cipher.encrypt(&report, false, true).unwrap());
        let packet = pack_frame(&TuyaFrame::new(0, FrameType::StatusResp, body), None).unwrap();

        let device = Discovery::new().parse_packet(&packet).unwrap();
        assert_eq!(device.ip, "10.0.0.21");
        assert_eq!(device.version, Some(Version::V3_3));
    }

    #[test]
    fn report_without_identity_is_dropped() {
        assert!(parse_report(&json!({"ip": "10.0.0.9"})).is_none());
        assert!(parse_report(&json!({"gwId": "abc"})).is_none());
        assert!(Discovery::new().parse_packet(b"not a packet").is_none());
    }
}
