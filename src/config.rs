//! Device binding configuration and validation.

use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use serde::{Deserialize, Serialize};

/// TCP control port used by every Tuya LAN device.
pub const TUYA_TCP_PORT: u16 = 6668;

/// Polling intervals the scheduler accepts, in seconds. Zero disables polling.
pub const POLL_INTERVALS: &[u16] = &[0, 30, 60, 120];

/// Immutable device binding, as provisioned from the vendor cloud plus LAN
/// discovery. Validated once at build time; the engine never re-checks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device IP address on the LAN.
    pub ip: String,
    /// TCP control port; every known device listens on 6668.
    pub port: u16,
    /// 20-character ASCII device id.
    #[serde(alias = "deviceId")]
    pub device_id: String,
    /// Local key as configured. Hosts that store it HTML-escaped are
    /// tolerated; entities are decoded before the 16-byte check.
    #[serde(alias = "localKey")]
    pub local_key: String,
    /// Protocol dialect code: 31, 33 or 34.
    #[serde(alias = "version")]
    pub protocol: u8,
    /// Scheduled refresh interval in seconds (0, 30, 60 or 120).
    #[serde(alias = "pollInterval")]
    pub poll_interval_sec: u16,
    /// Re-establish the session automatically after transport loss.
    #[serde(alias = "autoReconnect")]
    pub auto_reconnect: bool,
    /// Active heartbeat (20 s HEART_BEAT) instead of the passive idle watchdog.
    #[serde(alias = "useHeartbeat")]
    pub use_heartbeat: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: TUYA_TCP_PORT,
            device_id: String::new(),
            local_key: String::new(),
            protocol: 33,
            poll_interval_sec: 0,
            auto_reconnect: true,
            use_heartbeat: false,
        }
    }
}

impl DeviceConfig {
    pub fn new(ip: &str, device_id: &str, local_key: &str) -> Self {
        Self {
            ip: ip.to_string(),
            device_id: device_id.to_string(),
            local_key: local_key.to_string(),
            ..Self::default()
        }
    }

    /// Protocol dialect, after validation.
    pub fn version(&self) -> Result<Version> {
        Version::from_code(self.protocol)
            .ok_or_else(|| TuyaError::Config(format!("unsupported protocol {}", self.protocol)))
    }

    /// The 16 raw AES key bytes, with HTML entities decoded first.
    pub fn key_bytes(&self) -> Result<[u8; 16]> {
        let decoded = decode_html_entities(&self.local_key);
        let bytes = decoded.as_bytes();
        if bytes.len() != 16 {
            return Err(TuyaError::Config(format!(
                "local key must be 16 bytes after entity decoding, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(bytes);
        Ok(key)
    }

    /// Validates every binding field. Called by `DeviceBuilder::build`.
    pub fn validate(&self) -> Result<()> {
        if self.ip.is_empty() {
            return Err(TuyaError::Config("ip is required".into()));
        }
        if self.device_id.len() != 20 || !self.device_id.is_ascii() {
            return Err(TuyaError::Config(format!(
                "device id must be 20 ASCII characters, got {:?}",
                self.device_id
            )));
        }
        self.key_bytes()?;
        self.version()?;
        if !POLL_INTERVALS.contains(&self.poll_interval_sec) {
            return Err(TuyaError::Config(format!(
                "poll interval must be one of {:?}, got {}",
                POLL_INTERVALS, self.poll_interval_sec
            )));
        }
        Ok(())
    }
}

/// Decodes the HTML entities that cloud exports are known to leave in local
/// keys (`&lt;` and friends). Unknown `&...;` sequences pass through.
fn decode_html_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let replaced = [("&lt;", "<"), ("&gt;", ">"), ("&amp;", "&"), ("&quot;", "\"")]
            .iter()
            .find(|(entity, _)| rest.starts_with(entity));
        match replaced {
            Some((entity, ch)) => {
                out.push_str(ch);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> DeviceConfig {
        DeviceConfig::new("10.0.0.20", "bf1234567890abcdef12", "1234567890abcdef")
    }

    #[test]
    fn accepts_valid_binding() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().key_bytes().unwrap(), *b"1234567890abcdef");
    }

    #[test]
    fn decodes_escaped_key() {
        let mut cfg = valid();
        cfg.local_key = "12345&lt;7890abcdef".to_string();
        assert_eq!(cfg.key_bytes().unwrap(), *b"12345<7890abcdef");
    }

    #[test]
    fn rejects_short_key() {
        let mut cfg = valid();
        cfg.local_key = "too-short".to_string();
        assert!(matches!(cfg.validate(), Err(TuyaError::Config(_))));
    }

    #[test]
    fn rejects_bad_device_id() {
        let mut cfg = valid();
        cfg.device_id = "short".to_string();
        assert!(matches!(cfg.validate(), Err(TuyaError::Config(_))));
    }

    #[test]
    fn rejects_unknown_protocol() {
        let mut cfg = valid();
        cfg.protocol = 35;
        assert!(matches!(cfg.validate(), Err(TuyaError::Config(_))));
    }

    #[test]
    fn rejects_odd_poll_interval() {
        let mut cfg = valid();
        cfg.poll_interval_sec = 45;
        assert!(matches!(cfg.validate(), Err(TuyaError::Config(_))));
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "ip": "10.0.0.20",
            "deviceId": "bf1234567890abcdef12",
            "localKey": "1234567890abcdef",
            "version": 34,
            "pollInterval": 60
        }"#;
        let cfg: DeviceConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.protocol, 34);
        assert_eq!(cfg.poll_interval_sec, 60);
        assert!(cfg.auto_reconnect);
        assert!(cfg.validate().is_ok());
    }
}
