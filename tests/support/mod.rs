//! In-process fake device: a scripted TCP peer speaking just enough of the
//! wire protocol to drive the engine through each scenario.
#![allow(dead_code)]

use hmac::{Hmac, Mac};
use pioneer_wyt::crypto::TuyaCipher;
use pioneer_wyt::protocol::{FrameDecoder, FrameType, TuyaFrame, pack_frame};
use serde_json::{Value, json};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const DEVICE_ID: &str = "bf1234567890abcdef12";
pub const LOCAL_KEY_STR: &str = "1234567890abcdef";
pub const LOCAL_KEY: &[u8; 16] = b"1234567890abcdef";

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub struct FakeDevice {
    listener: TcpListener,
    pub port: u16,
}

impl FakeDevice {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub async fn accept(&self) -> FakePeer {
        let (stream, _) = self.listener.accept().await.unwrap();
        FakePeer {
            stream,
            decoder: FrameDecoder::new(),
        }
    }
}

pub struct FakePeer {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl FakePeer {
    /// Read one authenticated frame from the client.
    pub async fn read_frame(&mut self, hmac_key: Option<&[u8]>) -> TuyaFrame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame(hmac_key, Some(true)).unwrap() {
                return frame;
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection mid-read");
            self.decoder.extend(&buf[..n]);
        }
    }

    /// Read until the client closes the connection; returns frames seen.
    pub async fn read_until_close(&mut self, hmac_key: Option<&[u8]>) -> Vec<TuyaFrame> {
        let mut frames = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            while let Some(frame) = self.decoder.next_frame(hmac_key, Some(true)).unwrap() {
                frames.push(frame);
            }
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return frames,
                Ok(n) => self.decoder.extend(&buf[..n]),
            }
        }
    }

    pub async fn send_frame(&mut self, frame: TuyaFrame, hmac_key: Option<&[u8]>) {
        let bytes = pack_frame(&frame, hmac_key).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Send a STATUS_RESP whose payload is retcode 0 plus the encrypted
    /// `{"dps": ...}` object, the shape real firmware produces.
    pub async fn send_status(&mut self, seq: u32, dps: Value, key: &[u8; 16], hmac: bool) {
        let cipher = TuyaCipher::new(key).unwrap();
        let body = serde_json::to_vec(&json!({ "dps": dps })).unwrap();
        let mut payload = 0u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&cipher.encrypt(&body, false, true).unwrap());
        self.send_frame(
            TuyaFrame::new(seq, FrameType::StatusResp, payload),
            hmac.then_some(key.as_slice()),
        )
        .await;
    }
}

/// Decrypt a client frame's payload under the given key.
pub fn decrypt_payload(frame: &TuyaFrame, key: &[u8; 16]) -> Vec<u8> {
    TuyaCipher::new(key)
        .unwrap()
        .decrypt(&frame.payload, false)
        .unwrap()
}

/// Split a v3.3 control cleartext into its 15-byte version header and the
/// JSON body.
pub fn split_version_header(cleartext: &[u8]) -> (&[u8], Value) {
    let (header, body) = cleartext.split_at(15);
    (header, serde_json::from_slice(body).unwrap())
}
