//! v3.4 session key negotiation.
//!
//! The three-step exchange is modeled as a state machine the device task
//! drives: it owns the socket and the 750 ms step deadline, this module owns
//! the nonces, MAC checks and key derivation. v3.1/v3.3 sessions skip the
//! machine entirely and are established the moment TCP connect succeeds.

use crate::crypto::{TuyaCipher, derive_session_key};
use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use hmac::{Hmac, Mac};
use log::debug;
use rand::Rng;
use sha2::Sha256;

/// Handshake progress. Only v3.4 visits the two intermediate steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Disconnected,
    KeyStartSent,
    KeyRespReceived,
    Established,
}

/// Nonce alphabet: ASCII alphanumerics minus the lookalikes O, o, l and 1.
const NONCE_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz023456789";

fn generate_nonce() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut nonce = [0u8; 16];
    for b in &mut nonce {
        *b = NONCE_CHARSET[rng.random_range(0..NONCE_CHARSET.len())];
    }
    nonce
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Per-connection session state: handshake step, nonces, and the key that
/// currently drives both AES and the HMAC trailer.
pub struct Session {
    version: Version,
    local_key: [u8; 16],
    step: HandshakeStep,
    local_nonce: [u8; 16],
    remote_nonce: Option<[u8; 16]>,
    session_key: Option<[u8; 16]>,
}

impl Session {
    pub fn new(version: Version, local_key: [u8; 16]) -> Self {
        Self {
            version,
            local_key,
            step: HandshakeStep::Disconnected,
            local_nonce: [0u8; 16],
            remote_nonce: None,
            session_key: None,
        }
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    pub fn is_established(&self) -> bool {
        self.step == HandshakeStep::Established
    }

    /// The key for all cryptography right now: the negotiated session key
    /// once Established on v3.4, the device local key otherwise.
    pub fn active_key(&self) -> [u8; 16] {
        self.session_key.unwrap_or(self.local_key)
    }

    /// HMAC trailer key, present only for the v3.4 dialect.
    pub fn hmac_key(&self) -> Option<[u8; 16]> {
        (self.version == Version::V3_4).then(|| self.active_key())
    }

    pub fn cipher(&self) -> Result<TuyaCipher> {
        TuyaCipher::new(&self.active_key())
    }

    /// Tear down to Disconnected and forget all per-connection material.
    pub fn reset(&mut self) {
        self.step = HandshakeStep::Disconnected;
        self.local_nonce = [0u8; 16];
        self.remote_nonce = None;
        self.session_key = None;
    }

    /// TCP connect succeeded. For v3.1/v3.3 the session is immediately
    /// established; for v3.4 a fresh nonce is drawn and the cleartext
    /// KEY_START payload is returned for the caller to frame and send.
    pub fn on_connected(&mut self) -> Option<Vec<u8>> {
        match self.version {
            Version::V3_1 | Version::V3_3 => {
                self.step = HandshakeStep::Established;
                None
            }
            Version::V3_4 => {
                self.local_nonce = generate_nonce();
                self.step = HandshakeStep::KeyStartSent;
                Some(self.local_nonce.to_vec())
            }
        }
    }

    /// Handle the decrypted-or-raw KEY_RESP payload: 48 bytes of
    /// `remote_nonce(16) || HMAC(local_key, local_nonce)(32)`. The frame
    /// payload arrives still AES-wrapped under the local key; both padded
    /// and unpadded firmware variants are accepted.
    ///
    /// Returns the cleartext KEY_FINAL payload to frame and send.
    pub fn on_key_resp(&mut self, wire_payload: &[u8]) -> Result<Vec<u8>> {
        if self.step != HandshakeStep::KeyStartSent {
            return Err(TuyaError::HandshakeFailed);
        }

        let cipher = TuyaCipher::new(&self.local_key)?;
        let plain = cipher
            .decrypt(wire_payload, false)
            .or_else(|_| cipher.decrypt_raw(wire_payload))?;
        if plain.len() < 48 {
            debug!("KEY_RESP payload too short: {} bytes", plain.len());
            return Err(TuyaError::HandshakeFailed);
        }

        let mut remote_nonce = [0u8; 16];
        remote_nonce.copy_from_slice(&plain[..16]);

        let expected = hmac_sha256(&self.local_key, &self.local_nonce)?;
        if expected.as_slice() != &plain[16..48] {
            return Err(TuyaError::HandshakeMacMismatch);
        }

        self.remote_nonce = Some(remote_nonce);
        self.step = HandshakeStep::KeyRespReceived;
        hmac_sha256(&self.local_key, &remote_nonce)
    }

    /// KEY_FINAL has been written: derive the session key and switch every
    /// subsequent frame over to it.
    pub fn finalize(&mut self) -> Result<()> {
        if self.step != HandshakeStep::KeyRespReceived {
            return Err(TuyaError::HandshakeFailed);
        }
        let remote = self.remote_nonce.ok_or(TuyaError::HandshakeFailed)?;
        let key = derive_session_key(&self.local_key, &self.local_nonce, &remote)?;
        self.session_key = Some(key);
        self.step = HandshakeStep::Established;
        debug!("Session key established");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn force_local_nonce(&mut self, nonce: [u8; 16]) {
        self.local_nonce = nonce;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TuyaCipher;

    const LOCAL_KEY: [u8; 16] = [0u8; 16];

    fn key_resp_payload(local_key: &[u8; 16], local_nonce: &[u8; 16], remote_nonce: &[u8; 16]) -> Vec<u8> {
        let mut plain = remote_nonce.to_vec();
        plain.extend_from_slice(&hmac_sha256(local_key, local_nonce).unwrap());
        TuyaCipher::new(local_key).unwrap().encrypt(&plain, false, true).unwrap()
    }

    #[test]
    fn v33_establishes_on_connect() {
        let mut session = Session::new(Version::V3_3, LOCAL_KEY);
        assert!(session.on_connected().is_none());
        assert!(session.is_established());
        assert_eq!(session.active_key(), LOCAL_KEY);
        assert_eq!(session.hmac_key(), None);
    }

    #[test]
    fn v34_walks_all_four_steps() {
        let mut session = Session::new(Version::V3_4, LOCAL_KEY);
        assert_eq!(session.step(), HandshakeStep::Disconnected);

        let start = session.on_connected().expect("v3.4 sends KEY_START");
        assert_eq!(start.len(), 16);
        assert_eq!(session.step(), HandshakeStep::KeyStartSent);

        let local_nonce: [u8; 16] = start.as_slice().try_into().unwrap();
        let remote_nonce = [0xFFu8; 16];
        let resp = key_resp_payload(&LOCAL_KEY, &local_nonce, &remote_nonce);

        let final_payload = session.on_key_resp(&resp).unwrap();
        assert_eq!(session.step(), HandshakeStep::KeyRespReceived);
        assert_eq!(final_payload, hmac_sha256(&LOCAL_KEY, &remote_nonce).unwrap());

        session.finalize().unwrap();
        assert!(session.is_established());
        assert_eq!(session.hmac_key(), Some(session.active_key()));
        assert_ne!(session.active_key(), LOCAL_KEY);
    }

    #[test]
    fn session_key_matches_reference_derivation() {
        // Fixed nonces: all-zero key, remote nonce of 16×0xFF means the
        // XOR input equals !local_nonce.
        let mut session = Session::new(Version::V3_4, LOCAL_KEY);
        let _ = session.on_connected();
        session.force_local_nonce(*b"0123456789ABCDEF");

        let remote_nonce = [0xFFu8; 16];
        let resp = key_resp_payload(&LOCAL_KEY, b"0123456789ABCDEF", &remote_nonce);
        session.on_key_resp(&resp).unwrap();
        session.finalize().unwrap();

        let expected =
            derive_session_key(&LOCAL_KEY, b"0123456789ABCDEF", &remote_nonce).unwrap();
        assert_eq!(session.active_key(), expected);
    }

    #[test]
    fn bad_resp_mac_is_rejected() {
        let mut session = Session::new(Version::V3_4, LOCAL_KEY);
        let _ = session.on_connected();

        // MAC computed over the wrong nonce
        let resp = key_resp_payload(&LOCAL_KEY, b"wrong-nonce-16-b", &[0xABu8; 16]);
        assert!(matches!(
            session.on_key_resp(&resp),
            Err(TuyaError::HandshakeMacMismatch)
        ));
        assert!(!session.is_established());
    }

    #[test]
    fn reset_forgets_session_material() {
        let mut session = Session::new(Version::V3_4, LOCAL_KEY);
        let start = session.on_connected().unwrap();
        let local_nonce: [u8; 16] = start.as_slice().try_into().unwrap();
        let resp = key_resp_payload(&LOCAL_KEY, &local_nonce, &[0x42u8; 16]);
        session.on_key_resp(&resp).unwrap();
        session.finalize().unwrap();

        session.reset();
        assert_eq!(session.step(), HandshakeStep::Disconnected);
        assert_eq!(session.active_key(), LOCAL_KEY);
    }

    #[test]
    fn nonces_use_the_unambiguous_alphabet() {
        let mut session = Session::new(Version::V3_4, LOCAL_KEY);
        let nonce = session.on_connected().unwrap();
        assert!(nonce.iter().all(|b| NONCE_CHARSET.contains(b)));

        session.reset();
        let second = session.on_connected().unwrap();
        // Fresh nonce per session (16 chars over a 58-symbol alphabet;
        // a collision here means the generator is broken)
        assert_ne!(nonce, second);
    }
}
