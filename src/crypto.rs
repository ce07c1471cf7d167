//! Tuya payload encryption and decryption.
//! AES-128-ECB with PKCS#5/7 padding for all three supported dialects,
//! Base64 wrapping and the MD5 payload digest for v3.1.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use base64::{Engine as _, engine::general_purpose};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};
use md5::{Digest, Md5};

/// TuyaCipher provides AES-128-ECB encryption and decryption under a fixed
/// 16-byte key (the device local key, or the negotiated session key).
pub struct TuyaCipher {
    key: [u8; 16],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::EncryptionFailed);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        Ok(Self { key: k })
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// Encrypt data.
    /// * `use_base64`: if true, encode the ciphertext in Base64 (v3.1 payloads).
    /// * `padding`: if true, apply PKCS#7 padding; otherwise the input must
    ///   already be block-aligned (handshake probes).
    pub fn encrypt(&self, data: &[u8], use_base64: bool, padding: bool) -> Result<Vec<u8>> {
        let mut buf = if padding {
            let pad_len = 16 - data.len() % 16;
            let mut p = data.to_vec();
            p.resize(data.len() + pad_len, pad_len as u8);
            p
        } else {
            if !data.len().is_multiple_of(16) {
                return Err(TuyaError::EncryptionFailed);
            }
            data.to_vec()
        };

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        if use_base64 {
            Ok(general_purpose::STANDARD.encode(&buf).into_bytes())
        } else {
            Ok(buf)
        }
    }

    /// Decrypt data.
    /// * `use_base64`: if true, the input is Base64 (v3.1 payloads).
    ///
    /// Padding is verified byte-for-byte; a bad pad means a wrong key or a
    /// corrupted frame and maps to `DecryptionFailed`.
    pub fn decrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let mut buf = if use_base64 {
            general_purpose::STANDARD
                .decode(data)
                .map_err(|_| TuyaError::DecryptionFailed)?
        } else {
            data.to_vec()
        };

        if buf.is_empty() || !buf.len().is_multiple_of(16) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        let pad_len = buf[buf.len() - 1] as usize;
        if pad_len == 0 || pad_len > 16 || pad_len > buf.len() {
            return Err(TuyaError::DecryptionFailed);
        }
        for i in 0..pad_len {
            if buf[buf.len() - 1 - i] != pad_len as u8 {
                return Err(TuyaError::DecryptionFailed);
            }
        }
        buf.truncate(buf.len() - pad_len);
        Ok(buf)
    }

    /// Decrypt a single raw block (or an exact multiple), no padding check.
    /// Used for handshake payloads whose length is fixed by the protocol.
    pub fn decrypt_raw(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(TuyaError::DecryptionFailed);
        }
        let mut buf = data.to_vec();
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }
        Ok(buf)
    }
}

/// v3.1 payload digest: the middle 16 hex characters of
/// MD5("data=" + base64_ciphertext + "||lpv=3.1||" + local_key).
pub fn v31_digest(b64_payload: &[u8], key: &[u8; 16]) -> String {
    let mut hasher = Md5::new();
    hasher.update(b"data=");
    hasher.update(b64_payload);
    hasher.update(b"||lpv=3.1||");
    hasher.update(key);
    let hex_digest = hex::encode(hasher.finalize());
    hex_digest[8..24].to_string()
}

/// v3.4 session key: AES-ECB(local_key, local_nonce XOR remote_nonce),
/// first ciphertext block.
pub fn derive_session_key(
    local_key: &[u8; 16],
    local_nonce: &[u8; 16],
    remote_nonce: &[u8; 16],
) -> Result<[u8; 16]> {
    let mut xored = [0u8; 16];
    for (i, b) in xored.iter_mut().enumerate() {
        *b = local_nonce[i] ^ remote_nonce[i];
    }
    let cipher = TuyaCipher::new(local_key)?;
    let block = cipher.encrypt(&xored, false, false)?;
    let mut key = [0u8; 16];
    key.copy_from_slice(&block[..16]);
    Ok(key)
}
