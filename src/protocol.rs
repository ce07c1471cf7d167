//! Tuya wire protocol: frame packing, parsing, CRC/HMAC trailers, and
//! stream reassembly of the raw TCP byte feed.

use crate::crypto::{TuyaCipher, v31_digest};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use log::debug;
use sha2::Sha256;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

pub const HEADER_LEN: usize = 16;
pub const CRC_TRAILER_LEN: usize = 4;
pub const HMAC_TRAILER_LEN: usize = 32;
pub const SUFFIX_LEN: usize = 4;

/// Cleartext dialect marker: 3 version bytes plus 12 zero bytes.
pub const VERSION_HEADER_LEN: usize = 15;

/// Upper bound on the header length field; anything larger is line noise,
/// not a frame.
const MAX_PAYLOAD_LEN: u32 = 0x0001_0000;

define_frame_type! {
    KeyStart = 3,
    KeyResp = 4,
    KeyFinal = 5,
    Control = 7,
    StatusResp = 8,
    HeartBeat = 9,
    DpQuery = 10,
    ControlNew = 13,
    DpQueryNew = 16,
}

define_protocol_version! {
    V3_1 = ("3.1", 31),
    V3_3 = ("3.3", 33),
    V3_4 = ("3.4", 34),
}

/// Commands whose payload never carries the version header: queries,
/// heartbeats and the key negotiation frames.
const NO_VERSION_HEADER_CMDS: &[u32] = &[
    FrameType::DpQuery as u32,
    FrameType::DpQueryNew as u32,
    FrameType::HeartBeat as u32,
    FrameType::KeyStart as u32,
    FrameType::KeyResp as u32,
    FrameType::KeyFinal as u32,
];

/// One prefix-delimited, length-prefixed, trailer-authenticated message.
#[derive(Debug, Clone, Default)]
pub struct TuyaFrame {
    /// Sequence number
    pub seq: u32,
    /// Command code
    pub cmd: u32,
    /// Return code, present on device-originated frames
    pub retcode: Option<u32>,
    /// Payload bytes (ciphertext on the wire, cleartext after decode_payload)
    pub payload: Vec<u8>,
}

impl TuyaFrame {
    pub fn new(seq: u32, cmd: FrameType, payload: Vec<u8>) -> Self {
        Self {
            seq,
            cmd: cmd as u32,
            retcode: None,
            payload,
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u32(self.cmd)
    }
}

/// Parsed fixed-size frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub seq: u32,
    pub cmd: u32,
    /// Header length field: payload + trailer + suffix
    pub payload_len: u32,
    /// Full on-wire size including the 16-byte header
    pub total_len: usize,
}

/// Pack a frame for the wire. A `hmac_key` selects the 32-byte HMAC-SHA256
/// trailer (v3.4); without one the trailer is a big-endian CRC32 (v3.1/v3.3).
pub fn pack_frame(frame: &TuyaFrame, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let trailer_len = if hmac_key.is_some() {
        HMAC_TRAILER_LEN
    } else {
        CRC_TRAILER_LEN
    };
    let length_field = (frame.payload.len() + trailer_len + SUFFIX_LEN) as u32;

    let mut data = Vec::with_capacity(HEADER_LEN + length_field as usize);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(frame.seq)?;
    data.write_u32::<BigEndian>(frame.cmd)?;
    data.write_u32::<BigEndian>(length_field)?;
    data.extend_from_slice(&frame.payload);

    if let Some(key) = hmac_key {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(&data);
        data.extend_from_slice(&mac.finalize().into_bytes());
    } else {
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data);
        data.write_u32::<BigEndian>(crc)?;
    }
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;
    Ok(data)
}

/// Parse the fixed 16-byte header. `data` must start at the prefix.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader> {
    if data.len() < HEADER_LEN {
        return Err(TuyaError::InvalidHeader);
    }
    if BigEndian::read_u32(&data[0..4]) != PREFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }
    let seq = BigEndian::read_u32(&data[4..8]);
    let cmd = BigEndian::read_u32(&data[8..12]);
    let payload_len = BigEndian::read_u32(&data[12..16]);
    if payload_len < (CRC_TRAILER_LEN + SUFFIX_LEN) as u32 || payload_len > MAX_PAYLOAD_LEN {
        return Err(TuyaError::InvalidHeader);
    }
    Ok(FrameHeader {
        seq,
        cmd,
        payload_len,
        total_len: HEADER_LEN + payload_len as usize,
    })
}

/// Unpack and authenticate one complete frame.
///
/// Device-originated frames carry a 4-byte return code between header and
/// payload; client frames do not. `no_retcode` controls the stripping:
/// `Some(false)` always strips (TCP responses), `Some(true)` never does
/// (frames we produced ourselves), `None` detects heuristically (a
/// cleartext payload starts with `{`, a version-marked one with `3`).
pub fn unpack_frame(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    no_retcode: Option<bool>,
) -> Result<TuyaFrame> {
    let header = parse_header(data)?;
    if data.len() < header.total_len {
        return Err(TuyaError::InvalidHeader);
    }

    let trailer_len = if hmac_key.is_some() {
        HMAC_TRAILER_LEN
    } else {
        CRC_TRAILER_LEN
    };
    let trailer_start = header
        .total_len
        .checked_sub(trailer_len + SUFFIX_LEN)
        .filter(|&p| p >= HEADER_LEN)
        .ok_or(TuyaError::InvalidHeader)?;

    let suffix = BigEndian::read_u32(&data[header.total_len - SUFFIX_LEN..header.total_len]);
    if suffix != SUFFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }

    if let Some(key) = hmac_key {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(&data[..trailer_start]);
        mac.verify_slice(&data[trailer_start..trailer_start + HMAC_TRAILER_LEN])
            .map_err(|_| TuyaError::HmacMismatch)?;
    } else {
        let calc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data[..trailer_start]);
        let recv = BigEndian::read_u32(&data[trailer_start..trailer_start + CRC_TRAILER_LEN]);
        if calc != recv {
            return Err(TuyaError::CrcMismatch);
        }
    }

    let mut payload_start = HEADER_LEN;
    let mut retcode = None;
    let body = &data[payload_start..trailer_start];
    let has_retcode = body.len() >= 4
        && match no_retcode {
            Some(no) => !no,
            None => {
                body[0] != b'{' && (body[0] == 0 || (body.len() > 4 && body[0] != b'3'))
            }
        };
    if has_retcode {
        retcode = Some(BigEndian::read_u32(&body[..4]));
        payload_start += 4;
    }

    Ok(TuyaFrame {
        seq: header.seq,
        cmd: header.cmd,
        retcode,
        payload: data[payload_start..trailer_start].to_vec(),
    })
}

/// Reassembles frames out of the raw TCP byte feed. The transport appends
/// whatever the socket delivered; complete frames come out in order and a
/// partial tail stays buffered.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    ///
    /// Garbage before a prefix is skipped. A frame that fails
    /// authentication is consumed and the error returned, so the caller
    /// can log it and keep reading.
    pub fn next_frame(
        &mut self,
        hmac_key: Option<&[u8]>,
        no_retcode: Option<bool>,
    ) -> Result<Option<TuyaFrame>> {
        loop {
            self.discard_to_prefix();
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let header = match parse_header(&self.buf) {
                Ok(h) => h,
                Err(_) => {
                    // Prefix bytes were a coincidence inside garbage;
                    // resynchronize one byte further on.
                    self.buf.drain(..1);
                    continue;
                }
            };
            if self.buf.len() < header.total_len {
                return Ok(None);
            }
            let result = unpack_frame(&self.buf[..header.total_len], hmac_key, no_retcode);
            self.buf.drain(..header.total_len);
            return result.map(Some);
        }
    }

    fn discard_to_prefix(&mut self) {
        let mut skipped = 0usize;
        while self.buf.len() - skipped >= 4 {
            if BigEndian::read_u32(&self.buf[skipped..skipped + 4]) == PREFIX_55AA {
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            debug!("Discarding {} bytes before frame prefix", skipped);
            self.buf.drain(..skipped);
        }
    }
}

fn wants_version_header(cmd: u32) -> bool {
    !NO_VERSION_HEADER_CMDS.contains(&cmd)
}

fn version_header(version: Version) -> [u8; VERSION_HEADER_LEN] {
    let mut header = [0u8; VERSION_HEADER_LEN];
    header[..3].copy_from_slice(version.as_bytes());
    header
}

/// Wrap a cleartext payload for the wire according to the dialect rules.
///
/// * v3.1 encrypts `CONTROL` only: Base64 ciphertext behind a `3.1` marker
///   and an MD5 digest; queries and heartbeats go out as bare JSON.
/// * v3.3 and v3.4 encrypt everything, with the 15-byte version header
///   prepended to the cleartext of non-query/heartbeat/handshake commands
///   before encryption.
pub fn encode_payload(
    version: Version,
    cmd: u32,
    plaintext: &[u8],
    cipher: &TuyaCipher,
) -> Result<Vec<u8>> {
    match version {
        Version::V3_1 => {
            if cmd != FrameType::Control as u32 {
                return Ok(plaintext.to_vec());
            }
            let b64 = cipher.encrypt(plaintext, true, true)?;
            let digest = v31_digest(&b64, cipher.key());
            let mut out = Vec::with_capacity(3 + 16 + b64.len());
            out.extend_from_slice(version.as_bytes());
            out.extend_from_slice(digest.as_bytes());
            out.extend_from_slice(&b64);
            Ok(out)
        }
        Version::V3_3 | Version::V3_4 => {
            let mut body;
            if wants_version_header(cmd) {
                body = version_header(version).to_vec();
                body.extend_from_slice(plaintext);
            } else {
                body = plaintext.to_vec();
            }
            cipher.encrypt(&body, false, true)
        }
    }
}

/// Unwrap a received payload back to cleartext.
pub fn decode_payload(version: Version, payload: &[u8], cipher: &TuyaCipher) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    match version {
        Version::V3_1 => {
            if payload.starts_with(version.as_bytes()) {
                // "3.1" + 16 digest chars, then Base64 ciphertext
                if payload.len() < 19 {
                    return Err(TuyaError::InvalidPayload);
                }
                return cipher.decrypt(&payload[19..], true);
            }
            if payload.first() == Some(&b'{') {
                return Ok(payload.to_vec());
            }
            cipher.decrypt(payload, false)
        }
        Version::V3_3 | Version::V3_4 => match cipher.decrypt(payload, false) {
            Ok(plain) => Ok(strip_version_header(plain, version)),
            Err(e) => {
                // Some firmware revisions ship the version header in the
                // clear ahead of the ciphertext, or push bare JSON.
                if payload.starts_with(version.as_bytes())
                    && payload.len() > VERSION_HEADER_LEN
                {
                    let plain = cipher.decrypt(&payload[VERSION_HEADER_LEN..], false)?;
                    return Ok(strip_version_header(plain, version));
                }
                if payload.first() == Some(&b'{') {
                    return Ok(payload.to_vec());
                }
                Err(e)
            }
        },
    }
}

fn strip_version_header(mut plain: Vec<u8>, version: Version) -> Vec<u8> {
    if plain.len() >= VERSION_HEADER_LEN && plain.starts_with(version.as_bytes()) {
        plain.drain(..VERSION_HEADER_LEN);
    }
    plain
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"1234567890abcdef";

    fn cipher() -> TuyaCipher {
        TuyaCipher::new(&KEY).unwrap()
    }

    #[test]
    fn packed_frame_layout_is_exact() {
        let payload = b"0123456789".to_vec();
        let frame = TuyaFrame::new(1, FrameType::Control, payload.clone());
        let data = pack_frame(&frame, None).unwrap();

        assert_eq!(data.len(), HEADER_LEN + payload.len() + CRC_TRAILER_LEN + SUFFIX_LEN);
        assert_eq!(&data[..4], &[0x00, 0x00, 0x55, 0xAA]);
        assert_eq!(&data[data.len() - 4..], &[0x00, 0x00, 0xAA, 0x55]);
        assert_eq!(BigEndian::read_u32(&data[4..8]), 1);
        assert_eq!(BigEndian::read_u32(&data[8..12]), 7);
        assert_eq!(
            BigEndian::read_u32(&data[12..16]) as usize,
            payload.len() + CRC_TRAILER_LEN + SUFFIX_LEN
        );
    }

    #[test]
    fn crc_trailer_covers_header_and_payload() {
        let frame = TuyaFrame::new(9, FrameType::HeartBeat, b"ping".to_vec());
        let data = pack_frame(&frame, None).unwrap();
        let trailer_start = data.len() - CRC_TRAILER_LEN - SUFFIX_LEN;
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data[..trailer_start]);
        assert_eq!(BigEndian::read_u32(&data[trailer_start..trailer_start + 4]), crc);
    }

    #[test]
    fn hmac_trailer_is_32_bytes_and_verifies() {
        let frame = TuyaFrame::new(2, FrameType::DpQueryNew, Vec::new());
        let data = pack_frame(&frame, Some(&KEY)).unwrap();
        assert_eq!(data.len(), HEADER_LEN + HMAC_TRAILER_LEN + SUFFIX_LEN);

        let decoded = unpack_frame(&data, Some(&KEY), None).unwrap();
        assert_eq!(decoded.seq, 2);
        assert_eq!(decoded.frame_type(), Some(FrameType::DpQueryNew));

        let mut tampered = data.clone();
        tampered[HEADER_LEN] ^= 0x01; // no payload, so this flips a MAC byte
        assert!(unpack_frame(&tampered, Some(&KEY), None).is_err());
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let frame = TuyaFrame::new(3, FrameType::Control, b"x".to_vec());
        let mut data = pack_frame(&frame, None).unwrap();
        let n = data.len();
        data[n - 6] ^= 0xFF;
        assert!(matches!(unpack_frame(&data, None, None), Err(TuyaError::CrcMismatch)));
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let frame = TuyaFrame::new(7, FrameType::StatusResp, b"{\"dps\":{}}".to_vec());
        let data = pack_frame(&frame, None).unwrap();
        let decoded = unpack_frame(&data, None, None).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.payload, b"{\"dps\":{}}");
        assert_eq!(decoded.retcode, None);
    }

    #[test]
    fn retcode_is_detected_and_stripped() {
        // Device response: retcode 0 in front of a JSON payload
        let mut body = 0u32.to_be_bytes().to_vec();
        body.extend_from_slice(b"{\"dps\":{\"1\":true}}");
        let frame = TuyaFrame::new(5, FrameType::StatusResp, body);
        let data = pack_frame(&frame, None).unwrap();

        let decoded = unpack_frame(&data, None, None).unwrap();
        assert_eq!(decoded.retcode, Some(0));
        assert_eq!(decoded.payload, b"{\"dps\":{\"1\":true}}");
    }

    #[test]
    fn decoder_reassembles_split_and_coalesced_frames() {
        let a = pack_frame(&TuyaFrame::new(1, FrameType::HeartBeat, Vec::new()), None).unwrap();
        let b = pack_frame(
            &TuyaFrame::new(2, FrameType::StatusResp, b"{\"dps\":{\"1\":true}}".to_vec()),
            None,
        )
        .unwrap();

        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        // Feed in awkward chunks: half of frame A, rest of A plus half of
        // B, then the remainder.
        let cut1 = a.len() / 2;
        let cut2 = a.len() + b.len() / 2;
        decoder.extend(&stream[..cut1]);
        assert!(decoder.next_frame(None, None).unwrap().is_none());
        decoder.extend(&stream[cut1..cut2]);
        let first = decoder.next_frame(None, None).unwrap().unwrap();
        assert_eq!(first.seq, 1);
        assert!(decoder.next_frame(None, None).unwrap().is_none());
        decoder.extend(&stream[cut2..]);
        let second = decoder.next_frame(None, None).unwrap().unwrap();
        assert_eq!(second.seq, 2);
        assert!(decoder.next_frame(None, None).unwrap().is_none());
    }

    #[test]
    fn decoder_skips_leading_garbage() {
        let frame = pack_frame(&TuyaFrame::new(4, FrameType::HeartBeat, Vec::new()), None).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
        decoder.extend(&frame);
        let decoded = decoder.next_frame(None, None).unwrap().unwrap();
        assert_eq!(decoded.seq, 4);
    }

    #[test]
    fn v33_control_payload_encrypts_header_inside() {
        let cleartext = b"{\"dps\":{\"1\":true}}";
        let wire = encode_payload(Version::V3_3, FrameType::Control as u32, cleartext, &cipher())
            .unwrap();
        assert!(wire.len().is_multiple_of(16));
        // The version marker must not appear in the clear
        assert_ne!(&wire[..3], b"3.3");

        let plain = cipher().decrypt(&wire, false).unwrap();
        assert_eq!(&plain[..3], b"3.3");
        assert_eq!(&plain[3..VERSION_HEADER_LEN], &[0u8; 12]);
        assert_eq!(&plain[VERSION_HEADER_LEN..], cleartext);

        let decoded = decode_payload(Version::V3_3, &wire, &cipher()).unwrap();
        assert_eq!(decoded, cleartext);
    }

    #[test]
    fn v33_query_payload_has_no_version_header() {
        let cleartext = b"{\"gwId\":\"x\"}";
        let wire =
            encode_payload(Version::V3_3, FrameType::DpQuery as u32, cleartext, &cipher()).unwrap();
        let plain = cipher().decrypt(&wire, false).unwrap();
        assert_eq!(plain, cleartext);
    }

    #[test]
    fn v31_control_payload_is_marked_digested_base64() {
        let cleartext = b"{\"dps\":{\"1\":true}}";
        let wire = encode_payload(Version::V3_1, FrameType::Control as u32, cleartext, &cipher())
            .unwrap();
        assert_eq!(&wire[..3], b"3.1");
        assert!(wire[3..19].iter().all(u8::is_ascii_hexdigit));

        let decoded = decode_payload(Version::V3_1, &wire, &cipher()).unwrap();
        assert_eq!(decoded, cleartext);
    }

    #[test]
    fn v31_query_payload_stays_cleartext() {
        let cleartext = b"{\"gwId\":\"x\",\"devId\":\"x\"}";
        let wire =
            encode_payload(Version::V3_1, FrameType::DpQuery as u32, cleartext, &cipher()).unwrap();
        assert_eq!(wire, cleartext);
        assert_eq!(decode_payload(Version::V3_1, &wire, &cipher()).unwrap(), cleartext);
    }

    #[test]
    fn unknown_frame_types_have_no_mapping() {
        assert_eq!(FrameType::from_u32(0x22), None);
        assert_eq!(FrameType::from_u32(16), Some(FrameType::DpQueryNew));
    }

    #[test]
    fn version_codes_roundtrip() {
        for v in [Version::V3_1, Version::V3_3, Version::V3_4] {
            assert_eq!(Version::from_code(v.code()), Some(v));
            assert_eq!(v.as_str().parse::<Version>(), Ok(v));
        }
        assert_eq!(Version::from_code(35), None);
    }
}
