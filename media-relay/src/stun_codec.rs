//! STUN message codec (RFC 5389 subset)
//!
//! Binding requests and responses over IPv4, with MESSAGE-INTEGRITY
//! (HMAC-SHA1, short-term credentials) and FINGERPRINT (CRC-32).
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::net::{Ipv4Addr, SocketAddrV4};

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Fixed header length
pub const HEADER_LEN: usize = 20;

/// Transaction id length
pub const TRANSACTION_ID_LEN: usize = 12;

const ATTRIBUTE_HEADER_LEN: usize = 4;
const INTEGRITY_ATTRIBUTE_LEN: usize = ATTRIBUTE_HEADER_LEN + 20;
const FINGERPRINT_ATTRIBUTE_LEN: usize = ATTRIBUTE_HEADER_LEN + 4;
const FINGERPRINT_XOR: u32 = 0x5354_554E;
const FAMILY_IPV4: u8 = 0x01;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Attribute type codes
pub mod attribute {
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const FINGERPRINT: u16 = 0x8028;
}

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingSuccessResponse,
    BindingErrorResponse,
    Other(u16),
}

impl From<u16> for StunMessageType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => StunMessageType::BindingRequest,
            0x0101 => StunMessageType::BindingSuccessResponse,
            0x0111 => StunMessageType::BindingErrorResponse,
            other => StunMessageType::Other(other),
        }
    }
}

impl From<StunMessageType> for u16 {
    fn from(value: StunMessageType) -> Self {
        match value {
            StunMessageType::BindingRequest => 0x0001,
            StunMessageType::BindingSuccessResponse => 0x0101,
            StunMessageType::BindingErrorResponse => 0x0111,
            StunMessageType::Other(other) => other,
        }
    }
}

/// Attribute payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Raw bytes, written as-is
    Opaque(Bytes),
    /// IPv4 XOR-MAPPED-ADDRESS
    XorMappedAddress(SocketAddrV4),
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    /// Attribute type
    pub attribute_type: u16,
    /// Attribute value
    pub value: AttributeValue,
}

impl StunAttribute {
    pub fn opaque(attribute_type: u16, value: impl Into<Bytes>) -> Self {
        StunAttribute {
            attribute_type,
            value: AttributeValue::Opaque(value.into()),
        }
    }

    pub fn username(username: &str) -> Self {
        Self::opaque(attribute::USERNAME, Bytes::copy_from_slice(username.as_bytes()))
    }

    pub fn xor_mapped_address(addr: SocketAddrV4) -> Self {
        StunAttribute {
            attribute_type: attribute::XOR_MAPPED_ADDRESS,
            value: AttributeValue::XorMappedAddress(addr),
        }
    }

    /// Wire payload, without header or padding
    pub fn payload(&self) -> Bytes {
        match &self.value {
            AttributeValue::Opaque(bytes) => bytes.clone(),
            AttributeValue::XorMappedAddress(addr) => Bytes::from(encode_xor_address(addr).to_vec()),
        }
    }

    fn decode(attribute_type: u16, payload: &[u8]) -> Self {
        if attribute_type == attribute::XOR_MAPPED_ADDRESS {
            if let Some(addr) = decode_xor_address(payload) {
                return Self::xor_mapped_address(addr);
            }
        }
        Self::opaque(attribute_type, Bytes::copy_from_slice(payload))
    }
}

fn encode_xor_address(addr: &SocketAddrV4) -> [u8; 8] {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = u32::from(*addr.ip()) ^ MAGIC_COOKIE;

    let mut out = [0u8; 8];
    out[1] = FAMILY_IPV4;
    out[2..4].copy_from_slice(&port.to_be_bytes());
    out[4..8].copy_from_slice(&ip.to_be_bytes());
    out
}

fn decode_xor_address(payload: &[u8]) -> Option<SocketAddrV4> {
    if payload.len() != 8 || payload[1] != FAMILY_IPV4 {
        return None;
    }
    let port = u16::from_be_bytes([payload[2], payload[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) ^ MAGIC_COOKIE;
    Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type
    pub message_type: StunMessageType,
    /// Transaction ID
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
    integrity_key: Option<Bytes>,
    fingerprint: bool,
}

impl StunMessage {
    pub fn new(message_type: StunMessageType, transaction_id: [u8; TRANSACTION_ID_LEN]) -> Self {
        StunMessage {
            message_type,
            transaction_id,
            attributes: Vec::new(),
            integrity_key: None,
            fingerprint: false,
        }
    }

    /// New message with a random transaction id
    pub fn with_random_transaction_id(message_type: StunMessageType) -> Self {
        let mut transaction_id = [0u8; TRANSACTION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self::new(message_type, transaction_id)
    }

    /// Empty success response carrying the request's transaction id
    pub fn success_response(request: &StunMessage) -> Self {
        Self::new(StunMessageType::BindingSuccessResponse, request.transaction_id)
    }

    pub fn add_attribute(&mut self, attribute: StunAttribute) -> &mut Self {
        self.attributes.push(attribute);
        self
    }

    /// Append MESSAGE-INTEGRITY keyed with `password` on write
    pub fn set_message_integrity(&mut self, password: &str) -> &mut Self {
        self.integrity_key = Some(Bytes::copy_from_slice(password.as_bytes()));
        self
    }

    /// Append FINGERPRINT on write
    pub fn set_fingerprint(&mut self) -> &mut Self {
        self.fingerprint = true;
        self
    }

    pub fn is_binding_request(&self) -> bool {
        self.message_type == StunMessageType::BindingRequest
    }

    /// First attribute of the given type
    pub fn attribute(&self, attribute_type: u16) -> Option<&StunAttribute> {
        self.attributes
            .iter()
            .find(|a| a.attribute_type == attribute_type)
    }

    pub fn username(&self) -> Option<String> {
        self.attribute(attribute::USERNAME)
            .map(|a| String::from_utf8_lossy(&a.payload()).into_owned())
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddrV4> {
        self.attributes.iter().find_map(|a| match a.value {
            AttributeValue::XorMappedAddress(addr) => Some(addr),
            _ => None,
        })
    }

    /// Parse a datagram; `None` for anything that is not a well-formed message
    pub fn parse(data: &[u8]) -> Option<Self> {
        Self::decode(data).ok()
    }

    /// Parse a datagram, reporting why it was rejected
    pub fn decode(data: &[u8]) -> RelayResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(RelayError::MalformedMessage(format!(
                "{} bytes is shorter than the header",
                data.len()
            )));
        }

        if data[0] & 0xC0 != 0 {
            return Err(RelayError::MalformedMessage(
                "leading bits are not zero".to_string(),
            ));
        }

        let message_type = u16::from_be_bytes([data[0], data[1]]);
        let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() != HEADER_LEN + body_len {
            return Err(RelayError::MalformedMessage(format!(
                "length field {} does not match datagram of {} bytes",
                body_len,
                data.len()
            )));
        }

        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(RelayError::MalformedMessage(format!(
                "bad magic cookie {:#010x}",
                cookie
            )));
        }

        let mut transaction_id = [0u8; TRANSACTION_ID_LEN];
        transaction_id.copy_from_slice(&data[8..HEADER_LEN]);

        let mut message = StunMessage::new(StunMessageType::from(message_type), transaction_id);

        let mut offset = HEADER_LEN;
        while offset < data.len() {
            if offset + ATTRIBUTE_HEADER_LEN > data.len() {
                return Err(RelayError::MalformedMessage(
                    "truncated attribute header".to_string(),
                ));
            }

            let attribute_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let start = offset + ATTRIBUTE_HEADER_LEN;
            let end = start + len;
            if end > data.len() {
                return Err(RelayError::MalformedMessage(format!(
                    "attribute {:#06x} overruns message",
                    attribute_type
                )));
            }

            message
                .attributes
                .push(StunAttribute::decode(attribute_type, &data[start..end]));
            offset = start + padded(len);
        }

        Ok(message)
    }

    /// Serialize, appending MESSAGE-INTEGRITY then FINGERPRINT when requested
    pub fn write(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.extend_from_slice(&u16::from(self.message_type).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            write_attribute(&mut buf, attr.attribute_type, &attr.payload());
        }

        if let Some(key) = &self.integrity_key {
            let body_len = buf.len() - HEADER_LEN + INTEGRITY_ATTRIBUTE_LEN;
            set_body_len(&mut buf, body_len);
            let mut mac =
                HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
            mac.update(&buf);
            let digest = mac.finalize().into_bytes();
            write_attribute(&mut buf, attribute::MESSAGE_INTEGRITY, &digest);
        }

        if self.fingerprint {
            let body_len = buf.len() - HEADER_LEN + FINGERPRINT_ATTRIBUTE_LEN;
            set_body_len(&mut buf, body_len);
            let crc = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;
            write_attribute(&mut buf, attribute::FINGERPRINT, &crc.to_be_bytes());
        }

        let body_len = buf.len() - HEADER_LEN;
        set_body_len(&mut buf, body_len);
        buf
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Length fields are 16 bits wide
fn wire_len(len: usize) -> u16 {
    debug_assert!(len <= u16::MAX as usize, "length {} overflows a STUN length field", len);
    len as u16
}

fn set_body_len(buf: &mut [u8], len: usize) {
    buf[2..4].copy_from_slice(&wire_len(len).to_be_bytes());
}

fn write_attribute(buf: &mut Vec<u8>, attribute_type: u16, payload: &[u8]) {
    buf.extend_from_slice(&attribute_type.to_be_bytes());
    buf.extend_from_slice(&wire_len(payload.len()).to_be_bytes());
    buf.extend_from_slice(payload);
    buf.resize(buf.len() + padded(payload.len()) - payload.len(), 0);
}
