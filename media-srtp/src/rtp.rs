//! SRTP packet protection (RFC 3711 Section 3.3)
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


use crate::error::{SrtpError, SrtpResult};
use crate::keys::SessionKeys;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Authentication tag length for HMAC-SHA1-80
pub const AUTH_TAG_LEN: usize = 10;

/// Fixed RTP header length
pub const RTP_HEADER_LEN: usize = 12;

/// Rollover state tracked per SSRC
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RolloverState {
    roc: u32,
    highest_seq: u16,
    initialized: bool,
}

impl RolloverState {
    /// Guess the rollover counter for `seq` (RFC 3711 Section 3.3.1)
    fn estimate(&self, seq: u16) -> u32 {
        if !self.initialized {
            return self.roc;
        }

        let s_l = self.highest_seq as i32;
        let seq = seq as i32;
        if s_l < 32768 {
            if seq - s_l > 32768 {
                self.roc.wrapping_sub(1)
            } else {
                self.roc
            }
        } else if s_l - 32768 > seq {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }

    fn update(&mut self, seq: u16, roc: u32) {
        if !self.initialized {
            self.roc = roc;
            self.highest_seq = seq;
            self.initialized = true;
            return;
        }

        if roc == self.roc.wrapping_add(1) {
            self.roc = roc;
            self.highest_seq = seq;
        } else if roc == self.roc && seq > self.highest_seq {
            self.highest_seq = seq;
        }
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Length of the RTP header including CSRC list and extension
pub(crate) fn header_len(packet: &[u8]) -> SrtpResult<usize> {
    if packet.len() < RTP_HEADER_LEN {
        return Err(SrtpError::PacketTooShort(packet.len()));
    }

    let csrc_count = (packet[0] & 0x0F) as usize;
    let mut len = RTP_HEADER_LEN + csrc_count * 4;

    if packet[0] & 0x10 != 0 {
        if packet.len() < len + 4 {
            return Err(SrtpError::MalformedHeader(
                "header extension truncated".to_string(),
            ));
        }
        let words = read_u16(packet, len + 2) as usize;
        len += 4 + words * 4;
    }

    if packet.len() < len {
        return Err(SrtpError::MalformedHeader(format!(
            "header claims {} bytes, packet has {}",
            len,
            packet.len()
        )));
    }

    Ok(len)
}

fn auth_tag(keys: &SessionKeys, authenticated: &[u8], roc: u32) -> SrtpResult<[u8; AUTH_TAG_LEN]> {
    let mut mac = HmacSha1::new_from_slice(&keys.auth_key)
        .map_err(|e| SrtpError::InvalidKey(e.to_string()))?;
    mac.update(authenticated);
    mac.update(&roc.to_be_bytes());

    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&digest[..AUTH_TAG_LEN]);
    Ok(tag)
}

fn verify_tag(keys: &SessionKeys, authenticated: &[u8], roc: u32, tag: &[u8]) -> SrtpResult<()> {
    let mut mac = HmacSha1::new_from_slice(&keys.auth_key)
        .map_err(|e| SrtpError::InvalidKey(e.to_string()))?;
    mac.update(authenticated);
    mac.update(&roc.to_be_bytes());
    mac.verify_truncated_left(tag)
        .map_err(|_| SrtpError::AuthenticationFailed)
}

/// Encrypt the payload in place and append the authentication tag
pub(crate) fn protect(
    keys: &SessionKeys,
    state: &mut RolloverState,
    packet: &mut Vec<u8>,
) -> SrtpResult<()> {
    let header = header_len(packet)?;
    let seq = read_u16(packet, 2);
    let ssrc = read_u32(packet, 8);

    let roc = state.estimate(seq);
    let index = ((roc as u64) << 16) | seq as u64;

    keys.apply_keystream(ssrc, index, &mut packet[header..]);
    let tag = auth_tag(keys, &packet[..], roc)?;
    packet.extend_from_slice(&tag);

    state.update(seq, roc);
    Ok(())
}

/// Verify the tag, decrypt the payload in place and strip the tag
pub(crate) fn unprotect(
    keys: &SessionKeys,
    state: &mut RolloverState,
    packet: &mut Vec<u8>,
) -> SrtpResult<()> {
    if packet.len() < RTP_HEADER_LEN + AUTH_TAG_LEN {
        return Err(SrtpError::PacketTooShort(packet.len()));
    }

    let body_len = packet.len() - AUTH_TAG_LEN;
    let header = header_len(&packet[..body_len])?;
    let seq = read_u16(packet, 2);
    let ssrc = read_u32(packet, 8);

    let roc = state.estimate(seq);
    verify_tag(keys, &packet[..body_len], roc, &packet[body_len..])?;

    let index = ((roc as u64) << 16) | seq as u64;
    packet.truncate(body_len);
    keys.apply_keystream(ssrc, index, &mut packet[header..]);

    state.update(seq, roc);
    Ok(())
}
