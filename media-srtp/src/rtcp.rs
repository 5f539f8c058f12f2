//! SRTCP packet protection (RFC 3711 Section 3.4)
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
use crate::rtp::AUTH_TAG_LEN;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// RTCP header up to and including the sender SSRC
pub const RTCP_HEADER_LEN: usize = 8;

const INDEX_LEN: usize = 4;
const ENCRYPTED_FLAG: u32 = 0x8000_0000;
const INDEX_MASK: u32 = 0x7FFF_FFFF;

fn sender_ssrc(packet: &[u8]) -> u32 {
    u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]])
}

/// Encrypt everything after the sender SSRC, then append E|index and the tag
pub(crate) fn protect(keys: &SessionKeys, index: u32, packet: &mut Vec<u8>) -> SrtpResult<()> {
    if packet.len() < RTCP_HEADER_LEN {
        return Err(SrtpError::PacketTooShort(packet.len()));
    }

    let index = index & INDEX_MASK;
    let ssrc = sender_ssrc(packet);
    keys.apply_keystream(ssrc, index as u64, &mut packet[RTCP_HEADER_LEN..]);
    packet.extend_from_slice(&(ENCRYPTED_FLAG | index).to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(&keys.auth_key)
        .map_err(|e| SrtpError::InvalidKey(e.to_string()))?;
    mac.update(&packet[..]);
    let digest = mac.finalize().into_bytes();
    packet.extend_from_slice(&digest[..AUTH_TAG_LEN]);

    Ok(())
}

/// Verify the tag, strip trailer and decrypt if the E flag is set.
/// Returns the SRTCP index carried by the packet.
pub(crate) fn unprotect(keys: &SessionKeys, packet: &mut Vec<u8>) -> SrtpResult<u32> {
    if packet.len() < RTCP_HEADER_LEN + INDEX_LEN + AUTH_TAG_LEN {
        return Err(SrtpError::PacketTooShort(packet.len()));
    }

    let tag_start = packet.len() - AUTH_TAG_LEN;
    let mut mac = HmacSha1::new_from_slice(&keys.auth_key)
        .map_err(|e| SrtpError::InvalidKey(e.to_string()))?;
    mac.update(&packet[..tag_start]);
    mac.verify_truncated_left(&packet[tag_start..])
        .map_err(|_| SrtpError::AuthenticationFailed)?;

    let index_start = tag_start - INDEX_LEN;
    let word = u32::from_be_bytes([
        packet[index_start],
        packet[index_start + 1],
        packet[index_start + 2],
        packet[index_start + 3],
    ]);
    let index = word & INDEX_MASK;

    packet.truncate(index_start);
    if word & ENCRYPTED_FLAG != 0 {
        let ssrc = sender_ssrc(packet);
        keys.apply_keystream(ssrc, index as u64, &mut packet[RTCP_HEADER_LEN..]);
    }

    Ok(index)
}
