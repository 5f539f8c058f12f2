//! Per-stream SRTP/SRTCP session
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
use crate::keys::{MasterKey, SessionKeys};
use crate::rtcp::{self, RTCP_HEADER_LEN};
use crate::rtp::{self, RolloverState, RTP_HEADER_LEN};
use std::collections::HashMap;
use tracing::trace;

/// SRTP session holding RTP and RTCP keys derived from one master key.
///
/// Rollover counters and SRTCP indices are tracked per SSRC, so one
/// session can serve a stream that accepts any SSRC.
pub struct SrtpSession {
    rtp_keys: SessionKeys,
    rtcp_keys: SessionKeys,
    rollover: HashMap<u32, RolloverState>,
    rtcp_index: HashMap<u32, u32>,
}

impl std::fmt::Debug for SrtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpSession")
            .field("keys", &"[REDACTED]")
            .field("ssrcs", &self.rollover.len())
            .finish()
    }
}

fn ssrc_at(packet: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    ])
}

impl SrtpSession {
    /// Create a session from decoded master key material
    pub fn new(master: &MasterKey) -> Self {
        SrtpSession {
            rtp_keys: SessionKeys::for_rtp(master),
            rtcp_keys: SessionKeys::for_rtcp(master),
            rollover: HashMap::new(),
            rtcp_index: HashMap::new(),
        }
    }

    /// Create a session from a 60 digit hex key
    pub fn from_hex_key(key: &str) -> SrtpResult<Self> {
        Ok(Self::new(&MasterKey::from_hex(key)?))
    }

    /// RTP -> SRTP, in place
    pub fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        if packet.len() < RTP_HEADER_LEN {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let ssrc = ssrc_at(packet, 8);
        let state = self.rollover.entry(ssrc).or_default();
        rtp::protect(&self.rtp_keys, state, packet)
    }

    /// SRTP -> RTP, in place. On error the packet is left untouched.
    pub fn unprotect_rtp(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        if packet.len() < RTP_HEADER_LEN {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let ssrc = ssrc_at(packet, 8);
        let mut state = self.rollover.get(&ssrc).copied().unwrap_or_default();
        rtp::unprotect(&self.rtp_keys, &mut state, packet)?;
        self.rollover.insert(ssrc, state);
        Ok(())
    }

    /// RTCP -> SRTCP, in place
    pub fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        if packet.len() < RTCP_HEADER_LEN {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let ssrc = ssrc_at(packet, 4);
        let index = self.rtcp_index.entry(ssrc).or_insert(0);
        rtcp::protect(&self.rtcp_keys, *index, packet)?;
        *index = index.wrapping_add(1) & 0x7FFF_FFFF;
        Ok(())
    }

    /// SRTCP -> RTCP, in place. On error the packet is left untouched.
    pub fn unprotect_rtcp(&mut self, packet: &mut Vec<u8>) -> SrtpResult<()> {
        let index = rtcp::unprotect(&self.rtcp_keys, packet)?;
        trace!(index, "SRTCP packet unprotected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "325b26a87034dffd4dd5a2af2a78391fc5233eadb3e65cae7ba215b8da8f";

    fn rtp_packet(seq: u16, ssrc: u32) -> Vec<u8> {
        let mut packet = vec![0x80, 0x60];
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&160u32.to_be_bytes());
        packet.extend_from_slice(&ssrc.to_be_bytes());
        packet.extend_from_slice(&[0x55; 160]);
        packet
    }

    #[test]
    fn test_rtp_between_two_sessions() {
        let mut sender = SrtpSession::from_hex_key(KEY).unwrap();
        let mut receiver = SrtpSession::from_hex_key(KEY).unwrap();

        for seq in 100..110u16 {
            let original = rtp_packet(seq, 0x0102_0304);
            let mut packet = original.clone();
            sender.protect_rtp(&mut packet).unwrap();
            receiver.unprotect_rtp(&mut packet).unwrap();
            assert_eq!(packet, original);
        }
    }

    #[test]
    fn test_independent_state_per_ssrc() {
        let mut sender = SrtpSession::from_hex_key(KEY).unwrap();
        let mut receiver = SrtpSession::from_hex_key(KEY).unwrap();

        for ssrc in [1u32, 2, 3] {
            let original = rtp_packet(65535, ssrc);
            let mut packet = original.clone();
            sender.protect_rtp(&mut packet).unwrap();
            receiver.unprotect_rtp(&mut packet).unwrap();
            assert_eq!(packet, original);
        }
        assert_eq!(receiver.rollover.len(), 3);
    }

    #[test]
    fn test_wrong_key_fails_and_leaves_packet() {
        let mut sender = SrtpSession::from_hex_key(KEY).unwrap();
        let other = "00".repeat(30);
        let mut receiver = SrtpSession::from_hex_key(&other).unwrap();

        let mut packet = rtp_packet(1, 9);
        sender.protect_rtp(&mut packet).unwrap();
        let protected = packet.clone();

        assert_eq!(
            receiver.unprotect_rtp(&mut packet),
            Err(SrtpError::AuthenticationFailed)
        );
        assert_eq!(packet, protected);
        assert!(receiver.rollover.is_empty());
    }

    #[test]
    fn test_rtcp_index_increments() {
        let mut sender = SrtpSession::from_hex_key(KEY).unwrap();
        let mut packet = vec![0x80, 200, 0x00, 0x06];
        packet.extend_from_slice(&7u32.to_be_bytes());
        packet.extend_from_slice(&[0u8; 20]);

        let mut first = packet.clone();
        let mut second = packet.clone();
        sender.protect_rtcp(&mut first).unwrap();
        sender.protect_rtcp(&mut second).unwrap();

        assert_eq!(sender.rtcp_index.get(&7), Some(&2));
        assert_ne!(first, second);
    }

    #[test]
    fn test_short_rtp_rejected() {
        let mut session = SrtpSession::from_hex_key(KEY).unwrap();
        let mut packet = vec![0x80, 0x00, 0x00];
        assert_eq!(session.protect_rtp(&mut packet), Err(SrtpError::PacketTooShort(3)));
    }
}
