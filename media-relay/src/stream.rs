//! Per-SSRC relay channel
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
use crate::transform::{SecureTransform, TransformMode};
use crate::transport::ConnectionId;
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// SSRC offset in an RTP header
pub const RTP_SSRC_OFFSET: usize = 8;

/// Sender SSRC offset in an RTCP header
pub const RTCP_SSRC_OFFSET: usize = 4;

/// Read the SSRC at `offset`, if the packet is long enough
pub fn read_ssrc(packet: &[u8], offset: usize) -> Option<u32> {
    let field = packet.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([field[0], field[1], field[2], field[3]]))
}

/// Packet ready to leave through a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub via: ConnectionId,
    pub to: SocketAddr,
    pub packet: Vec<u8>,
}

/// Result of handing a packet to a stream
#[derive(Debug)]
pub enum StreamOutcome {
    /// Packet accepted and ready to forward
    Forward(Delivery),
    /// Packet accepted but the stream has nowhere to send it
    NoDestination,
    /// Transform failed, packet dropped
    Rejected(RelayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Rtp,
    Rtcp,
}

/// One relay channel for a single SSRC, or any SSRC when `ssrc == 0`
pub struct Stream {
    ssrc: u32,
    new_ssrc: Option<u32>,
    mode: TransformMode,
    transform: Option<Box<dyn SecureTransform>>,
    rtp_conn: Option<ConnectionId>,
    rtcp_conn: Option<ConnectionId>,
    rtp_addr: Option<SocketAddr>,
    rtcp_addr: Option<SocketAddr>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("ssrc", &self.ssrc)
            .field("new_ssrc", &self.new_ssrc)
            .field("mode", &self.mode)
            .field("rtp_conn", &self.rtp_conn)
            .field("rtcp_conn", &self.rtcp_conn)
            .field("rtp_addr", &self.rtp_addr)
            .field("rtcp_addr", &self.rtcp_addr)
            .finish()
    }
}

impl Stream {
    pub fn new(ssrc: u32) -> Self {
        Stream {
            ssrc,
            new_ssrc: None,
            mode: TransformMode::None,
            transform: None,
            rtp_conn: None,
            rtcp_conn: None,
            rtp_addr: None,
            rtcp_addr: None,
        }
    }

    /// Rewrite the RTP SSRC of forwarded packets
    pub fn with_new_ssrc(mut self, new_ssrc: u32) -> Self {
        self.new_ssrc = Some(new_ssrc);
        self
    }

    pub fn with_transform(mut self, mode: TransformMode, transform: Box<dyn SecureTransform>) -> Self {
        self.mode = mode;
        self.transform = Some(transform);
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn new_ssrc(&self) -> Option<u32> {
        self.new_ssrc
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    pub fn matches(&self, ssrc: u32) -> bool {
        self.ssrc == 0 || self.ssrc == ssrc
    }

    pub fn destination_rtp(&self) -> (Option<&ConnectionId>, Option<SocketAddr>) {
        (self.rtp_conn.as_ref(), self.rtp_addr)
    }

    pub fn destination_rtcp(&self) -> (Option<&ConnectionId>, Option<SocketAddr>) {
        (self.rtcp_conn.as_ref(), self.rtcp_addr)
    }

    pub fn set_destination_address(&mut self, rtp: Option<SocketAddr>, rtcp: Option<SocketAddr>) {
        self.rtp_addr = rtp;
        self.rtcp_addr = rtcp;
    }

    pub fn set_destination_rtp_conn(&mut self, conn: Option<ConnectionId>) {
        self.rtp_conn = conn;
    }

    pub fn set_destination_rtcp_conn(&mut self, conn: Option<ConnectionId>) {
        self.rtcp_conn = conn;
    }

    pub fn on_rtp_received(&mut self, data: &[u8], from: SocketAddr) -> StreamOutcome {
        let mut packet = data.to_vec();
        if let Err(e) = self.apply_transform(PacketKind::Rtp, &mut packet) {
            debug!(ssrc = self.ssrc, from = %from, error = %e, "RTP transform failed");
            return StreamOutcome::Rejected(e);
        }

        if let Some(new_ssrc) = self.new_ssrc {
            if let Some(field) = packet.get_mut(RTP_SSRC_OFFSET..RTP_SSRC_OFFSET + 4) {
                field.copy_from_slice(&new_ssrc.to_be_bytes());
            }
        }

        self.forward(packet, self.rtp_conn.clone(), self.rtp_addr)
    }

    pub fn on_rtcp_received(&mut self, data: &[u8], from: SocketAddr) -> StreamOutcome {
        let mut packet = data.to_vec();
        if let Err(e) = self.apply_transform(PacketKind::Rtcp, &mut packet) {
            debug!(ssrc = self.ssrc, from = %from, error = %e, "RTCP transform failed");
            return StreamOutcome::Rejected(e);
        }

        self.forward(packet, self.rtcp_conn.clone(), self.rtcp_addr)
    }

    fn apply_transform(&mut self, kind: PacketKind, packet: &mut Vec<u8>) -> RelayResult<()> {
        let Some(transform) = self.transform.as_mut() else {
            return Ok(());
        };

        match (self.mode, kind) {
            (TransformMode::None, _) => Ok(()),
            (TransformMode::Encrypt, PacketKind::Rtp) => transform.protect_rtp(packet),
            (TransformMode::Decrypt, PacketKind::Rtp) => transform.unprotect_rtp(packet),
            (TransformMode::Encrypt, PacketKind::Rtcp) => transform.protect_rtcp(packet),
            (TransformMode::Decrypt, PacketKind::Rtcp) => transform.unprotect_rtcp(packet),
        }
    }

    fn forward(
        &self,
        packet: Vec<u8>,
        via: Option<ConnectionId>,
        to: Option<SocketAddr>,
    ) -> StreamOutcome {
        match (via, to) {
            (Some(via), Some(to)) => {
                trace!(ssrc = self.ssrc, via = %via, to = %to, len = packet.len(), "Forwarding");
                StreamOutcome::Forward(Delivery { via, to, packet })
            }
            _ => {
                debug!(ssrc = self.ssrc, "Stream has no destination, dropping packet");
                StreamOutcome::NoDestination
            }
        }
    }
}
