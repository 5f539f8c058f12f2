//! Relay point: local/remote endpoint pairs, ICE credentials and streams
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
use crate::stream::{read_ssrc, Stream, StreamOutcome, RTCP_SSRC_OFFSET, RTP_SSRC_OFFSET};
use crate::transport::{Channel, ConnectionId};
use std::net::SocketAddr;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// ICE username fragment and password
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        IceCredentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    /// Parse a `ufrag:pwd` pair
    pub fn parse_pair(pair: &str) -> RelayResult<Self> {
        pair.split_once(':')
            .map(|(ufrag, pwd)| Self::new(ufrag, pwd))
            .ok_or_else(|| RelayError::InvalidArgument(format!("ICE pair without ':': {}", pair)))
    }
}

/// Transport binding slot of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    RemoteRtp,
    RemoteRtcp,
    LocalRtp,
    LocalRtcp,
}

impl Role {
    /// Dispatch order
    pub const ALL: [Role; 4] = [Role::RemoteRtp, Role::RemoteRtcp, Role::LocalRtp, Role::LocalRtcp];

    pub fn channel(self) -> Channel {
        match self {
            Role::RemoteRtp | Role::LocalRtp => Channel::Rtp,
            Role::RemoteRtcp | Role::LocalRtcp => Channel::Rtcp,
        }
    }
}

/// Mutable part of a point, guarded by the point's lock
#[derive(Debug, Default)]
pub struct PointState {
    local_ice: IceCredentials,
    remote_ice: IceCredentials,
    local_rtp: Option<ConnectionId>,
    local_rtcp: Option<ConnectionId>,
    remote_rtp: Option<ConnectionId>,
    remote_rtcp: Option<ConnectionId>,
    external_remote_rtp: Option<SocketAddr>,
    local_streams: Vec<Stream>,
    remote_streams: Vec<Stream>,
}

impl PointState {
    pub fn local_ice(&self) -> &IceCredentials {
        &self.local_ice
    }

    pub fn remote_ice(&self) -> &IceCredentials {
        &self.remote_ice
    }

    pub fn set_ice(&mut self, local: IceCredentials, remote: IceCredentials) {
        self.local_ice = local;
        self.remote_ice = remote;
    }

    pub fn binding(&self, role: Role) -> Option<&ConnectionId> {
        match role {
            Role::RemoteRtp => self.remote_rtp.as_ref(),
            Role::RemoteRtcp => self.remote_rtcp.as_ref(),
            Role::LocalRtp => self.local_rtp.as_ref(),
            Role::LocalRtcp => self.local_rtcp.as_ref(),
        }
    }

    /// Rebind a role and re-derive the destination of the streams sending
    /// through it. Returns the previous binding.
    ///
    /// Remote streams send through the local transports, local streams
    /// through the remote ones.
    pub fn set_binding(&mut self, role: Role, conn: Option<ConnectionId>) -> Option<ConnectionId> {
        match role {
            Role::RemoteRtp => {
                for stream in &mut self.local_streams {
                    stream.set_destination_rtp_conn(conn.clone());
                }
                std::mem::replace(&mut self.remote_rtp, conn)
            }
            Role::RemoteRtcp => {
                for stream in &mut self.local_streams {
                    stream.set_destination_rtcp_conn(conn.clone());
                }
                std::mem::replace(&mut self.remote_rtcp, conn)
            }
            Role::LocalRtp => {
                for stream in &mut self.remote_streams {
                    stream.set_destination_rtp_conn(conn.clone());
                }
                std::mem::replace(&mut self.local_rtp, conn)
            }
            Role::LocalRtcp => {
                for stream in &mut self.remote_streams {
                    stream.set_destination_rtcp_conn(conn.clone());
                }
                std::mem::replace(&mut self.local_rtcp, conn)
            }
        }
    }

    pub fn external_remote_rtp(&self) -> Option<SocketAddr> {
        self.external_remote_rtp
    }

    /// RTCP is not tracked separately and follows the RTP address
    pub fn external_remote_rtcp(&self) -> Option<SocketAddr> {
        self.external_remote_rtp
    }

    /// Update the learned remote address and every local stream's target
    pub fn set_external_remote_rtp(&mut self, addr: Option<SocketAddr>) {
        self.external_remote_rtp = addr;
        for stream in &mut self.local_streams {
            stream.set_destination_address(addr, addr);
        }
    }

    pub fn local_streams(&self) -> &[Stream] {
        &self.local_streams
    }

    pub fn remote_streams(&self) -> &[Stream] {
        &self.remote_streams
    }

    /// Stream received from the remote side, sent out via the local transports
    pub fn add_remote_stream(&mut self, mut stream: Stream) {
        stream.set_destination_rtp_conn(self.local_rtp.clone());
        stream.set_destination_rtcp_conn(self.local_rtcp.clone());
        self.remote_streams.push(stream);
    }

    /// Stream received from the local side, sent to the learned remote address
    pub fn add_local_stream(&mut self, mut stream: Stream) {
        stream.set_destination_rtp_conn(self.remote_rtp.clone());
        stream.set_destination_rtcp_conn(self.remote_rtcp.clone());
        stream.set_destination_address(self.external_remote_rtp, self.external_remote_rtp);
        self.local_streams.push(stream);
    }

    pub fn remove_local_stream(&mut self, ssrc: u32) -> bool {
        match self.local_streams.iter().position(|s| s.ssrc() == ssrc) {
            Some(pos) => {
                self.local_streams.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Offer a datagram received on `conn`.
    ///
    /// `None` means no role and stream of this point accepted it.
    pub fn dispatch(&mut self, conn: &ConnectionId, data: &[u8], from: SocketAddr) -> Option<StreamOutcome> {
        if self.remote_rtp.as_ref() == Some(conn) {
            if self.external_remote_rtp != Some(from) {
                return None;
            }
            if let Some(stream) = find_stream(&mut self.remote_streams, data, RTP_SSRC_OFFSET) {
                return Some(stream.on_rtp_received(data, from));
            }
        }

        if self.remote_rtcp.as_ref() == Some(conn) {
            if self.external_remote_rtcp() != Some(from) {
                return None;
            }
            if let Some(stream) = find_stream(&mut self.remote_streams, data, RTCP_SSRC_OFFSET) {
                return Some(stream.on_rtcp_received(data, from));
            }
        }

        if self.local_rtp.as_ref() == Some(conn) {
            if let Some(stream) = find_stream(&mut self.local_streams, data, RTP_SSRC_OFFSET) {
                trace!(ssrc = stream.ssrc(), "Local RTP matched");
                return Some(stream.on_rtp_received(data, from));
            }
        }

        if self.local_rtcp.as_ref() == Some(conn) {
            if let Some(stream) = find_stream(&mut self.local_streams, data, RTCP_SSRC_OFFSET) {
                trace!(ssrc = stream.ssrc(), "Local RTCP matched");
                return Some(stream.on_rtcp_received(data, from));
            }
        }

        None
    }
}

fn find_stream<'a>(streams: &'a mut [Stream], data: &[u8], offset: usize) -> Option<&'a mut Stream> {
    let ssrc = read_ssrc(data, offset)?;
    streams.iter_mut().find(|s| s.matches(ssrc))
}

/// Relay point registered under a caller-chosen id
#[derive(Debug)]
pub struct RelayPoint {
    id: String,
    state: RwLock<PointState>,
}

impl RelayPoint {
    pub fn new(id: impl Into<String>) -> Self {
        RelayPoint {
            id: id.into(),
            state: RwLock::new(PointState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, PointState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, PointState> {
        self.state.write().await
    }
}
