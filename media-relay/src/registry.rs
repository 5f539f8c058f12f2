//! Connection and point registries, and the shared relay state
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
use crate::ice;
use crate::point::{IceCredentials, RelayPoint, Role};
use crate::ranges;
use crate::stream::{read_ssrc, Delivery, Stream, StreamOutcome, RTP_SSRC_OFFSET};
use crate::stun_codec::StunMessage;
use crate::transport::{ConnectionId, Transport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Open transports by id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Transport>>>,
}

impl ConnectionRegistry {
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Transport>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, transport: Arc<Transport>) {
        self.connections
            .write()
            .await
            .insert(transport.id().clone(), transport);
    }

    async fn remove(&self, id: &ConnectionId) -> Option<Arc<Transport>> {
        self.connections.write().await.remove(id)
    }

    async fn drain(&self) -> Vec<Arc<Transport>> {
        self.connections.write().await.drain().map(|(_, t)| t).collect()
    }
}

/// Relay points by id
#[derive(Debug, Default)]
pub struct PointRegistry {
    points: RwLock<HashMap<String, Arc<RelayPoint>>>,
}

impl PointRegistry {
    pub async fn get(&self, id: &str) -> Option<Arc<RelayPoint>> {
        self.points.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.points.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert(&self, point: Arc<RelayPoint>) -> RelayResult<()> {
        let mut points = self.points.write().await;
        if points.contains_key(point.id()) {
            return Err(RelayError::AlreadyExists(point.id().to_string()));
        }
        points.insert(point.id().to_string(), point);
        Ok(())
    }

    // Only reachable through RelayState::remove_point, after unbinding
    async fn remove(&self, id: &str) -> Option<Arc<RelayPoint>> {
        self.points.write().await.remove(id)
    }
}

/// Arguments of a new relay point
#[derive(Debug, Clone, Default)]
pub struct PointConfig {
    pub id: String,
    pub local_rtp: Option<ConnectionId>,
    pub remote_rtp: Option<ConnectionId>,
    pub local_rtcp: Option<ConnectionId>,
    pub remote_rtcp: Option<ConnectionId>,
    pub ice: Option<(IceCredentials, IceCredentials)>,
    pub external_remote_rtp: Option<SocketAddr>,
}

/// Everything the receive tasks and the control loop share
#[derive(Debug)]
pub struct RelayState {
    connections: ConnectionRegistry,
    points: PointRegistry,
    recv_buffer_size: usize,
    this: Weak<RelayState>,
}

impl RelayState {
    pub fn new(recv_buffer_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| RelayState {
            connections: ConnectionRegistry::default(),
            points: PointRegistry::default(),
            recv_buffer_size,
            this: this.clone(),
        })
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn points(&self) -> &PointRegistry {
        &self.points
    }

    /// Bind a port from `ports` on `iface` and start its receive task
    pub async fn open_connection(&self, ports: &str, iface: &str) -> RelayResult<Arc<Transport>> {
        let socket = ranges::bind_udp(ports, iface).await?;
        let transport = Transport::start(socket, self.this.clone(), self.recv_buffer_size)?;
        self.connections.insert(transport.clone()).await;

        info!(id = %transport.id(), addr = %transport.local_addr(), "Connection opened");
        Ok(transport)
    }

    /// Unbind every point from the transport, then close it
    pub async fn close_connection(&self, id: &ConnectionId) -> RelayResult<()> {
        let transport = self
            .connections
            .get(id)
            .await
            .ok_or_else(|| RelayError::UnknownTarget(id.to_string()))?;

        let listeners = transport.listeners().await;
        for point_id in listeners.iter() {
            let Some(point) = self.points.get(point_id).await else {
                continue;
            };
            for role in Role::ALL {
                let bound_here = point.read().await.binding(role) == Some(id);
                if bound_here {
                    self.unbind(&point, role).await;
                }
            }
        }

        self.connections.remove(id).await;
        transport.close().await;
        info!(id = %id, "Connection closed");
        Ok(())
    }

    /// Create a point and bind it to its transports.
    ///
    /// Every referenced transport is resolved before anything is inserted,
    /// so a failure leaves no trace.
    pub async fn add_point(&self, config: PointConfig) -> RelayResult<Arc<RelayPoint>> {
        if config.id.is_empty() {
            return Err(RelayError::InvalidArgument("point id is empty".to_string()));
        }
        if self.points.contains(&config.id).await {
            return Err(RelayError::AlreadyExists(config.id));
        }

        let local_rtp = self.require(config.local_rtp.as_ref(), "localRtp").await?;
        let remote_rtp = self.require(config.remote_rtp.as_ref(), "remoteRtp").await?;
        let local_rtcp = self.resolve(config.local_rtcp.as_ref()).await?;
        let remote_rtcp = self.resolve(config.remote_rtcp.as_ref()).await?;

        let point = Arc::new(RelayPoint::new(config.id.clone()));
        {
            let mut state = point.write().await;
            if let Some((local, remote)) = config.ice {
                state.set_ice(local, remote);
            }
            state.set_external_remote_rtp(config.external_remote_rtp);
        }
        self.points.insert(point.clone()).await?;

        self.bind(&point, Role::RemoteRtp, Some(&remote_rtp)).await;
        self.bind(&point, Role::RemoteRtcp, remote_rtcp.as_ref()).await;
        self.bind(&point, Role::LocalRtp, Some(&local_rtp)).await;
        self.bind(&point, Role::LocalRtcp, local_rtcp.as_ref()).await;

        info!(id = %config.id, "Point added");
        Ok(point)
    }

    /// Unbind from every transport, then drop the point
    pub async fn remove_point(&self, id: &str) -> RelayResult<()> {
        let point = self
            .points
            .get(id)
            .await
            .ok_or_else(|| RelayError::UnknownTarget(id.to_string()))?;

        for role in Role::ALL {
            self.unbind(&point, role).await;
        }
        self.points.remove(id).await;

        info!(id = %id, "Point removed");
        Ok(())
    }

    pub async fn add_remote_stream(&self, point_id: &str, stream: Stream) -> RelayResult<()> {
        let point = self.point(point_id).await?;
        debug!(point = point_id, ssrc = stream.ssrc(), "Adding remote stream");
        point.write().await.add_remote_stream(stream);
        Ok(())
    }

    pub async fn add_local_stream(&self, point_id: &str, stream: Stream) -> RelayResult<()> {
        let point = self.point(point_id).await?;
        debug!(point = point_id, ssrc = stream.ssrc(), "Adding local stream");
        point.write().await.add_local_stream(stream);
        Ok(())
    }

    pub async fn remove_local_stream(&self, point_id: &str, ssrc: u32) -> RelayResult<()> {
        let point = self.point(point_id).await?;
        if point.write().await.remove_local_stream(ssrc) {
            debug!(point = point_id, ssrc, "Local stream removed");
            Ok(())
        } else {
            Err(RelayError::UnknownTarget(format!(
                "point {} has no local stream {}",
                point_id, ssrc
            )))
        }
    }

    /// Entry point for every datagram read by a transport
    pub async fn handle_datagram(&self, conn_id: &ConnectionId, data: &[u8], from: SocketAddr) {
        let Some(transport) = self.connections.get(conn_id).await else {
            return;
        };

        match StunMessage::parse(data) {
            Some(request) if request.is_binding_request() => {
                ice::handle_binding_request(self, &transport, &request, from).await;
            }
            _ => self.dispatch_media(&transport, data, from).await,
        }
    }

    /// Close every transport
    pub async fn shutdown(&self) {
        let transports = self.connections.drain().await;
        for transport in &transports {
            transport.close().await;
        }
        info!(closed = transports.len(), "Relay state shut down");
    }

    async fn dispatch_media(&self, transport: &Transport, data: &[u8], from: SocketAddr) {
        let listeners = transport.listeners().await;

        for point_id in listeners.iter() {
            let Some(point) = self.points.get(point_id).await else {
                continue;
            };
            let outcome = point.write().await.dispatch(transport.id(), data, from);

            match outcome {
                Some(StreamOutcome::Forward(delivery)) => {
                    self.deliver(delivery).await;
                    return;
                }
                Some(StreamOutcome::NoDestination) => return,
                Some(StreamOutcome::Rejected(e)) => {
                    debug!(point = %point_id, error = %e, "Packet rejected by stream");
                }
                None => {}
            }
        }

        self.log_unmatched(transport, data, from).await;
    }

    async fn deliver(&self, delivery: Delivery) {
        let Some(transport) = self.connections.get(&delivery.via).await else {
            debug!(via = %delivery.via, "Destination connection is closed");
            return;
        };
        if let Err(e) = transport.send_to(&delivery.packet, delivery.to).await {
            warn!(via = %delivery.via, to = %delivery.to, error = %e, "Forwarding failed");
        }
    }

    async fn log_unmatched(&self, transport: &Transport, data: &[u8], from: SocketAddr) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let listeners = transport.listeners().await;
        debug!(
            id = %transport.id(),
            from = %from,
            ssrc = ?read_ssrc(data, RTP_SSRC_OFFSET),
            candidates = listeners.rtp.len(),
            "Packet from unknown host"
        );

        for point_id in &listeners.rtp {
            let Some(point) = self.points.get(point_id).await else {
                continue;
            };
            let state = point.read().await;
            let ssrcs: Vec<u32> = state.local_streams().iter().map(Stream::ssrc).collect();
            debug!(
                point = %point_id,
                external = ?state.external_remote_rtp(),
                remote_streams = state.remote_streams().len(),
                local_ssrcs = ?ssrcs,
                "Candidate point"
            );
        }
    }

    async fn point(&self, id: &str) -> RelayResult<Arc<RelayPoint>> {
        self.points
            .get(id)
            .await
            .ok_or_else(|| RelayError::UnknownTarget(format!("point {}", id)))
    }

    async fn require(&self, id: Option<&ConnectionId>, name: &str) -> RelayResult<Arc<Transport>> {
        let id = id.ok_or_else(|| RelayError::InvalidArgument(format!("{} is required", name)))?;
        self.connections
            .get(id)
            .await
            .ok_or_else(|| RelayError::UnknownTarget(id.to_string()))
    }

    async fn resolve(&self, id: Option<&ConnectionId>) -> RelayResult<Option<Arc<Transport>>> {
        match id {
            Some(id) => Ok(Some(
                self.connections
                    .get(id)
                    .await
                    .ok_or_else(|| RelayError::UnknownTarget(id.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn bind(&self, point: &RelayPoint, role: Role, transport: Option<&Arc<Transport>>) {
        self.unbind(point, role).await;
        let Some(transport) = transport else {
            return;
        };
        point
            .write()
            .await
            .set_binding(role, Some(transport.id().clone()));
        transport.register(role.channel(), point.id()).await;
    }

    async fn unbind(&self, point: &RelayPoint, role: Role) {
        let previous = point.write().await.set_binding(role, None);
        if let Some(conn_id) = previous {
            if let Some(transport) = self.connections.get(&conn_id).await {
                transport.unregister(role.channel(), point.id()).await;
            }
        }
    }
}
