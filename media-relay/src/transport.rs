//! UDP transport with a dedicated receive task
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
use crate::registry::RelayState;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Transport id of the form `udp://<iface>:<port>/`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn for_addr(addr: SocketAddr) -> Self {
        ConnectionId(format!("udp://{}:{}/", addr.ip(), addr.port()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        ConnectionId(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which listener list a point is registered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Rtp,
    Rtcp,
}

/// Point ids registered for dispatch lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listeners {
    pub rtp: Vec<String>,
    pub rtcp: Vec<String>,
}

impl Listeners {
    /// RTP listeners first, then RTCP listeners
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.rtp.iter().chain(self.rtcp.iter())
    }

    fn list_mut(&mut self, channel: Channel) -> &mut Vec<String> {
        match channel {
            Channel::Rtp => &mut self.rtp,
            Channel::Rtcp => &mut self.rtcp,
        }
    }
}

/// One bound UDP endpoint
pub struct Transport {
    id: ConnectionId,
    local_addr: SocketAddr,
    // Emptied by `close`; the receive task holds the only other reference
    socket: RwLock<Option<Arc<UdpSocket>>>,
    listeners: RwLock<Listeners>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Take ownership of a bound socket and start receiving
    pub fn start(
        socket: UdpSocket,
        state: Weak<RelayState>,
        buffer_size: usize,
    ) -> RelayResult<Arc<Self>> {
        let local_addr = socket.local_addr()?;
        let id = ConnectionId::for_addr(local_addr);
        let socket = Arc::new(socket);

        let receiver = tokio::spawn(receive_loop(
            id.clone(),
            socket.clone(),
            state,
            buffer_size,
        ));

        Ok(Arc::new(Transport {
            id,
            local_addr,
            socket: RwLock::new(Some(socket)),
            listeners: RwLock::new(Listeners::default()),
            receiver: Mutex::new(Some(receiver)),
        }))
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> RelayResult<usize> {
        let socket = self.socket.read().await;
        let Some(socket) = socket.as_ref() else {
            return Err(RelayError::NetworkError(format!("{} is closed", self.id)));
        };
        let sent = socket.send_to(data, to).await?;
        trace!(id = %self.id, to = %to, len = sent, "Datagram sent");
        Ok(sent)
    }

    pub async fn register(&self, channel: Channel, point_id: &str) {
        debug!(id = %self.id, point = point_id, ?channel, "Registering listener");
        self.listeners
            .write()
            .await
            .list_mut(channel)
            .push(point_id.to_string());
    }

    /// Remove one registration of `point_id`
    pub async fn unregister(&self, channel: Channel, point_id: &str) {
        let mut listeners = self.listeners.write().await;
        let list = listeners.list_mut(channel);
        if let Some(pos) = list.iter().position(|id| id == point_id) {
            list.remove(pos);
        }
    }

    /// Copy of the current listener lists
    pub async fn listeners(&self) -> Listeners {
        self.listeners.read().await.clone()
    }

    /// Stop the receive task and release the socket.
    ///
    /// The port is free again once this returns.
    pub async fn close(&self) {
        let receiver = self.receiver.lock().await.take();
        if let Some(receiver) = receiver {
            receiver.abort();
            // resolves only after the task, and its socket handle, are dropped
            let _ = receiver.await;
        }
        self.socket.write().await.take();
    }

    pub async fn is_closed(&self) -> bool {
        self.socket.read().await.is_none()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.get_mut().take() {
            receiver.abort();
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn receive_loop(
    id: ConnectionId,
    socket: Arc<UdpSocket>,
    state: Weak<RelayState>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(id = %id, error = %e, "Receive failed, stopping transport");
                break;
            }
        };

        let Some(state) = state.upgrade() else {
            break;
        };
        trace!(id = %id, from = %from, len, "Datagram received");
        state.handle_datagram(&id, &buf[..len], from).await;
    }
    debug!(id = %id, "Receive loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_format() {
        let id = ConnectionId::for_addr("0.0.0.0:50000".parse().unwrap());
        assert_eq!(id.as_str(), "udp://0.0.0.0:50000/");
        assert_eq!(id.to_string(), "udp://0.0.0.0:50000/");
    }

    #[tokio::test]
    async fn test_listener_registration() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::start(socket, Weak::new(), 1500).unwrap();

        transport.register(Channel::Rtp, "a").await;
        transport.register(Channel::Rtp, "a").await;
        transport.register(Channel::Rtcp, "b").await;
        transport.unregister(Channel::Rtp, "a").await;

        let listeners = transport.listeners().await;
        assert_eq!(listeners.rtp, vec!["a".to_string()]);
        assert_eq!(listeners.rtcp, vec!["b".to_string()]);
        assert_eq!(listeners.iter().count(), 2);
    }

    #[tokio::test]
    async fn test_send_to() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::start(socket, Weak::new(), 1500).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        transport
            .send_to(b"ping", peer.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, transport.local_addr());
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = Transport::start(socket, Weak::new(), 1500).unwrap();
        let addr = transport.local_addr();

        transport.close().await;

        assert!(transport.is_closed().await);
        assert!(matches!(
            transport.send_to(b"late", addr).await,
            Err(RelayError::NetworkError(_))
        ));
        UdpSocket::bind(addr).await.unwrap();

        // closing twice is harmless
        transport.close().await;
    }
}
