//! Control command dispatch
//!
//! Maps one [`ControlMessage`] onto the relay state and produces exactly one
//! reply, `<COMMAND>_OK` or `<COMMAND>_FAILED`. `DIE`/`q` stop the agent and
//! unknown types are ignored.
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


use crate::control::{parse_udp_address, ControlMessage};
use crate::error::{RelayError, RelayResult};
use crate::point::IceCredentials;
use crate::registry::{PointConfig, RelayState};
use crate::stream::Stream;
use crate::transform::{srtp_transform, TransformMode};
use crate::transport::ConnectionId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Commands understood on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    OpenConn,
    CloseConn,
    AddPoint,
    RemovePoint,
    AddRemoteStream,
    AddLocalStream,
    RemoveLocalStream,
    Die,
}

const COMMANDS: &[(&str, Command)] = &[
    ("OPEN_CONN", Command::OpenConn),
    ("CLOSE_CONN", Command::CloseConn),
    ("ADD_POINT", Command::AddPoint),
    ("REMOVE_POINT", Command::RemovePoint),
    ("ADD_REMOTE_STREAM", Command::AddRemoteStream),
    ("ADD_LOCAL_STREAM", Command::AddLocalStream),
    ("REMOVE_LOCAL_STREAM", Command::RemoveLocalStream),
    ("DIE", Command::Die),
    ("q", Command::Die),
];

impl Command {
    pub fn from_type(message_type: &str) -> Option<Self> {
        COMMANDS
            .iter()
            .find(|(name, _)| *name == message_type)
            .map(|(_, command)| *command)
    }

    /// Canonical name, used as the reply type prefix
    pub fn name(self) -> &'static str {
        match self {
            Command::OpenConn => "OPEN_CONN",
            Command::CloseConn => "CLOSE_CONN",
            Command::AddPoint => "ADD_POINT",
            Command::RemovePoint => "REMOVE_POINT",
            Command::AddRemoteStream => "ADD_REMOTE_STREAM",
            Command::AddLocalStream => "ADD_LOCAL_STREAM",
            Command::RemoveLocalStream => "REMOVE_LOCAL_STREAM",
            Command::Die => "DIE",
        }
    }
}

/// What the control loop should do after a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Reply(ControlMessage),
    Shutdown,
    Ignored,
}

/// Applies control commands to a [`RelayState`], one at a time
pub struct ControlDispatcher {
    state: Arc<RelayState>,
    default_iface: String,
    default_ports: String,
}

impl ControlDispatcher {
    pub fn new(
        state: Arc<RelayState>,
        default_iface: impl Into<String>,
        default_ports: impl Into<String>,
    ) -> Self {
        ControlDispatcher {
            state,
            default_iface: default_iface.into(),
            default_ports: default_ports.into(),
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Run one command to completion
    pub async fn handle(&self, message: &ControlMessage) -> DispatchOutcome {
        let Some(command) = Command::from_type(message.message_type()) else {
            warn!(message_type = message.message_type(), "Unknown control message");
            return DispatchOutcome::Ignored;
        };
        debug!(command = command.name(), request = %message, "Handling control command");

        let result = match command {
            Command::Die => return DispatchOutcome::Shutdown,
            Command::OpenConn => self.open_conn(message).await,
            Command::CloseConn => self.close_conn(message).await,
            Command::AddPoint => self.add_point(message).await,
            Command::RemovePoint => self.remove_point(message).await,
            Command::AddRemoteStream => self.add_remote_stream(message).await,
            Command::AddLocalStream => self.add_local_stream(message).await,
            Command::RemoveLocalStream => self.remove_local_stream(message).await,
        };

        let reply = match result {
            Ok(extra) => {
                let mut reply = message.reply(&format!("{}_OK", command.name()));
                for (name, value) in extra {
                    reply.set_arg(name, value);
                }
                reply
            }
            Err(e) => {
                warn!(command = command.name(), request = %message, error = %e, "Control command failed");
                message.reply(&format!("{}_FAILED", command.name()))
            }
        };
        DispatchOutcome::Reply(reply)
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        self.state.shutdown().await;
    }

    async fn open_conn(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let iface = message.non_empty_arg("iface").unwrap_or(self.default_iface.as_str());
        let ports = message.non_empty_arg("port").unwrap_or(self.default_ports.as_str());

        let transport = self.state.open_connection(ports, iface).await?;
        Ok(vec![
            ("port", transport.local_addr().port().to_string()),
            ("iface", iface.to_string()),
            ("id", transport.id().to_string()),
        ])
    }

    async fn close_conn(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let id = required(message, "id")?;
        self.state.close_connection(&ConnectionId::from(id)).await?;
        Ok(Vec::new())
    }

    async fn add_point(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let id = required(message, "id")?;
        let conn = |name: &str| message.non_empty_arg(name).map(ConnectionId::from);

        let ice = match (message.non_empty_arg("localIce"), message.non_empty_arg("remoteIce")) {
            (Some(local), Some(remote)) => Some((
                IceCredentials::parse_pair(local)?,
                IceCredentials::parse_pair(remote)?,
            )),
            _ => None,
        };

        if message.has_arg("externalRemoteRtcp") {
            debug!(point = id, "externalRemoteRtcp ignored, RTCP follows the RTP address");
        }

        let config = PointConfig {
            id: id.to_string(),
            local_rtp: conn("localRtp"),
            remote_rtp: conn("remoteRtp"),
            local_rtcp: conn("localRtcp"),
            remote_rtcp: conn("remoteRtcp"),
            ice,
            external_remote_rtp: message.arg("externalRemoteRtp").and_then(parse_udp_address),
        };
        self.state.add_point(config).await?;
        Ok(Vec::new())
    }

    async fn remove_point(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let id = required(message, "id")?;
        self.state.remove_point(id).await?;
        Ok(Vec::new())
    }

    async fn add_remote_stream(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let point_id = required(message, "pointId")?;
        let rtp = message
            .arg("rtp")
            .and_then(parse_udp_address)
            .ok_or_else(|| RelayError::InvalidArgument("rtp address missing or invalid".to_string()))?;
        let rtcp = message.arg("rtcp").and_then(parse_udp_address);

        let mut stream = build_stream(message, TransformMode::Decrypt)?;
        stream.set_destination_address(Some(rtp), rtcp);

        self.state.add_remote_stream(point_id, stream).await?;
        Ok(Vec::new())
    }

    async fn add_local_stream(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let point_id = required(message, "pointId")?;
        let stream = build_stream(message, TransformMode::Encrypt)?;

        self.state.add_local_stream(point_id, stream).await?;
        Ok(Vec::new())
    }

    async fn remove_local_stream(&self, message: &ControlMessage) -> RelayResult<Vec<(&'static str, String)>> {
        let point_id = required(message, "pointId")?;
        let ssrc = parse_ssrc(required(message, "ssrc")?)?;

        self.state.remove_local_stream(point_id, ssrc).await?;
        info!(point = point_id, ssrc, "Local stream removed");
        Ok(Vec::new())
    }
}

fn required<'a>(message: &'a ControlMessage, name: &str) -> RelayResult<&'a str> {
    message
        .non_empty_arg(name)
        .ok_or_else(|| RelayError::InvalidArgument(format!("missing argument {}", name)))
}

fn parse_ssrc(value: &str) -> RelayResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| RelayError::InvalidArgument(format!("invalid ssrc {:?}", value)))
}

/// Stream from `ssrc`, `newSsrc` and `key`; a key selects `keyed_mode`
fn build_stream(message: &ControlMessage, keyed_mode: TransformMode) -> RelayResult<Stream> {
    let ssrc = message.non_empty_arg("ssrc").map(parse_ssrc).transpose()?.unwrap_or(0);
    let mut stream = Stream::new(ssrc);

    if let Some(new_ssrc) = message.non_empty_arg("newSsrc").map(parse_ssrc).transpose()? {
        if new_ssrc != 0 {
            stream = stream.with_new_ssrc(new_ssrc);
        }
    }
    if let Some(key) = message.non_empty_arg("key") {
        stream = stream.with_transform(keyed_mode, srtp_transform(key)?);
    }
    Ok(stream)
}
