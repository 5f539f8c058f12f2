//! ICE connectivity check handling
//!
//! Answers STUN Binding Requests addressed to a point's local ufrag,
//! learns the sender as the point's remote address and sends a check
//! back towards it.
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


use crate::point::IceCredentials;
use crate::registry::RelayState;
use crate::stun_codec::{attribute, StunAttribute, StunMessage, StunMessageType};
use crate::transport::Transport;
use bytes::Bytes;
use std::net::{SocketAddr, SocketAddrV4};
use tracing::{debug, warn};

/// PRIORITY carried by outbound checks
pub const CHECK_PRIORITY: [u8; 4] = [0x6e, 0x00, 0x1e, 0xff];

/// Split `local:remote`; anything without a separator has no usable ufrags
pub fn split_username(username: &str) -> Option<(&str, &str)> {
    username.split_once(':')
}

/// Binding Success Response to `request`, keyed with the local password
pub fn binding_response(request: &StunMessage, from: SocketAddrV4, local_pwd: &str) -> StunMessage {
    let mut response = StunMessage::success_response(request);
    response
        .add_attribute(StunAttribute::xor_mapped_address(from))
        .set_message_integrity(local_pwd)
        .set_fingerprint();
    response
}

/// Outbound Binding Request towards the peer, keyed with the remote password
pub fn connectivity_check(local_ufrag: &str, remote_ufrag: &str, remote_pwd: &str) -> StunMessage {
    let mut check = StunMessage::with_random_transaction_id(StunMessageType::BindingRequest);
    check
        .add_attribute(StunAttribute::username(&format!("{}:{}", remote_ufrag, local_ufrag)))
        .add_attribute(StunAttribute::opaque(
            attribute::PRIORITY,
            Bytes::from_static(&CHECK_PRIORITY),
        ))
        .add_attribute(StunAttribute::opaque(attribute::USE_CANDIDATE, Bytes::new()))
        .set_message_integrity(remote_pwd)
        .set_fingerprint();
    check
}

/// Run the binding request algorithm for a request received on `transport`
pub(crate) async fn handle_binding_request(
    state: &RelayState,
    transport: &Transport,
    request: &StunMessage,
    from: SocketAddr,
) {
    let username = request.username().unwrap_or_default();
    let Some((local_ufrag, remote_ufrag)) = split_username(&username) else {
        debug!(from = %from, username = %username, "Binding request without ufrag pair");
        return;
    };

    let SocketAddr::V4(from_v4) = from else {
        debug!(from = %from, "Binding request from non-IPv4 sender");
        return;
    };

    let listeners = transport.listeners().await;

    let mut credentials: Option<(IceCredentials, IceCredentials)> = None;
    for point_id in listeners.iter() {
        let Some(point) = state.points().get(point_id).await else {
            continue;
        };
        let point_state = point.read().await;
        let local = point_state.local_ice();
        if !local.ufrag.is_empty() && local.ufrag == local_ufrag {
            credentials = Some((local.clone(), point_state.remote_ice().clone()));
            break;
        }
    }

    let Some((local, remote)) = credentials else {
        debug!(
            id = %transport.id(),
            from = %from,
            local_ufrag,
            remote_ufrag,
            "Binding request for unknown user"
        );
        return;
    };

    debug!(id = %transport.id(), from = %from, local_ufrag, remote_ufrag, "Binding request");

    for point_id in &listeners.rtp {
        if let Some(point) = state.points().get(point_id).await {
            point.write().await.set_external_remote_rtp(Some(from));
        }
    }

    let response = binding_response(request, from_v4, &local.pwd);
    if let Err(e) = transport.send_to(&response.write(), from).await {
        warn!(to = %from, error = %e, "Failed to send binding response");
    }

    let check = connectivity_check(local_ufrag, remote_ufrag, &remote.pwd);
    if let Err(e) = transport.send_to(&check.write(), from).await {
        warn!(to = %from, error = %e, "Failed to send connectivity check");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun_codec::AttributeValue;

    #[test]
    fn test_split_username() {
        assert_eq!(split_username("L:R"), Some(("L", "R")));
        assert_eq!(split_username("L:R:x"), Some(("L", "R:x")));
        assert_eq!(split_username("LR"), None);
    }

    #[test]
    fn test_binding_response_contents() {
        let mut request = StunMessage::new(StunMessageType::BindingRequest, [7u8; 12]);
        request.add_attribute(StunAttribute::username("L:R"));
        let from: SocketAddrV4 = "203.0.113.9:40000".parse().unwrap();

        let bytes = binding_response(&request, from, "localpwd").write();
        let parsed = StunMessage::parse(&bytes).unwrap();

        assert_eq!(parsed.message_type, StunMessageType::BindingSuccessResponse);
        assert_eq!(parsed.transaction_id, [7u8; 12]);
        assert_eq!(parsed.xor_mapped_address(), Some(from));
        let types: Vec<u16> = parsed.attributes.iter().map(|a| a.attribute_type).collect();
        assert_eq!(
            types,
            vec![
                attribute::XOR_MAPPED_ADDRESS,
                attribute::MESSAGE_INTEGRITY,
                attribute::FINGERPRINT
            ]
        );
    }

    #[test]
    fn test_connectivity_check_contents() {
        let check = connectivity_check("L", "R", "remotepwd");
        let parsed = StunMessage::parse(&check.write()).unwrap();

        assert!(parsed.is_binding_request());
        assert_eq!(parsed.username().as_deref(), Some("R:L"));
        assert_eq!(
            parsed.attribute(attribute::PRIORITY).map(|a| a.value.clone()),
            Some(AttributeValue::Opaque(Bytes::from_static(&CHECK_PRIORITY)))
        );
        assert!(parsed.attribute(attribute::USE_CANDIDATE).is_some());
        assert!(parsed.attribute(attribute::MESSAGE_INTEGRITY).is_some());
        assert!(parsed.attribute(attribute::FINGERPRINT).is_some());
    }

    #[test]
    fn test_checks_use_fresh_transaction_ids() {
        let a = connectivity_check("L", "R", "pwd");
        let b = connectivity_check("L", "R", "pwd");
        assert_ne!(a.transaction_id, b.transaction_id);
    }
}
