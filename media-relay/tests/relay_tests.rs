//! End-to-end relay tests over loopback UDP

use media_relay::stun_codec::attribute;
use media_relay::transform::srtp_transform;
use media_relay::{
    ControlDispatcher, ControlMessage, DispatchOutcome, IceCredentials, PointConfig, RelayState,
    Stream, StunAttribute, StunMessage, StunMessageType, TransformMode, Transport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_test::assert_ok;

const KEY: &str = "325b26a87034dffd4dd5a2af2a78391fc5233eadb3e65cae7ba215b8da8f";
const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

async fn peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf.truncate(len);
    (buf, from)
}

async fn assert_silent(socket: &UdpSocket) {
    let mut buf = vec![0u8; 2048];
    assert!(timeout(QUIET, socket.recv_from(&mut buf)).await.is_err());
}

fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x80, 0x60];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&160u32.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

fn ssrc_of(packet: &[u8]) -> u32 {
    u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]])
}

async fn open(state: &RelayState) -> Arc<Transport> {
    state.open_connection("0", "127.0.0.1").await.unwrap()
}

#[tokio::test]
async fn test_ice_handshake_learns_remote_address() {
    let state = RelayState::new(2048);
    let local = open(&state).await;
    let remote = open(&state).await;

    let point = assert_ok!(
        state
            .add_point(PointConfig {
                id: "p1".to_string(),
                local_rtp: Some(local.id().clone()),
                remote_rtp: Some(remote.id().clone()),
                ice: Some((IceCredentials::new("L", "lpwd"), IceCredentials::new("R", "rpwd"))),
                ..Default::default()
            })
            .await
    );

    let browser = peer().await;
    let browser_addr = browser.local_addr().unwrap();

    let mut request = StunMessage::new(StunMessageType::BindingRequest, [7u8; 12]);
    request
        .add_attribute(StunAttribute::username("L:R"))
        .set_message_integrity("lpwd")
        .set_fingerprint();
    browser.send_to(&request.write(), remote.local_addr()).await.unwrap();

    let (first, from) = recv(&browser).await;
    assert_eq!(from, remote.local_addr());
    let response = StunMessage::parse(&first).expect("response parses");
    assert_eq!(response.message_type, StunMessageType::BindingSuccessResponse);
    assert_eq!(response.transaction_id, [7u8; 12]);
    assert_eq!(response.xor_mapped_address().map(SocketAddr::V4), Some(browser_addr));
    assert!(response.attribute(attribute::MESSAGE_INTEGRITY).is_some());
    assert!(response.attribute(attribute::FINGERPRINT).is_some());

    let (second, _) = recv(&browser).await;
    let check = StunMessage::parse(&second).expect("check parses");
    assert!(check.is_binding_request());
    assert_eq!(check.username().as_deref(), Some("R:L"));
    assert!(check.attribute(attribute::PRIORITY).is_some());
    assert!(check.attribute(attribute::USE_CANDIDATE).is_some());

    assert_silent(&browser).await;
    assert_eq!(point.read().await.external_remote_rtp(), Some(browser_addr));
    state.shutdown().await;
}

fn binding_request(username: &str, password: &str) -> Vec<u8> {
    let mut request = StunMessage::with_random_transaction_id(StunMessageType::BindingRequest);
    request
        .add_attribute(StunAttribute::username(username))
        .set_message_integrity(password)
        .set_fingerprint();
    request.write()
}

fn rtcp_packet(sender_ssrc: u32) -> Vec<u8> {
    // receiver report with one zeroed report block
    let mut packet = vec![0x81, 201, 0x00, 0x07];
    packet.extend_from_slice(&sender_ssrc.to_be_bytes());
    packet.extend_from_slice(&[0u8; 24]);
    packet
}

#[tokio::test]
async fn test_ice_sets_address_on_every_rtp_listener() {
    let state = RelayState::new(2048);
    let local_a = open(&state).await;
    let local_b = open(&state).await;
    let shared_remote = open(&state).await;

    let matched = state
        .add_point(PointConfig {
            id: "matched".to_string(),
            local_rtp: Some(local_a.id().clone()),
            remote_rtp: Some(shared_remote.id().clone()),
            ice: Some((IceCredentials::new("L", "lpwd"), IceCredentials::new("R", "rpwd"))),
            ..Default::default()
        })
        .await
        .unwrap();
    let bystander = state
        .add_point(PointConfig {
            id: "bystander".to_string(),
            local_rtp: Some(local_b.id().clone()),
            remote_rtp: Some(shared_remote.id().clone()),
            ice: Some((IceCredentials::new("Q", "qpwd"), IceCredentials::new("S", "spwd"))),
            ..Default::default()
        })
        .await
        .unwrap();

    let browser = peer().await;
    let browser_addr = browser.local_addr().unwrap();
    browser
        .send_to(&binding_request("L:R", "lpwd"), shared_remote.local_addr())
        .await
        .unwrap();

    let (first, _) = recv(&browser).await;
    let (second, _) = recv(&browser).await;
    assert_eq!(
        StunMessage::parse(&first).map(|m| m.message_type),
        Some(StunMessageType::BindingSuccessResponse)
    );
    assert!(StunMessage::parse(&second).is_some_and(|m| m.is_binding_request()));

    assert_eq!(matched.read().await.external_remote_rtp(), Some(browser_addr));
    assert_eq!(bystander.read().await.external_remote_rtp(), Some(browser_addr));
    state.shutdown().await;
}

#[tokio::test]
async fn test_ice_matches_rtcp_only_listener() {
    let state = RelayState::new(2048);
    let local = open(&state).await;
    let remote = open(&state).await;
    let remote_rtcp = open(&state).await;

    let point = state
        .add_point(PointConfig {
            id: "p1".to_string(),
            local_rtp: Some(local.id().clone()),
            remote_rtp: Some(remote.id().clone()),
            remote_rtcp: Some(remote_rtcp.id().clone()),
            ice: Some((IceCredentials::new("L", "lpwd"), IceCredentials::new("R", "rpwd"))),
            ..Default::default()
        })
        .await
        .unwrap();

    let browser = peer().await;
    browser
        .send_to(&binding_request("L:R", "lpwd"), remote_rtcp.local_addr())
        .await
        .unwrap();

    let (first, from) = recv(&browser).await;
    assert_eq!(from, remote_rtcp.local_addr());
    let response = StunMessage::parse(&first).expect("response parses");
    assert_eq!(response.message_type, StunMessageType::BindingSuccessResponse);
    let (second, _) = recv(&browser).await;
    let check = StunMessage::parse(&second).expect("check parses");
    assert_eq!(check.username().as_deref(), Some("R:L"));

    // only RTP listeners learn the sender
    assert_eq!(point.read().await.external_remote_rtp(), None);
    state.shutdown().await;
}

#[tokio::test]
async fn test_rtcp_relay_both_directions() {
    let state = RelayState::new(2048);
    let local = open(&state).await;
    let local_rtcp = open(&state).await;
    let remote = open(&state).await;
    let remote_rtcp = open(&state).await;

    let browser = peer().await;
    let media_rtp = peer().await;
    let media_rtcp = peer().await;

    state
        .add_point(PointConfig {
            id: "p1".to_string(),
            local_rtp: Some(local.id().clone()),
            local_rtcp: Some(local_rtcp.id().clone()),
            remote_rtp: Some(remote.id().clone()),
            remote_rtcp: Some(remote_rtcp.id().clone()),
            external_remote_rtp: Some(browser.local_addr().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut inbound = Stream::new(0x1111).with_new_ssrc(0x2222);
    inbound.set_destination_address(
        Some(media_rtp.local_addr().unwrap()),
        Some(media_rtcp.local_addr().unwrap()),
    );
    state.add_remote_stream("p1", inbound).await.unwrap();
    state.add_local_stream("p1", Stream::new(0x3333)).await.unwrap();

    // remote -> local: matched on the sender SSRC, never rewritten
    let report = rtcp_packet(0x1111);
    browser.send_to(&report, remote_rtcp.local_addr()).await.unwrap();
    let (relayed, from) = recv(&media_rtcp).await;
    assert_eq!(from, local_rtcp.local_addr());
    assert_eq!(relayed, report);
    assert_silent(&media_rtp).await;

    // local -> remote, towards the learned address
    let report = rtcp_packet(0x3333);
    media_rtcp.send_to(&report, local_rtcp.local_addr()).await.unwrap();
    let (relayed, from) = recv(&browser).await;
    assert_eq!(from, remote_rtcp.local_addr());
    assert_eq!(relayed, report);

    // sender SSRC without a stream
    media_rtcp
        .send_to(&rtcp_packet(0x4444), local_rtcp.local_addr())
        .await
        .unwrap();
    assert_silent(&browser).await;

    state.shutdown().await;
}

#[tokio::test]
async fn test_binding_request_for_unknown_ufrag_is_dropped() {
    let state = RelayState::new(2048);
    let local = open(&state).await;
    let remote = open(&state).await;
    let point = state
        .add_point(PointConfig {
            id: "p1".to_string(),
            local_rtp: Some(local.id().clone()),
            remote_rtp: Some(remote.id().clone()),
            ice: Some((IceCredentials::new("L", "lpwd"), IceCredentials::new("R", "rpwd"))),
            ..Default::default()
        })
        .await
        .unwrap();

    let browser = peer().await;
    let mut request = StunMessage::new(StunMessageType::BindingRequest, [1u8; 12]);
    request.add_attribute(StunAttribute::username("X:R"));
    browser.send_to(&request.write(), remote.local_addr()).await.unwrap();

    assert_silent(&browser).await;
    assert_eq!(point.read().await.external_remote_rtp(), None);
    state.shutdown().await;
}

#[tokio::test]
async fn test_relay_both_directions_with_ssrc_rewrite() {
    let state = RelayState::new(2048);
    let local = open(&state).await;
    let remote = open(&state).await;

    let browser = peer().await;
    let media_server = peer().await;

    state
        .add_point(PointConfig {
            id: "p1".to_string(),
            local_rtp: Some(local.id().clone()),
            remote_rtp: Some(remote.id().clone()),
            external_remote_rtp: Some(browser.local_addr().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut inbound = Stream::new(0x1111).with_new_ssrc(0x2222);
    inbound.set_destination_address(Some(media_server.local_addr().unwrap()), None);
    state.add_remote_stream("p1", inbound).await.unwrap();
    state.add_local_stream("p1", Stream::new(0)).await.unwrap();

    // remote -> local, rewritten
    let packet = rtp_packet(1, 0x1111, b"voice");
    browser.send_to(&packet, remote.local_addr()).await.unwrap();
    let (relayed, from) = recv(&media_server).await;
    assert_eq!(from, local.local_addr());
    assert_eq!(ssrc_of(&relayed), 0x2222);
    assert_eq!(&relayed[12..], b"voice");

    // local -> remote, wildcard stream
    let packet = rtp_packet(1, 0x3333, b"reply");
    media_server.send_to(&packet, local.local_addr()).await.unwrap();
    let (relayed, from) = recv(&browser).await;
    assert_eq!(from, remote.local_addr());
    assert_eq!(relayed, packet);

    // unknown SSRC from the remote side matches nothing
    browser
        .send_to(&rtp_packet(2, 0x4444, b"stray"), remote.local_addr())
        .await
        .unwrap();
    assert_silent(&media_server).await;

    state.shutdown().await;
}

#[tokio::test]
async fn test_remote_media_from_unlearned_address_is_dropped() {
    let state = RelayState::new(2048);
    let local = open(&state).await;
    let remote = open(&state).await;
    let browser = peer().await;
    let intruder = peer().await;
    let media_server = peer().await;

    state
        .add_point(PointConfig {
            id: "p1".to_string(),
            local_rtp: Some(local.id().clone()),
            remote_rtp: Some(remote.id().clone()),
            external_remote_rtp: Some(browser.local_addr().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut inbound = Stream::new(0);
    inbound.set_destination_address(Some(media_server.local_addr().unwrap()), None);
    state.add_remote_stream("p1", inbound).await.unwrap();

    intruder
        .send_to(&rtp_packet(1, 5, b"spoof"), remote.local_addr())
        .await
        .unwrap();
    assert_silent(&media_server).await;

    state.shutdown().await;
}

/// Two points back to back: the first encrypts, the second decrypts
async fn srtp_chain(decrypt_key: &str) -> (Arc<RelayState>, UdpSocket, UdpSocket, Arc<Transport>) {
    let state = RelayState::new(2048);
    let l1 = open(&state).await;
    let r1 = open(&state).await;
    let l2 = open(&state).await;
    let r2 = open(&state).await;
    let sender = peer().await;
    let receiver = peer().await;

    state
        .add_point(PointConfig {
            id: "encrypting".to_string(),
            local_rtp: Some(l1.id().clone()),
            remote_rtp: Some(r1.id().clone()),
            external_remote_rtp: Some(r2.local_addr()),
            ..Default::default()
        })
        .await
        .unwrap();
    state
        .add_point(PointConfig {
            id: "decrypting".to_string(),
            local_rtp: Some(l2.id().clone()),
            remote_rtp: Some(r2.id().clone()),
            external_remote_rtp: Some(r1.local_addr()),
            ..Default::default()
        })
        .await
        .unwrap();

    let outbound = Stream::new(0).with_transform(TransformMode::Encrypt, srtp_transform(KEY).unwrap());
    state.add_local_stream("encrypting", outbound).await.unwrap();

    let mut inbound =
        Stream::new(0).with_transform(TransformMode::Decrypt, srtp_transform(decrypt_key).unwrap());
    inbound.set_destination_address(Some(receiver.local_addr().unwrap()), None);
    state.add_remote_stream("decrypting", inbound).await.unwrap();

    (state, sender, receiver, l1)
}

#[tokio::test]
async fn test_srtp_encrypt_then_decrypt() {
    let (state, sender, receiver, entry) = srtp_chain(KEY).await;

    for seq in 0..3u16 {
        let packet = rtp_packet(seq, 0xABCD, b"secret media");
        sender.send_to(&packet, entry.local_addr()).await.unwrap();
        let (relayed, _) = recv(&receiver).await;
        assert_eq!(relayed, packet);
    }

    state.shutdown().await;
}

#[tokio::test]
async fn test_srtp_wrong_key_drops_packets() {
    let other_key = "e1f97a0d3e018be0d64fa32c06de41390ec675ad498afeebb6960b3aabe6";
    let (state, sender, receiver, entry) = srtp_chain(other_key).await;

    sender
        .send_to(&rtp_packet(0, 0xABCD, b"secret media"), entry.local_addr())
        .await
        .unwrap();
    assert_silent(&receiver).await;

    state.shutdown().await;
}

#[tokio::test]
async fn test_control_lines_drive_the_relay() {
    let dispatcher = ControlDispatcher::new(RelayState::new(2048), "127.0.0.1", "0");
    let browser = peer().await;
    let media_server = peer().await;

    async fn send(dispatcher: &ControlDispatcher, line: &str) -> ControlMessage {
        let message = assert_ok!(ControlMessage::parse_line(line));
        match dispatcher.handle(&message).await {
            DispatchOutcome::Reply(reply) => reply,
            other => panic!("no reply to {}: {:?}", line, other),
        }
    }

    let local = send(&dispatcher, "OPEN_CONN").await;
    let remote = send(&dispatcher, "OPEN_CONN").await;
    assert_eq!(local.message_type(), "OPEN_CONN_OK");
    let local_id = local.arg("id").unwrap().to_string();
    let remote_id = remote.arg("id").unwrap().to_string();
    let remote_port: u16 = remote.arg("port").unwrap().parse().unwrap();

    let reply = send(
        &dispatcher,
        &format!(
            "ADD_POINT id=call localRtp={} remoteRtp={} externalRemoteRtp=udp://{}",
            local_id,
            remote_id,
            browser.local_addr().unwrap()
        ),
    )
    .await;
    assert_eq!(reply.to_line(), format!(
        "type=ADD_POINT_OK externalRemoteRtp=udp://{} id=call localRtp={} remoteRtp={}",
        browser.local_addr().unwrap(),
        local_id,
        remote_id
    ));

    let reply = send(
        &dispatcher,
        &format!(
            "ADD_REMOTE_STREAM pointId=call rtp=udp://{} ssrc=10 newSsrc=20",
            media_server.local_addr().unwrap()
        ),
    )
    .await;
    assert_eq!(reply.message_type(), "ADD_REMOTE_STREAM_OK");

    let relay_addr: SocketAddr = ([127, 0, 0, 1], remote_port).into();
    browser.send_to(&rtp_packet(1, 10, b"hi"), relay_addr).await.unwrap();
    let (relayed, _) = recv(&media_server).await;
    assert_eq!(ssrc_of(&relayed), 20);

    let reply = send(&dispatcher, "REMOVE_POINT id=call").await;
    assert_eq!(reply.message_type(), "REMOVE_POINT_OK");
    browser.send_to(&rtp_packet(2, 10, b"hi"), relay_addr).await.unwrap();
    assert_silent(&media_server).await;

    let quit = assert_ok!(ControlMessage::parse_line("q"));
    assert_eq!(dispatcher.handle(&quit).await, DispatchOutcome::Shutdown);
    dispatcher.shutdown().await;
    assert!(dispatcher.state().connections().is_empty().await);
}
