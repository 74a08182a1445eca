use crate::*;

use parley_core::{DeliveryClass, PacketKind, BROADCAST};

/// A frame whose checksum does not match its payload.
fn corrupt_frame() -> Vec<u8> {
    let mut frame = Message::from(Text::new(1, 2, "x", DeliveryClass::Private).unwrap())
        .encode()
        .unwrap()
        .to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;
    frame
}

#[tokio::test]
async fn malformed_packets_are_skipped() {
    let server = TestServer::start().await.unwrap();
    let mut peer = server.login(2).await.unwrap();
    let mut client = Client::connect(server.control_addr).await.unwrap();

    let mut junk = Vec::new();
    junk.extend_from_slice(b"not a frame at all");
    junk.extend_from_slice(&corrupt_frame());
    junk.extend_from_slice(&corrupt_frame());
    client.send_raw(&junk).await.unwrap();

    client.identity(1, IdentityAction::Login).await.unwrap();
    server.wait_until(|| server.control.is_online(1)).await.unwrap();

    client
        .send(Text::new(1, 2, "still here", DeliveryClass::Private).unwrap())
        .await
        .unwrap();
    assert_eq!(peer.expect_text().await.unwrap().content_str(), "still here");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_packet_type_is_skipped() {
    let server = TestServer::start().await.unwrap();
    let mut peer = server.login(2).await.unwrap();
    let mut client = server.login(1).await.unwrap();

    let unknown = wire::encode(0x7Fu16, b"whatever").unwrap();
    client.send_raw(&unknown).await.unwrap();
    let wrong_size = wire::encode(PacketKind::Text, &[0u8; 3]).unwrap();
    client.send_raw(&wrong_size).await.unwrap();

    client
        .send(Text::new(1, BROADCAST, "after junk", DeliveryClass::Group).unwrap())
        .await
        .unwrap();
    assert_eq!(peer.expect_text().await.unwrap().content_str(), "after junk");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn persistent_garbage_closes_connection() {
    let opts = Options {
        max_decode_errors: 4,
        ..Options::default()
    };
    let server = TestServer::start_with(opts).await.unwrap();
    let mut client = server.login(3).await.unwrap();

    let junk: Vec<u8> = (0..4).flat_map(|_| corrupt_frame()).collect();
    client.send_raw(&junk).await.unwrap();

    assert!(client.closed_within(WAIT).await, "connection survived garbage");
    server
        .wait_until(|| !server.control.is_online(3))
        .await
        .unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn bulk_connection_must_open_with_file_request() {
    let server = TestServer::start().await.unwrap();
    let mut stream = TcpStream::connect(server.bulk_addr).await.unwrap();
    let hello = Message::from(Identity::new(1, IdentityAction::Login))
        .encode()
        .unwrap();
    stream.write_all(&hello).await.unwrap();

    let mut rest = Vec::new();
    let read = tokio::time::timeout(WAIT, stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "bulk connection not closed");
    assert!(rest.is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn file_request_on_control_channel_is_ignored() {
    let server = TestServer::start().await.unwrap();
    let mut client = server.login(4).await.unwrap();

    let request = parley_core::File::new(4, "x.bin", 1, parley_core::FileAction::Upload).unwrap();
    client.send(request).await.unwrap();
    assert!(client.recv_within(QUIET).await.unwrap().is_none());
    assert!(server.control.is_online(4));

    server.stop().await.unwrap();
}
