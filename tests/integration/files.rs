use crate::*;

use parley_core::config::Negotiation;
use parley_core::{DeliveryClass, File, FileAction, BROADCAST};
use parley_services::{BulkReceiver, BulkSender};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn upload(server: &TestServer, uid: UserId, name: &str, data: &[u8]) -> u64 {
    let request = File::new(uid, name, data.len() as u64, FileAction::Upload).unwrap();
    let stream = open_bulk(server, request).await.unwrap();
    BulkSender::new(stream, server.transfer.clone())
        .send_from(data, data.len() as u64)
        .await
        .unwrap()
}

async fn download(server: &TestServer, uid: UserId, name: &str) -> Vec<u8> {
    let request = File::new(uid, name, 0, FileAction::Download).unwrap();
    let stream = open_bulk(server, request).await.unwrap();
    let mut out = Vec::new();
    BulkReceiver::new(stream, server.transfer.clone())
        .receive_into(&mut out)
        .await
        .unwrap();
    out
}

async fn round_trip(opts: Options, len: usize) {
    let server = TestServer::start_with(opts).await.unwrap();
    let mut alice = server.login(7).await.unwrap();
    let mut bob = server.login(9).await.unwrap();
    let data = payload(len);

    assert_eq!(upload(&server, 7, "report.bin", &data).await, len as u64);

    let expected = format!("file available: report.bin ({len} bytes)");
    for client in [&mut alice, &mut bob] {
        let notice = client.expect_text().await.unwrap();
        assert_eq!(notice.sender, BROADCAST);
        assert_eq!(notice.class, DeliveryClass::Group);
        assert_eq!(notice.content_str(), expected);
    }
    assert_eq!(std::fs::read(server.repo.join("report.bin")).unwrap(), data);

    assert_eq!(download(&server, 9, "report.bin").await, data);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn upload_then_download_size_first() {
    round_trip(Options::default(), 10 * 4096 + 7).await;
}

#[tokio::test]
async fn upload_then_download_sentinel_acknowledged() {
    let opts = Options {
        negotiation: Negotiation::Sentinel,
        acknowledged: true,
        chunk_size: 1024,
        ..Options::default()
    };
    round_trip(opts, 5 * 1024).await;
}

#[tokio::test]
async fn empty_file_round_trips() {
    round_trip(Options::default(), 0).await;
}

#[tokio::test]
async fn resumed_upload_appends_at_offset() {
    let server = TestServer::start().await.unwrap();
    let mut alice = server.login(4).await.unwrap();

    upload(&server, 4, "log.txt", b"first half, ").await;
    alice.expect_text().await.unwrap();

    let request = File::new(4, "log.txt", 23, FileAction::Upload)
        .unwrap()
        .at_offset(12);
    let stream = open_bulk(&server, request).await.unwrap();
    let rest = b"second half";
    BulkSender::new(stream, server.transfer.clone())
        .send_from(&rest[..], rest.len() as u64)
        .await
        .unwrap();

    let notice = alice.expect_text().await.unwrap();
    assert_eq!(notice.content_str(), "file available: log.txt (23 bytes)");
    assert_eq!(
        std::fs::read(server.repo.join("log.txt")).unwrap(),
        b"first half, second half"
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn download_of_missing_file_notifies_requester() {
    let server = TestServer::start().await.unwrap();
    let mut alice = server.login(5).await.unwrap();

    let request = File::new(5, "nope.bin", 0, FileAction::Download).unwrap();
    let mut stream = open_bulk(&server, request).await.unwrap();

    let notice = alice.expect_text().await.unwrap();
    assert_eq!(notice.receiver, 5);
    assert_eq!(notice.class, DeliveryClass::Private);
    assert!(notice.content_str().contains("nope.bin"), "{}", notice.content_str());

    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn path_escaping_filename_is_refused() {
    let server = TestServer::start().await.unwrap();
    let mut alice = server.login(6).await.unwrap();

    let request = File::new(6, "../escape.txt", 4, FileAction::Upload).unwrap();
    let stream = open_bulk(&server, request).await.unwrap();
    let _ = BulkSender::new(stream, server.transfer.clone())
        .send_from(&b"evil"[..], 4)
        .await;

    let notice = alice.expect_text().await.unwrap();
    assert!(notice.content_str().contains("failed"), "{}", notice.content_str());
    assert!(!server.repo.parent().unwrap().join("escape.txt").exists());
    server.stop().await.unwrap();
}
