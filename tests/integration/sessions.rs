use crate::*;

use parley_core::DeliveryClass;

fn fast_sweep() -> Options {
    Options {
        sweep: Duration::from_millis(150),
        ..Options::default()
    }
}

#[tokio::test]
async fn silent_user_is_evicted_and_disconnected() {
    let server = TestServer::start_with(fast_sweep()).await.unwrap();
    let mut quiet = server.login(5).await.unwrap();

    server
        .wait_until(|| server.control.get_connections().is_empty())
        .await
        .unwrap();
    assert!(quiet.closed_within(WAIT).await, "evicted user still connected");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_keeps_user_registered() {
    let server = TestServer::start_with(fast_sweep()).await.unwrap();
    let mut quiet = server.login(5).await.unwrap();
    let mut lively = server.login(6).await.unwrap();

    let beats = async {
        for _ in 0..20 {
            lively.identity(6, IdentityAction::Heartbeat).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
    };
    let evicted = async {
        server
            .wait_until(|| !server.control.get_connections().iter().any(|c| c.uid == 5))
            .await
    };
    let ((), evicted) = tokio::join!(beats, evicted);
    evicted.unwrap();

    let ids: Vec<_> = server
        .control
        .get_connections()
        .into_iter()
        .map(|c| c.uid)
        .collect();
    assert_eq!(ids, vec![6]);
    assert!(quiet.closed_within(WAIT).await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn second_login_replaces_first_connection() {
    let server = TestServer::start().await.unwrap();
    let mut first = server.login(8).await.unwrap();
    let mut sender = server.login(1).await.unwrap();

    let mut second = Client::connect(server.control_addr).await.unwrap();
    second.identity(8, IdentityAction::Login).await.unwrap();
    assert!(first.closed_within(WAIT).await, "displaced connection left open");

    // The closed first connection must not take the new one offline.
    tokio::time::sleep(QUIET).await;
    assert!(server.control.is_online(8));

    sender
        .send(Text::new(1, 8, "to the new one", DeliveryClass::Private).unwrap())
        .await
        .unwrap();
    assert_eq!(second.expect_text().await.unwrap().content_str(), "to the new one");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_marks_user_offline() {
    let server = TestServer::start().await.unwrap();
    let client = server.login(12).await.unwrap();
    drop(client);

    server
        .wait_until(|| !server.control.is_online(12))
        .await
        .unwrap();
    let conns = server.control.get_connections();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].uid, 12);
    assert!(!conns[0].online);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn connection_listing_reports_peer_addresses() {
    let server = TestServer::start().await.unwrap();
    let _a = server.login(30).await.unwrap();
    let _b = server.login(31).await.unwrap();

    let mut conns = server.control.get_connections();
    conns.sort_by_key(|c| c.uid);
    assert_eq!(conns.len(), 2);
    assert_eq!(conns[0].uid, 30);
    assert_eq!(conns[1].uid, 31);
    assert!(conns.iter().all(|c| c.online && c.addr.ip().is_loopback()));

    server.stop().await.unwrap();
}
