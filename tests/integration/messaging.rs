use crate::*;

use parley_core::{DeliveryClass, BROADCAST};

#[tokio::test]
async fn broadcast_text_reaches_others_but_not_sender() {
    let server = TestServer::start().await.unwrap();
    let mut alice = server.login(7).await.unwrap();
    let mut bob = server.login(9).await.unwrap();

    alice
        .send(Text::new(7, BROADCAST, "hi", DeliveryClass::Group).unwrap())
        .await
        .unwrap();

    let got = bob.expect_text().await.unwrap();
    assert_eq!(got.sender, 7);
    assert_eq!(got.receiver, 9);
    assert_eq!(got.content_str(), "hi");
    assert!(alice.recv_within(QUIET).await.unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn private_text_reaches_only_its_receiver() {
    let server = TestServer::start().await.unwrap();
    let mut one = server.login(1).await.unwrap();
    let mut two = server.login(2).await.unwrap();
    let mut three = server.login(3).await.unwrap();

    one.send(Text::new(1, 3, "just you", DeliveryClass::Private).unwrap())
        .await
        .unwrap();

    let got = three.expect_text().await.unwrap();
    assert_eq!(got.sender, 1);
    assert_eq!(got.content_str(), "just you");
    assert!(two.recv_within(QUIET).await.unwrap().is_none());
    assert!(one.recv_within(QUIET).await.unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn texts_from_one_sender_arrive_in_order() {
    let server = TestServer::start().await.unwrap();
    let mut alice = server.login(10).await.unwrap();
    let mut bob = server.login(11).await.unwrap();

    for i in 0..20 {
        let body = format!("msg {i}");
        alice
            .send(Text::new(10, 11, body.into_bytes(), DeliveryClass::Private).unwrap())
            .await
            .unwrap();
    }
    for i in 0..20 {
        let got = bob.expect_text().await.unwrap();
        assert_eq!(got.content_str(), format!("msg {i}"));
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn text_to_logged_out_user_is_not_delivered() {
    let server = TestServer::start().await.unwrap();
    let mut alice = server.login(20).await.unwrap();
    let mut bob = server.login(21).await.unwrap();

    bob.identity(21, IdentityAction::Logout).await.unwrap();
    server.wait_until(|| !server.control.is_online(21)).await.unwrap();

    alice
        .send(Text::new(20, 21, "anyone there?", DeliveryClass::Private).unwrap())
        .await
        .unwrap();
    assert!(bob.recv_within(QUIET).await.unwrap().is_none());

    // Logging back in on the same connection resumes delivery.
    bob.identity(21, IdentityAction::Login).await.unwrap();
    server.wait_until(|| server.control.is_online(21)).await.unwrap();
    alice
        .send(Text::new(20, 21, "welcome back", DeliveryClass::Private).unwrap())
        .await
        .unwrap();
    assert_eq!(bob.expect_text().await.unwrap().content_str(), "welcome back");

    server.stop().await.unwrap();
}
