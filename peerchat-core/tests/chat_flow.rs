//! Room chat end to end over the in-process fabric: delivery, echo suppression,
//! defaults, bulk delivery and room switching.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{fast_config, init_test_logging, star, with_timeout};
use peerchat_core::{Fabric, MemoryHub, RoomSession, RoomSwitcher};

#[tokio::test]
async fn hello_reaches_peer_but_not_author() {
    init_test_logging();
    let hub = MemoryHub::new();
    let nodes = star(&hub, 2).await;
    let config = fast_config();
    let mut a = RoomSession::join(nodes[0].as_ref(), "A", "lobby", &config).await.unwrap();
    let mut b = RoomSession::join(nodes[1].as_ref(), "B", "lobby", &config).await.unwrap();

    a.send("hello").await.unwrap();
    let got = with_timeout(b.incoming.recv()).await.unwrap();
    assert_eq!(got.message, "hello");
    assert_eq!(got.sender_name, "A");
    assert_eq!(got.sender_id, nodes[0].local_id());

    let echo = tokio::time::timeout(Duration::from_millis(100), a.incoming.recv()).await;
    assert!(echo.is_err(), "author received its own message");

    a.exit().await;
    b.exit().await;
}

#[tokio::test]
async fn both_directions_through_a_relay() {
    let hub = MemoryHub::new();
    // nodes[1] and nodes[2] only reach each other through nodes[0]
    let nodes = star(&hub, 3).await;
    let config = fast_config();
    let mut left = RoomSession::join(nodes[1].as_ref(), "left", "lobby", &config).await.unwrap();
    let mut right = RoomSession::join(nodes[2].as_ref(), "right", "lobby", &config).await.unwrap();

    left.send("to the right").await.unwrap();
    right.send("to the left").await.unwrap();
    assert_eq!(with_timeout(right.incoming.recv()).await.unwrap().message, "to the right");
    assert_eq!(with_timeout(left.incoming.recv()).await.unwrap().message, "to the left");
    assert_eq!(left.peer_list(), vec![nodes[2].local_id()]);

    left.exit().await;
    right.exit().await;
}

#[tokio::test]
async fn empty_names_join_the_default_room() {
    let hub = MemoryHub::new();
    let nodes = star(&hub, 2).await;
    let config = fast_config();
    let a = RoomSession::join(nodes[0].as_ref(), "", "", &config).await.unwrap();
    let mut b = RoomSession::join(nodes[1].as_ref(), "bob", "default_room", &config)
        .await
        .unwrap();
    assert_eq!(a.display_name(), "default_user");
    assert_eq!(a.room_name(), "default_room");

    a.send("anyone?").await.unwrap();
    let got = with_timeout(b.incoming.recv()).await.unwrap();
    assert_eq!(got.sender_name, "default_user");

    a.exit().await;
    b.exit().await;
}

#[tokio::test]
async fn hundred_messages_arrive_once_each_in_order() {
    let hub = MemoryHub::new();
    let nodes = star(&hub, 2).await;
    let config = fast_config();
    let a = RoomSession::join(nodes[0].as_ref(), "A", "bulk", &config).await.unwrap();
    let mut b = RoomSession::join(nodes[1].as_ref(), "B", "bulk", &config).await.unwrap();

    let sender = a.outgoing().unwrap();
    let producer = tokio::spawn(async move {
        for i in 0..100 {
            sender.send(format!("msg {}", i)).await.unwrap();
        }
    });

    let mut seen = HashSet::new();
    for i in 0..100 {
        let got = with_timeout(b.incoming.recv()).await.unwrap();
        assert_eq!(got.message, format!("msg {}", i));
        assert!(seen.insert(got.message));
    }
    producer.await.unwrap();
    let extra = tokio::time::timeout(Duration::from_millis(100), b.incoming.recv()).await;
    assert!(extra.is_err(), "duplicate delivery");

    a.exit().await;
    b.exit().await;
}

#[tokio::test]
async fn switched_session_receives_new_room_traffic() {
    let hub = MemoryHub::new();
    let nodes = star(&hub, 2).await;
    let config = fast_config();
    let switcher = RoomSwitcher::new(nodes[0].clone(), config.clone());
    let mut active = switcher.join("A", "old").await.unwrap();
    let b = RoomSession::join(nodes[1].as_ref(), "B", "new", &config).await.unwrap();

    let teardown = switcher.switch_room(&mut active, "", "new").await.unwrap();
    // published before the old session is gone
    b.send("welcome").await.unwrap();
    let got = with_timeout(active.incoming.recv()).await.unwrap();
    assert_eq!(got.message, "welcome");
    assert_eq!(active.room_name(), "new");
    assert_eq!(active.generation(), 1);

    with_timeout(teardown).await.unwrap();
    b.send("still here").await.unwrap();
    assert_eq!(with_timeout(active.incoming.recv()).await.unwrap().message, "still here");

    active.exit().await;
    b.exit().await;
}

#[tokio::test]
async fn leaving_removes_member_from_peer_list() {
    let hub = MemoryHub::new();
    let nodes = star(&hub, 3).await;
    let config = fast_config();
    let a = RoomSession::join(nodes[0].as_ref(), "A", "r", &config).await.unwrap();
    let b = RoomSession::join(nodes[1].as_ref(), "B", "r", &config).await.unwrap();
    let c = RoomSession::join(nodes[2].as_ref(), "C", "r", &config).await.unwrap();

    let mut expected = vec![nodes[1].local_id(), nodes[2].local_id()];
    expected.sort();
    assert_eq!(a.peer_list(), expected);

    c.exit().await;
    assert_eq!(a.peer_list(), vec![nodes[1].local_id()]);

    a.exit().await;
    b.exit().await;
}
