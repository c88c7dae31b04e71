//! Multi-hop delivery, dedup, and loop suppression over a scripted radio
//! topology.

mod common;

use std::time::Duration;

use common::{capture_events, settle, spawn_node, wait_for_event, TestWorld};
use meshradio::{MeshEvent, SendOptions};

/// A-B and B-C only: a transmission from A reaches C through B, and B
/// itself observes the packet exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn two_hop_text_delivery() {
    let world = TestWorld::new();
    let a = spawn_node(&world, 7).await;
    let b = spawn_node(&world, 7).await;
    let c = spawn_node(&world, 7).await;
    world.link(a.node_id(), b.node_id());
    world.link(b.node_id(), c.node_id());
    settle(700).await;

    let (mut c_events, _c_token) = capture_events(&c);
    let (mut b_events, _b_token) = capture_events(&b);

    let sent_id = a
        .transmit_text("HELLO", SendOptions::default())
        .await
        .unwrap();

    let delivered = wait_for_event(&mut c_events, Duration::from_secs(5), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await
    .expect("C must receive the two-hop transmission");

    match delivered {
        MeshEvent::TransmissionReceived(t) => {
            assert_eq!(t.content, b"HELLO");
            assert_eq!(t.sender_id, a.node_id());
            assert_eq!(t.channel, 7);
            assert_eq!(t.transmission_id, sent_id);
            assert!(!t.encrypted);
        }
        _ => unreachable!(),
    }

    // B delivers it exactly once despite flooding.
    let first = wait_for_event(&mut b_events, Duration::from_secs(2), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(first.is_some());
    let second = wait_for_event(&mut b_events, Duration::from_millis(800), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(second.is_none(), "duplicate delivery at B");

    // No duplicate at C either.
    let dup = wait_for_event(&mut c_events, Duration::from_millis(800), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(dup.is_none(), "duplicate delivery at C");

    for node in [a, b, c] {
        node.power_off().await.unwrap();
    }
}

/// Full triangle: everyone delivers once, nothing orbits.
#[tokio::test(flavor = "multi_thread")]
async fn triangle_floods_without_looping() {
    let world = TestWorld::new();
    let a = spawn_node(&world, 2).await;
    let b = spawn_node(&world, 2).await;
    let c = spawn_node(&world, 2).await;
    world.link(a.node_id(), b.node_id());
    world.link(b.node_id(), c.node_id());
    world.link(a.node_id(), c.node_id());
    settle(700).await;

    let (mut a_events, _a_token) = capture_events(&a);
    let (mut b_events, _b_token) = capture_events(&b);
    let (mut c_events, _c_token) = capture_events(&c);

    a.transmit_text("LOOP", SendOptions::default())
        .await
        .unwrap();

    for (who, events) in [("B", &mut b_events), ("C", &mut c_events)] {
        let got = wait_for_event(events, Duration::from_secs(5), |event| {
            matches!(event, MeshEvent::TransmissionReceived(t) if t.content == b"LOOP")
        })
        .await;
        assert!(got.is_some(), "{} missed the transmission", who);

        let dup = wait_for_event(events, Duration::from_millis(800), |event| {
            matches!(event, MeshEvent::TransmissionReceived(_))
        })
        .await;
        assert!(dup.is_none(), "{} delivered twice", who);
    }

    // The sender never sees its own packet come back up.
    let echo = wait_for_event(&mut a_events, Duration::from_millis(800), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(echo.is_none(), "A received its own transmission");

    for node in [a, b, c] {
        node.power_off().await.unwrap();
    }
}

/// Channel isolation: a transmission on channel 7 never surfaces on
/// channel 8.
#[tokio::test(flavor = "multi_thread")]
async fn foreign_channel_is_filtered() {
    let world = TestWorld::new();
    let a = spawn_node(&world, 7).await;
    let b = spawn_node(&world, 8).await;
    world.link(a.node_id(), b.node_id());
    settle(700).await;

    let (mut b_events, _b_token) = capture_events(&b);
    a.transmit_text("WRONG ROOM", SendOptions::default())
        .await
        .unwrap();

    let got = wait_for_event(&mut b_events, Duration::from_secs(2), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(got.is_none(), "transmission crossed channels");

    a.power_off().await.unwrap();
    b.power_off().await.unwrap();
}
