//! Emergency preemption of a congested link and store-and-forward
//! delivery once a route appears.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{capture_events, settle, spawn_node, wait_for_event, TestWorld};
use meshradio::{MeshEvent, SendOptions};
use parking_lot::Mutex;

/// Back up a slow link with normal texts, then fire an emergency beacon:
/// it must overtake nearly the whole backlog.
#[tokio::test(flavor = "multi_thread")]
async fn emergency_preempts_backlogged_texts() {
    let world = TestWorld::with_send_delay(Duration::from_millis(30));
    let a = spawn_node(&world, 5).await;
    let b = spawn_node(&world, 5).await;
    world.link(a.node_id(), b.node_id());
    settle(700).await;

    // Record arrival order at B.
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let order_writer = order.clone();
    let _token = b.subscribe_events(move |event| match event {
        MeshEvent::TransmissionReceived(_) => order_writer.lock().push("text"),
        MeshEvent::EmergencyReceived(_) => order_writer.lock().push("emergency"),
        _ => {}
    });

    const BACKLOG: usize = 50;
    for i in 0..BACKLOG {
        a.transmit_text(&format!("text-{}", i), SendOptions::default())
            .await
            .unwrap();
    }
    let beacon = a.send_emergency_beacon("MAYDAY", None).await.unwrap();
    assert_eq!(beacon.len(), 16);

    // 51 frames at 30 ms each, plus slack.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        {
            let seen = order.lock();
            if seen.len() >= BACKLOG + 1 {
                break;
            }
        }
        if tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let seen = order.lock().clone();
    let emergency_pos = seen
        .iter()
        .position(|kind| *kind == "emergency")
        .expect("emergency beacon never arrived");
    assert!(
        emergency_pos <= 4,
        "emergency arrived at position {} behind the backlog",
        emergency_pos
    );
    assert!(
        seen.iter().filter(|kind| **kind == "text").count() >= BACKLOG - 2,
        "backlog was mostly lost: {:?}",
        seen.len()
    );

    a.power_off().await.unwrap();
    b.power_off().await.unwrap();
}

/// Transmit with nobody in range: the packet parks, then delivers exactly
/// once when a peer appears, with its original id and timestamp.
#[tokio::test(flavor = "multi_thread")]
async fn parked_packet_delivers_when_route_appears() {
    let world = TestWorld::new();
    let a = spawn_node(&world, 9).await;
    let b = spawn_node(&world, 9).await;
    // No link yet: A is alone in the dark.

    let sent_id = a
        .transmit_text("LATE", SendOptions::default())
        .await
        .unwrap();
    settle(400).await;

    let (mut b_events, _b_token) = capture_events(&b);

    // The peers come into range; announcements flow and wake the parked
    // packet.
    world.link(a.node_id(), b.node_id());

    let delivered = wait_for_event(&mut b_events, Duration::from_secs(5), |event| {
        matches!(event, MeshEvent::TransmissionReceived(t) if t.content == b"LATE")
    })
    .await
    .expect("parked transmission must deliver once a route exists");

    match delivered {
        MeshEvent::TransmissionReceived(t) => {
            // Original identity and send-time survive the parking.
            assert_eq!(t.transmission_id, sent_id);
            assert!(
                t.timestamp_ms < 1500,
                "timestamp was regenerated on retry: {}",
                t.timestamp_ms
            );
        }
        _ => unreachable!(),
    }

    let duplicate = wait_for_event(&mut b_events, Duration::from_secs(1), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(duplicate.is_none(), "parked packet delivered twice");

    a.power_off().await.unwrap();
    b.power_off().await.unwrap();
}

/// An emergency sent into the void parks forever and retries; it must
/// deliver after the mesh heals.
#[tokio::test(flavor = "multi_thread")]
async fn parked_emergency_survives_until_contact() {
    let world = TestWorld::new();
    let a = spawn_node(&world, 4).await;
    let b = spawn_node(&world, 4).await;

    a.send_emergency_beacon("STRANDED", Some((46.5, 8.0)))
        .await
        .unwrap();
    settle(400).await;

    let (mut b_events, _b_token) = capture_events(&b);
    world.link(a.node_id(), b.node_id());

    let delivered = wait_for_event(&mut b_events, Duration::from_secs(8), |event| {
        matches!(event, MeshEvent::EmergencyReceived(t) if t.content == b"STRANDED")
    })
    .await;
    assert!(delivered.is_some(), "emergency never escaped the parked queue");

    a.power_off().await.unwrap();
    b.power_off().await.unwrap();
}
