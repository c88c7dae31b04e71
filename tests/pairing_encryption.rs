//! Pairing and end-to-end encrypted voice across the mesh: bonded peers
//! decrypt, bystanders see nothing but an authentication-failure counter.

mod common;

use std::time::Duration;

use common::{capture_events, settle, spawn_node, wait_for_event, TestWorld};
use meshradio::{MeshEvent, SendOptions, TransmissionKind};

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_voice_reaches_only_the_bonded_peer() {
    let world = TestWorld::new();
    let a = spawn_node(&world, 1).await;
    let b = spawn_node(&world, 1).await;
    let x = spawn_node(&world, 1).await;
    world.link(a.node_id(), b.node_id());
    world.link(a.node_id(), x.node_id());
    world.link(b.node_id(), x.node_id());
    settle(700).await;

    // Out-of-band pairing: exchange blobs, compare the 6-character code.
    let b_id = a.ingest_pairing_code(&b.generate_pairing_code()).unwrap();
    let a_id = b.ingest_pairing_code(&a.generate_pairing_code()).unwrap();
    let code_on_a = a.verification_code(&b_id).unwrap();
    let code_on_b = b.verification_code(&a_id).unwrap();
    assert_eq!(code_on_a, code_on_b, "both devices must display one code");
    assert_eq!(code_on_a.len(), 6);
    assert!(a.verify_pairing(&b_id, &code_on_b).unwrap());
    assert!(b.verify_pairing(&a_id, &code_on_a).unwrap());

    let (mut b_events, _b_token) = capture_events(&b);
    let (mut x_events, _x_token) = capture_events(&x);

    let frame = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x10, 0x20, 0x30];
    a.transmit_voice(
        &frame,
        SendOptions {
            priority: 5,
            encrypt: true,
        },
    )
    .await
    .unwrap();

    let delivered = wait_for_event(&mut b_events, Duration::from_secs(5), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await
    .expect("bonded peer must decrypt the voice frame");
    match delivered {
        MeshEvent::TransmissionReceived(t) => {
            assert!(t.encrypted);
            assert_eq!(t.kind, TransmissionKind::Voice);
            assert_eq!(t.content, frame);
            assert_eq!(t.sender_id, a.node_id());
        }
        _ => unreachable!(),
    }

    // The bystander gets no decodable transmission, only a counter bump.
    let leaked = wait_for_event(&mut x_events, Duration::from_secs(1), |event| {
        matches!(event, MeshEvent::TransmissionReceived(_))
    })
    .await;
    assert!(leaked.is_none(), "unpaired node decoded bonded traffic");
    let x_status = x.status().await;
    assert!(
        x_status.counters.auth_failures >= 1,
        "auth failure counter must record the rejected copy"
    );

    for node in [a, b, x] {
        node.power_off().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_pairing_blob_is_rejected() {
    use std::sync::Arc;

    use meshradio::config::NodeConfig;
    use meshradio::crypto::{PairingBlob, PAIRING_BLOB_TTL_MS};
    use meshradio::platform::{Clock, MemoryBlobStore, Platform, StaticDeviceMonitor};
    use meshradio::MeshNode;

    struct FixedClock(u64);
    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }
    }

    // The recipient's clock sits well past the blob's embedded timestamp.
    let platform = Platform {
        clock: Arc::new(FixedClock(PAIRING_BLOB_TTL_MS * 3)),
        monitor: Arc::new(StaticDeviceMonitor::new()),
        store: Arc::new(MemoryBlobStore::new()),
    };
    let node = MeshNode::new(NodeConfig::default(), platform).unwrap();

    let stale = PairingBlob::new([9u8; 16], [1u8; 32], 0).encode();
    assert!(node.ingest_pairing_code(&stale).is_err());

    // A fresh one is fine.
    let fresh = PairingBlob::new([9u8; 16], [1u8; 32], PAIRING_BLOB_TTL_MS * 3 - 1000).encode();
    assert!(node.ingest_pairing_code(&fresh).is_ok());

    assert!(node.ingest_pairing_code("complete garbage").is_err());
}
