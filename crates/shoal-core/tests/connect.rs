mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shoal_core::protocol::{
    decode_envelope, encode_envelope, ConnectRequest, ConnectionChange, ConnectionStatus,
    MessageKind, Topic,
};
use shoal_core::{
    BackMasterChannel, ChannelConfig, FrontMasterChannel, FrontUid, JsonCodec, ShardError,
    SpliceDelta,
};
use test_timeout::tokio_timeout_test;
use transport_bus::{Bus, BusMessage, LocalBus};

use common::{settle, Cluster, FrontRecorder};

#[tokio_timeout_test(30, paused)]
async fn connect_waits_for_every_shard() {
    let cluster = Cluster::new(&[&["a"], &["b"]], 1);
    let recorder_a = Arc::new(FrontRecorder::default());
    let recorder_b = Arc::new(FrontRecorder::default());
    cluster.front_channel(0, "a").set_handler(recorder_a.clone());
    cluster.front_channel(0, "b").set_handler(recorder_b.clone());

    cluster.connect().await;

    let front_a = cluster.front_channel(0, "a");
    assert!(front_a.is_connected());
    assert_eq!(front_a.back_master_index(), Some(0));
    assert_eq!(
        front_a.connected_channel_ids(),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(cluster.front_channel(0, "b").back_master_index(), Some(1));
    assert_eq!(*recorder_a.connected.lock(), vec![0]);
    assert_eq!(*recorder_b.connected.lock(), vec![1]);

    // Every back channel learns of every front, mirrored or not.
    let back_a = cluster.back_channel("a");
    assert_eq!(
        back_a.connected_front_uids(),
        vec![FrontUid::new("a", 0), FrontUid::new("b", 0)]
    );
    assert_eq!(back_a.mirrored_front_uids(), vec![FrontUid::new("a", 0)]);
    assert_eq!(cluster.backs[0].connected_front_masters(), vec![0]);

    // Connecting again is a no-op and fires nothing.
    front_a.connect().await.expect("reconnect");
    assert_eq!(recorder_a.connected.lock().len(), 1);
}

#[tokio_timeout_test(30, paused)]
async fn connect_times_out_with_outstanding_count() {
    let bus = Arc::new(LocalBus::new());
    let _back = BackMasterChannel::new(
        0,
        ["a"],
        bus.clone(),
        Arc::new(JsonCodec),
        Arc::new(SpliceDelta),
    )
    .expect("back master");
    let config = ChannelConfig {
        connect_timeout: Duration::from_secs(2),
        ..ChannelConfig::default()
    };
    let front = FrontMasterChannel::new(0, ["a", "b", "c"], bus.clone(), Arc::new(JsonCodec), config)
        .expect("front master");

    let channel = front.channel("a").expect("channel");
    let err = channel.connect().await.unwrap_err();
    match err {
        ShardError::ConnectTimeout {
            channel_id,
            outstanding,
        } => {
            assert_eq!(channel_id, "a");
            assert_eq!(outstanding, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!channel.is_connected());
}

#[tokio_timeout_test(30, paused)]
async fn acks_from_unknown_shards_do_not_count() {
    let bus = Arc::new(LocalBus::new());
    let _back = BackMasterChannel::new(
        0,
        ["a", "x"],
        bus.clone(),
        Arc::new(JsonCodec),
        Arc::new(SpliceDelta),
    )
    .expect("back master");
    let config = ChannelConfig {
        connect_timeout: Duration::from_secs(2),
        ..ChannelConfig::default()
    };
    let front = FrontMasterChannel::new(0, ["a", "b"], bus.clone(), Arc::new(JsonCodec), config)
        .expect("front master");

    let channel = front.channel("a").expect("channel");
    let err = channel.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ShardError::ConnectTimeout { outstanding: 1, .. }
    ));
    assert!(!channel.is_connected());
    assert_eq!(channel.connected_channel_ids(), vec!["a".to_string()]);
}

#[tokio_timeout_test(30, paused)]
async fn concurrent_connect_is_rejected() {
    let cluster = Cluster::new(&[&["a"]], 1);
    let front = cluster.front_channel(0, "a");
    let (first, second) = tokio::join!(front.connect(), front.connect());
    first.expect("first connect");
    assert!(matches!(
        second,
        Err(ShardError::AlreadyConnecting { .. })
    ));
}

#[tokio_timeout_test(30, paused)]
async fn repeated_connect_is_acknowledged_again() {
    let cluster = Cluster::new(&[&["a"]], 0);
    let front_uid = FrontUid::new("a", 7);
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    cluster
        .bus
        .pull(
            &Topic::for_front(MessageKind::ConnectionChange, &front_uid).to_string(),
            Arc::new(move |message: BusMessage| {
                let change: ConnectionChange =
                    decode_envelope(&message.payload).expect("decode");
                sink.lock().push(change);
            }),
        )
        .expect("pull");

    let request = encode_envelope(&ConnectRequest {
        channel_id: "a".into(),
        front_uid: front_uid.clone(),
        front_master_index: 7,
    })
    .expect("encode");
    cluster
        .bus
        .publish(&Topic::connect().to_string(), request.clone())
        .expect("publish");
    cluster
        .bus
        .publish(&Topic::connect().to_string(), request)
        .expect("publish");
    settle().await;

    let replies = replies.lock();
    assert_eq!(replies.len(), 2);
    assert!(replies
        .iter()
        .all(|change| change.status == ConnectionStatus::Connected && change.back_master_index == 0));
    assert_eq!(cluster.back_channel("a").connected_front_uids(), vec![front_uid]);
    assert_eq!(cluster.backs[0].connected_front_masters(), vec![7]);
}

#[tokio_timeout_test(30, paused)]
async fn closing_a_back_master_disconnects_its_fronts() {
    let cluster = Cluster::new(&[&["a"], &["b"]], 1);
    let recorder_a = Arc::new(FrontRecorder::default());
    let recorder_b = Arc::new(FrontRecorder::default());
    cluster.front_channel(0, "a").set_handler(recorder_a.clone());
    cluster.front_channel(0, "b").set_handler(recorder_b.clone());
    cluster.connect().await;

    cluster.backs[0].close();
    settle().await;

    let front_a = cluster.front_channel(0, "a");
    assert!(!front_a.is_connected());
    assert_eq!(front_a.back_master_index(), None);
    assert_eq!(*recorder_a.disconnected.lock(), 1);

    // `b` lost a peer shard but its own back channel is still there.
    let front_b = cluster.front_channel(0, "b");
    assert!(front_b.is_connected());
    assert_eq!(front_b.connected_channel_ids(), vec!["b".to_string()]);
    assert_eq!(*recorder_b.disconnected.lock(), 0);
}
