mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use shoal_core::{FrontUid, ShardError};
use test_timeout::tokio_timeout_test;

use common::{settle, BackRecorder, Cluster, FrontRecorder};

fn recorders(cluster: &Cluster, channel_ids: &[&str]) -> Vec<(FrontUid, Arc<FrontRecorder>)> {
    let mut recorders = Vec::new();
    for (index, _) in cluster.fronts.iter().enumerate() {
        for channel_id in channel_ids {
            let recorder = Arc::new(FrontRecorder::default());
            let channel = cluster.front_channel(index, channel_id);
            channel.set_handler(recorder.clone());
            recorders.push((channel.front_uid().clone(), recorder));
        }
    }
    recorders
}

#[tokio_timeout_test(30, paused)]
async fn broadcast_reaches_every_front_or_only_the_listed_ones() {
    let cluster = Cluster::new(&[&["a", "b"]], 2);
    let recorders = recorders(&cluster, &["a", "b"]);
    cluster.connect().await;
    let back_a = cluster.back_channel("a");

    back_a.broadcast(&json!("all"), None).expect("broadcast");
    settle().await;
    for (_, recorder) in &recorders {
        assert_eq!(*recorder.messages.lock(), vec![json!("all")]);
    }

    let targets = [FrontUid::new("a", 0), FrontUid::new("b", 1)];
    back_a
        .broadcast(&json!("some"), Some(&targets[..]))
        .expect("broadcast");
    settle().await;
    for (front_uid, recorder) in &recorders {
        let expected = if targets.contains(front_uid) { 2 } else { 1 };
        assert_eq!(recorder.messages.lock().len(), expected, "{front_uid}");
    }
}

#[tokio_timeout_test(30, paused)]
async fn broadcast_linked_skips_fronts_without_clients() {
    let cluster = Cluster::new(&[&["a"]], 2);
    let recorders = recorders(&cluster, &["a"]);
    cluster.connect().await;

    let client = cluster.fronts[1].create_client("c1").expect("client");
    client.link("a", Value::Null).await.expect("link");

    cluster
        .back_channel("a")
        .broadcast_linked(&json!({"tick": 1}))
        .expect("broadcast");
    settle().await;
    for (front_uid, recorder) in &recorders {
        let expected = usize::from(front_uid.front_master_index == 1);
        assert_eq!(recorder.messages.lock().len(), expected);
    }
}

#[tokio_timeout_test(30, paused)]
async fn client_writes_flow_through_the_queue() {
    let cluster = Cluster::new(&[&["a"]], 1);
    let recorder = Arc::new(BackRecorder::default());
    let back = cluster.back_channel("a");
    back.set_handler(recorder.clone());
    back.set_observer(recorder.clone());
    cluster.connect().await;

    let client = cluster.fronts[0].create_client("c1").expect("client");
    assert!(matches!(
        client.send(&json!("early")),
        Err(ShardError::NoProcessorChannel { .. })
    ));

    client.link("a", Value::Null).await.expect("link");
    client
        .set_processor_channel("a", Value::Null)
        .expect("processor");
    client.send(&json!({"move": "left"})).expect("send");
    client.send(&json!({"move": "right"})).expect("send");
    assert_eq!(cluster.fronts[0].queued_message_count(0), 2);

    assert_eq!(cluster.fronts[0].send_queued_messages().expect("flush"), 1);
    assert_eq!(cluster.fronts[0].send_queued_messages().expect("flush"), 0);
    settle().await;

    assert_eq!(
        *recorder.messages.lock(),
        vec![
            (Some("c1".to_string()), json!({"move": "left"})),
            (Some("c1".to_string()), json!({"move": "right"})),
        ]
    );
    assert_eq!(*recorder.writers_added.lock(), vec!["c1".to_string()]);
    assert_eq!(back.writing_client_uids(), vec!["c1".to_string()]);

    assert!(client
        .remove_processor_channel(Value::Null)
        .expect("remove processor"));
    settle().await;
    assert!(back.writing_client_uids().is_empty());
    assert_eq!(*recorder.writers_removed.lock(), vec!["c1".to_string()]);
}

#[tokio_timeout_test(30, paused)]
async fn queuing_without_a_linked_back_master_fails() {
    let cluster = Cluster::new(&[&["a"]], 1);
    cluster.connect().await;
    let err = cluster
        .front_channel(0, "a")
        .send(&json!("hello"), None)
        .unwrap_err();
    assert!(matches!(
        err,
        ShardError::BackMasterNotLinked {
            back_master_index: 0
        }
    ));
}

#[tokio_timeout_test(30, paused)]
async fn direct_sends_bypass_the_queue() {
    let cluster = Cluster::new(&[&["a", "b"]], 1);
    let recorder_a = Arc::new(BackRecorder::default());
    let recorder_b = Arc::new(BackRecorder::default());
    cluster.back_channel("a").set_handler(recorder_a.clone());
    cluster.back_channel("b").set_handler(recorder_b.clone());
    cluster.connect().await;

    let front_a = cluster.front_channel(0, "a");
    front_a
        .send_direct("b", &json!("to b"), Some("c9"))
        .expect("direct");
    front_a
        .broadcast_all_back(&json!("to all"), None)
        .expect("broadcast");
    settle().await;

    assert_eq!(*recorder_a.messages.lock(), vec![(None, json!("to all"))]);
    assert_eq!(
        *recorder_b.messages.lock(),
        vec![
            (Some("c9".to_string()), json!("to b")),
            (None, json!("to all")),
        ]
    );
}

#[tokio_timeout_test(30, paused)]
async fn back_masters_message_clients_directly() {
    let cluster = Cluster::new(&[&["a"]], 2);
    cluster.connect().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = cluster.fronts[1].create_client("c1").expect("client");
    let sink = Arc::clone(&seen);
    client.set_handler(Arc::new(move |uid: &str, message: Value| {
        sink.lock().push((uid.to_string(), message));
    }));
    client.link("a", Value::Null).await.expect("link");

    let back_master = &cluster.backs[0];
    assert_eq!(back_master.client_front_master("c1"), Some(1));
    assert!(back_master
        .message_client("c1", &json!({"whisper": true}))
        .expect("message"));
    assert!(!back_master
        .message_client("ghost", &json!(null))
        .expect("message"));
    settle().await;
    assert_eq!(
        *seen.lock(),
        vec![("c1".to_string(), json!({"whisper": true}))]
    );

    // In flight while the client leaves the front process: dropped quietly.
    assert!(cluster
        .back_channel("a")
        .message_client("c1", &json!("again"))
        .expect("message"));
    cluster.fronts[1].disconnect_client("c1").expect("disconnect");
    settle().await;
    assert_eq!(seen.lock().len(), 1);
}
