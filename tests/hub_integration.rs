use std::sync::Arc;
use std::time::Duration;

use canvas_sync::config::Config;
use canvas_sync::models::messages::{ClientMessage, DrawMessage, RegisterMessage};
use canvas_sync::relay::{Broker, MemoryBroker};
use canvas_sync::server::{start_node, Node};
use canvas_sync::store::Point;
use canvas_sync::ws::{BoardSnapshot, Frame, HubHandle};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

async fn node(broker: &MemoryBroker) -> Node {
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    start_node(Config::default(), broker, None).await.unwrap()
}

struct Client {
    id: Uuid,
    rx: mpsc::Receiver<Frame>,
}

impl Client {
    async fn next(&mut self) -> Value {
        let frame = timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbox closed");
        serde_json::from_str(&frame).unwrap()
    }

    async fn assert_silent(&mut self) {
        assert!(timeout(Duration::from_millis(100), self.rx.recv()).await.is_err());
    }
}

async fn connect(hub: &HubHandle, capacity: usize) -> Client {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(capacity);
    hub.connect(id, tx).await.unwrap();
    Client { id, rx }
}

/// Connect, register and consume the bootstrap frames. Returns the init-board strokes.
async fn join(hub: &HubHandle, user: &str) -> (Client, Vec<Value>) {
    let mut client = connect(hub, 64).await;
    hub.client_message(
        client.id,
        ClientMessage::Register(RegisterMessage { user_id: Some(user.to_string()) }),
    )
    .await
    .unwrap();

    let info = client.next().await;
    assert_eq!(info["type"], "user-info");
    assert_eq!(info["userId"], user);
    let board = client.next().await;
    assert_eq!(board["type"], "init-board");
    let strokes = board["strokes"].as_array().cloned().unwrap_or_default();
    (client, strokes)
}

fn draw(stroke_id: Option<&str>, from: usize, n: usize, end: bool) -> ClientMessage {
    ClientMessage::Draw(DrawMessage {
        stroke_id: stroke_id.map(str::to_string),
        points: (from..from + n).map(|i| Point { x: i as f64, y: 1.0 }).collect(),
        color: "#ff0000".to_string(),
        width: 3.0,
        end,
        op_id: None,
    })
}

async fn wait_for(hub: &HubHandle, done: impl Fn(&BoardSnapshot) -> bool) -> BoardSnapshot {
    for _ in 0..100 {
        let snapshot = hub.snapshot().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("board never reached the expected state");
}

fn ids(snapshot: &BoardSnapshot) -> Vec<String> {
    snapshot.strokes.iter().map(|s| s.id.clone()).collect()
}

#[tokio::test]
async fn stroke_reaches_a_client_on_another_node() {
    let broker = MemoryBroker::default();
    let n1 = node(&broker).await;
    let n2 = node(&broker).await;
    let h1 = n1.state.hub.clone();
    let h2 = n2.state.hub.clone();

    let (alice, _) = join(&h1, "alice").await;
    let (mut bob, _) = join(&h2, "bob").await;

    h1.client_message(alice.id, draw(Some("s1"), 0, 3, false)).await.unwrap();
    h1.client_message(alice.id, draw(Some("s1"), 3, 2, false)).await.unwrap();
    h1.client_message(alice.id, draw(Some("s1"), 5, 0, true)).await.unwrap();

    let mut seen = 0;
    let mut finalized = false;
    while !finalized {
        let frame = bob.next().await;
        assert_eq!(frame["type"], "draw");
        assert_eq!(frame["stroke"]["userId"], "alice");
        seen += frame["stroke"]["points"].as_array().unwrap().len();
        finalized = frame["stroke"]["finalized"].as_bool().unwrap();
    }
    assert_eq!(seen, 5);

    let snapshot = wait_for(&h2, |s| s.strokes.len() == 1).await;
    assert_eq!(snapshot.strokes[0].points.len(), 5);
    assert!(snapshot.strokes[0].finalized);
    assert_eq!(snapshot.strokes, h1.snapshot().await.unwrap().strokes);
}

#[tokio::test]
async fn clear_mine_removes_only_own_strokes_on_every_node() {
    let broker = MemoryBroker::default();
    let n1 = node(&broker).await;
    let n2 = node(&broker).await;
    let h1 = n1.state.hub.clone();
    let h2 = n2.state.hub.clone();

    let (alice, _) = join(&h1, "alice").await;
    let (bob, _) = join(&h2, "bob").await;

    h1.client_message(alice.id, draw(Some("a1"), 0, 2, true)).await.unwrap();
    h1.client_message(alice.id, draw(Some("a2"), 0, 2, true)).await.unwrap();
    h2.client_message(bob.id, draw(Some("b1"), 0, 2, true)).await.unwrap();

    wait_for(&h1, |s| s.strokes.len() == 3).await;
    wait_for(&h2, |s| s.strokes.len() == 3).await;

    h1.client_message(alice.id, ClientMessage::ClearMine).await.unwrap();

    let s1 = wait_for(&h1, |s| s.strokes.len() == 1).await;
    let s2 = wait_for(&h2, |s| s.strokes.len() == 1).await;
    assert_eq!(ids(&s1), vec!["b1".to_string()]);
    assert_eq!(s1.strokes, s2.strokes);
}

#[tokio::test]
async fn clearing_the_only_users_strokes_empties_every_board() {
    let broker = MemoryBroker::default();
    let n1 = node(&broker).await;
    let n2 = node(&broker).await;
    let h1 = n1.state.hub.clone();
    let h2 = n2.state.hub.clone();

    let (alice, _) = join(&h1, "alice").await;
    h1.client_message(alice.id, draw(Some("s1"), 0, 3, true)).await.unwrap();
    h1.client_message(alice.id, draw(None, 0, 2, false)).await.unwrap();
    wait_for(&h2, |s| s.strokes.len() == 2).await;

    h1.client_message(alice.id, ClientMessage::ClearMine).await.unwrap();
    wait_for(&h1, |s| s.strokes.is_empty()).await;
    wait_for(&h2, |s| s.strokes.is_empty()).await;

    let (_carol, strokes) = join(&h2, "carol").await;
    assert!(strokes.is_empty());
}

#[tokio::test]
async fn disconnect_mid_gesture_finalizes_the_stroke_everywhere() {
    let broker = MemoryBroker::default();
    let n1 = node(&broker).await;
    let n2 = node(&broker).await;
    let h1 = n1.state.hub.clone();
    let h2 = n2.state.hub.clone();

    let (alice, _) = join(&h1, "alice").await;
    h1.client_message(alice.id, draw(Some("s1"), 0, 3, false)).await.unwrap();
    h1.client_message(alice.id, draw(Some("s1"), 3, 3, false)).await.unwrap();
    h1.disconnect_detached(alice.id);

    for hub in [&h1, &h2] {
        let snapshot = wait_for(hub, |s| s.strokes.first().is_some_and(|s| s.finalized)).await;
        assert_eq!(snapshot.strokes[0].points.len(), 6);
    }
    assert_eq!(h1.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn late_joiner_gets_the_current_board() {
    let broker = MemoryBroker::default();
    let n1 = node(&broker).await;
    let n2 = node(&broker).await;
    let h1 = n1.state.hub.clone();
    let h2 = n2.state.hub.clone();

    let (alice, _) = join(&h1, "alice").await;
    h1.client_message(alice.id, draw(Some("s1"), 0, 4, true)).await.unwrap();
    h1.client_message(alice.id, draw(None, 0, 2, false)).await.unwrap();
    wait_for(&h2, |s| s.strokes.len() == 2).await;

    let (_carol, strokes) = join(&h2, "carol").await;
    assert_eq!(strokes.len(), 2);
    assert!(strokes.iter().all(|s| s["userId"] == "alice"));
}

#[tokio::test]
async fn local_fan_out_skips_the_origin_for_draws() {
    let broker = MemoryBroker::default();
    let n = node(&broker).await;
    let hub = n.state.hub.clone();

    let (mut alice, _) = join(&hub, "alice").await;
    let (mut bob, _) = join(&hub, "bob").await;

    hub.client_message(alice.id, draw(None, 0, 3, false)).await.unwrap();
    let frame = bob.next().await;
    assert_eq!(frame["type"], "draw");
    assert_eq!(frame["stroke"]["finalized"], true);
    alice.assert_silent().await;

    hub.client_message(bob.id, ClientMessage::ClearAll).await.unwrap();
    assert_eq!(alice.next().await["type"], "clear-all");
    assert_eq!(bob.next().await["type"], "clear-all");
    assert!(hub.snapshot().await.unwrap().strokes.is_empty());
}

#[tokio::test]
async fn mutations_require_registration() {
    let broker = MemoryBroker::default();
    let n = node(&broker).await;
    let hub = n.state.hub.clone();

    let mut stranger = connect(&hub, 8).await;
    hub.client_message(stranger.id, draw(Some("s1"), 0, 2, true)).await.unwrap();
    hub.client_message(stranger.id, ClientMessage::ClearAll).await.unwrap();
    assert!(hub.snapshot().await.unwrap().strokes.is_empty());

    // Ping does not need an identity
    hub.client_message(stranger.id, ClientMessage::Ping).await.unwrap();
    assert_eq!(stranger.next().await["type"], "pong");
}

#[tokio::test]
async fn reregistration_keeps_the_first_identity() {
    let broker = MemoryBroker::default();
    let n = node(&broker).await;
    let hub = n.state.hub.clone();

    let (mut alice, _) = join(&hub, "alice").await;
    hub.client_message(
        alice.id,
        ClientMessage::Register(RegisterMessage { user_id: Some("mallory".into()) }),
    )
    .await
    .unwrap();
    alice.assert_silent().await;

    hub.client_message(alice.id, draw(None, 0, 1, false)).await.unwrap();
    let snapshot = wait_for(&hub, |s| s.strokes.len() == 1).await;
    assert_eq!(snapshot.strokes[0].user_id, "alice");
}

#[tokio::test]
async fn appends_are_only_accepted_from_the_starting_connection() {
    let broker = MemoryBroker::default();
    let n = node(&broker).await;
    let hub = n.state.hub.clone();

    let (alice, _) = join(&hub, "alice").await;
    let (bob, _) = join(&hub, "bob").await;

    hub.client_message(alice.id, draw(Some("s1"), 0, 2, false)).await.unwrap();
    hub.client_message(bob.id, draw(Some("s1"), 2, 5, true)).await.unwrap();

    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(snapshot.strokes[0].points.len(), 2);
    assert!(!snapshot.strokes[0].finalized);
}

#[tokio::test]
async fn slow_connection_is_dropped() {
    let broker = MemoryBroker::default();
    let n = node(&broker).await;
    let hub = n.state.hub.clone();

    // Room for exactly the bootstrap frames
    let mut slow = connect(&hub, 2).await;
    hub.client_message(slow.id, ClientMessage::Register(RegisterMessage { user_id: None }))
        .await
        .unwrap();
    let (mut alice, _) = join(&hub, "alice").await;
    assert_eq!(hub.stats().await.unwrap().registered, 2);

    // The slow connection leaves a stroke open; drawing does not send it anything
    hub.client_message(slow.id, draw(Some("open"), 0, 2, false)).await.unwrap();
    assert_eq!(alice.next().await["stroke"]["id"], "open");

    hub.client_message(alice.id, draw(None, 0, 1, false)).await.unwrap();
    assert_eq!(hub.stats().await.unwrap().registered, 1);

    let finished = alice.next().await;
    assert_eq!(finished["stroke"]["id"], "open");
    assert_eq!(finished["stroke"]["finalized"], true);
    let snapshot = hub.snapshot().await.unwrap();
    assert!(snapshot.strokes.iter().all(|s| s.finalized));

    assert_eq!(slow.next().await["type"], "user-info");
    assert_eq!(slow.next().await["type"], "init-board");
    assert!(slow.rx.recv().await.is_none());
}

#[tokio::test]
async fn nodes_ignore_other_boards() {
    let broker = MemoryBroker::default();
    let n1 = node(&broker).await;
    let other = Config { board_name: "other".into(), ..Config::default() };
    let n2 = start_node(other, Arc::new(broker.clone()), None).await.unwrap();
    let h1 = n1.state.hub.clone();
    let h2 = n2.state.hub.clone();

    let (alice, _) = join(&h1, "alice").await;
    h1.client_message(alice.id, draw(None, 0, 2, false)).await.unwrap();
    wait_for(&h1, |s| s.strokes.len() == 1).await;

    sleep(Duration::from_millis(100)).await;
    assert!(h2.snapshot().await.unwrap().strokes.is_empty());
    assert!(n2.state.relay_stats.snapshot().foreign >= 1);
}
