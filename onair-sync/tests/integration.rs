//! Integration tests for end-to-end relay sync.
//!
//! These tests start a real relay and connect real transports,
//! verifying the full fan-out and bootstrap pipeline.

use futures_util::{SinkExt, StreamExt};
use onair_core::{Cursor, Folder, Item, Rundown};
use onair_sync::bootstrap::bootstrap;
use onair_sync::config::{EngineConfig, ServerConfig, TransportConfig};
use onair_sync::engine::Publisher;
use onair_sync::protocol::{MessageType, PeerRole, RoomEvent, SyncMessage, TimerUpdate};
use onair_sync::server::RelayServer;
use onair_sync::session::Session;
use onair_sync::storage::{RundownStore, StoreConfig};
use onair_sync::transport::{ConnectionState, EventFilter, Inbound, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        storage_path: None,
    }
}

/// Start a relay on `port`, optionally over a shared store.
async fn start_relay_on(port: u16, store: Option<Arc<RundownStore>>) -> Arc<RelayServer> {
    let server = Arc::new(RelayServer::with_store(server_config(port), store));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

async fn start_test_server() -> (Arc<RelayServer>, u16) {
    let port = free_port().await;
    (start_relay_on(port, None).await, port)
}

async fn connect(port: u16, name: &str, role: PeerRole) -> Transport {
    let mut config = TransportConfig::new(format!("ws://127.0.0.1:{port}"), name, role);
    config.reconnect_delay = Duration::from_millis(50);
    config.max_reconnect_delay = Duration::from_millis(200);
    config.max_reconnect_attempts = 20;
    let transport = Transport::new(config);
    transport.connect().await.unwrap();
    transport
}

/// Wait until the relay sees `count` peers in `room`.
async fn wait_for_peers(server: &RelayServer, room: Uuid, count: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(group) = server.room_manager().get(&room).await {
                if group.peer_count().await >= count {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers never joined");
}

async fn expect_event(rx: &mut mpsc::Receiver<Inbound>) -> Inbound {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within timeout")
        .expect("subscription closed")
}

async fn expect_silence(rx: &mut mpsc::Receiver<Inbound>) {
    let got = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "unexpected event: {got:?}");
}

fn running(room: Uuid, elapsed: u64) -> RoomEvent {
    RoomEvent::Timer {
        room,
        update: TimerUpdate {
            is_running: true,
            time_elapsed: Some(elapsed),
            cursor: Some(Cursor::ORIGIN),
        },
    }
}

fn show() -> Rundown {
    Rundown::with_id(
        Uuid::new_v4(),
        "Evening News",
        vec![
            Folder::with_items("Opening", vec![Item::new("Headlines", 60), Item::new("Weather", 30)]),
            Folder::with_items("Block 2", vec![Item::new("Interview", 300)]),
        ],
    )
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, port) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_transport_connects() {
    let (server, port) = start_test_server().await;
    let transport = connect(port, "Operator", PeerRole::Controller).await;
    assert_eq!(transport.connection_state(), ConnectionState::Connected);

    let room = Uuid::new_v4();
    transport.join(room);
    wait_for_peers(&server, room, 1).await;
    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test]
async fn test_room_event_reaches_everyone_but_sender() {
    let (server, port) = start_test_server().await;
    let room = Uuid::new_v4();

    let operator = connect(port, "Operator", PeerRole::Controller).await;
    let presenter = connect(port, "Presenter", PeerRole::Follower).await;
    let prompter = connect(port, "Prompter", PeerRole::Follower).await;
    let mut own = operator.subscribe(EventFilter::All);
    let mut presenter_rx = presenter.subscribe(EventFilter::All);
    let mut prompter_rx = prompter.subscribe(EventFilter::All);

    operator.join(room);
    presenter.join(room);
    prompter.join(room);
    wait_for_peers(&server, room, 3).await;

    operator.publish(&running(room, 12));

    let got = expect_event(&mut presenter_rx).await;
    assert_eq!(got.from, operator.peer_info().peer_id);
    assert_eq!(got.event, running(room, 12));
    assert_eq!(expect_event(&mut prompter_rx).await.event, running(room, 12));
    expect_silence(&mut own).await;
}

#[tokio::test]
async fn test_subscription_filter() {
    let (server, port) = start_test_server().await;
    let room = Uuid::new_v4();

    let operator = connect(port, "Operator", PeerRole::Controller).await;
    let presenter = connect(port, "Presenter", PeerRole::Follower).await;
    let mut statuses = presenter.subscribe(EventFilter::Kind(MessageType::StatusUpdate));

    operator.join(room);
    presenter.join(room);
    wait_for_peers(&server, room, 2).await;

    operator.publish(&running(room, 1));
    operator.publish(&RoomEvent::Status {
        room,
        status: "Live".to_string(),
    });

    let got = expect_event(&mut statuses).await;
    assert_eq!(got.event.kind(), MessageType::StatusUpdate);
    expect_silence(&mut statuses).await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, port) = start_test_server().await;
    let news = Uuid::new_v4();
    let sports = Uuid::new_v4();

    let operator = connect(port, "Operator", PeerRole::Controller).await;
    let news_desk = connect(port, "News desk", PeerRole::Follower).await;
    let sports_desk = connect(port, "Sports desk", PeerRole::Follower).await;
    let mut news_rx = news_desk.subscribe(EventFilter::All);
    let mut sports_rx = sports_desk.subscribe(EventFilter::All);

    operator.join(news);
    operator.join(sports);
    news_desk.join(news);
    sports_desk.join(sports);
    wait_for_peers(&server, news, 2).await;
    wait_for_peers(&server, sports, 2).await;

    operator.publish(&running(news, 5));

    assert_eq!(expect_event(&mut news_rx).await.event.room(), news);
    expect_silence(&mut sports_rx).await;
}

#[tokio::test]
async fn test_leave_stops_delivery() {
    let (server, port) = start_test_server().await;
    let room = Uuid::new_v4();

    let operator = connect(port, "Operator", PeerRole::Controller).await;
    let presenter = connect(port, "Presenter", PeerRole::Follower).await;
    let mut presenter_rx = presenter.subscribe(EventFilter::All);

    operator.join(room);
    presenter.join(room);
    wait_for_peers(&server, room, 2).await;

    presenter.leave(room);
    timeout(Duration::from_secs(2), async {
        while server.room_manager().get(&room).await.unwrap().peer_count().await > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    operator.publish(&running(room, 3));
    expect_silence(&mut presenter_rx).await;
}

#[tokio::test]
async fn test_late_joiner_bootstraps_through_relay() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RundownStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let rundown = show();
    store.save_rundown(&rundown).unwrap();

    let port = free_port().await;
    let server = start_relay_on(port, Some(store.clone())).await;

    let operator = connect(port, "Operator", PeerRole::Controller).await;
    operator.join(rundown.id);
    wait_for_peers(&server, rundown.id, 1).await;
    operator.publish(&running(rundown.id, 30));

    timeout(Duration::from_secs(2), async {
        while !store.load_timer(rundown.id).map(|t| t.is_running).unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timer never persisted");

    let late = connect(port, "Presenter", PeerRole::Follower).await;
    late.join(rundown.id);
    let outcome = bootstrap(&late, &late, rundown.id, Duration::from_secs(2)).await;

    assert_eq!(outcome.document.unwrap(), rundown);
    let snapshot = outcome.snapshot.unwrap();
    assert!(snapshot.is_running);
    assert!(snapshot.time_elapsed >= 30);
    assert_eq!(snapshot.cursor, Cursor::ORIGIN);
}

#[tokio::test]
async fn test_unknown_room_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RundownStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let port = free_port().await;
    let _server = start_relay_on(port, Some(store)).await;

    let client = connect(port, "Presenter", PeerRole::Follower).await;
    let room = Uuid::new_v4();
    let outcome = bootstrap(&client, &client, room, Duration::from_secs(2)).await;

    assert!(outcome.document.is_err());
    let snapshot = outcome.snapshot.unwrap();
    assert!(!snapshot.is_running);
    assert_eq!(snapshot.time_elapsed, 0);
}

#[tokio::test]
async fn test_sessions_converge_through_relay() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RundownStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let rundown = show();
    store.save_rundown(&rundown).unwrap();

    let port = free_port().await;
    let server = start_relay_on(port, Some(store)).await;

    let operator = Session::with_transport(
        EngineConfig::for_testing(),
        connect(port, "Operator", PeerRole::Controller).await,
    );
    operator.attach(rundown.id).unwrap();
    let mut operator_model = operator.watch();
    timeout(Duration::from_secs(5), operator_model.wait_for(|m| m.document.is_some()))
        .await
        .unwrap()
        .unwrap();
    operator.start().unwrap();
    operator.set_cursor(Cursor::new(1, 0)).unwrap();

    let presenter = Session::with_transport(
        EngineConfig::for_testing(),
        connect(port, "Presenter", PeerRole::Follower).await,
    );
    presenter.attach(rundown.id).unwrap();
    wait_for_peers(&server, rundown.id, 2).await;

    let mut presenter_model = presenter.watch();
    let model = timeout(
        Duration::from_secs(5),
        presenter_model.wait_for(|m| m.is_running && m.cursor == Cursor::new(1, 0)),
    )
    .await
    .expect("presenter never converged")
    .unwrap()
    .clone();
    assert_eq!(model.document.as_ref().map(|d| d.id), Some(rundown.id));
    assert!(model.time_elapsed >= 90);
    assert!(model.warning.is_none());

    operator.pause().unwrap();
    timeout(Duration::from_secs(5), presenter_model.wait_for(|m| !m.is_running))
        .await
        .expect("pause never arrived")
        .unwrap();
}

#[tokio::test]
async fn test_reconnect_rejoins_rooms() {
    let port = free_port().await;
    let first = start_relay_on(port, None).await;
    let room = Uuid::new_v4();

    let presenter = connect(port, "Presenter", PeerRole::Follower).await;
    let mut presenter_rx = presenter.subscribe(EventFilter::All);
    let mut states = presenter.state_changes();
    presenter.join(room);
    wait_for_peers(&first, room, 1).await;

    first.shutdown();
    timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Reconnecting))
        .await
        .expect("drop never noticed")
        .unwrap();

    let second = start_relay_on(port, None).await;
    timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("never reconnected")
        .unwrap();
    wait_for_peers(&second, room, 1).await;

    let operator = connect(port, "Operator", PeerRole::Controller).await;
    operator.join(room);
    wait_for_peers(&second, room, 2).await;
    operator.publish(&running(room, 40));

    assert_eq!(expect_event(&mut presenter_rx).await.event, running(room, 40));
}

#[tokio::test]
async fn test_publish_while_disconnected_is_dropped() {
    let transport = Transport::new(TransportConfig::new("ws://127.0.0.1:1", "Offline", PeerRole::Controller));
    let room = Uuid::new_v4();
    transport.join(room);
    transport.publish(&running(room, 1));
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    assert_eq!(transport.rooms(), vec![room]);
}

#[tokio::test]
async fn test_malformed_frames_do_not_kill_connection() {
    let (server, port) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Binary(vec![0xff, 0x00, 0x13].into())).await.unwrap();

    let peer = Uuid::new_v4();
    let ping = SyncMessage::ping(peer).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return SyncMessage::decode(&data).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.msg_type, MessageType::Pong);

    let stats = server.stats().await;
    assert_eq!(stats.total_messages, 2);
}

#[tokio::test]
async fn test_event_for_unjoined_room_is_not_relayed() {
    let (server, port) = start_test_server().await;
    let room = Uuid::new_v4();

    let intruder = connect(port, "Intruder", PeerRole::Controller).await;
    let presenter = connect(port, "Presenter", PeerRole::Follower).await;
    let mut presenter_rx = presenter.subscribe(EventFilter::All);
    presenter.join(room);
    intruder.join(Uuid::new_v4());
    wait_for_peers(&server, room, 1).await;

    intruder.publish(&running(room, 99));
    expect_silence(&mut presenter_rx).await;
}
