//! Server round trips over real sockets.

use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, Message, MessageKind};
use huddle_server::{app, AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, Arc<AppState>) {
    let mut config = Config::default();
    config.storage.enabled = false;
    config.metrics.enabled = false;

    let state = Arc::new(AppState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn join(addr: SocketAddr, query: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?{query}"))
        .await
        .expect("websocket handshake failed");
    ws
}

/// Next chat message, with whether it came in a binary frame.
async fn recv_frame(ws: &mut Client) -> (Message, bool) {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => return (codec::decode_json(&text).unwrap(), false),
            WsMessage::Binary(data) => return (codec::decode(&data).unwrap(), true),
            _ => continue,
        }
    }
}

/// Next message that is not a member count.
async fn recv_content(ws: &mut Client) -> (Message, bool) {
    loop {
        let (message, binary) = recv_frame(ws).await;
        if message.kind != MessageKind::UserCount {
            return (message, binary);
        }
    }
}

async fn wait_for_count(ws: &mut Client, expected: usize) {
    loop {
        let (message, _) = recv_frame(ws).await;
        if let Some(count) = message.as_user_count() {
            if count.user_count == expected {
                return;
            }
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> (String, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head.lines().next().unwrap().to_string();
    (status, serde_json::from_str(body).unwrap())
}

#[tokio::test]
async fn chat_round_trip() {
    let (addr, state) = start_server().await;

    let mut alice = join(addr, "room=lobby&user_id=a&user_name=Alice").await;
    let (over, _) = recv_content(&mut alice).await;
    assert_eq!(over.kind, MessageKind::Over);
    let (listing, _) = recv_content(&mut alice).await;
    assert_eq!(listing.kind, MessageKind::RoomList);
    let rooms = listing.chat_room_list.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].room_name, "lobby");

    let hello = Message::text("lobby", b"hi".to_vec());
    alice
        .send(WsMessage::Text(codec::encode_json(&hello).unwrap()))
        .await
        .unwrap();
    let (echo, binary) = recv_content(&mut alice).await;
    assert_eq!(echo, hello);
    assert!(!binary);

    // A late joiner gets the history, the marker and the listing, in that order.
    let mut bob = join(addr, "room=lobby&user_id=b&user_name=Bob").await;
    let (replayed, _) = recv_content(&mut bob).await;
    assert_eq!(replayed.data, b"hi");
    assert_eq!(recv_content(&mut bob).await.0.kind, MessageKind::Over);
    assert_eq!(recv_content(&mut bob).await.0.kind, MessageKind::RoomList);
    wait_for_count(&mut alice, 2).await;

    // Binary frames switch the replies to MessagePack.
    let image = Message::image("lobby", vec![0x89, 0x50, 0x4e, 0x47]);
    bob.send(WsMessage::Binary(codec::encode(&image).unwrap().to_vec()))
        .await
        .unwrap();
    let (echo, binary) = recv_content(&mut bob).await;
    assert_eq!(echo, image);
    assert!(binary);
    let (relayed, binary) = recv_content(&mut alice).await;
    assert_eq!(relayed, image);
    assert!(!binary);

    bob.close(None).await.unwrap();
    wait_for_count(&mut alice, 1).await;

    let lobby = state.directory.get("lobby").unwrap();
    assert_eq!(lobby.history_len().await, 2);
}

#[tokio::test]
async fn rooms_are_isolated() {
    let (addr, _state) = start_server().await;

    let mut kitchen = join(addr, "room=kitchen&user_id=k").await;
    let mut attic = join(addr, "room=attic&user_id=a").await;
    for ws in [&mut kitchen, &mut attic] {
        assert_eq!(recv_content(ws).await.0.kind, MessageKind::Over);
        assert_eq!(recv_content(ws).await.0.kind, MessageKind::RoomList);
    }

    let note = Message::text("kitchen", b"dinner".to_vec());
    kitchen
        .send(WsMessage::Text(codec::encode_json(&note).unwrap()))
        .await
        .unwrap();
    assert_eq!(recv_content(&mut kitchen).await.0, note);

    let marker = Message::text("attic", b"dust".to_vec());
    attic
        .send(WsMessage::Text(codec::encode_json(&marker).unwrap()))
        .await
        .unwrap();
    // The kitchen message never reaches the attic.
    assert_eq!(recv_content(&mut attic).await.0, marker);
}

#[tokio::test]
async fn invalid_room_is_rejected() {
    let (addr, state) = start_server().await;

    let result = connect_async(format!("ws://{addr}/ws?room=.hidden")).await;
    assert!(result.is_err());
    assert!(state.directory.is_empty());
}

#[tokio::test]
async fn default_room_is_lobby() {
    let (addr, state) = start_server().await;

    let mut ws = join(addr, "").await;
    assert_eq!(recv_content(&mut ws).await.0.kind, MessageKind::Over);
    assert!(state.directory.contains("lobby"));
}

#[tokio::test]
async fn http_endpoints() {
    let (addr, state) = start_server().await;

    let (status, health) = http_get(addr, "/health").await;
    assert!(status.contains("200"));
    assert_eq!(health["status"], "ok");
    assert_eq!(health["rooms"], 0);

    let mut ws = join(addr, "room=lobby&user_id=a").await;
    assert_eq!(recv_content(&mut ws).await.0.kind, MessageKind::Over);
    let lobby = state.directory.get("lobby").unwrap();
    timeout(Duration::from_secs(5), async {
        while lobby.member_count() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let (status, rooms) = http_get(addr, "/rooms").await;
    assert!(status.contains("200"));
    assert_eq!(rooms[0]["roomName"], "lobby");
    assert_eq!(rooms[0]["userCount"], 1);
}
