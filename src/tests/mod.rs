//! End-to-end wire tests: spin up the real accept loop on an ephemeral port
//! and drive it with raw `TcpStream` clients, the way `sharify/websocket.rs`'s
//! tests drove the old actix-ws surface — just over a plain socket instead of
//! an HTTP upgrade.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;

use crate::config::Features;
use crate::server;

async fn spawn_server(features: Features) -> std::net::SocketAddr {
    let listener = server::bind_ephemeral().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_on(listener, features));
    addr
}

struct Client {
    write: tokio::net::tcp::OwnedWriteHalf,
    read: BufReader<OwnedReadHalf>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            write,
            read: BufReader::new(read),
        }
    }

    async fn send(&mut self, value: &Value) {
        let mut body = serde_json::to_vec(value).unwrap();
        body.extend_from_slice(b"\r\n");
        self.write.write_all(&body).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), self.read.read_line(&mut line))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        serde_json::from_str(line.trim_end_matches(['\r', '\n'])).unwrap()
    }

    fn hello(username: &str, room: &str) -> Value {
        serde_json::json!({
            "Hello": {
                "username": username,
                "version": "1.7.3",
                "room": {"name": room},
            }
        })
    }
}

fn top_level_key(v: &Value) -> &str {
    v.as_object().unwrap().keys().next().unwrap().as_str()
}

#[tokio::test]
async fn tls_upgrade_is_refused_with_the_exact_fixed_bytes() {
    let addr = spawn_server(Features::default()).await;
    let mut client = Client::connect(addr).await;
    client
        .send_raw(b"{\"TLS\": {\"startTLS\": \"true\"}}\r\n")
        .await;

    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(2), client.read.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.as_bytes(), crate::wire::TLS_REFUSAL);
}

#[tokio::test]
async fn join_handshake_arrives_in_the_documented_order() {
    let addr = spawn_server(Features::default()).await;
    let mut client = Client::connect(addr).await;
    client.send(&Client::hello("alice", "movie-night")).await;

    let expected_order = ["Set", "Set", "Set", "Set", "Hello", "State"];
    for expected in expected_order {
        let frame = client.recv().await;
        assert_eq!(top_level_key(&frame), expected, "frame was {frame:?}");
    }
}

#[tokio::test]
async fn duplicate_username_gets_a_chat_diagnostic_and_is_not_admitted() {
    let addr = spawn_server(Features::default()).await;
    let mut first = Client::connect(addr).await;
    first.send(&Client::hello("alice", "room")).await;
    for _ in 0..6 {
        first.recv().await;
    }

    let mut second = Client::connect(addr).await;
    second.send(&Client::hello("alice", "room")).await;
    let diagnostic = second.recv().await;
    assert_eq!(top_level_key(&diagnostic), "Chat");
    assert_eq!(diagnostic["Chat"]["username"], "Server");
}

#[tokio::test]
async fn chat_is_echoed_to_other_room_members() {
    let addr = spawn_server(Features::default()).await;
    let mut alice = Client::connect(addr).await;
    alice.send(&Client::hello("alice", "room")).await;
    for _ in 0..6 {
        alice.recv().await;
    }

    let mut bob = Client::connect(addr).await;
    bob.send(&Client::hello("bob", "room")).await;
    for _ in 0..6 {
        bob.recv().await;
    }
    // bob's own join announcement also reaches alice.
    let _ = alice.recv().await;

    bob.send(&serde_json::json!({"Chat": "hello there"})).await;
    let echoed = alice.recv().await;
    assert_eq!(echoed["Chat"]["message"], "hello there");
    assert_eq!(echoed["Chat"]["username"], "bob");
}

#[tokio::test]
async fn state_update_within_tolerance_is_reflected_in_list() {
    let addr = spawn_server(Features::default()).await;
    let mut client = Client::connect(addr).await;
    client.send(&Client::hello("alice", "room")).await;
    for _ in 0..6 {
        client.recv().await;
    }

    client
        .send(&serde_json::json!({
            "State": {
                "ping": {"latencyCalculation": 1.0},
                "playstate": {"position": 12.5, "paused": false, "doSeek": false, "setBy": "alice"},
            }
        }))
        .await;
    // allow the write to land before listing
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.send(&serde_json::json!({"List": null})).await;
    let listing = client.recv().await;
    assert_eq!(
        listing["List"]["room"]["alice"]["position"],
        serde_json::json!(12.5)
    );
}

#[tokio::test]
async fn periodic_state_emission_survives_a_room_move() {
    let addr = spawn_server(Features::default()).await;
    let mut client = Client::connect(addr).await;
    client.send(&Client::hello("alice", "first-room")).await;
    for _ in 0..6 {
        client.recv().await;
    }

    client
        .send(&serde_json::json!({"Set": {"room": {"name": "second-room"}}}))
        .await;
    // the move's own Set broadcasts (left, then joined).
    let _ = client.recv().await;
    let _ = client.recv().await;

    // the periodic emission fires on its own ~1s schedule; wait past two ticks
    // so a dropped event (never reattached after the move) would show up as a timeout.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    client.send(&serde_json::json!({"List": null})).await;

    let mut saw_state_after_move = false;
    for _ in 0..4 {
        let frame = client.recv().await;
        if top_level_key(&frame) == "State" {
            saw_state_after_move = true;
        }
        if top_level_key(&frame) == "List" {
            break;
        }
    }
    assert!(saw_state_after_move, "no State frame arrived after the room move");
}
