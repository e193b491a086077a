//! Process bootstrap and wire dispatcher (§4.7, §4.8, §4.9, §4.10, §4.11).
//!
//! One `tokio` task per accepted stream; state machine Initial → Joined →
//! Closing per connection (§4.7). Grounded on the teacher's accept-and-spawn
//! shape in `main.rs`/`sharify/websocket.rs`, adapted from actix-ws sessions
//! to a raw `tokio::net::TcpStream`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::config::Features;
use crate::connection::{Connection, ConnectionHandle};
use crate::error::ServerError;
use crate::event::ManagedEvent;
use crate::framing;
use crate::room_manager::ConnectionManager;
use crate::sync::{self, now_seconds};
use crate::wire::{self, SetFrame, WireMessage};

/// Per-user periodic `State` emission interval (§4.4: "approximately 1 second").
const EMISSION_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on concurrently-dispatching connection tasks (§5 admission control).
const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

pub struct AppState {
    pub manager: Arc<RwLock<ConnectionManager>>,
    pub features: Arc<Features>,
    next_handle: AtomicU64,
    next_ignore_token: AtomicU64,
}

impl AppState {
    pub fn new(features: Features) -> Self {
        Self {
            manager: Arc::new(RwLock::new(ConnectionManager::new())),
            features: Arc::new(features),
            next_handle: AtomicU64::new(1),
            next_ignore_token: AtomicU64::new(1),
        }
    }

    fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn next_ignore_token(&self) -> u64 {
        self.next_ignore_token.fetch_add(1, Ordering::Relaxed)
    }
}

/// Binds the listener and runs the accept loop until the process is killed.
pub async fn serve(port: u16, features: Features) -> Result<(), ServerError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ServerError::Configuration(e.to_string()))?;
    info!("listening on 0.0.0.0:{port}");
    let state = Arc::new(AppState::new(features));
    accept_loop_with_state(listener, state).await
}

/// Binds on an ephemeral port and returns the listener without entering the
/// accept loop, so tests can learn the assigned port before driving clients
/// against it.
pub async fn bind_ephemeral() -> Result<TcpListener, ServerError> {
    TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| ServerError::Configuration(e.to_string()))
}

async fn accept_loop_with_state(listener: TcpListener, state: Arc<AppState>) -> Result<(), ServerError> {
    let admission = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));

    loop {
        let (stream, addr) = listener.accept().await?;
        let permit = admission.clone().acquire_owned().await.expect("semaphore never closes");
        let state = state.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_stream(stream, state).await {
                debug!("connection {addr} closed: {e}");
            }
        });
    }
}

/// Runs the accept loop against an already-bound listener with caller-supplied
/// features, for tests that need a known feature set on an ephemeral port.
pub async fn serve_on(listener: TcpListener, features: Features) -> Result<(), ServerError> {
    let state = Arc::new(AppState::new(features));
    accept_loop_with_state(listener, state).await
}

/// Gathers live writers for a room without holding the room lock across I/O
/// (§5: "never hold a room lock across a blocking write").
async fn room_writers(
    manager: &RwLock<ConnectionManager>,
    room_name: &str,
    exclude: Option<ConnectionHandle>,
) -> Vec<Arc<Mutex<OwnedWriteHalf>>> {
    let guard = manager.read().await;
    match guard.get_room(room_name) {
        Some(room) => room
            .get_connections()
            .filter(|c| Some(c.handle) != exclude)
            .map(|c| c.writer.clone())
            .collect(),
        None => Vec::new(),
    }
}

async fn broadcast(
    manager: &RwLock<ConnectionManager>,
    room_name: &str,
    value: &Value,
    exclude: Option<ConnectionHandle>,
) {
    for writer in room_writers(manager, room_name, exclude).await {
        if let Err(e) = framing::write_frame(&writer, value).await {
            warn!("broadcast write failed, dropping stale handle silently: {e}");
        }
    }
}

async fn handle_stream(stream: tokio::net::TcpStream, state: Arc<AppState>) -> Result<(), ServerError> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));
    let handle = state.next_handle();

    let mut joined: Option<(String, String)> = None; // (username, room_name)

    loop {
        let line = match framing::read_frame(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("transport error on handle {handle:?}: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match wire::parse_frame(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!("discarding malformed frame: {e}");
                continue;
            }
        };

        match message {
            WireMessage::Tls => {
                if let Err(e) = framing::write_raw(&writer, wire::TLS_REFUSAL).await {
                    debug!("failed to send TLS refusal: {e}");
                    break;
                }
            }
            WireMessage::Hello(hello) if joined.is_none() => {
                match handle_hello(&state, handle, writer.clone(), hello).await {
                    Ok(Some((username, room_name))) => joined = Some((username, room_name)),
                    Ok(None) => {}
                    Err(e) => {
                        debug!("hello handling failed: {e}");
                        // handle_hello may have already admitted the connection
                        // before a later write failed; clear it either way.
                        state.manager.write().await.remove_connection(handle);
                        break;
                    }
                }
            }
            WireMessage::Hello(_) => {
                warn!("ignoring duplicate Hello on an already-joined connection");
            }
            _ if joined.is_none() => {
                warn!("ignoring frame received before Hello");
            }
            WireMessage::State(frame) => {
                let (username, room_name) = joined.clone().unwrap();
                if let Err(e) = handle_state(&state, handle, &room_name, &username, frame).await {
                    debug!("state handling failed: {e}");
                }
            }
            WireMessage::Chat(text) => {
                let (username, room_name) = joined.clone().unwrap();
                if state.features.chat {
                    broadcast(&state.manager, &room_name, &wire::chat_echo(&text, &username), None).await;
                }
            }
            WireMessage::Set(set_frame) => {
                let (username, room_name) = joined.clone().unwrap();
                match handle_set(&state, handle, &room_name, &username, set_frame).await {
                    Ok(Some(new_room)) => joined = Some((username, new_room)),
                    Ok(None) => {}
                    Err(e) => debug!("set handling failed: {e}"),
                }
            }
            WireMessage::List => {
                let (username, room_name) = joined.clone().unwrap();
                if let Err(e) = handle_list(&state, &room_name, &username, &writer).await {
                    debug!("list handling failed: {e}");
                }
            }
        }
    }

    if let Some((username, room_name)) = joined {
        state.manager.write().await.remove_connection(handle);
        broadcast(&state.manager, &room_name, &wire::left_announcement(&username, &room_name), None).await;
        debug!("{username} left {room_name}");
    }

    Ok(())
}

/// Hello / join handshake (§4.8). Returns `Ok(Some((username, room)))` on
/// admission, `Ok(None)` on a handled rejection (diagnostic already sent).
async fn handle_hello(
    state: &Arc<AppState>,
    handle: ConnectionHandle,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    hello: wire::HelloFrame,
) -> Result<Option<(String, String)>, ServerError> {
    let username = hello.username;
    let room_name = hello.room.name;
    let version = hello.version;

    let connection = Connection::new(username.clone(), handle, writer.clone());
    {
        let mut guard = state.manager.write().await;
        if let Err(_e) = guard.add_connection(&room_name, connection) {
            drop(guard);
            let diagnostic = wire::chat_diagnostic(&format!("{username} is already in the room"));
            framing::write_frame(&writer, &diagnostic).await?;
            return Ok(None);
        }
    }

    broadcast(
        &state.manager,
        &room_name,
        &wire::joined_announcement(&username, &room_name),
        None,
    )
    .await;

    framing::write_frame(&writer, &wire::ready_init(&username)).await?;

    let (files, index, authoritative) = {
        let guard = state.manager.read().await;
        let room = guard
            .get_room(&room_name)
            .ok_or_else(|| ServerError::Semantic("room vanished mid-join".into()))?;
        (
            room.playlist_store
                .get_playlist(&username, state.features.shared_playlists)
                .to_vec(),
            room.playlist_store.index(),
            room.playlist_store.authoritative.clone(),
        )
    };
    framing::write_frame(&writer, &wire::playlist_change(&files, None)).await?;
    framing::write_frame(&writer, &wire::playlist_index(index, None)).await?;
    framing::write_frame(
        &writer,
        &wire::hello_response(&username, &version, &room_name, &state.features),
    )
    .await?;
    framing::write_frame(
        &writer,
        &wire::state_message(
            authoritative.position,
            authoritative.paused,
            authoritative.do_seek,
            &authoritative.set_by,
            now_seconds(),
            0.0,
            None,
        ),
    )
    .await?;

    attach_emission_event(state, handle, room_name.clone(), username.clone()).await;

    info!("{username} joined room {room_name}");
    Ok(Some((username, room_name)))
}

/// Attaches the periodic per-user `State` emission (§4.4, §4.8), stored on
/// the `Connection` so it can be stopped on departure (§4.2, §4.5, §9).
async fn attach_emission_event(
    state: &Arc<AppState>,
    handle: ConnectionHandle,
    room_name: String,
    username: String,
) {
    let emission_state = state.clone();
    let event = ManagedEvent::start(EMISSION_INTERVAL, move || {
        let state = emission_state.clone();
        let username = username.clone();
        async move {
            emit_state(&state, handle, &username).await;
        }
    });

    let mut guard = state.manager.write().await;
    if let Some(room) = guard.get_room_mut(&room_name) {
        if let Some(connection) = room.get_connection_by_handle_mut(handle) {
            connection.emission_event = Some(event);
        }
    }
}

async fn emit_state(state: &Arc<AppState>, handle: ConnectionHandle, username: &str) {
    let now = now_seconds();
    // Looked up by handle, not a room name captured at attach time: the
    // reverse index tracks a connection into whatever room it currently
    // belongs to, so this follows a `Set.room`/`Set.user` move automatically.
    let (room_name, writer, position, authoritative, probe) = {
        let guard = state.manager.read().await;
        let Some(room) = guard.get_room_by_handle(handle) else {
            return;
        };
        let Some(connection) = room.get_connection_by_username(username) else {
            return;
        };
        let position = room.playlist_store.calculate_position(now);
        (
            room.name.clone(),
            connection.writer.clone(),
            position,
            room.playlist_store.authoritative.clone(),
            connection.latency_probe,
        )
    };

    let client_latency =
        sync::round_trip_client_latency(probe.client_time, now, probe.arrival_time);
    let ignoring = if authoritative.ignore != 0 {
        Some(authoritative.ignore)
    } else {
        None
    };
    let message = wire::state_message(
        position,
        authoritative.paused,
        authoritative.do_seek,
        &authoritative.set_by,
        now,
        client_latency,
        ignoring,
    );
    if let Err(e) = framing::write_frame(&writer, &message).await {
        debug!("periodic emission to {username} failed (will retry next tick): {e}");
        return;
    }

    let mut guard = state.manager.write().await;
    if let Some(room) = guard.get_room_mut(&room_name) {
        room.playlist_store.set_last_message_age(username, now);
    }
}

async fn handle_state(
    state: &Arc<AppState>,
    handle: ConnectionHandle,
    room_name: &str,
    username: &str,
    frame: wire::StateFrame,
) -> Result<(), ServerError> {
    let now = now_seconds();
    let message_age = frame.ping.latency_calculation;

    let mut guard = state.manager.write().await;
    let room = guard
        .get_room_mut(room_name)
        .ok_or_else(|| ServerError::Semantic("room not found".into()))?;

    if let Some(ack) = frame.ignoring_on_the_fly {
        sync::acknowledge_ignore_token(&mut room.playlist_store.authoritative, ack.client);
    }

    if let Some(connection) = room.get_connection_by_handle_mut(handle) {
        connection.latency_probe.arrival_time = now;
        connection.latency_probe.client_time = frame.ping.client_latency_calculation;
        connection.latency_probe.client_rtt = frame.ping.client_rtt;
        connection.latency_probe.latency_calculation = message_age;
    }

    let outcome = sync::apply_inbound_state(
        &mut room.playlist_store.authoritative,
        message_age,
        &frame.playstate,
        state.features.desync_range,
        || state.next_ignore_token(),
    );
    if let sync::ApplyOutcome::RejectedBeyondTolerance { token } = outcome {
        debug!("{username} in {room_name} exceeded desync tolerance, issued ignore token {token}");
    }

    room.playlist_store.set_user_playstate(
        username,
        frame.playstate.position,
        frame.playstate.paused,
        frame.playstate.do_seek,
        message_age,
    )?;

    Ok(())
}

/// Handles one `Set` frame. Returns `Ok(Some(new_room))` when this connection
/// moved rooms, so the caller can update the dispatcher's notion of which
/// room subsequent frames from this connection belong to.
async fn handle_set(
    state: &Arc<AppState>,
    handle: ConnectionHandle,
    room_name: &str,
    username: &str,
    frame: SetFrame,
) -> Result<Option<String>, ServerError> {
    match frame {
        SetFrame::Ready {
            is_ready,
            manually_initiated,
        } => {
            {
                let mut guard = state.manager.write().await;
                if let Some(room) = guard.get_room_mut(room_name) {
                    room.set_user_ready_state(username, is_ready, manually_initiated);
                }
            }
            broadcast(
                &state.manager,
                room_name,
                &wire::ready_update(username, is_ready, manually_initiated),
                None,
            )
            .await;
        }
        SetFrame::PlaylistChange { files } => {
            let files: Vec<crate::playlist::File> = wire::sanitize_files(files)
                .into_iter()
                .map(Into::into)
                .collect();
            {
                let mut guard = state.manager.write().await;
                if let Some(room) = guard.get_room_mut(room_name) {
                    room.playlist_store
                        .set_playlist(files, username, state.features.shared_playlists);
                }
            }
            let stored = {
                let guard = state.manager.read().await;
                guard
                    .get_room(room_name)
                    .map(|r| r.playlist_store.get_playlist(username, state.features.shared_playlists).to_vec())
                    .unwrap_or_default()
            };
            broadcast(
                &state.manager,
                room_name,
                &wire::playlist_change(&stored, Some(username)),
                None,
            )
            .await;
        }
        SetFrame::PlaylistIndex { index } => {
            let authorized = {
                let guard = state.manager.read().await;
                guard
                    .get_room(room_name)
                    .map(|r| r.playlist_store.last_author() == Some(username))
                    .unwrap_or(false)
            };
            if !authorized {
                return Err(ServerError::Semantic(
                    "only the last playlist author may set the index".into(),
                ));
            }
            {
                let mut guard = state.manager.write().await;
                if let Some(room) = guard.get_room_mut(room_name) {
                    let len = room
                        .playlist_store
                        .get_playlist(username, state.features.shared_playlists)
                        .len();
                    room.playlist_store.set_index(index, len)?;
                }
            }
            broadcast(
                &state.manager,
                room_name,
                &wire::playlist_index(index, Some(username)),
                None,
            )
            .await;
        }
        SetFrame::File { entry } => {
            {
                let mut guard = state.manager.write().await;
                if let Some(room) = guard.get_room_mut(room_name) {
                    room.playlist_store
                        .set_user_file(username, entry.clone().into());
                }
            }
            broadcast(
                &state.manager,
                room_name,
                &wire::file_announcement(username, room_name, &entry),
                None,
            )
            .await;
        }
        SetFrame::Room { name } => {
            state.manager.write().await.move_connection(handle, &name)?;
            broadcast(&state.manager, room_name, &wire::left_announcement(username, room_name), None).await;
            broadcast(&state.manager, &name, &wire::joined_announcement(username, &name), None).await;
            attach_emission_event(state, handle, name.clone(), username.to_string()).await;
            return Ok(Some(name));
        }
        SetFrame::User {
            username: target,
            room_name: target_room,
            joined,
            left,
        } => {
            if joined && !left {
                state.manager.write().await.move_connection(handle, &target_room)?;
                broadcast(&state.manager, room_name, &wire::left_announcement(&target, room_name), None).await;
                broadcast(&state.manager, &target_room, &wire::joined_announcement(&target, &target_room), None).await;
                attach_emission_event(state, handle, target_room.clone(), target.clone()).await;
                return Ok(Some(target_room));
            }
        }
    }
    Ok(None)
}

async fn handle_list(
    state: &Arc<AppState>,
    room_name: &str,
    _requesting_user: &str,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
) -> Result<(), ServerError> {
    let guard = state.manager.read().await;
    let room = guard
        .get_room(room_name)
        .ok_or_else(|| ServerError::Semantic("room not found".into()))?;

    let mut room_info = serde_json::Map::new();
    for user in room.playlist_store.get_users() {
        let playstate = room.playlist_store.get_user_playstate(&user).unwrap_or_default();
        let file = room
            .playlist_store
            .get_user_file(&user)
            .map(|f| serde_json::json!({"duration": f.duration, "name": f.name, "size": f.size}))
            .unwrap_or_else(|| serde_json::json!({}));
        let is_ready = room
            .ready_store
            .get_user_ready_state(&user)
            .map(|r| r.is_ready)
            .unwrap_or(false);
        room_info.insert(
            user,
            serde_json::json!({
                "position": playstate.position,
                "file": file,
                "controller": false,
                "isReady": is_ready,
                "features": wire::features_object(&state.features),
            }),
        );
    }

    let mut list = serde_json::Map::new();
    list.insert(room_name.to_string(), Value::Object(room_info));
    let response = serde_json::json!({"List": list});
    drop(guard);
    framing::write_frame(writer, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_state_issues_increasing_handles() {
        let state = AppState::new(Features::default());
        let a = state.next_handle();
        let b = state.next_handle();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn app_state_issues_increasing_ignore_tokens() {
        let state = AppState::new(Features::default());
        let a = state.next_ignore_token();
        let b = state.next_ignore_token();
        assert_ne!(a, b);
    }
}
