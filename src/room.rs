//! Room (§3, §4.5): aggregates connections, playlist store, ready store, and
//! the authoritative playstate (held inside the playlist store, see
//! `playlist.rs`'s module doc). Exclusively owned by the [`crate::room_manager::ConnectionManager`].
//!
//! Grounded on the Go original's `mngr/room/room.go` `Room`/`Connection`.

use std::collections::HashMap;

use crate::connection::{Connection, ConnectionHandle, LatencyProbe};
use crate::error::ServerError;
use crate::playlist::PlaylistStore;
use crate::ready::ReadyStore;

pub struct Room {
    pub name: String,
    connections: HashMap<ConnectionHandle, Connection>,
    username_index: HashMap<String, ConnectionHandle>,
    pub playlist_store: PlaylistStore,
    pub ready_store: ReadyStore,
}

impl Room {
    pub fn new(name: String) -> Self {
        Self {
            name,
            connections: HashMap::new(),
            username_index: HashMap::new(),
            playlist_store: PlaylistStore::new(),
            ready_store: ReadyStore::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Admits a connection. Rejects on a duplicate username (§4.5, §8): the
    /// incumbent is left untouched and the caller must not admit the session.
    pub fn add_connection(&mut self, connection: Connection) -> Result<(), ServerError> {
        if self.username_index.contains_key(&connection.username) {
            return Err(ServerError::Semantic(format!(
                "{} is already in the room",
                connection.username
            )));
        }
        self.username_index
            .insert(connection.username.clone(), connection.handle);
        self.playlist_store.create_user(&connection.username);
        self.connections.insert(connection.handle, connection);
        Ok(())
    }

    /// Removes a connection and clears its readiness/playstate (§4.5, §8).
    /// Stops only the departing connection's own events (§9, not StopAll).
    pub fn remove_connection(&mut self, handle: ConnectionHandle) -> Option<Connection> {
        let mut connection = self.connections.remove(&handle)?;
        self.username_index.remove(&connection.username);
        self.ready_store.remove_user(&connection.username);
        self.playlist_store.remove_user(&connection.username);
        connection.stop_own_events();
        Some(connection)
    }

    pub fn get_connection_by_username(&self, username: &str) -> Option<&Connection> {
        let handle = self.username_index.get(username)?;
        self.connections.get(handle)
    }

    pub fn get_connection_by_handle(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(&handle)
    }

    pub fn get_connection_by_handle_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(&handle)
    }

    pub fn get_username_by_handle(&self, handle: ConnectionHandle) -> Option<&str> {
        self.connections.get(&handle).map(|c| c.username.as_str())
    }

    pub fn get_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn set_user_ready_state(&mut self, username: &str, is_ready: bool, manually_initiated: bool) {
        self.ready_store
            .set_user_ready_state(username, is_ready, manually_initiated);
    }

    pub fn get_users_latency_probe(&self, username: &str) -> Option<LatencyProbe> {
        self.get_connection_by_username(username)
            .map(|c| c.latency_probe)
    }

    pub fn set_users_latency_probe(&mut self, username: &str, probe: LatencyProbe) {
        if let Some(handle) = self.username_index.get(username).copied() {
            if let Some(conn) = self.connections.get_mut(&handle) {
                conn.latency_probe = probe;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    async fn dummy_connection(username: &str, handle: u64) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_read, write) = client.unwrap().into_split();
        Connection::new(username.to_string(), ConnectionHandle(handle), Arc::new(Mutex::new(write)))
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected_and_incumbent_stays() {
        let mut room = Room::new("r".to_string());
        room.add_connection(dummy_connection("alice", 1).await).unwrap();
        let err = room.add_connection(dummy_connection("alice", 2).await);
        assert!(err.is_err());
        assert!(room.get_connection_by_handle(ConnectionHandle(1)).is_some());
        assert!(room.get_connection_by_handle(ConnectionHandle(2)).is_none());
    }

    #[tokio::test]
    async fn removal_clears_readiness_and_playstate() {
        let mut room = Room::new("r".to_string());
        room.add_connection(dummy_connection("alice", 1).await).unwrap();
        room.set_user_ready_state("alice", true, true);
        room.remove_connection(ConnectionHandle(1));
        assert!(room.ready_store.get_user_ready_state("alice").is_none());
        assert!(room.playlist_store.get_user_playstate("alice").is_none());
        assert!(room.get_connection_by_username("alice").is_none());
    }

    #[tokio::test]
    async fn handles_are_unique_within_a_room() {
        let mut room = Room::new("r".to_string());
        room.add_connection(dummy_connection("alice", 1).await).unwrap();
        room.add_connection(dummy_connection("bob", 2).await).unwrap();
        assert!(room.get_connection_by_handle(ConnectionHandle(1)).is_some());
        assert!(room.get_connection_by_handle(ConnectionHandle(2)).is_some());
    }
}
