//! Connection manager (§4.6): process-wide registry of rooms keyed by name,
//! plus a reverse index from transport handle to room name for O(1) reverse
//! lookup. Held as explicit `Arc<RwLock<ConnectionManager>>` state, never a
//! `static`/`OnceLock` singleton (§9 design-note resolution) — contrast with
//! the Go original's `mngr/conn/conn.go` package-level `connectionManager`.

use std::collections::HashMap;

use crate::connection::{Connection, ConnectionHandle};
use crate::error::ServerError;
use crate::room::Room;

#[derive(Default)]
pub struct ConnectionManager {
    rooms: HashMap<String, Room>,
    handle_to_room: HashMap<ConnectionHandle, String>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_room(&mut self, name: &str) -> &mut Room {
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| Room::new(name.to_string()))
    }

    pub fn get_room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub fn get_room_mut(&mut self, name: &str) -> Option<&mut Room> {
        self.rooms.get_mut(name)
    }

    pub fn get_room_by_handle(&self, handle: ConnectionHandle) -> Option<&Room> {
        let name = self.handle_to_room.get(&handle)?;
        self.rooms.get(name)
    }

    pub fn get_room_by_username(&self, username: &str) -> Option<&Room> {
        self.rooms
            .values()
            .find(|room| room.get_connection_by_username(username).is_some())
    }

    /// Admits `connection` into `room_name`, creating the room lazily (§4.6, §4.8).
    pub fn add_connection(&mut self, room_name: &str, connection: Connection) -> Result<(), ServerError> {
        let handle = connection.handle;
        let room = self.create_room(room_name);
        room.add_connection(connection)?;
        self.handle_to_room.insert(handle, room_name.to_string());
        Ok(())
    }

    /// Removes a connection from its room. Reclaims the room if it becomes
    /// empty (§9 open-question resolution: empty rooms are not kept forever).
    pub fn remove_connection(&mut self, handle: ConnectionHandle) -> Option<Connection> {
        let room_name = self.handle_to_room.remove(&handle)?;
        let room = self.rooms.get_mut(&room_name)?;
        let removed = room.remove_connection(handle);
        if room.is_empty() {
            self.rooms.remove(&room_name);
        }
        removed
    }

    /// Removes from the old room, re-inserts in the new one (§4.6). The
    /// caller is responsible for emitting the leave-then-join broadcasts in
    /// that order once both steps here succeed.
    pub fn move_connection(
        &mut self,
        handle: ConnectionHandle,
        new_room_name: &str,
    ) -> Result<(), ServerError> {
        let connection = self
            .remove_connection(handle)
            .ok_or_else(|| ServerError::Semantic("connection not found".into()))?;
        self.add_connection(new_room_name, connection)
    }

    pub fn room_names(&self) -> impl Iterator<Item = &str> {
        self.rooms.keys().map(String::as_str)
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
    async fn lazily_creates_rooms_on_first_join() {
        let mut cm = ConnectionManager::new();
        assert!(cm.get_room("r").is_none());
        cm.add_connection("r", dummy_connection("alice", 1).await).unwrap();
        assert!(cm.get_room("r").is_some());
    }

    #[tokio::test]
    async fn empty_room_is_reclaimed_on_last_departure() {
        let mut cm = ConnectionManager::new();
        cm.add_connection("r", dummy_connection("alice", 1).await).unwrap();
        cm.remove_connection(ConnectionHandle(1));
        assert!(cm.get_room("r").is_none());
    }

    #[tokio::test]
    async fn room_survives_while_other_users_remain() {
        let mut cm = ConnectionManager::new();
        cm.add_connection("r", dummy_connection("alice", 1).await).unwrap();
        cm.add_connection("r", dummy_connection("bob", 2).await).unwrap();
        cm.remove_connection(ConnectionHandle(1));
        assert!(cm.get_room("r").is_some());
    }

    #[tokio::test]
    async fn reverse_handle_lookup_finds_the_right_room() {
        let mut cm = ConnectionManager::new();
        cm.add_connection("r", dummy_connection("alice", 1).await).unwrap();
        assert_eq!(
            cm.get_room_by_handle(ConnectionHandle(1)).map(|r| r.name.as_str()),
            Some("r")
        );
    }

    #[tokio::test]
    async fn move_connection_relocates_between_rooms() {
        let mut cm = ConnectionManager::new();
        cm.add_connection("r1", dummy_connection("alice", 1).await).unwrap();
        cm.move_connection(ConnectionHandle(1), "r2").unwrap();
        assert!(cm.get_room("r1").is_none());
        assert!(
            cm.get_room("r2")
                .unwrap()
                .get_connection_by_username("alice")
                .is_some()
        );
    }
}
