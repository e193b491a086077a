//! Playlist store (per room, §3, §4.3): shared-or-per-user file lists, the
//! current index, per-user file metadata, per-user playstate snapshots, and
//! the room's authoritative [`Playstate`] (CalculatePosition and the
//! ignore-on-the-fly token live here because they are exactly the operations
//! spec.md's playlist-store operation list names).
//!
//! Grounded on the Go original's `mngr/playlists/playlists.go`
//! `PlaylistManager`, generalized with the richer `File`/dedup/messageAge
//! fields spec.md's operation list adds beyond that simplified snapshot.

use std::collections::HashMap;

use crate::error::ServerError;
use crate::wire::FileEntry;

#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub name: String,
    pub duration: f64,
    pub size: serde_json::Value,
}

impl From<FileEntry> for File {
    fn from(e: FileEntry) -> Self {
        Self {
            name: e.name,
            duration: e.duration,
            size: e.size,
        }
    }
}

/// The authoritative, room-wide playback state (§3).
#[derive(Debug, Clone)]
pub struct Playstate {
    pub position: f64,
    pub paused: bool,
    pub do_seek: bool,
    pub set_by: String,
    pub position_time: f64,
    pub do_seek_time: f64,
    pub ignore: u64,
}

impl Default for Playstate {
    fn default() -> Self {
        Self {
            position: 0.0,
            paused: true,
            do_seek: false,
            set_by: "Nobody".to_string(),
            position_time: 0.0,
            do_seek_time: 0.0,
            ignore: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserPlaystate {
    pub position: f64,
    pub paused: bool,
    pub do_seek: bool,
    pub last_message_age: f64,
}

#[derive(Debug, Default)]
pub struct PlaylistStore {
    shared_files: Vec<File>,
    per_user_files: HashMap<String, Vec<File>>,
    index: Option<usize>,
    last_author: Option<String>,
    current_file: HashMap<String, File>,
    user_playstates: HashMap<String, UserPlaystate>,
    pub authoritative: Playstate,
}

impl PlaylistStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_user(&mut self, username: &str) {
        self.user_playstates
            .entry(username.to_string())
            .or_default();
        self.per_user_files.entry(username.to_string()).or_default();
    }

    pub fn remove_user(&mut self, username: &str) {
        self.user_playstates.remove(username);
        self.per_user_files.remove(username);
        self.current_file.remove(username);
    }

    /// Adds a file, deduped by name (§4.3): returns the existing file if a
    /// name match is found in the relevant list, otherwise appends.
    pub fn add_file(
        &mut self,
        name: &str,
        duration: f64,
        size: serde_json::Value,
        owner: &str,
        shared_playlists: bool,
    ) -> Result<File, ServerError> {
        if name.trim().is_empty() {
            return Err(ServerError::Protocol("file name is empty".into()));
        }
        let list = if shared_playlists {
            &mut self.shared_files
        } else {
            self.per_user_files.entry(owner.to_string()).or_default()
        };
        if let Some(existing) = list.iter().find(|f| f.name == name) {
            return Ok(existing.clone());
        }
        let file = File {
            name: name.to_string(),
            duration,
            size,
        };
        list.push(file.clone());
        self.last_author = Some(owner.to_string());
        Ok(file)
    }

    /// Replaces the playlist wholesale (§6: `Set.playlistChange` "Replace
    /// list"), unlike [`Self::add_file`] which only appends. Matches the Go
    /// original's `SetPlaylist`.
    pub fn set_playlist(&mut self, files: Vec<File>, owner: &str, shared_playlists: bool) {
        if shared_playlists {
            self.shared_files = files;
        } else {
            self.per_user_files.insert(owner.to_string(), files);
        }
        self.last_author = Some(owner.to_string());
    }

    pub fn set_user_file(&mut self, username: &str, file: File) {
        self.current_file.insert(username.to_string(), file);
    }

    pub fn get_user_file(&self, username: &str) -> Option<&File> {
        self.current_file.get(username)
    }

    pub fn set_user_playstate(
        &mut self,
        username: &str,
        position: f64,
        paused: bool,
        do_seek: bool,
        message_age: f64,
    ) -> Result<(), ServerError> {
        if username.is_empty() {
            return Err(ServerError::Semantic("empty username".into()));
        }
        let state = self.user_playstates.entry(username.to_string()).or_default();
        state.position = position;
        state.paused = paused;
        state.do_seek = do_seek;
        state.last_message_age = message_age;
        Ok(())
    }

    pub fn get_user_playstate(&self, username: &str) -> Option<UserPlaystate> {
        self.user_playstates.get(username).copied()
    }

    pub fn get_users(&self) -> Vec<String> {
        self.user_playstates.keys().cloned().collect()
    }

    pub fn get_playlist(&self, username: &str, shared_playlists: bool) -> &[File] {
        if shared_playlists {
            &self.shared_files
        } else {
            self.per_user_files
                .get(username)
                .map(Vec::as_slice)
                .unwrap_or(&[])
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: Option<usize>, max_len: usize) -> Result<(), ServerError> {
        if let Some(i) = index {
            if i >= max_len {
                return Err(ServerError::Semantic(format!(
                    "playlist index {i} out of bounds (len {max_len})"
                )));
            }
        }
        self.index = index;
        Ok(())
    }

    pub fn last_author(&self) -> Option<&str> {
        self.last_author.as_deref()
    }

    pub fn set_last_author(&mut self, username: &str) {
        self.last_author = Some(username.to_string());
    }

    pub fn set_last_message_age(&mut self, username: &str, t: f64) {
        self.user_playstates
            .entry(username.to_string())
            .or_default()
            .last_message_age = t;
    }

    pub fn get_last_message_age(&self, username: &str) -> f64 {
        self.user_playstates
            .get(username)
            .map(|s| s.last_message_age)
            .unwrap_or(0.0)
    }

    pub fn set_ignore(&mut self, token: u64) {
        self.authoritative.ignore = token;
    }

    /// `position + (messageAge - positionTime)` while unpaused, else `position` (§4.3).
    pub fn calculate_position(&self, message_age: f64) -> f64 {
        if self.authoritative.paused {
            self.authoritative.position
        } else {
            self.authoritative.position + (message_age - self.authoritative.position_time)
        }
    }
}
