//! Process-wide feature flags and tunables, loaded once at startup (§3, §6).

use std::env;

/// Feature flags and limits advertised to clients and consulted by handlers.
///
/// Constructed once in `main` and handed to every connection/event task behind
/// an `Arc`, never read from a mutable global (see DESIGN.md's resolution of
/// the "global singletons" design note).
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub isolate_rooms: bool,
    pub readiness: bool,
    pub managed_rooms: bool,
    pub persistent_rooms: bool,
    pub chat: bool,
    pub shared_playlists: bool,
    pub max_chat_message_length: usize,
    pub max_username_length: usize,
    pub max_room_name_length: usize,
    pub max_filename_length: usize,
    pub desync_range: f64,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            isolate_rooms: false,
            readiness: true,
            managed_rooms: true,
            persistent_rooms: false,
            chat: true,
            shared_playlists: true,
            max_chat_message_length: 150,
            max_username_length: 16,
            max_room_name_length: 35,
            max_filename_length: 250,
            desync_range: 0.5,
        }
    }
}

impl Features {
    /// Loads overrides from the environment, layered over [`Features::default`].
    ///
    /// Mirrors the teacher's `HOST`/`PORT` env-resolution idiom in `main.rs`,
    /// generalized to the full flag set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            isolate_rooms: env_bool("ISOLATE_ROOMS", defaults.isolate_rooms),
            readiness: env_bool("READINESS", defaults.readiness),
            managed_rooms: env_bool("MANAGED_ROOMS", defaults.managed_rooms),
            persistent_rooms: env_bool("PERSISTENT_ROOMS", defaults.persistent_rooms),
            chat: env_bool("CHAT", defaults.chat),
            shared_playlists: env_bool("SHARED_PLAYLISTS", defaults.shared_playlists),
            max_chat_message_length: env_usize(
                "MAX_CHAT_MESSAGE_LENGTH",
                defaults.max_chat_message_length,
            ),
            max_username_length: env_usize("MAX_USERNAME_LENGTH", defaults.max_username_length),
            max_room_name_length: env_usize("MAX_ROOM_NAME_LENGTH", defaults.max_room_name_length),
            max_filename_length: env_usize("MAX_FILENAME_LENGTH", defaults.max_filename_length),
            desync_range: env_f64("DESYNC_RANGE", defaults.desync_range),
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Default listener port, used when neither a CLI arg nor `PORT` is set.
pub const DEFAULT_PORT: u16 = 8080;

/// Resolves the listener port: CLI positional arg > `PORT` env var > default.
pub fn resolve_port(cli_arg: Option<&str>) -> u16 {
    if let Some(port) = cli_arg.and_then(|arg| arg.parse().ok()) {
        return port;
    }
    env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_contract() {
        let f = Features::default();
        assert_eq!(f.desync_range, 0.5);
        assert_eq!(f.max_username_length, 16);
        assert!(f.chat);
        assert!(!f.persistent_rooms);
    }

    #[test]
    fn resolve_port_prefers_cli_arg_over_default() {
        assert_eq!(resolve_port(Some("9191")), 9191);
    }

    #[test]
    fn resolve_port_falls_back_to_default_on_garbage() {
        assert_eq!(resolve_port(Some("not-a-port")), DEFAULT_PORT);
    }
}
