//! Playback synchronization engine (§4.4): pure functions over
//! [`crate::playlist::Playstate`] so the tolerance/tie-break/ignore-token
//! rules are unit-testable without any I/O.
//!
//! Grounded on the Go original's `messages/state.go` (`HandleStatePing`,
//! `SendUserState`) for the overall shape, with spec.md's more precise
//! round-trip formula and tolerance rule taking precedence where the two
//! disagree (see SPEC_FULL.md §4.4 and DESIGN.md).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::playlist::Playstate;
use crate::wire::PlaystateFrame;

/// Current time as floating-point seconds-since-epoch (§6: all timestamps
/// on the wire use this representation).
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyOutcome {
    /// The room is currently forcing an ignore-on-the-fly override; this
    /// client's reported state was not adopted.
    Ignored,
    /// Applied in full (or in part — paused/doSeek/position update independently).
    Applied,
    /// The reported position fell outside `desyncRange`; a fresh ignore
    /// token was issued and the room kept its own elapsed position.
    RejectedBeyondTolerance { token: u64 },
}

fn canonical_set_by(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Applies one inbound `State` frame to the room's authoritative playstate.
///
/// `message_age` is the inbound `ping.latencyCalculation` (§4.4). `issue_token`
/// is called at most once, lazily, only when a fresh ignore-on-the-fly token
/// is actually needed.
pub fn apply_inbound_state(
    authoritative: &mut Playstate,
    message_age: f64,
    client: &PlaystateFrame,
    desync_range: f64,
    issue_token: impl FnOnce() -> u64,
) -> ApplyOutcome {
    if authoritative.ignore != 0 {
        return ApplyOutcome::Ignored;
    }

    let incoming_set_by =
        canonical_set_by(client.set_by.as_deref()).unwrap_or_else(|| "Nobody".to_string());
    let mut changed = false;
    let mut position_handled_by_seek = false;

    // A deliberate seek bypasses the drift-tolerance check entirely: it is an
    // intentional jump, not drift to be filtered.
    if message_age > authoritative.do_seek_time {
        if client.do_seek {
            authoritative.do_seek = true;
            authoritative.paused = true;
            authoritative.do_seek_time = message_age;
            authoritative.position = client.position;
            authoritative.position_time = message_age;
            changed = true;
            position_handled_by_seek = true;
        } else if authoritative.do_seek {
            authoritative.do_seek = false;
            authoritative.do_seek_time = message_age;
        }
    }

    if !position_handled_by_seek && message_age > authoritative.position_time {
        if (authoritative.position - client.position).abs() <= desync_range {
            authoritative.position = client.position;
            authoritative.position_time = message_age;
            changed = true;
        } else {
            let elapsed_position = if authoritative.paused {
                authoritative.position
            } else {
                authoritative.position + (message_age - authoritative.position_time)
            };
            authoritative.position = elapsed_position;
            authoritative.position_time = message_age;
            let token = issue_token();
            authoritative.ignore = token;
            authoritative.set_by = "Nobody".to_string();
            return ApplyOutcome::RejectedBeyondTolerance { token };
        }
    }

    if !position_handled_by_seek && client.paused != authoritative.paused {
        authoritative.paused = client.paused;
        changed = true;
    }

    if changed {
        authoritative.set_by = incoming_set_by;
    }

    ApplyOutcome::Applied
}

/// Clears a pending ignore-on-the-fly override once the client echoes the
/// matching token (§4.4 step 2). Mismatched tokens are ignored (the server
/// only verifies symmetry, per §9's open-question resolution).
pub fn acknowledge_ignore_token(authoritative: &mut Playstate, echoed: Option<u64>) {
    if let Some(token) = echoed {
        if authoritative.ignore == token {
            authoritative.ignore = 0;
        }
    }
}

/// `ping.clientLatencyCalculation` for the next outbound `State`: round-trips
/// the client's own clock, augmented by server-side processing delay (§4.4).
pub fn round_trip_client_latency(client_time: f64, now: f64, arrival_time: f64) -> f64 {
    if client_time == 0.0 {
        0.0
    } else {
        client_time + (now - arrival_time)
    }
}
