use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::models::{OnlineUser, ServerEvent};
use crate::services::auth_service::Identity;

pub type ConnId = Uuid;

/// Handle for pushing events onto one connection's outbound queue.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// A connection's departure from a room, reported so the session router can
/// notify the remaining members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: String,
    pub user_id: String,
}

/// Outcome of placing a connection in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection was already joined to this room; nothing changed.
    AlreadyJoined,
    /// The connection entered the room, possibly departing another.
    Joined { departure: Option<Departure> },
}

/// Hub counters for the diagnostics endpoint.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    pub n_conn: u32,
    pub n_in_room: u32,
    pub n_rooms: u32,
    pub n_cursor_rooms: u32,
}

struct ConnEntry {
    identity: Identity,
    room_id: Option<String>,
    tx: EventSender,
}

#[derive(Default)]
struct HubState {
    conns: HashMap<ConnId, ConnEntry>,
    // room -> user -> last known cursor position. Never persisted; a room's
    // map is dropped entirely once its last entry is removed.
    cursors: HashMap<String, HashMap<String, i64>>,
}

/// Process-wide registry of live connections: who is authenticated, which
/// room each connection is in, and where each room member's cursor is.
///
/// All mutation goes through these operations; the maps are never exposed.
/// Each operation takes the lock once and never holds it across an await,
/// so registry updates appear atomic relative to other event handling.
pub struct RoomHub {
    inner: Mutex<HubState>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubState::default()),
        }
    }

    // Every operation leaves the maps consistent before releasing the lock,
    // so a panic elsewhere must not take the registry down with it.
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit an authenticated connection. Called once per connection, after
    /// the handshake succeeds and before any room event is processed.
    pub fn register(&self, conn_id: ConnId, identity: Identity, tx: EventSender) {
        let mut state = self.state();
        state.conns.insert(
            conn_id,
            ConnEntry {
                identity,
                room_id: None,
                tx,
            },
        );
    }

    /// Remove a connection entirely. Runs the same room cleanup as an
    /// explicit leave, so an ungraceful disconnect cannot leak a phantom
    /// presence record or cursor entry.
    pub fn unregister(&self, conn_id: ConnId) -> Option<Departure> {
        let mut state = self.state();
        let departure = remove_from_room(&mut state, conn_id);
        state.conns.remove(&conn_id);
        departure
    }

    /// Place a connection in a room, replacing any prior presence record for
    /// that connection. Re-joining the current room is a no-op, reported as
    /// such so the caller does not announce an already-present user again;
    /// joining a different room reports the departure from the old one.
    pub fn join_room(&self, conn_id: ConnId, room_id: &str) -> JoinOutcome {
        let mut state = self.state();

        let current = state.conns.get(&conn_id).and_then(|e| e.room_id.clone());
        if current.as_deref() == Some(room_id) {
            return JoinOutcome::AlreadyJoined;
        }

        let departure = remove_from_room(&mut state, conn_id);
        if let Some(entry) = state.conns.get_mut(&conn_id) {
            entry.room_id = Some(room_id.to_string());
        }
        JoinOutcome::Joined { departure }
    }

    /// Take a connection out of its current room, if any.
    pub fn leave_room(&self, conn_id: ConnId) -> Option<Departure> {
        let mut state = self.state();
        remove_from_room(&mut state, conn_id)
    }

    /// The room a connection is currently joined to.
    pub fn current_room(&self, conn_id: ConnId) -> Option<String> {
        let state = self.state();
        state.conns.get(&conn_id).and_then(|e| e.room_id.clone())
    }

    /// Exactly the set of live, authenticated connections currently joined
    /// to the room.
    pub fn list_online(&self, room_id: &str) -> Vec<OnlineUser> {
        let state = self.state();
        state
            .conns
            .iter()
            .filter(|(_, entry)| entry.room_id.as_deref() == Some(room_id))
            .map(|(conn_id, entry)| OnlineUser {
                conn_id: *conn_id,
                user_id: entry.identity.user_id.clone(),
                username: entry.identity.username.clone(),
            })
            .collect()
    }

    /// Record a cursor position. The room's map is created on first use.
    /// Positions are raw document offsets; clamping against the current
    /// document length is the presentation layer's job.
    pub fn cursor_move(&self, room_id: &str, user_id: &str, position: i64) {
        let mut state = self.state();
        state
            .cursors
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string(), position);
    }

    /// Last known cursor positions for a room, pushed once to a newly
    /// joined connection.
    pub fn cursor_snapshot(&self, room_id: &str) -> HashMap<String, i64> {
        let state = self.state();
        state.cursors.get(room_id).cloned().unwrap_or_default()
    }

    /// Push an event to a single connection.
    pub fn send_to(&self, conn_id: ConnId, event: ServerEvent) {
        let state = self.state();
        if let Some(entry) = state.conns.get(&conn_id) {
            // A closed receiver means the connection is tearing down; its
            // unregister will run shortly.
            let _ = entry.tx.send(event);
        }
    }

    /// Fan an event out to every connection currently joined to the room,
    /// optionally excluding one (the sender, for edit/cursor rebroadcasts).
    ///
    /// Delivery happens under the registry lock, so events enqueued by one
    /// sender reach all subscribers in send order.
    pub fn broadcast(&self, room_id: &str, event: ServerEvent, exclude: Option<ConnId>) {
        let state = self.state();
        for (conn_id, entry) in state.conns.iter() {
            if Some(*conn_id) == exclude {
                continue;
            }
            if entry.room_id.as_deref() != Some(room_id) {
                continue;
            }
            if entry.tx.send(event.clone()).is_err() {
                debug!("Dropping event for closed connection {}", conn_id);
            }
        }
    }

    /// Aggregate counters for diagnostics.
    pub fn stats(&self) -> HubStats {
        let state = self.state();
        let rooms: std::collections::HashSet<&str> = state
            .conns
            .values()
            .filter_map(|e| e.room_id.as_deref())
            .collect();
        HubStats {
            n_conn: state.conns.len() as u32,
            n_in_room: state.conns.values().filter(|e| e.room_id.is_some()).count() as u32,
            n_rooms: rooms.len() as u32,
            n_cursor_rooms: state.cursors.len() as u32,
        }
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

// Unified cleanup for explicit leave, disconnect and room switches: clears
// the presence record's room, removes the user's cursor entry and drops the
// room's cursor map once empty.
fn remove_from_room(state: &mut HubState, conn_id: ConnId) -> Option<Departure> {
    let entry = state.conns.get_mut(&conn_id)?;
    let room_id = entry.room_id.take()?;
    let user_id = entry.identity.user_id.clone();

    if let Some(room_cursors) = state.cursors.get_mut(&room_id) {
        room_cursors.remove(&user_id);
        if room_cursors.is_empty() {
            state.cursors.remove(&room_id);
        }
    }

    Some(Departure { room_id, user_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerEvent;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn identity(n: u32) -> Identity {
        Identity {
            user_id: format!("user-{n}"),
            username: format!("name-{n}"),
        }
    }

    fn connect(hub: &RoomHub, n: u32) -> (ConnId, UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(conn_id, identity(n), tx);
        (conn_id, rx)
    }

    #[test]
    fn list_online_is_exactly_the_joined_set() {
        let hub = RoomHub::new();
        let (a, _rx_a) = connect(&hub, 1);
        let (b, _rx_b) = connect(&hub, 2);
        let (_c, _rx_c) = connect(&hub, 3);

        hub.join_room(a, "abc");
        hub.join_room(b, "abc");

        let online = hub.list_online("abc");
        assert_eq!(online.len(), 2);
        assert!(online.iter().any(|u| u.conn_id == a));
        assert!(online.iter().any(|u| u.conn_id == b));

        hub.leave_room(a);
        let online = hub.list_online("abc");
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].conn_id, b);
    }

    #[test]
    fn rejoining_same_room_does_not_duplicate_presence() {
        let hub = RoomHub::new();
        let (a, _rx) = connect(&hub, 1);

        assert_eq!(
            hub.join_room(a, "abc"),
            JoinOutcome::Joined { departure: None }
        );
        // reported distinctly so the router skips the presence-added
        // broadcast for a user the room already sees
        assert_eq!(hub.join_room(a, "abc"), JoinOutcome::AlreadyJoined);
        assert_eq!(hub.list_online("abc").len(), 1);
    }

    #[test]
    fn switching_rooms_reports_departure_from_old_room() {
        let hub = RoomHub::new();
        let (a, _rx) = connect(&hub, 1);

        hub.join_room(a, "abc");
        hub.cursor_move("abc", "user-1", 5);
        let outcome = hub.join_room(a, "xyz");

        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                departure: Some(Departure {
                    room_id: "abc".to_string(),
                    user_id: "user-1".to_string(),
                })
            }
        );
        assert!(hub.list_online("abc").is_empty());
        assert_eq!(hub.list_online("xyz").len(), 1);
        // cursor entry moved out with the connection
        assert_eq!(hub.stats().n_cursor_rooms, 0);
    }

    #[test]
    fn leave_is_noop_for_unknown_connection() {
        let hub = RoomHub::new();
        assert_eq!(hub.leave_room(Uuid::new_v4()), None);
        assert_eq!(hub.unregister(Uuid::new_v4()), None);
    }

    #[test]
    fn disconnect_removes_cursor_and_drops_empty_room_map() {
        let hub = RoomHub::new();
        let (a, _rx_a) = connect(&hub, 1);
        let (b, _rx_b) = connect(&hub, 2);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");
        hub.cursor_move("abc", "user-1", 10);
        hub.cursor_move("abc", "user-2", 20);

        hub.unregister(a);
        assert_eq!(hub.cursor_snapshot("abc").len(), 1);
        assert_eq!(hub.stats().n_cursor_rooms, 1);

        hub.unregister(b);
        // absent, not merely empty
        assert_eq!(hub.stats().n_cursor_rooms, 0);
        assert!(hub.list_online("abc").is_empty());
    }

    #[test]
    fn broadcast_excludes_sender_and_other_rooms() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = connect(&hub, 1);
        let (b, mut rx_b) = connect(&hub, 2);
        let (c, mut rx_c) = connect(&hub, 3);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");
        hub.join_room(c, "xyz");

        let event = ServerEvent::CodeChange(crate::models::CodeBroadcastMessage {
            content: "print(1)".to_string(),
        });
        hub.broadcast("abc", event, Some(a));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn full_broadcast_includes_sender() {
        let hub = RoomHub::new();
        let (a, mut rx_a) = connect(&hub, 1);
        let (b, mut rx_b) = connect(&hub, 2);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");

        let event = ServerEvent::UserOffline(crate::models::UserOfflineMessage {
            user_id: "user-9".to_string(),
        });
        hub.broadcast("abc", event, None);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn unregister_precedes_departure_broadcast() {
        let hub = RoomHub::new();
        let (a, _rx_a) = connect(&hub, 1);
        let (b, mut rx_b) = connect(&hub, 2);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");

        // the session router unregisters first, then broadcasts the
        // departure; at broadcast time the registry no longer lists a
        let departure = hub.unregister(a).unwrap();
        assert!(hub.list_online("abc").iter().all(|u| u.conn_id != a));

        hub.broadcast(
            &departure.room_id,
            ServerEvent::UserOffline(crate::models::UserOfflineMessage {
                user_id: departure.user_id,
            }),
            None,
        );
        match rx_b.try_recv().unwrap() {
            ServerEvent::UserOffline(msg) => assert_eq!(msg.user_id, "user-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn broadcast_survives_closed_receiver() {
        let hub = RoomHub::new();
        let (a, rx_a) = connect(&hub, 1);
        let (b, mut rx_b) = connect(&hub, 2);
        hub.join_room(a, "abc");
        hub.join_room(b, "abc");
        drop(rx_a);

        hub.broadcast(
            "abc",
            ServerEvent::CodeChange(crate::models::CodeBroadcastMessage {
                content: "x".to_string(),
            }),
            None,
        );
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn cursor_snapshot_for_unknown_room_is_empty() {
        let hub = RoomHub::new();
        assert!(hub.cursor_snapshot("nope").is_empty());
    }

    #[test]
    fn registry_survives_poisoned_lock() {
        let hub = std::sync::Arc::new(RoomHub::new());
        let (a, _rx) = connect(&hub, 1);
        hub.join_room(a, "abc");

        // poison the lock by panicking while holding it
        let poisoner = std::sync::Arc::clone(&hub);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("poisoning the registry lock");
        })
        .join();
        assert!(hub.inner.is_poisoned());

        assert_eq!(hub.list_online("abc").len(), 1);
        assert_eq!(hub.unregister(a).map(|d| d.room_id), Some("abc".to_string()));
    }
}
