//! The room registry, sole owner of room membership and activity
//! timestamps.
//!
//! Critical sections are short: admit, remove, snapshot, touch. Fan-out
//! never happens under a registry lock; callers take a snapshot and
//! write to member queues after release.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tungstenite::Message;

/// Out-of-band close instruction delivered on a member's kick channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kick {
    /// The member's room was reclaimed by the idle sweeper.
    IdleRoom,
    /// The member's outbound queue overflowed.
    SlowConsumer,
}

/// Handle to a live member — everything the router and sweeper need to
/// reach a connection without touching its task.
#[derive(Clone, Debug)]
pub struct MemberHandle {
    /// Opaque client id, unique within the room.
    pub client_id: String,
    /// Token subject, for logging only.
    pub subject: String,
    /// Bounded outbound queue feeding the member's writer.
    pub tx: mpsc::Sender<Message>,
    /// Capacity-1 channel for out-of-band closes.
    pub kick: mpsc::Sender<Kick>,
    /// Process-unique connection sequence; guards idempotent removal.
    pub seq: u64,
    /// When the member was admitted.
    pub joined_at: Instant,
}

#[derive(Debug)]
struct Room {
    /// Insertion order preserved for deterministic fan-out.
    members: Vec<MemberHandle>,
    last_active: Instant,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// The room already holds `capacity` members.
    RoomFull,
    /// The client id is already present in the room.
    DuplicateId,
}

/// Result of a successful admission.
#[derive(Debug)]
pub struct Admitted {
    /// Sequence number assigned to the new member.
    pub seq: u64,
    /// Snapshot of the members present before this one joined.
    pub peers: Vec<MemberHandle>,
}

/// Result of a successful removal.
#[derive(Debug)]
pub struct Removed {
    /// Snapshot of the members remaining after the removal.
    pub peers: Vec<MemberHandle>,
    /// True when the departing member was the last one.
    pub room_deleted: bool,
}

/// Concurrent room table keyed by room code.
#[derive(Debug)]
pub struct Registry {
    rooms: DashMap<String, Room>,
    capacity: usize,
    next_seq: AtomicU64,
}

impl Registry {
    /// Create an empty registry with the given per-room capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Atomically create the room if absent and append the member.
    ///
    /// # Errors
    ///
    /// `RoomFull` when the room holds `capacity` members, `DuplicateId`
    /// when the client id is already present.
    pub fn admit(
        &self,
        code: &str,
        client_id: &str,
        subject: &str,
        tx: mpsc::Sender<Message>,
        kick: mpsc::Sender<Kick>,
    ) -> Result<Admitted, AdmitError> {
        let now = Instant::now();
        let mut room = self.rooms.entry(code.to_string()).or_insert_with(|| Room {
            members: Vec::new(),
            last_active: now,
        });

        if room.members.len() >= self.capacity {
            return Err(AdmitError::RoomFull);
        }
        if room.members.iter().any(|m| m.client_id == client_id) {
            return Err(AdmitError::DuplicateId);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let peers = room.members.clone();
        room.members.push(MemberHandle {
            client_id: client_id.to_string(),
            subject: subject.to_string(),
            tx,
            kick,
            seq,
            joined_at: now,
        });
        room.last_active = now;

        Ok(Admitted { seq, peers })
    }

    /// Remove the member identified by `(client_id, seq)`. Idempotent:
    /// returns `None` when the member (or the whole room) is already
    /// gone, which happens after a sweep or a repeated call. An empty
    /// room is deleted on the spot.
    pub fn remove(&self, code: &str, client_id: &str, seq: u64) -> Option<Removed> {
        match self.rooms.entry(code.to_string()) {
            Entry::Occupied(mut occupied) => {
                let room = occupied.get_mut();
                let idx = room
                    .members
                    .iter()
                    .position(|m| m.client_id == client_id && m.seq == seq)?;
                room.members.remove(idx);
                room.last_active = Instant::now();
                if room.members.is_empty() {
                    occupied.remove();
                    Some(Removed {
                        peers: Vec::new(),
                        room_deleted: true,
                    })
                } else {
                    Some(Removed {
                        peers: room.members.clone(),
                        room_deleted: false,
                    })
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Point-in-time snapshot of a room's members, in insertion order.
    #[must_use]
    pub fn members_of(&self, code: &str) -> Vec<MemberHandle> {
        self.rooms
            .get(code)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    /// Bump a room's activity timestamp without a membership change.
    pub fn touch(&self, code: &str) {
        if let Some(mut room) = self.rooms.get_mut(code) {
            room.last_active = Instant::now();
        }
    }

    /// Detach every room idle for at least `ttl` (inclusive) and return
    /// the detached members. Closing their connections is the caller's
    /// job, outside any registry lock.
    pub fn sweep_idle(&self, ttl: Duration) -> Vec<(String, Vec<MemberHandle>)> {
        let now = Instant::now();
        let idle: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_active) >= ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = Vec::new();
        for code in idle {
            // Re-check under the removal lock; the room may have been
            // touched between the scan and now.
            if let Some((code, room)) = self
                .rooms
                .remove_if(&code, |_, room| now.duration_since(room.last_active) >= ttl)
            {
                swept.push((code, room.members));
            }
        }
        swept
    }

    /// Number of live rooms.
    #[must_use]
    pub fn rooms(&self) -> usize {
        self.rooms.len()
    }

    #[cfg(test)]
    fn backdate(&self, code: &str, age: Duration) {
        if let Some(mut room) = self.rooms.get_mut(code) {
            room.last_active = Instant::now() - age;
        }
    }
}
