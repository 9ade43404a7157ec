//! Snapshot fan-out.
//!
//! The router enqueues and returns: it never awaits per-peer I/O, so a
//! slow peer cannot block the producer. Queue overflow closes the slow
//! consumer via its kick channel; closing preserves ordering semantics
//! for the remaining peers, unlike dropping buffered frames.

use crate::metrics::counters;
use crate::registry::{Kick, MemberHandle, Registry};
use tokio::sync::mpsc::error::TrySendError;
use tungstenite::Message;

fn deliver(peer: &MemberHandle, frame: Message) {
    match peer.tx.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            counters::messages_dropped_total("slow_consumer");
            tracing::warn!(client_id = %peer.client_id, "outbound queue full, closing slow consumer");
            // A full kick channel means a close is already pending.
            let _ = peer.kick.try_send(Kick::SlowConsumer);
        }
        Err(TrySendError::Closed(_)) => {
            // Member is mid-teardown; its peer_left will follow.
            counters::messages_dropped_total("closed");
        }
    }
}

/// Enqueue `frame` to every member in the snapshot.
pub fn fan_out(peers: &[MemberHandle], frame: &Message) {
    for peer in peers {
        deliver(peer, frame.clone());
    }
}

/// Relay an opaque frame from the member identified by `sender_seq` to
/// the rest of its room. Bumps the room's activity timestamp, snapshots
/// the membership, then enqueues outside any registry lock. Returns the
/// number of peers the frame was offered to.
pub fn relay(registry: &Registry, room: &str, sender_seq: u64, frame: &Message) -> usize {
    registry.touch(room);
    let snapshot = registry.members_of(room);
    let mut offered = 0;
    for peer in snapshot.iter().filter(|m| m.seq != sender_seq) {
        deliver(peer, frame.clone());
        offered += 1;
    }
    offered
}
