//! Idle-room reclamation.
//!
//! The sweeper asks the registry for the idle set (a short locked
//! computation that detaches the rooms), then kicks the detached members
//! with no lock held. A kicked member's teardown finds its room already
//! gone, so no `peer_left` is emitted for swept rooms.

use crate::metrics::{counters, gauges};
use crate::registry::Kick;
use crate::server::ServerState;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// Run the periodic sweep until shutdown is signaled.
pub async fn run(state: Arc<ServerState>) {
    let mut shutdown = state.shutdown.subscribe();
    let mut ticker = tokio::time::interval(state.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => sweep_once(&state),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// A single sweep pass.
pub fn sweep_once(state: &ServerState) {
    let swept = state.registry.sweep_idle(state.config.room_ttl());
    for (code, members) in swept {
        for member in &members {
            let _ = member.kick.try_send(Kick::IdleRoom);
        }
        counters::rooms_swept_total();
        tracing::info!(room = %code, members = members.len(), "event=room_deleted reason=idle_expiry");
    }
    gauges::set_rooms_active(state.registry.rooms());
}
