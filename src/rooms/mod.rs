//! Room membership and broadcast fan-out
//!
//! Rooms are process-local, ephemeral sets of spark ids used for broadcast
//! addressing. The manager owns all membership state; sparks and the server
//! mutate it only through `join`/`leave`, so the tables are never observed
//! in a torn state.

pub mod broadcast;
pub mod manager;


pub use broadcast::{Broadcast, BroadcastResult};
pub use manager::{RoomManager, RoomManagerStats};

/// Split a whitespace-separated room list into individual names
pub(crate) fn split_rooms(spec: &str) -> Vec<String> {
    spec.split_whitespace().map(str::to_string).collect()
}
