//! # sparkmux
//!
//! A multiplexing messaging layer riding atop a single bidirectional
//! framed connection:
//!
//! - **Channels** multiplex many independent logical conversations over one
//!   connection, each with its own event dispatch and lifecycle
//! - **Rooms** group server-side endpoints ("sparks") into named broadcast
//!   sets with exactly-once fan-out per member
//! - **Acks** correlate one-shot replies to emitted events, resolved as
//!   one-shot futures and abandoned cleanly on disconnect
//!
//! The transport is an external collaborator: anything that can carry
//! discrete [`Frame`]s on a live connection plugs in through
//! [`FrameTransport`]. An in-memory duplex pair is provided for tests and
//! embedding.
//!
//! ```no_run
//! use serde_json::json;
//! use sparkmux::{memory_pair, Client, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new();
//!     let news = server.channel("news").await;
//!     news.on_connection(|spark| async move {
//!         let _ = spark.join("breaking").await;
//!         let _ = spark.emit("msg", json!({ "hi": "hello" })).await;
//!     })
//!     .await;
//!
//!     let (local, remote) = memory_pair();
//!     server.accept(remote).await;
//!
//!     let client = Client::connect(local);
//!     let channel = client.channel("news").await?;
//!     channel
//!         .on("msg", |payload, _| async move {
//!             println!("got {payload}");
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod ack;
pub mod channel;
pub mod client;
pub mod emitter;
pub mod frame;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod spark;
pub mod transport;
pub mod types;

// Re-export main types
pub use ack::AckHandle;
pub use channel::Channel;
pub use client::Client;
pub use emitter::{AckReply, CLOSE_EVENT, DATA_EVENT};
pub use frame::{Frame, FrameBody};
pub use registry::{ChannelGroup, SparkRegistry};
pub use rooms::{Broadcast, BroadcastResult, RoomManager, RoomManagerStats};
pub use server::{Server, ServerStats};
pub use spark::Spark;
pub use transport::{memory_pair, FrameTransport, MemoryTransport};
pub use types::{
    ChannelState, ConnectionId, MuxConfig, MuxError, MuxResult, SparkId,
};
