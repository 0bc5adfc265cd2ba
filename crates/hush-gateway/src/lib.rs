//! Live push delivery: a per-user registry of open channels and the
//! WebSocket loop that drains one channel into one socket.

pub mod connection;
pub mod live;

pub use live::{ChannelHandle, ChannelId, LiveChannel};
