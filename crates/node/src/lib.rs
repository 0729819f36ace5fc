//! A replica validator process: the application connections, mempool,
//! consensus state machine, write-ahead logs and both reactors, wired
//! together by [Node].
pub mod app;
mod config;
mod node;
mod switch;

pub use config::{LogFormat, NodeConfig};
pub use node::Node;
pub use switch::PeerSet;
