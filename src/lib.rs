//! Composable fan-in channels.
//!
//! Build a tree of buffered, single-consumer [`Channel`]s: every message sent
//! into a child ends up at the root's handler, and shutting the tree down
//! drains it from the leaves upward so nothing in flight is lost.
//!
//! ```no_run
//! use channel_tree::{Channel, ChannelConfig};
//!
//! # async fn demo() -> Result<(), channel_tree::ChannelError> {
//! let root: Channel<String> = Channel::new(
//!     ChannelConfig::<String>::new()
//!         .with_buffer_capacity(16)
//!         .with_consumer(|seq, msg| println!("{seq}: {msg}")),
//! );
//!
//! let worker = root.make_child_channel().await?;
//! worker.send("hello from a child".to_string()).await?;
//!
//! worker.sender_wait_and_close().await?;
//! root.sender_wait_and_close().await?;
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod config;
pub mod error;

pub use channels::{
    Channel, ChannelConfig, ChannelId, ChannelSnapshot, ChannelState, ChildMap, FnHandler,
    IdAllocator, MessageHandler, NoopHandler, Registry,
};
pub use config::ChannelSettings;
pub use error::{ChannelError, ConfigError, Error, RegistryError, Result};
