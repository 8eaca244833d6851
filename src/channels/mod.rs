//! Fan-in channel trees.
//!
//! A [`Channel`] is a bounded queue with one consumer task. Child channels
//! relay what they consume into their parent, so independent producers can
//! feed a shared consumer without touching its queue directly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Channel (root)                       │
//! │                                                              │
//! │   producers ──send──► [ bounded queue ] ──► consumer task    │
//! │                            ▲                  │              │
//! │                            │ forward          ▼              │
//! │   ┌──────────────┐   ┌─────┴────────┐    MessageHandler      │
//! │   │ child 2      │   │ child 3      │    (seq, message)      │
//! │   │ queue + task │   │ queue + task │                        │
//! │   └──────┬───────┘   └──────────────┘                        │
//! │          │ forward                                           │
//! │   ┌──────┴───────┐          Registry: id -> child handle     │
//! │   │ grandchild 4 │          (removed when a child drains)    │
//! │   └──────────────┘                                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown is initiated top-down and completes bottom-up: a channel closes
//! its queue only after its registry is empty.

mod channel;
mod handler;
mod id;
mod registry;
mod topology;

pub use channel::{Channel, ChannelConfig, ChannelState};
pub use handler::{CloseFn, ConsumerFn, FnHandler, MessageHandler, NoopHandler};
pub use id::{ChannelId, IdAllocator};
pub use registry::{ChildMap, Registry};
pub use topology::ChannelSnapshot;
