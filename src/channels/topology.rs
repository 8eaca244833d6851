//! Point-in-time view of a channel tree.
//!
//! ```text
//! channel 1 (ingest) [running, capacity 4]
//! ├── channel 2 [running, capacity 4]
//! │   └── channel 4 [draining, capacity 4]
//! └── channel 3 [running, capacity 4]
//! ```

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::channels::channel::{Channel, ChannelState};
use crate::channels::id::ChannelId;
use crate::error::ChannelError;

/// Serializable snapshot of one channel and its live descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub name: Option<String>,
    pub state: ChannelState,
    pub capacity: usize,
    /// Live children, ordered by id.
    pub children: Vec<ChannelSnapshot>,
}

impl ChannelSnapshot {
    /// Number of channels in this subtree, including this one.
    pub fn channel_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(ChannelSnapshot::channel_count)
            .sum::<usize>()
    }

    /// Render the subtree as an indented ASCII tree.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.label());
        out.push('\n');
        self.render_children("", &mut out);
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!(
                "channel {} ({}) [{}, capacity {}]",
                self.id, name, self.state, self.capacity
            ),
            None => format!(
                "channel {} [{}, capacity {}]",
                self.id, self.state, self.capacity
            ),
        }
    }

    fn render_children(&self, prefix: &str, out: &mut String) {
        let count = self.children.len();
        for (i, child) in self.children.iter().enumerate() {
            let last = i + 1 == count;
            out.push_str(prefix);
            out.push_str(if last { "└── " } else { "├── " });
            out.push_str(&child.label());
            out.push('\n');
            let nested = format!("{}{}", prefix, if last { "    " } else { "│   " });
            child.render_children(&nested, out);
        }
    }
}

impl<M: Send + 'static> Channel<M> {
    /// Capture this channel and every live descendant.
    ///
    /// Each registry is read under its own lock, so a tree that is shutting
    /// down may show a child next to a parent that has already moved on.
    pub fn snapshot(&self) -> BoxFuture<'_, Result<ChannelSnapshot, ChannelError>> {
        async move {
            let mut children = Vec::new();
            for child in self.children().await? {
                children.push(child.snapshot().await?);
            }
            children.sort_by_key(|c| c.id);

            Ok(ChannelSnapshot {
                id: self.id(),
                name: self.name().map(str::to_string),
                state: self.state(),
                capacity: self.capacity(),
                children,
            })
        }
        .boxed()
    }
}
