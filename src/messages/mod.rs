//! Defines the message types that are sent between nodes and threads.
//!
//! All messages are serialized as JSON before they are handed to the
//! [`Transport`][crate::transport::Transport].

pub use self::{
    depart::{Departed, SelfDepart},
    join::Join,
    notify::Notify,
    request::Request,
    response::Response,
};

mod depart;
mod join;
mod notify;

pub mod key_data;
pub mod management;
pub mod replication_factor;
pub mod request;
pub mod response;
pub mod user_feedback;

/// An enum representing all the tiers the system supports -- currently, a
/// memory tier and a disk-based tier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Tier {
    /// The value for the memory tier.
    Memory,
    /// The value for the disk-based tier.
    Disk,
    /// The value for the routing tier.
    Routing,
}
