//! Remote store access
//!
//! Layers, leaf first:
//!
//! - `record`: pure codec between measurements and wire records
//! - `backend`: generic record database trait (`RecordBackend`)
//! - `client`: measurement-level contract (`RemoteClient`) and its single
//!   implementation `CloudClient`, shared by every device class
//! - `memory`: in-process backend, optionally shared through a JSON file

mod backend;
mod client;
mod error;
mod memory;
pub mod record;

pub use backend::{
    AccountStatus, ChangeKind, ChangeNotification, Query, RecordBackend, Subscription,
};
pub use client::{CloudClient, RemoteClient, SubscriptionOptions};
pub use error::{NetworkReason, RemoteError, RemoteResult};
pub use memory::MemoryBackend;
pub use record::{CodecError, RemoteRecord};
