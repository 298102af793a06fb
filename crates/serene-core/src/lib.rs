//! Serene Core Library
//!
//! Keeps stress measurements in step between a user's devices (a primary
//! phone and a battery-constrained companion watch) through one shared
//! remote store.
//!
//! # Architecture
//!
//! - **Local store**: authoritative copy for the running session
//! - **Remote store**: shared by every device of the account, reached
//!   through `RemoteClient`
//! - **Sync**: batched upload with retry, incremental download, push
//!   triggered refresh and per-device throttling
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let identity = DeviceIdentity::load_or_create(&config.device_id_path(), config.device_class)?;
//!
//! let store = Arc::new(FileStore::open(config.store_path())?);
//! store.insert(Measurement::new(identity.id(), 42.0, 55.0, 61.0)).await?;
//!
//! coordinator.sync_user_initiated(&cancel).await?;
//! ```
//!
//! # Modules
//!
//! - `models`: measurements, baselines and stress categories
//! - `identity`: per-device identifier and device class
//! - `remote`: wire codec, backend trait and the remote client
//! - `sync`: engine, coordinator, throttle and conflict resolution
//! - `store`: local persistence collaborator
//! - `config`: application configuration

pub mod config;
pub mod identity;
pub mod models;
pub mod persist;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::Config;
pub use identity::{DeviceClass, DeviceIdentity, InitResult};
pub use models::{Baseline, Measurement, RecordKey, StressCategory};
pub use remote::{CloudClient, MemoryBackend, RemoteClient, RemoteError};
pub use store::{FileStore, LocalStore};
pub use sync::{SyncCoordinator, SyncError, SyncOutcome, SyncPolicy, SyncSession, SyncStatus};
