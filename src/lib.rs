// src/lib.rs

pub mod arbiter;
pub mod audit;
pub mod config;
pub mod detect;
pub mod engine;
pub mod event;
pub mod executor;
pub mod logging;
pub mod snapshot;
pub mod state;
pub mod storage;

// wygodne skróty dla kolaboratorów (klient gateway, loader configu)
pub use crate::audit::{Alerter, AlertKind, TracingAlerter};
pub use crate::engine::Sentinel;
pub use crate::event::RawEvent;
pub use crate::executor::{PlatformClient, PlatformError};
pub use crate::snapshot::SnapshotVault;
pub use crate::storage::{MemoryStorage, Storage};
