//! Multi-connection FTP/FTPS bulk-transfer client engine.
//!
//! A caller builds an [`config::OperationConfig`], constructs a
//! [`coordinator::OperationCoordinator`] around it and a shared
//! [`cache::ListingCache`], seeds the queue with one or more top-level
//! [`queue::Item`]s, then calls [`coordinator::OperationCoordinator::spawn`]
//! to start the worker pool. There is no CLI or GUI surface here — this
//! crate is the engine a host application drives, the same role
//! `sorng-ftp::ftp::service::FtpService` played for a single Tauri-embedded
//! session, generalized to a multi-worker bulk operation.

pub mod cache;
pub mod compress;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod disk;
pub mod error;
pub mod explored;
pub mod parser;
pub mod path;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod tls;
pub mod transfer;
pub mod worker;

pub use cache::{CacheKey, CachePolicy, ListingCache};
pub use config::{DataChannelMode, OperationConfig, TlsPolicy, TransferMode};
pub use coordinator::{OperationCoordinator, SpeedMeter};
pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use parser::custom::{CustomServerType, StrFormatError};
pub use queue::{ForceAction, Item, ItemKind, ItemState, OperationOutcome, OperationQueue, ProblemCode, QueueCounters};
pub use worker::{Worker, WorkerEvent, WorkerHandle, WorkerState};
