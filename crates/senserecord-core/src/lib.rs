//! SenseRecord Core Library
//!
//! Core types and services for recording biosensor streams into BIDS-style
//! source data. This crate is independent of any control surface; the CLI
//! and HTTP server in `senserecord-cli` drive it through
//! [`SessionController`].
//!
//! # Modules
//!
//! - [`identifiers`] - Validated subject/session/task/run labels
//! - [`naming`] - BIDS path layout for data and metadata files
//! - [`catalog`] - Supported boards and their channel layouts
//! - [`board`] - Hardware capability traits and the CSV sample sink
//! - [`synthetic`] - Software board for tests and demos
//! - [`metadata`] - JSON sidecar and channel table
//! - [`session`] - Per-board recording state machine
//! - [`registry`] - Process-wide table of board sessions
//! - [`controller`] - Start/stop/status operations
//! - [`config`] - YAML configuration
//! - [`events`] - Event sink trait for decoupling from front ends
//! - [`error`] - Error types

pub mod board;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod identifiers;
pub mod metadata;
pub mod naming;
pub mod registry;
pub mod session;
pub mod synthetic;

// Re-export commonly used types
pub use board::{
    Board, BoardDescriptor, BoardDriver, BoardIdentity, BoardIdentityPolicy, ConflictPolicy,
    ConnectionParams, DriverRegistry,
};
pub use catalog::{BoardInfo, BoardKind};
pub use config::{AppConfig, RequestDefaults};
pub use controller::{RecordingHandle, SessionController, StartParams, StartRequest};
pub use error::{RecordError, Result};
pub use events::EventSink;
pub use identifiers::{IdentifierInput, SessionIdentifiers};
pub use naming::{compute_target, RecordingTarget};
pub use registry::SessionRegistry;
pub use session::{BoardSession, BoardSessionState, BoardStatus};
