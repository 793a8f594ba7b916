//! Schedule Core - offline-first sync and consistency engine for scheduling data.
//!
//! This library provides the core functionality shared by every device and
//! the authoritative server:
//! - Data models (Record, Book, Event, Note, ScheduleDrawing)
//! - Local store with change tracking (SQLite)
//! - Sync protocol (client, authoritative service and HTTP server)
//! - Conflict detection and resolution
//! - Cooperative note edit locks
//! - Per-record note resolution and legacy note migration
//! - Cache eviction for notes and drawings
//! - Configuration management
//!
//! # Feature Flags
//!
//! - `server`: Include the HTTP server (axum). Not needed for mobile clients.
//! - `desktop`: Include desktop-specific features (hostname detection, config dir detection).

pub mod batch;
pub mod cache;
pub mod change_tracker;
pub mod config;
pub mod conflicts;
pub mod database;
pub mod error;
pub mod locks;
pub mod models;
pub mod normalize;
pub mod resolver;
pub mod sync_client;
#[cfg(feature = "server")]
pub mod sync_server;
pub mod sync_service;
pub mod validation;

/// Number of leading id characters shown in log lines
pub const ID_SHORT_LEN: usize = 8;

// Re-export commonly used types
pub use cache::CacheManager;
pub use change_tracker::ChangeTracker;
pub use config::Config;
pub use conflicts::{ConflictManager, ConflictPolicy, ConflictResolver};
pub use database::Database;
pub use error::{ScheduleError, ScheduleResult, ValidationError};
pub use locks::{LockCoordinator, NoteLocks};
pub use models::{Book, DeviceSession, Event, Note, Record, ScheduleDrawing, SyncChange, ViewMode};
pub use resolver::NoteResolver;
pub use sync_client::{HttpTransport, InProcessTransport, SyncClient, SyncResult, SyncTransport};
pub use sync_service::SyncService;
