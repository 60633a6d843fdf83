//! Outpost Gateway - command, request and live-view broker for remote devices
//!
//! Devices are never reachable directly. The gateway and the devices meet in
//! a shared JSON store: the gateway writes commands and requests into it, the
//! devices drain them and write answers and frames back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   HTTP API (axum)                    │
//! │  presence  │  commands  │  requests  │  live view   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                     Broker                           │
//! │  Dispatcher  │  Correlator  │  Frame Relay │ Presence│
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Shared Store                           │
//! │   in-process memory  │  Firebase Realtime Database  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod presence;
pub mod relay;
pub mod store;

pub use broker::Broker;
pub use config::Config;
pub use correlator::{Correlator, Reply, RequestId, RequestKind};
pub use dispatch::{CommandDispatcher, CommandId};
pub use error::{Error, Result};
pub use presence::{OnlineDevice, PresenceRegistry};
pub use relay::{CameraFacing, FrameRelay, RelayOptions, ViewerId, ViewerStream};
pub use store::{FirebaseStore, MemoryStore, SharedStore, SharedStoreRef, StorePath};
