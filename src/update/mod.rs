//! Self-update layer
//!
//! Checks a remote manifest for a newer release, asks for consent, stops
//! other running instances, downloads the artifact and hands off to the
//! installer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Manifest   │────▶│Orchestrator │────▶│  Installer  │
//! │  (fetch)    │     │(state mach.)│     │  (handoff)  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │              │         │
//!        ▼              ▼         ▼
//! ┌─────────────┐ ┌──────────┐ ┌──────────┐
//! │   Version   │ │ Process  │ │ Download │
//! │  (compare)  │ │ (peers)  │ │ (stream) │
//! └─────────────┘ └──────────┘ └──────────┘
//! ```
//!
//! # Modules
//!
//! - [`version`]: Strict `major.minor.patch` parsing and comparison
//! - [`manifest`]: Manifest types, formats and the `ManifestSource` trait
//! - [`fetcher`]: HTTP implementation of `ManifestSource`
//! - [`process`]: Peer instance enumeration and termination
//! - [`download`]: Streaming download with throttled progress
//! - [`installer`]: Installer launch and replace-and-relaunch handoff
//! - [`orchestrator`]: The update session state machine
//! - [`error`]: Error taxonomy

pub mod download;
pub mod error;
pub mod fetcher;
pub mod installer;
pub mod manifest;
pub mod orchestrator;
pub mod process;
pub mod version;

pub use error::UpdateError;
pub use orchestrator::{
    ConsentProvider, SessionOutcome, UpdateEvent, UpdateOrchestrator, UpdateState,
};
