//! Runtime plumbing for the blim scripting bridge.
//!
//! # Output capture
//!
//! ```text
//!  script print / io.write          background worker           test / UI
//! ┌──────────────────────┐     ┌──────────────────────┐     ┌──────────────┐
//! │ ScriptEngine         │────▶│ OutputPipe           │────▶│ Collector    │
//! │ (OutputRecord)       │     │ bounded, drop oldest │     │ ring buffer  │
//! └──────────────────────┘     └──────────────────────┘     └──────────────┘
//!                                         │
//!                                         └──────────▶ OutputDrainer → io::Write
//! ```
//!
//! Producers never block: a full [`OutputPipe`](output::OutputPipe) evicts its
//! oldest record. The [`OutputCollector`](output::OutputCollector) runs one
//! worker thread with a three-state lifecycle and exposes a pull-based
//! consumer protocol. The [`OutputDrainer`](output::OutputDrainer) streams
//! records to writers for command-line style execution.
//!
//! # Configuration
//!
//! [`config::ConfigLoader`] merges defaults, global and project TOML files and
//! `BLIM_*` environment variables into a [`config::BridgeConfig`].

pub mod config;
pub mod output;
