//! Typed subscription configuration.

use crate::callback::CallbackRef;
use blim_device::{DeviceError, SubscribeOptions};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How notifications collapse into callback invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamMode {
    /// One callback per notification.
    #[default]
    EveryUpdate,
    /// All notifications of a window, in arrival order.
    Batched,
    /// The latest value per characteristic, at most once per window.
    Aggregated,
}

impl StreamMode {
    /// Parses a script-supplied mode name. Unknown names fall back to
    /// [`EveryUpdate`](Self::EveryUpdate).
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "Batched" => Self::Batched,
            "Aggregated" => Self::Aggregated,
            "EveryUpdate" => Self::EveryUpdate,
            other => {
                tracing::debug!(mode = other, "unknown stream mode, using EveryUpdate");
                Self::EveryUpdate
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EveryUpdate => "EveryUpdate",
            Self::Batched => "Batched",
            Self::Aggregated => "Aggregated",
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub selectors: Vec<SubscribeOptions>,
    pub mode: StreamMode,
    /// Minimum spacing between two callback invocations. Zero disables
    /// rate limiting.
    pub max_rate: Duration,
    pub callback: Option<CallbackRef>,
}

impl SubscriptionConfig {
    /// Checks the request before anything is registered.
    ///
    /// # Errors
    ///
    /// The first missing piece: callback, services, or characteristics of a
    /// service.
    pub fn validate(&self) -> Result<CallbackRef, DispatchError> {
        let callback = self.callback.ok_or(DispatchError::MissingCallback)?;
        if self.selectors.is_empty() {
            return Err(DispatchError::NoServices);
        }
        if let Some(empty) = self.selectors.iter().find(|s| s.characteristics.is_empty()) {
            return Err(DispatchError::NoCharacteristics(empty.service.clone()));
        }
        Ok(callback)
    }

    /// Every subscribed characteristic UUID, deduplicated, in selector order.
    #[must_use]
    pub fn characteristics(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for chr in self.selectors.iter().flat_map(|s| &s.characteristics) {
            if !out.contains(chr) {
                out.push(chr.clone());
            }
        }
        out
    }
}

/// Subscription failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no callback specified in Lua subscription")]
    MissingCallback,

    #[error("no services specified in Lua subscription")]
    NoServices,

    #[error("no characteristics specified for service {0}")]
    NoCharacteristics(String),

    #[error("no connection available")]
    NoConnection,

    #[error("{0}")]
    Device(#[from] DeviceError),

    #[error("runtime was reset before the subscription started")]
    Retired,

    #[error("failed to start subscription worker: {0}")]
    Spawn(#[source] std::io::Error),
}
