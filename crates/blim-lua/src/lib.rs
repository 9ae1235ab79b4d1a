//! Sandboxed Lua scripting for BLE devices.
//!
//! Scripts drive a connected peripheral through the `blim` table: read and
//! write characteristics, subscribe to notifications, sleep while
//! notifications keep arriving, and print output the host captures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ScriptEngine                                                 │
//! │  Mutex<Runtime> ── the only way in: run_exclusive()          │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Lua (sandboxed)                                        │  │
//! │  │  print / io.write ──▶ OutputPipe                       │  │
//! │  │  blim.sleep, c:read(), c:write() ──▶ yield to driver   │  │
//! │  │  blim.subscribe{...} ──▶ CallbackTable (arena)         │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────▲───────────────────────────────┘
//!                                │ run_exclusive (per callback)
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │ SubscriptionDispatcher: one worker per subscription          │
//! │  queue ─▶ Accumulator (EveryUpdate | Batched | Aggregated)   │
//! └──────────────────────────────▲───────────────────────────────┘
//!                                │ NotificationSink
//!                         blim_device::Connection
//! ```
//!
//! # Example Lua Script
//!
//! ```lua
//! local hr = blim.characteristic("180d", "2a37")
//! print("flags", hr.properties.notify ~= nil)
//!
//! local id = blim.subscribe{
//!     services = { { service = "180d", chars = { "2a37" } } },
//!     Mode = "Aggregated",
//!     MaxRate = 1000,
//!     Callback = function(record)
//!         local bpm = record.Values["2a37"]:byte(2)
//!         print(record.Seq, bpm)
//!     end,
//! }
//!
//! blim.sleep(10000)
//! blim.unsubscribe(id)
//! ```
//!
//! # Faults
//!
//! Every host function is wrapped by [`guard_host_fn`] and every host call
//! into a script callback by [`contain`]: a panic on either side of the
//! boundary becomes a runtime [`ScriptError`] instead of unwinding through
//! the Lua VM.

mod api;
mod barrier;
mod callback;
mod context;
pub mod dispatch;
mod engine;
mod error;
mod executor;
mod json;
mod sandbox;
mod suspend;
mod types;

pub use api::{install_core, BleApi, API_ALIAS, API_GLOBAL};
pub use barrier::{contain, guard_host_fn, recover_stack};
pub use callback::{CallbackRef, CallbackTable};
pub use context::ExecContext;
pub use dispatch::{
    StreamFlags, StreamMode, StreamRecord, SubscriptionConfig, SubscriptionDispatcher,
    SubscriptionId, SubscriptionStats,
};
pub use engine::{EngineHandle, Runtime, RuntimeExtension, ScriptEngine, DEFAULT_CHUNK_NAME};
pub use error::{ErrorKind, HostPanic, Interrupted, ScriptError};
pub use executor::ScriptExecutor;
pub use sandbox::PRELOADED_MODULES;
pub use types::{json_to_lua, lua_to_json};
