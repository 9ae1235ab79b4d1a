//! Device and connection interfaces consumed by the blim scripting bridge.
//!
//! The BLE transport itself (scanning, GATT discovery, MTU handling) lives
//! outside this workspace. This crate only describes the boundary the
//! scripting layer talks to:
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │  blim-lua                │        │  BLE transport           │
//! │  (script API, dispatch)  │──────▶ │  impl Device             │
//! │                          │        │  impl Connection         │
//! │  NotificationSink  ◀─────┼────────│  (own notification       │
//! │                          │        │   thread)                │
//! └──────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! [`testing::MemoryPeripheral`] is an in-memory implementation used by the
//! test suites of the other crates.

mod connection;
mod error;
pub mod testing;
mod types;
mod uuid;

pub use connection::{Connection, Device, NotificationSink, RegistrationId};
pub use error::DeviceError;
pub use types::{
    CharacteristicInfo, DescriptorInfo, DeviceInfo, Notification, Properties, ServiceInfo,
    SubscribeOptions,
};
pub use uuid::{normalize_uuid, normalize_uuids};
