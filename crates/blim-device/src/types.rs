//! Value types exchanged with the device collaborator.

use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// GATT characteristic property bits, in their on-air bit order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Properties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl Properties {
    /// Script-facing key and display name for every defined bit, in bit order.
    pub const NAMED: [(Properties, &'static str, &'static str); 8] = [
        (Properties::BROADCAST, "broadcast", "Broadcast"),
        (Properties::READ, "read", "Read"),
        (
            Properties::WRITE_WITHOUT_RESPONSE,
            "write_without_response",
            "Write Without Response",
        ),
        (Properties::WRITE, "write", "Write"),
        (Properties::NOTIFY, "notify", "Notify"),
        (Properties::INDICATE, "indicate", "Indicate"),
        (
            Properties::AUTHENTICATED_SIGNED_WRITES,
            "authenticated_signed_writes",
            "Authenticated Signed Writes",
        ),
        (
            Properties::EXTENDED_PROPERTIES,
            "extended_properties",
            "Extended Properties",
        ),
    ];

    /// Returns `true` if the characteristic can push values (notify or indicate).
    #[must_use]
    pub fn can_notify(self) -> bool {
        self.intersects(Properties::NOTIFY | Properties::INDICATE)
    }
}

/// Advertisement and identity data of a peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub address: String,
    pub name: String,
    pub rssi: i32,
    pub connectable: bool,
    pub tx_power: Option<i32>,
    pub advertised_services: Vec<String>,
    pub manufacturer_data: Vec<u8>,
    pub service_data: BTreeMap<String, Vec<u8>>,
}

/// A GATT descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub uuid: String,
    pub handle: u16,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// A GATT characteristic as discovered on the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Normalized characteristic UUID.
    pub uuid: String,
    /// Normalized UUID of the owning service.
    pub service: String,
    /// Well-known name, if the UUID is a registered one.
    pub name: Option<String>,
    pub properties: Properties,
    pub descriptors: Vec<DescriptorInfo>,
    /// A value parser is registered for this characteristic type.
    pub has_parser: bool,
    pub requires_authentication: bool,
}

impl CharacteristicInfo {
    /// Creates a characteristic with no name, descriptors or parser.
    pub fn new(service: &str, uuid: &str, properties: Properties) -> Self {
        Self {
            uuid: crate::normalize_uuid(uuid),
            service: crate::normalize_uuid(service),
            name: None,
            properties,
            descriptors: Vec::new(),
            has_parser: false,
            requires_authentication: false,
        }
    }

    /// Sets the well-known name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends a descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: DescriptorInfo) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Marks the characteristic as requiring pairing.
    #[must_use]
    pub fn with_authentication(mut self) -> Self {
        self.requires_authentication = true;
        self
    }
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: String,
    pub name: Option<String>,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// One entry of a subscription request: a service and the characteristics to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub service: String,
    pub characteristics: Vec<String>,
}

impl SubscribeOptions {
    /// Creates options with normalized UUIDs.
    pub fn new<S: AsRef<str>>(service: &str, characteristics: &[S]) -> Self {
        Self {
            service: crate::normalize_uuid(service),
            characteristics: crate::normalize_uuids(characteristics),
        }
    }
}

/// A value pushed by the peripheral for a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub service: String,
    pub characteristic: String,
    pub data: Vec<u8>,
    /// Arrival time in microseconds since the Unix epoch.
    pub ts_us: i64,
}

impl Notification {
    /// Creates a notification stamped with the current time.
    pub fn now(service: &str, characteristic: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            service: crate::normalize_uuid(service),
            characteristic: crate::normalize_uuid(characteristic),
            data: data.into(),
            ts_us: chrono::Utc::now().timestamp_micros(),
        }
    }
}
