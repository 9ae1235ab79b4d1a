//! Collaborator traits.

use crate::{
    CharacteristicInfo, DeviceError, DeviceInfo, Notification, ServiceInfo, SubscribeOptions,
};
use std::sync::Arc;
use std::time::Duration;

/// Identifies one registration made through [`Connection::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// Receives notifications for a registration.
///
/// Called on a thread owned by the device collaborator. Implementations must
/// return quickly and must not block on the scripting runtime.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// An open GATT connection.
///
/// All UUID arguments may be given in any spelling; implementations compare
/// normalized forms.
pub trait Connection: Send + Sync {
    /// Returns `true` while the link is up.
    fn is_connected(&self) -> bool;

    /// Discovered services in discovery order.
    fn services(&self) -> Vec<ServiceInfo>;

    /// Looks up one characteristic.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] if the service or characteristic is unknown.
    fn characteristic(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicInfo, DeviceError>;

    /// Reads a characteristic value.
    fn read(
        &self,
        service: &str,
        characteristic: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Writes a characteristic value.
    fn write(
        &self,
        service: &str,
        characteristic: &str,
        data: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<(), DeviceError>;

    /// Decodes a raw value with the characteristic's registered parser.
    ///
    /// Returns `Ok(None)` when the parser rejects the value.
    fn parse(
        &self,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<Option<serde_json::Value>, DeviceError>;

    /// Registers `sink` for value changes of every selected characteristic.
    ///
    /// # Errors
    ///
    /// Fails without registering anything if the device is not connected, a
    /// selector names an unknown service or characteristic, or a characteristic
    /// supports neither notify nor indicate.
    fn subscribe(
        &self,
        selectors: &[SubscribeOptions],
        sink: Arc<dyn NotificationSink>,
    ) -> Result<RegistrationId, DeviceError>;

    /// Releases a registration. Unknown ids are ignored.
    fn unsubscribe(&self, registration: RegistrationId);
}

/// A discovered peripheral.
pub trait Device: Send + Sync {
    /// Identity and advertisement snapshot.
    fn info(&self) -> DeviceInfo;

    /// The active connection, if any.
    fn connection(&self) -> Option<Arc<dyn Connection>>;
}
