//! In-memory peripheral for tests.
//!
//! [`MemoryPeripheral`] implements both [`Device`] and [`Connection`] over a
//! GATT table held in memory. Tests populate services, script read results,
//! inspect writes and push notifications with [`MemoryPeripheral::notify`].
//!
//! # Example
//!
//! ```
//! use blim_device::testing::MemoryPeripheral;
//! use blim_device::{CharacteristicInfo, Connection, Properties};
//! use std::time::Duration;
//!
//! let peripheral = MemoryPeripheral::new("heart-rate");
//! peripheral.add_service("180d", Some("Heart Rate"));
//! peripheral.add_characteristic(CharacteristicInfo::new(
//!     "180d",
//!     "2a37",
//!     Properties::READ | Properties::NOTIFY,
//! ));
//! peripheral.set_read_value("180d", "2a37", vec![0x00, 0x48]);
//!
//! let value = peripheral
//!     .read("180d", "2a37", Duration::from_secs(1))
//!     .expect("read");
//! assert_eq!(value, vec![0x00, 0x48]);
//! ```

use crate::{
    normalize_uuid, CharacteristicInfo, Connection, Device, DeviceError, DeviceInfo,
    Notification, NotificationSink, RegistrationId, ServiceInfo, SubscribeOptions,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

type CharKey = (String, String);
type Parser = Arc<dyn Fn(&[u8]) -> Option<serde_json::Value> + Send + Sync>;

fn key(service: &str, characteristic: &str) -> CharKey {
    (normalize_uuid(service), normalize_uuid(characteristic))
}

/// A write observed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub service: String,
    pub characteristic: String,
    pub data: Vec<u8>,
    pub with_response: bool,
}

struct Registration {
    targets: Vec<CharKey>,
    sink: Arc<dyn NotificationSink>,
}

#[derive(Default)]
struct GattState {
    connected: bool,
    services: Vec<ServiceInfo>,
    reads: HashMap<CharKey, Result<Vec<u8>, DeviceError>>,
    write_errors: HashMap<CharKey, DeviceError>,
    writes: Vec<WriteRecord>,
    parsers: HashMap<CharKey, Parser>,
    registrations: HashMap<RegistrationId, Registration>,
}

impl GattState {
    fn find(&self, service: &str, characteristic: &str) -> Result<&CharacteristicInfo, DeviceError> {
        let (svc, chr) = key(service, characteristic);
        let found = self
            .services
            .iter()
            .find(|s| s.uuid == svc)
            .ok_or_else(|| DeviceError::service_not_found(svc.clone()))?;
        found
            .characteristics
            .iter()
            .find(|c| c.uuid == chr)
            .ok_or_else(|| DeviceError::characteristic_not_found(chr))
    }
}

/// In-memory [`Device`] + [`Connection`].
pub struct MemoryPeripheral {
    this: Weak<MemoryPeripheral>,
    info: Mutex<DeviceInfo>,
    state: Mutex<GattState>,
    next_registration: AtomicU64,
}

impl MemoryPeripheral {
    /// Creates a connected peripheral with no services.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            info: Mutex::new(DeviceInfo {
                id: format!("mem-{name}"),
                address: "00:00:00:00:00:00".into(),
                name: name.into(),
                rssi: -60,
                connectable: true,
                ..DeviceInfo::default()
            }),
            state: Mutex::new(GattState {
                connected: true,
                ..GattState::default()
            }),
            next_registration: AtomicU64::new(1),
        })
    }

    /// Replaces the advertisement snapshot.
    pub fn set_info(&self, info: DeviceInfo) {
        *self.info.lock() = info;
    }

    /// Marks the link up or down.
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Adds an empty service.
    pub fn add_service(&self, uuid: &str, name: Option<&str>) {
        self.state.lock().services.push(ServiceInfo {
            uuid: normalize_uuid(uuid),
            name: name.map(str::to_string),
            characteristics: Vec::new(),
        });
    }

    /// Adds a characteristic to its service, creating the service if needed.
    pub fn add_characteristic(&self, characteristic: CharacteristicInfo) {
        let mut state = self.state.lock();
        let service = match state
            .services
            .iter()
            .position(|s| s.uuid == characteristic.service)
        {
            Some(idx) => &mut state.services[idx],
            None => {
                state.services.push(ServiceInfo {
                    uuid: characteristic.service.clone(),
                    name: None,
                    characteristics: Vec::new(),
                });
                let last = state.services.len() - 1;
                &mut state.services[last]
            }
        };
        service.characteristics.push(characteristic);
    }

    /// Sets the value returned by subsequent reads.
    pub fn set_read_value(&self, service: &str, characteristic: &str, value: Vec<u8>) {
        self.state
            .lock()
            .reads
            .insert(key(service, characteristic), Ok(value));
    }

    /// Makes subsequent reads fail with `error`.
    pub fn fail_reads(&self, service: &str, characteristic: &str, error: DeviceError) {
        self.state
            .lock()
            .reads
            .insert(key(service, characteristic), Err(error));
    }

    /// Makes subsequent writes fail with `error`.
    pub fn fail_writes(&self, service: &str, characteristic: &str, error: DeviceError) {
        self.state
            .lock()
            .write_errors
            .insert(key(service, characteristic), error);
    }

    /// Registers a value parser and flags the characteristic as parseable.
    pub fn register_parser<F>(&self, service: &str, characteristic: &str, parser: F)
    where
        F: Fn(&[u8]) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        let k = key(service, characteristic);
        let mut state = self.state.lock();
        for svc in state.services.iter_mut().filter(|s| s.uuid == k.0) {
            for chr in svc.characteristics.iter_mut().filter(|c| c.uuid == k.1) {
                chr.has_parser = true;
            }
        }
        state.parsers.insert(k, Arc::new(parser));
    }

    /// Writes observed so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    /// Pushes a notification to every registration following the characteristic.
    ///
    /// Sinks are called on the caller's thread, after the internal lock is
    /// released. Returns the number of sinks notified.
    pub fn notify(&self, service: &str, characteristic: &str, data: &[u8]) -> usize {
        let target = key(service, characteristic);
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let state = self.state.lock();
            state
                .registrations
                .values()
                .filter(|r| r.targets.contains(&target))
                .map(|r| Arc::clone(&r.sink))
                .collect()
        };
        for sink in &sinks {
            sink.notify(Notification::now(&target.0, &target.1, data.to_vec()));
        }
        sinks.len()
    }
}

impl Device for MemoryPeripheral {
    fn info(&self) -> DeviceInfo {
        self.info.lock().clone()
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        let this = self.this.upgrade()?;
        Some(this as Arc<dyn Connection>)
    }
}

impl Connection for MemoryPeripheral {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.state.lock().services.clone()
    }

    fn characteristic(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicInfo, DeviceError> {
        self.state.lock().find(service, characteristic).cloned()
    }

    fn read(
        &self,
        service: &str,
        characteristic: &str,
        _timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        let chr = state.find(service, characteristic)?;
        if !chr.properties.contains(crate::Properties::READ) {
            return Err(DeviceError::Unsupported(format!("read on {}", chr.uuid)));
        }
        state
            .reads
            .get(&key(service, characteristic))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn write(
        &self,
        service: &str,
        characteristic: &str,
        data: &[u8],
        with_response: bool,
        _timeout: Duration,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        let chr = state.find(service, characteristic)?;
        let wanted = if with_response {
            crate::Properties::WRITE
        } else {
            crate::Properties::WRITE_WITHOUT_RESPONSE
        };
        if !chr.properties.contains(wanted) {
            return Err(DeviceError::Unsupported(format!("write on {}", chr.uuid)));
        }
        let k = key(service, characteristic);
        if let Some(err) = state.write_errors.get(&k) {
            return Err(err.clone());
        }
        state.writes.push(WriteRecord {
            service: k.0,
            characteristic: k.1,
            data: data.to_vec(),
            with_response,
        });
        Ok(())
    }

    fn parse(
        &self,
        service: &str,
        characteristic: &str,
        value: &[u8],
    ) -> Result<Option<serde_json::Value>, DeviceError> {
        let parser = {
            let state = self.state.lock();
            state.find(service, characteristic)?;
            state.parsers.get(&key(service, characteristic)).cloned()
        };
        match parser {
            Some(parse) => Ok(parse(value)),
            None => Err(DeviceError::Unsupported(format!(
                "parsing {}",
                normalize_uuid(characteristic)
            ))),
        }
    }

    fn subscribe(
        &self,
        selectors: &[SubscribeOptions],
        sink: Arc<dyn NotificationSink>,
    ) -> Result<RegistrationId, DeviceError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }

        let mut targets = Vec::new();
        for selector in selectors {
            let svc = normalize_uuid(&selector.service);
            if !state.services.iter().any(|s| s.uuid == svc) {
                return Err(DeviceError::service_not_found(svc));
            }
            for chr in &selector.characteristics {
                let info = state.find(&svc, chr)?;
                if !info.properties.can_notify() {
                    return Err(DeviceError::NotNotifiable(info.uuid.clone()));
                }
                targets.push(key(&svc, chr));
            }
        }

        let id = RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed));
        debug!(registration = %id, targets = targets.len(), "registered notification sink");
        state
            .registrations
            .insert(id, Registration { targets, sink });
        Ok(id)
    }

    fn unsubscribe(&self, registration: RegistrationId) {
        if self.state.lock().registrations.remove(&registration).is_some() {
            debug!(registration = %registration, "released notification sink");
        }
    }
}
