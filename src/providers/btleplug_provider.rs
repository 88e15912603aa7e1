use std::sync::Mutex;
use std::time::Duration;

use futures::stream::StreamExt;
use log::{debug, warn};
use uuid::Uuid;

// Import traits as _ to avoid name clashes with the identically named structs
use btleplug::api::{Manager as _, Central as _, Peripheral as _, ScanFilter, CharPropFlags,
    WriteType, Characteristic as BtleplugCharacteristic};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::task::JoinHandle;

use crate::bridge::lock;
use crate::device::{GattDevice, GattEvent, GattStatus, LinkState};
use crate::errors::{Error, ErrorKind};
use crate::events::EventSink;

impl From<btleplug::Error> for Error {
    fn from(error: btleplug::Error) -> Self {
        Self::new(ErrorKind::Device, &format!("Error during bluetooth communication: {error}"))
    }
}

async fn get_device_by_name(adapter: &Adapter, name: &str) -> Result<Option<Peripheral>, Error> {
    for p in adapter.peripherals().await? {
        if let Some(props) = p.properties().await? {
            if props.local_name == Some(name.into()) {
                return Ok(Some(p));
            }
        }
    }
    Ok(None)
}

fn status_of(error: &btleplug::Error, denied: GattStatus) -> GattStatus {
    match error {
        btleplug::Error::PermissionDenied => denied,
        _ => GattStatus::FAILURE,
    }
}

/// The struct implementing the central [`GattDevice`](crate::GattDevice) trait.
///
/// btleplug operations complete asynchronously, so every trigger spawns a task which reports
/// the outcome through the [`EventSink`] handed over on connect.
pub struct BtleplugDevice {
    device: Peripheral,
    events: Mutex<Option<EventSink>>,
    notifications: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugDevice {
    /// Wrap a peripheral found through btleplug
    pub fn new(device: Peripheral) -> Self {
        Self {
            device,
            events: Mutex::new(None),
            notifications: Mutex::new(None),
        }
    }

    fn sink(&self) -> Result<EventSink, Error> {
        lock(&self.events).clone()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "connect() has not been called"))
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<BtleplugCharacteristic, Error> {
        self.device.services()
            .into_iter()
            .find(|s| s.uuid == service)
            .and_then(|s| s.characteristics.into_iter().find(|c| c.uuid == characteristic))
            .ok_or_else(|| Error::new(ErrorKind::CharacteristicNotFound,
                &format!("characteristic({characteristic}) not found on service({service})")))
    }

    async fn forward_notifications(&self, events: EventSink) -> Result<(), Error> {
        if lock(&self.notifications).as_ref().map_or(false, |task| !task.is_finished()) {
            return Ok(());
        }
        // https://github.com/deviceplug/btleplug/blob/master/examples/subscribe_notify_characteristic.rs
        let mut stream = self.device.notifications().await?;
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                events.send(GattEvent::CharacteristicChanged {
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });
        if let Some(previous) = lock(&self.notifications).replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl GattDevice for BtleplugDevice {
    async fn find_by_name(name: &str) -> Result<Self, Error> where Self: Sized {
        let manager = Manager::new().await?;
        let adapter = manager.adapters()
            .await?
            .into_iter()
            .next().ok_or_else(|| Error::new(ErrorKind::Device, "No bluetooth adapter available"))?;
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let device = get_device_by_name(&adapter, name).await?
            .ok_or_else(|| Error::new(ErrorKind::Device, &format!("No device found with name {name}")))?;
        Ok(Self::new(device))
    }

    async fn connect(&self, events: EventSink) -> Result<(), Error> {
        *lock(&self.events) = Some(events.clone());
        let device = self.device.clone();
        tokio::spawn(async move {
            let (status, state) = match device.connect().await {
                Ok(()) => (GattStatus::SUCCESS, LinkState::Connected),
                Err(error) => {
                    warn!("Unable to connect: {error}");
                    (GattStatus::FAILURE, LinkState::Disconnected)
                }
            };
            events.send(GattEvent::ConnectionStateChanged {status, state});
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.device.disconnect().await?;
        if let Some(events) = lock(&self.events).clone() {
            events.send(GattEvent::ConnectionStateChanged {status: GattStatus::SUCCESS, state: LinkState::Disconnected});
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        lock(&self.events).take();
        if let Some(task) = lock(&self.notifications).take() {
            task.abort();
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), Error> {
        let events = self.sink()?;
        let device = self.device.clone();
        tokio::spawn(async move {
            let status = match device.discover_services().await {
                Ok(()) => GattStatus::SUCCESS,
                Err(error) => {
                    warn!("Unable to discover services: {error}");
                    GattStatus::FAILURE
                }
            };
            events.send(GattEvent::ServicesDiscovered {status});
        });
        Ok(())
    }

    async fn set_notification(&self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<(), Error> {
        let target = self.characteristic(service, characteristic)?;
        if !target.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
            debug!("characteristic({characteristic}) does not support notifications");
            return Ok(());
        }
        if enable {
            // The stream has to exist before subscribing or the first value could be missed
            self.forward_notifications(self.sink()?).await?;
            self.device.subscribe(&target).await?;
        } else {
            self.device.unsubscribe(&target).await?;
        }
        Ok(())
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), Error> {
        let target = self.characteristic(service, characteristic)?;
        let events = self.sink()?;
        let device = self.device.clone();
        tokio::spawn(async move {
            let (status, value) = match device.read(&target).await {
                Ok(value) => (GattStatus::SUCCESS, Some(value)),
                Err(error) => {
                    warn!("Unable to read {characteristic}: {error}");
                    (status_of(&error, GattStatus::READ_NOT_PERMITTED), None)
                }
            };
            events.send(GattEvent::CharacteristicRead {status, characteristic, value});
        });
        Ok(())
    }

    async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), Error> {
        let target = self.characteristic(service, characteristic)?;
        let events = self.sink()?;
        let device = self.device.clone();
        let value = value.to_vec();
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        tokio::spawn(async move {
            let status = match device.write(&target, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(error) => {
                    warn!("Unable to write {characteristic}: {error}");
                    status_of(&error, GattStatus::WRITE_NOT_PERMITTED)
                }
            };
            events.send(GattEvent::CharacteristicWrite {status, characteristic, value: Some(value)});
        });
        Ok(())
    }

    fn has_service(&self, service: Uuid) -> bool {
        self.device.services().iter().any(|s| s.uuid == service)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.characteristic(service, characteristic).is_ok()
    }
}
