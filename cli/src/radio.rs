// Desktop radio bridge over btleplug
//
// An event pump turns adapter events into sightings while a scan is active.
// GATT operations run on spawned tasks and report completion as radio events,
// so the engine sees the same request/completion split as on mobile stacks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use proxima_core::sensor::GATT_SUCCESS;
use proxima_core::{
    Advertisement, PeerId, PeripheralHandle, RadioBridge, RadioError, RadioEvent, RadioLink,
    RadioState, ScanFilter, ServiceDescriptor,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generic GATT failure status, reported when a connection attempt fails
const GATT_ERROR: u8 = 0x85;

type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

pub struct BtleRadio {
    adapter: Adapter,
    link: RadioLink,
    peripherals: PeripheralMap,
    /// Active scan filter; `None` while not scanning
    filter: Arc<Mutex<Option<ScanFilter>>>,
}

impl BtleRadio {
    /// Open the first Bluetooth adapter and start the event pump
    pub async fn open(link: RadioLink) -> Result<Self> {
        let manager = Manager::new().await.context("Failed to open Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .context("No Bluetooth adapter found")?;

        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "Bluetooth adapter opened");
        }

        let radio = Self {
            adapter,
            link,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            filter: Arc::new(Mutex::new(None)),
        };
        radio.spawn_event_pump().await?;
        Ok(radio)
    }

    async fn spawn_event_pump(&self) -> Result<()> {
        let mut events = self
            .adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let adapter = self.adapter.clone();
        let link = self.link.clone();
        let peripherals = self.peripherals.clone();
        let filter = self.filter.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let delivered = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. }
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                        let active = filter.lock().clone();
                        match active {
                            Some(active) => {
                                sighting(&adapter, &id, &active, &peripherals, &link).await
                            }
                            None => true,
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => link.event(RadioEvent::Disconnected {
                        peer: PeerId::new(peripheral_key(&id)),
                        status: GATT_SUCCESS,
                    }),
                    _ => true,
                };
                if !delivered {
                    debug!("Sensor receiver gone, stopping event pump");
                    break;
                }
            }
        });
        Ok(())
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral, RadioError> {
        self.peripherals
            .lock()
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| RadioError::UnknownPeripheral(handle.to_string()))
    }

    fn characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, RadioError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| RadioError::Rejected(format!("characteristic {} not discovered", uuid)))
    }
}

/// Report one advertisement if it passes the filter; false once the receiver is gone
async fn sighting(
    adapter: &Adapter,
    id: &PeripheralId,
    filter: &ScanFilter,
    peripherals: &PeripheralMap,
    link: &RadioLink,
) -> bool {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return true;
    };
    let Ok(Some(properties)) = peripheral.properties().await else {
        return true;
    };

    let key = peripheral_key(id);
    let advertisement = advertisement(
        &key,
        properties.rssi,
        properties.services,
        properties.manufacturer_data,
    );
    if !filter.matches(&advertisement) {
        return true;
    }
    peripherals.lock().insert(key, peripheral);
    link.sighting(advertisement)
}

fn peripheral_key(id: &PeripheralId) -> String {
    format!("{:?}", id)
}

/// Build a sighting; the peripheral key doubles as the session-stable peer id
fn advertisement(
    key: &str,
    rssi: Option<i16>,
    services: Vec<Uuid>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
) -> Advertisement {
    let mut advertisement = Advertisement::new(PeerId::new(key), PeripheralHandle::new(key));
    advertisement.rssi = rssi;
    advertisement.services = services;
    advertisement.manufacturer_data = manufacturer_data;
    advertisement
}

fn rejected(e: btleplug::Error) -> RadioError {
    RadioError::Rejected(e.to_string())
}

#[async_trait]
impl RadioBridge for BtleRadio {
    /// btleplug exposes no power state; an opened adapter counts as powered on
    async fn state(&self) -> RadioState {
        RadioState::PoweredOn
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError> {
        *self.filter.lock() = Some(filter.clone());
        // Unfiltered at the adapter: background platform-A adverts carry no service id
        self.adapter
            .start_scan(BtleScanFilter::default())
            .await
            .map_err(rejected)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        *self.filter.lock() = None;
        self.adapter.stop_scan().await.map_err(rejected)
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let link = self.link.clone();
        let peer = PeerId::new(handle.as_str());

        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => link.event(RadioEvent::Connected { peer }),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Connect failed");
                    link.event(RadioEvent::Disconnected {
                        peer,
                        status: GATT_ERROR,
                    })
                }
            };
        });
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let link = self.link.clone();
        let peer = PeerId::new(handle.as_str());

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                // The link is unusable either way; report it closed
                debug!(peer = %peer, error = %e, "Disconnect failed");
                link.event(RadioEvent::Disconnected {
                    peer,
                    status: GATT_SUCCESS,
                });
            }
        });
        Ok(())
    }

    async fn close(&self, handle: &PeripheralHandle) {
        let Ok(peripheral) = self.peripheral(handle) else {
            return;
        };
        tokio::spawn(async move {
            let _ = peripheral.disconnect().await;
        });
    }

    async fn discover_services(&self, handle: &PeripheralHandle) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let link = self.link.clone();
        let peer = PeerId::new(handle.as_str());

        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral
                        .services()
                        .into_iter()
                        .map(|service| ServiceDescriptor {
                            uuid: service.uuid,
                            characteristics: service
                                .characteristics
                                .iter()
                                .map(|c| c.uuid)
                                .collect(),
                        })
                        .collect();
                    link.event(RadioEvent::ServicesDiscovered { peer, services });
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Service discovery failed");
                    let _ = peripheral.disconnect().await;
                    link.event(RadioEvent::Disconnected {
                        peer,
                        status: GATT_ERROR,
                    });
                }
            }
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let link = self.link.clone();
        let peer = PeerId::new(handle.as_str());

        tokio::spawn(async move {
            let event = match peripheral.read(&target).await {
                Ok(value) => RadioEvent::CharacteristicRead {
                    peer,
                    characteristic,
                    value: Some(value),
                    success: true,
                },
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Read failed");
                    RadioEvent::CharacteristicRead {
                        peer,
                        characteristic,
                        value: None,
                        success: false,
                    }
                }
            };
            link.event(event);
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        let link = self.link.clone();
        let peer = PeerId::new(handle.as_str());

        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await;
            if let Err(e) = &result {
                debug!(peer = %peer, error = %e, "Write failed");
            }
            link.event(RadioEvent::CharacteristicWritten {
                peer,
                characteristic,
                value,
                success: result.is_ok(),
            });
        });
        Ok(())
    }
}
