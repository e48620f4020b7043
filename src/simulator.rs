//! Simulator: the supervising construct that owns configuration,
//! persistence, the Forwarder, and every device/gateway task, and that
//! answers operator-console and fleet-provisioning traffic by mutating the
//! fleet and (re)spawning tasks.
//!
//! Grounded on `original_source/simulator/components/device/device.go`'s
//! `Run` loop shape (select over a timer/exit-channel pair) generalized to
//! a fleet-wide `tokio::select!` over console commands, provisioning
//! events, and the process shutdown signal; the per-device/per-gateway
//! drain barrier gives every task a chance to unregister before exit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::Config;
use crate::console::{CommandEnvelope, ConsoleCommand, ConsoleResponse};
use crate::device::{Device, DeviceCommand, DeviceConfig, Identity};
use crate::error::StatusCode;
use crate::forwarder::{Forwarder, Location};
use crate::gateway::{Gateway, GatewayConfig};
use crate::lorawan::keys::{AppKey, DevEui};
use crate::mac::{Cid, MacCommand};
use crate::payload::SampleLoader;
use crate::persistence::{DeviceRecord, GatewayRecord, Persistence, SaveRequest};
use crate::provisioning::{DeviceCategory, ProvisioningEvent};
use crate::region::Region;

struct RunningDevice {
    record: DeviceRecord,
    commands: mpsc::Sender<DeviceCommand>,
    shutdown: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

struct RunningGateway {
    record: GatewayRecord,
    shutdown: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Simulator {
    config: Config,
    forwarder: Forwarder,
    persistence: Persistence,
    samples: SampleLoader,
    devices: HashMap<String, RunningDevice>,
    gateways: HashMap<String, RunningGateway>,
    bridge_addr: Option<SocketAddr>,
}

impl Simulator {
    pub fn new(config: Config) -> Self {
        let dir = PathBuf::from(&config.config_dirname);
        let persistence = Persistence::spawn(dir.clone());
        let samples = SampleLoader::new(config.data_path_s.clone(), config.data_path_l.clone());
        Self {
            config,
            forwarder: Forwarder::new(),
            persistence,
            samples,
            devices: HashMap::new(),
            gateways: HashMap::new(),
            bridge_addr: None,
        }
    }

    /// Loads persisted fleet state, spawns its tasks, then runs the
    /// console/provisioning/shutdown loop until `process_shutdown` fires.
    pub async fn run(mut self, console_addr: SocketAddr, mut process_shutdown: broadcast::Receiver<()>) {
        let dir = PathBuf::from(&self.config.config_dirname);
        if let Ok(Some(record)) = crate::persistence::load_simulator(&dir) {
            self.bridge_addr = record.bridge_address.and_then(|s| s.parse().ok());
        }
        for record in crate::persistence::load_devices(&dir).unwrap_or_default() {
            if record.active {
                self.spawn_device(record);
            } else {
                self.devices.insert(record.dev_eui.clone(), dormant_device(record));
            }
        }
        for record in crate::persistence::load_gateways(&dir).unwrap_or_default() {
            if record.active {
                self.spawn_gateway(record);
            } else {
                self.gateways.insert(record.mac.clone(), dormant_gateway(record));
            }
        }

        let (console_tx, mut console_rx) = mpsc::channel::<CommandEnvelope>(32);
        let (provisioning_tx, mut provisioning_rx) = mpsc::channel::<ProvisioningEvent>(8);

        let console_shutdown_tx = broadcast::Sender::<()>::new(1);
        let console_task_shutdown = console_shutdown_tx.subscribe();
        let console_server = tokio::spawn(crate::console::run_console(console_addr, console_tx, console_task_shutdown));

        let provisioning_shutdown_tx = broadcast::Sender::<()>::new(1);
        let provisioning_task = if !self.config.c2server_ws.is_empty() {
            let url = self.config.c2server_ws.clone();
            let rx = provisioning_shutdown_tx.subscribe();
            let tx = provisioning_tx.clone();
            Some(tokio::spawn(async move { crate::provisioning::run_client(&url, tx, rx).await }))
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = process_shutdown.recv() => {
                    info!("simulator received shutdown signal");
                    break;
                }
                Some((cmd, reply)) = console_rx.recv() => {
                    let response = self.handle_console_command(cmd).await;
                    let _ = reply.send(response);
                }
                Some(event) = provisioning_rx.recv() => {
                    self.handle_provisioning_event(event).await;
                }
            }
        }

        let _ = console_shutdown_tx.send(());
        let _ = console_server.await;
        let _ = provisioning_shutdown_tx.send(());
        if let Some(task) = provisioning_task {
            let _ = task.await;
        }

        for (_, dev) in self.devices.drain() {
            let _ = dev.shutdown.send(());
            let _ = dev.handle.await;
        }
        for (_, gw) in self.gateways.drain() {
            let _ = gw.shutdown.send(());
            let _ = gw.handle.await;
        }
        info!("simulator drained all tasks, exiting");
    }

    fn spawn_device(&mut self, record: DeviceRecord) {
        let Ok(dev_eui) = DevEui::from_hex(&record.dev_eui) else {
            warn!(name = %record.name, "device record has malformed DevEUI, skipping spawn");
            return;
        };
        let app_eui = DevEui::from_hex(&record.app_eui).unwrap_or(DevEui([0; 8]));
        let Ok(app_key) = AppKey::from_hex(&record.app_key) else {
            warn!(name = %record.name, "device record has malformed AppKey, skipping spawn");
            return;
        };
        let region = Region::try_from(record.region).unwrap_or(Region::Eu868);
        let identity = Identity { dev_eui, app_eui, app_key };
        let config = DeviceConfig {
            region,
            send_interval: std::time::Duration::from_secs(record.send_interval_secs),
            ack_timeout: std::time::Duration::from_secs(record.ack_timeout_secs),
            range_m: record.range_m,
            disable_fcnt_down: record.disable_fcnt_down,
            supported_otaa: record.supported_otaa,
            supported_adr: record.supported_adr,
            supported_class_b: record.supported_class_b,
            supported_class_c: record.supported_class_c,
            supported_fragment: record.supported_fragment,
            data_rate: record.data_rate,
            rx1_dr_offset: record.rx1_dr_offset,
            nb_retransmission: record.nb_retransmission,
            rx_delay: std::time::Duration::from_secs(record.rx_delay_secs),
            rx_duration_open: std::time::Duration::from_millis(record.rx_duration_open_ms),
            confirmed_uplinks: record.confirmed_uplinks,
        };
        let location = Location { lat: record.lat, lon: record.lon, alt: record.alt };
        let (device, commands) = Device::new(identity, config, location, self.forwarder.clone());
        let provider = self.samples.provider_for(record.name.clone(), String::new(), 0);
        let device = device.with_payload_source(provider);

        let shutdown = broadcast::Sender::<()>::new(1);
        let rx = shutdown.subscribe();
        let handle = tokio::spawn(device.run(rx));
        self.devices.insert(record.dev_eui.clone(), RunningDevice { record, commands, shutdown, handle });
    }

    fn spawn_gateway(&mut self, record: GatewayRecord) {
        let Ok(mac) = parse_mac(&record.mac) else {
            warn!(name = %record.name, "gateway record has malformed MAC, skipping spawn");
            return;
        };
        let bridge_addr = match (&record.ip, record.port) {
            (Some(ip), Some(port)) => format!("{ip}:{port}").parse().ok(),
            _ => self.bridge_addr,
        };
        let config = GatewayConfig {
            mac,
            name: record.name.clone(),
            location: Location { lat: record.lat, lon: record.lon, alt: record.alt },
            bridge_addr,
            keep_alive: std::time::Duration::from_secs(record.keep_alive_secs),
        };
        let gateway = Gateway::new(config, self.forwarder.clone());
        let shutdown = broadcast::Sender::<()>::new(1);
        let rx = shutdown.subscribe();
        let handle = tokio::spawn(gateway.run(rx));
        self.gateways.insert(record.mac.clone(), RunningGateway { record, shutdown, handle });
    }

    async fn persist_devices(&self) {
        let records: Vec<_> = self.devices.values().map(|d| d.record.clone()).collect();
        self.persistence.save(SaveRequest::Devices(records)).await;
    }

    async fn persist_gateways(&self) {
        let records: Vec<_> = self.gateways.values().map(|g| g.record.clone()).collect();
        self.persistence.save(SaveRequest::Gateways(records)).await;
    }

    async fn persist_simulator(&self) {
        self.persistence
            .save(SaveRequest::Simulator(crate::persistence::SimulatorRecord {
                bridge_address: self.bridge_addr.map(|a| a.to_string()),
            }))
            .await;
    }

    async fn handle_provisioning_event(&mut self, event: ProvisioningEvent) {
        match event {
            ProvisioningEvent::Aborted { reason } => {
                warn!(reason, "provisioning session aborted");
            }
            ProvisioningEvent::Completed { devices, profiles } => {
                let profile_by_id: HashMap<_, _> = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
                let mut registered = 0usize;
                for bonded in devices {
                    match bonded.category() {
                        DeviceCategory::Unsupported(kind) => {
                            warn!(kind, name = %bonded.name, "unsupported provisioned device type, skipping");
                            continue;
                        }
                        DeviceCategory::Gateway => {
                            let record = GatewayRecord {
                                mac: bonded.code.clone(),
                                name: bonded.name.clone(),
                                active: true,
                                lat: 0.0,
                                lon: 0.0,
                                alt: 0.0,
                                ip: None,
                                port: None,
                                keep_alive_secs: 30,
                            };
                            self.spawn_gateway(record);
                            registered += 1;
                        }
                        DeviceCategory::Device => {
                            let profile = profile_by_id.get(&bonded.profile_id);
                            let region = profile.map(|p| region_from_name(&p.device_region)).unwrap_or(Region::Eu868);
                            let record = DeviceRecord {
                                dev_eui: bonded.code.clone(),
                                app_eui: bonded.code.clone(),
                                app_key: bonded.key.clone(),
                                name: bonded.name.clone(),
                                region: region as u8,
                                active: true,
                                lat: 0.0,
                                lon: 0.0,
                                alt: 0.0,
                                send_interval_secs: self.config.send_interval,
                                ack_timeout_secs: self.config.ack_timeout,
                                range_m: 2000.0,
                                disable_fcnt_down: false,
                                supported_otaa: profile.map(|p| p.device_support_otaa).unwrap_or(true),
                                supported_adr: true,
                                supported_class_b: profile.map(|p| p.device_support_class_b).unwrap_or(false),
                                supported_class_c: profile.map(|p| p.device_support_class_c).unwrap_or(false),
                                supported_fragment: false,
                                data_rate: self.config.data_rate,
                                rx1_dr_offset: 0,
                                nb_retransmission: 3,
                                rx_delay_secs: self.config.rx_delay,
                                rx_duration_open_ms: self.config.rx_duration_open,
                                confirmed_uplinks: false,
                            };
                            self.spawn_device(record);
                            registered += 1;
                        }
                    }
                }
                info!(registered, "provisioning session registered devices/gateways");
                self.persist_devices().await;
                self.persist_gateways().await;
            }
        }
    }

    async fn handle_console_command(&mut self, cmd: ConsoleCommand) -> ConsoleResponse {
        match cmd {
            ConsoleCommand::GetBridgeAddress => match self.bridge_addr {
                Some(addr) => ConsoleResponse::ok_with_data("", addr.to_string()),
                None => ConsoleResponse::err(StatusCode::NoBridge, "", "no bridge address configured"),
            },
            ConsoleCommand::SetBridgeAddress { address } => match address.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.bridge_addr = Some(addr);
                    self.persist_simulator().await;
                    ConsoleResponse::ok(address)
                }
                Err(e) => ConsoleResponse::err(StatusCode::ErrorAddress, address, e.to_string()),
            },
            ConsoleCommand::AddGateway { gateway } => {
                if self.gateways.contains_key(&gateway.mac) {
                    return ConsoleResponse::err(StatusCode::ErrorDuplicate, gateway.mac, "gateway already registered");
                }
                let id = gateway.mac.clone();
                if gateway.active {
                    self.spawn_gateway(gateway);
                } else {
                    self.gateways.insert(id.clone(), dormant_gateway(gateway));
                }
                self.persist_gateways().await;
                ConsoleResponse::ok(id)
            }
            ConsoleCommand::UpdateGateway { gateway } => {
                let id = gateway.mac.clone();
                self.remove_gateway(&id).await;
                if gateway.active {
                    self.spawn_gateway(gateway);
                } else {
                    self.gateways.insert(id.clone(), dormant_gateway(gateway));
                }
                self.persist_gateways().await;
                ConsoleResponse::ok(id)
            }
            ConsoleCommand::DeleteGateway { mac } => {
                self.remove_gateway(&mac).await;
                self.persist_gateways().await;
                ConsoleResponse::ok(mac)
            }
            ConsoleCommand::AddDevice { device } => {
                if self.devices.contains_key(&device.dev_eui) {
                    return ConsoleResponse::err(StatusCode::ErrorDuplicate, device.dev_eui, "device already registered");
                }
                let id = device.dev_eui.clone();
                if device.active {
                    self.spawn_device(device);
                } else {
                    self.devices.insert(id.clone(), dormant_device(device));
                }
                self.persist_devices().await;
                ConsoleResponse::ok(id)
            }
            ConsoleCommand::UpdateDevice { device } => {
                let id = device.dev_eui.clone();
                self.remove_device(&id).await;
                if device.active {
                    self.spawn_device(device);
                } else {
                    self.devices.insert(id.clone(), dormant_device(device));
                }
                self.persist_devices().await;
                ConsoleResponse::ok(id)
            }
            ConsoleCommand::DeleteDevice { dev_eui } => {
                self.remove_device(&dev_eui).await;
                self.persist_devices().await;
                ConsoleResponse::ok(dev_eui)
            }
            ConsoleCommand::ToggleDevice { dev_eui, active } => self.toggle_device(dev_eui, active).await,
            ConsoleCommand::ToggleGateway { mac, active } => self.toggle_gateway(mac, active).await,
            ConsoleCommand::SendMacCommand { dev_eui, cid, payload } => match Cid::try_from(cid) {
                Ok(cid) => match self.devices.get(&dev_eui) {
                    Some(dev) => {
                        let _ = dev.commands.send(DeviceCommand::SendMacCommand(MacCommand { cid, payload })).await;
                        ConsoleResponse::ok(dev_eui)
                    }
                    None => ConsoleResponse::err(StatusCode::ErrorNotFound, dev_eui, "unknown device"),
                },
                Err(e) => ConsoleResponse::err(StatusCode::ErrorValidation, dev_eui, e.to_string()),
            },
            ConsoleCommand::ChangePayload { dev_eui, device_type, data_type, axis } => match self.devices.get(&dev_eui) {
                Some(dev) => {
                    let provider = self.samples.provider_for(device_type, data_type, axis);
                    let _ = dev.commands.send(DeviceCommand::ChangePayload(provider)).await;
                    ConsoleResponse::ok(dev_eui)
                }
                None => ConsoleResponse::err(StatusCode::ErrorNotFound, dev_eui, "unknown device"),
            },
            ConsoleCommand::SendUplinkNow { dev_eui } => match self.devices.get(&dev_eui) {
                Some(dev) => {
                    let _ = dev.commands.send(DeviceCommand::SendUplinkNow).await;
                    ConsoleResponse::ok(dev_eui)
                }
                None => ConsoleResponse::err(StatusCode::ErrorNotFound, dev_eui, "unknown device"),
            },
            ConsoleCommand::ChangeLocation { dev_eui, lat, lon, alt } => match self.devices.get_mut(&dev_eui) {
                Some(dev) => {
                    dev.record.lat = lat;
                    dev.record.lon = lon;
                    dev.record.alt = alt;
                    let _ = dev.commands.send(DeviceCommand::ChangeLocation(Location { lat, lon, alt })).await;
                    ConsoleResponse::ok(dev_eui)
                }
                None => ConsoleResponse::err(StatusCode::ErrorNotFound, dev_eui, "unknown device"),
            },
        }
    }

    async fn remove_device(&mut self, dev_eui: &str) {
        if let Some(dev) = self.devices.remove(dev_eui) {
            let _ = dev.shutdown.send(());
            let _ = dev.handle.await;
        }
    }

    async fn remove_gateway(&mut self, mac: &str) {
        if let Some(gw) = self.gateways.remove(mac) {
            let _ = gw.shutdown.send(());
            let _ = gw.handle.await;
        }
    }

    async fn toggle_device(&mut self, dev_eui: String, active: bool) -> ConsoleResponse {
        let Some(dev) = self.devices.remove(&dev_eui) else {
            return ConsoleResponse::err(StatusCode::ErrorNotFound, dev_eui, "unknown device");
        };
        let mut record = dev.record;
        record.active = active;
        if active {
            self.spawn_device(record);
        } else {
            let _ = dev.shutdown.send(());
            let _ = dev.handle.await;
            self.devices.insert(record.dev_eui.clone(), dormant_device(record));
        }
        self.persist_devices().await;
        ConsoleResponse::ok(dev_eui)
    }

    async fn toggle_gateway(&mut self, mac: String, active: bool) -> ConsoleResponse {
        let Some(gw) = self.gateways.remove(&mac) else {
            return ConsoleResponse::err(StatusCode::ErrorGatewayActive, mac, "unknown gateway");
        };
        let mut record = gw.record;
        record.active = active;
        if active {
            self.spawn_gateway(record);
        } else {
            let _ = gw.shutdown.send(());
            let _ = gw.handle.await;
            self.gateways.insert(record.mac.clone(), dormant_gateway(record));
        }
        self.persist_gateways().await;
        ConsoleResponse::ok(mac)
    }
}

/// Registers a device record without spawning a task, used for
/// `active: false` records loaded at startup or toggled off at runtime.
/// Its channels are never polled; `commands`/`shutdown` exist purely so the
/// bookkeeping struct's shape doesn't need an `Option`.
fn dormant_device(record: DeviceRecord) -> RunningDevice {
    let (commands, _rx) = mpsc::channel(1);
    let shutdown = broadcast::Sender::<()>::new(1);
    RunningDevice { record, commands, shutdown, handle: tokio::spawn(async {}) }
}

fn dormant_gateway(record: GatewayRecord) -> RunningGateway {
    let shutdown = broadcast::Sender::<()>::new(1);
    RunningGateway { record, shutdown, handle: tokio::spawn(async {}) }
}

fn parse_mac(s: &str) -> anyhow::Result<[u8; 8]> {
    let bytes = hex::decode(s.replace(':', ""))?;
    if bytes.len() != 8 {
        anyhow::bail!("gateway MAC must be 8 bytes, got {}", bytes.len());
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Maps a provisioning profile's free-text `deviceRegion` onto a `Region`.
/// Unrecognized names fall back to EU868 rather than rejecting the whole
/// device, since region is the one field the catalog sends as a name
/// instead of an ID.
fn region_from_name(name: &str) -> Region {
    match name.to_ascii_uppercase().as_str() {
        "EU868" => Region::Eu868,
        "US915" => Region::Us915,
        "CN779" => Region::Cn779,
        "EU433" => Region::Eu433,
        "AU915" => Region::Au915,
        "CN470" => Region::Cn470,
        "AS923" => Region::As923,
        "KR920" => Region::Kr920,
        "IN865" => Region::In865,
        "RU864" => Region::Ru864,
        _ => Region::Eu868,
    }
}
