//! In-process fake of the RaSCSI engine.
//!
//! Binds an ephemeral TCP port on 127.0.0.1 and speaks the engine wire
//! protocol with an in-memory device table, reservation set and image list.
//! Every decoded command is recorded for inspection.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rascsi_control::proto::{
    PbCommand, PbDevice, PbDeviceDefinition, PbDeviceProperties, PbDeviceStatus, PbDeviceType,
    PbDeviceTypeProperties, PbDeviceTypesInfo, PbDevicesInfo, PbImageFile, PbImageFilesInfo,
    PbLogLevelInfo, PbMappingInfo, PbNetworkInterfacesInfo, PbOperation, PbReservedIdsInfo,
    PbResult, PbServerInfo, PbVersionInfo,
};
use rascsi_control::{decode_command, encode_result, read_frame, read_magic, write_frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

/// Version reported by the fake.
pub const FAKE_VERSION: (i32, i32, i32) = (22, 10, 1);

/// Default images directory reported by the fake.
pub const FAKE_IMAGES_DIR: &str = "/home/pi/images";

/// Vendor the fake assigns when an attach names none.
pub const FAKE_DEFAULT_VENDOR: &str = "RaSCSI";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "err", "critical", "off"];

#[derive(Debug)]
struct EngineState {
    devices: BTreeMap<(i32, i32), PbDevice>,
    reserved: BTreeSet<i32>,
    images_dir: String,
    images: BTreeMap<String, PbImageFile>,
    token: Option<String>,
    log_level: String,
    commands: Vec<PbCommand>,
}

/// Fake engine listening on an ephemeral port.
///
/// The listener task is aborted on drop.
#[derive(Debug)]
pub struct FakeEngine {
    addr: SocketAddr,
    state: Arc<Mutex<EngineState>>,
    task: JoinHandle<()>,
}

impl FakeEngine {
    /// Start with the default images directory.
    pub async fn start() -> Self {
        Self::start_with_images_dir(FAKE_IMAGES_DIR).await
    }

    /// Start with a specific images directory.
    pub async fn start_with_images_dir(images_dir: impl Into<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(EngineState {
            devices: BTreeMap::new(),
            reserved: BTreeSet::new(),
            images_dir: images_dir.into(),
            images: BTreeMap::new(),
            token: None,
            log_level: "info".to_string(),
            commands: Vec::new(),
        }));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, state).await {
                        debug!(error = %e, "fake engine connection ended");
                    }
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn images_dir(&self) -> String {
        self.state.lock().unwrap().images_dir.clone()
    }

    /// Require a token on every command.
    pub fn set_token(&self, token: Option<&str>) {
        self.state.lock().unwrap().token = token.map(str::to_string);
    }

    /// Register an image file in the engine's listing.
    pub fn add_image(&self, name: &str, size: u64) {
        let mut state = self.state.lock().unwrap();
        let image = PbImageFile {
            name: name.to_string(),
            r#type: type_for_file(name) as i32,
            size,
            read_only: false,
        };
        state.images.insert(name.to_string(), image);
    }

    /// Attach a device directly, bypassing the protocol.
    pub fn preload(&self, definition: PbDeviceDefinition) {
        let mut state = self.state.lock().unwrap();
        attach_one(&mut state, &definition).unwrap();
    }

    /// Reserve ids directly, bypassing the protocol.
    pub fn preload_reserved(&self, ids: &[i32]) {
        self.state.lock().unwrap().reserved.extend(ids.iter().copied());
    }

    pub fn devices(&self) -> Vec<PbDevice> {
        self.state.lock().unwrap().devices.values().cloned().collect()
    }

    pub fn device(&self, id: i32, unit: i32) -> Option<PbDevice> {
        self.state.lock().unwrap().devices.get(&(id, unit)).cloned()
    }

    pub fn reserved_ids(&self) -> Vec<i32> {
        self.state.lock().unwrap().reserved.iter().copied().collect()
    }

    pub fn log_level(&self) -> String {
        self.state.lock().unwrap().log_level.clone()
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<PbCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Operations received so far, in order.
    pub fn operations(&self) -> Vec<PbOperation> {
        self.commands()
            .iter()
            .map(|cmd| PbOperation::try_from(cmd.operation).unwrap_or(PbOperation::NoOperation))
            .collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<EngineState>>) -> rascsi_core::Result<()> {
    read_magic(&mut stream).await?;
    let payload = read_frame(&mut stream).await?;
    let cmd = decode_command(&payload)?;
    let result = {
        let mut state = state.lock().unwrap();
        state.commands.push(cmd.clone());
        handle(&mut state, &cmd)
    };
    let bytes = encode_result(&result)?;
    write_frame(&mut stream, &bytes).await
}

// ============================================================================
// Command handling
// ============================================================================

fn ok() -> PbResult {
    PbResult {
        status: true,
        ..Default::default()
    }
}

fn fail(msg: impl Into<String>) -> PbResult {
    PbResult {
        status: false,
        msg: msg.into(),
        ..Default::default()
    }
}

fn handle(state: &mut EngineState, cmd: &PbCommand) -> PbResult {
    let operation = PbOperation::try_from(cmd.operation).unwrap_or(PbOperation::NoOperation);
    let presented = cmd.params.get("token").map(String::as_str);

    if operation == PbOperation::CheckAuthentication {
        let valid = state.token.is_none() || presented == state.token.as_deref();
        return if valid {
            ok()
        } else {
            fail("Authentication failed")
        };
    }
    if let Some(token) = &state.token {
        if presented != Some(token.as_str()) {
            return fail("Authentication failed");
        }
    }

    match operation {
        PbOperation::NoOperation | PbOperation::ShutDown => ok(),
        PbOperation::ServerInfo => PbResult {
            server_info: Some(server_info(state)),
            ..ok()
        },
        PbOperation::VersionInfo => PbResult {
            version_info: Some(version_info()),
            ..ok()
        },
        PbOperation::LogLevelInfo => PbResult {
            log_level_info: Some(log_level_info(state)),
            ..ok()
        },
        PbOperation::NetworkInterfacesInfo => PbResult {
            network_interfaces_info: Some(PbNetworkInterfacesInfo {
                name: vec!["eth0".into(), "wlan0".into()],
            }),
            ..ok()
        },
        PbOperation::MappingInfo => PbResult {
            mapping_info: Some(mapping_info()),
            ..ok()
        },
        PbOperation::DeviceTypesInfo => PbResult {
            device_types_info: Some(device_types_info()),
            ..ok()
        },
        PbOperation::DefaultImageFilesInfo => PbResult {
            image_files_info: Some(image_files_info(state)),
            ..ok()
        },
        PbOperation::ReservedIdsInfo => PbResult {
            reserved_ids_info: Some(PbReservedIdsInfo {
                ids: state.reserved.iter().copied().collect(),
            }),
            ..ok()
        },
        PbOperation::DevicesInfo => devices_info(state, cmd),
        PbOperation::ImageFileInfo => {
            let file = cmd.params.get("file").cloned().unwrap_or_default();
            match state.images.get(&file) {
                Some(image) => PbResult {
                    image_file_info: Some(image.clone()),
                    ..ok()
                },
                None => fail(format!("Image file '{}' does not exist", file)),
            }
        }
        PbOperation::Attach => each_device(state, cmd, attach_one),
        PbOperation::Insert => each_device(state, cmd, insert_one),
        PbOperation::Detach => each_device(state, cmd, detach_one),
        PbOperation::Eject => each_device(state, cmd, eject_one),
        PbOperation::Protect => each_device(state, cmd, |s, d| set_flag(s, d, Flag::Protected(true))),
        PbOperation::Unprotect => {
            each_device(state, cmd, |s, d| set_flag(s, d, Flag::Protected(false)))
        }
        PbOperation::Start => each_device(state, cmd, |s, d| set_flag(s, d, Flag::Stopped(false))),
        PbOperation::Stop => each_device(state, cmd, |s, d| set_flag(s, d, Flag::Stopped(true))),
        PbOperation::DetachAll => {
            state.devices.clear();
            ok()
        }
        PbOperation::ReserveIds => reserve_ids(state, cmd),
        PbOperation::LogLevel => {
            let level = cmd.params.get("level").cloned().unwrap_or_default();
            if LOG_LEVELS.contains(&level.as_str()) {
                state.log_level = level;
                ok()
            } else {
                fail(format!("Invalid log level '{}'", level))
            }
        }
        PbOperation::DefaultFolder => {
            match cmd.params.get("folder").filter(|f| !f.is_empty()) {
                Some(folder) => {
                    state.images_dir = folder.clone();
                    ok()
                }
                None => fail("Missing default folder name"),
            }
        }
        PbOperation::CreateImage => {
            let file = cmd.params.get("file").cloned().unwrap_or_default();
            let size = cmd
                .params
                .get("size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if file.is_empty() || size == 0 {
                return fail("Missing image file name or size");
            }
            if state.images.contains_key(&file) {
                return fail(format!("Image file '{}' already exists", file));
            }
            state.images.insert(
                file.clone(),
                PbImageFile {
                    r#type: type_for_file(&file) as i32,
                    name: file,
                    size,
                    read_only: cmd.params.get("read_only").is_some_and(|v| v == "true"),
                },
            );
            ok()
        }
        PbOperation::DeleteImage => {
            let file = cmd.params.get("file").cloned().unwrap_or_default();
            match state.images.remove(&file) {
                Some(_) => ok(),
                None => fail(format!("Image file '{}' does not exist", file)),
            }
        }
        PbOperation::RenameImage | PbOperation::CopyImage => {
            let from = cmd.params.get("from").cloned().unwrap_or_default();
            let to = cmd.params.get("to").cloned().unwrap_or_default();
            let Some(image) = state.images.get(&from).cloned() else {
                return fail(format!("Image file '{}' does not exist", from));
            };
            if state.images.contains_key(&to) {
                return fail(format!("Image file '{}' already exists", to));
            }
            if operation == PbOperation::RenameImage {
                state.images.remove(&from);
            }
            state.images.insert(
                to.clone(),
                PbImageFile {
                    name: to,
                    ..image
                },
            );
            ok()
        }
        PbOperation::ProtectImage | PbOperation::UnprotectImage => {
            let file = cmd.params.get("file").cloned().unwrap_or_default();
            match state.images.get_mut(&file) {
                Some(image) => {
                    image.read_only = operation == PbOperation::ProtectImage;
                    ok()
                }
                None => fail(format!("Image file '{}' does not exist", file)),
            }
        }
        PbOperation::CheckAuthentication => ok(),
    }
}

fn each_device(
    state: &mut EngineState,
    cmd: &PbCommand,
    mut op: impl FnMut(&mut EngineState, &PbDeviceDefinition) -> Result<(), String>,
) -> PbResult {
    if cmd.devices.is_empty() {
        return fail("Missing device information");
    }
    for definition in &cmd.devices {
        if let Err(msg) = op(state, definition) {
            return fail(msg);
        }
    }
    ok()
}

fn attach_one(state: &mut EngineState, def: &PbDeviceDefinition) -> Result<(), String> {
    if !(0..8).contains(&def.id) {
        return Err(format!("Invalid device ID {} (0-7)", def.id));
    }
    if state.reserved.contains(&def.id) {
        return Err(format!("Device ID {} is reserved", def.id));
    }
    if state.devices.contains_key(&(def.id, def.unit)) {
        return Err(format!("Duplicate ID {}, unit {}", def.id, def.unit));
    }

    let file = def.params.get("file").cloned().unwrap_or_default();
    let device_type = match PbDeviceType::try_from(def.r#type) {
        Ok(PbDeviceType::Undefined) | Err(_) => type_for_file(&file),
        Ok(t) => t,
    };
    if device_type == PbDeviceType::Undefined {
        return Err(format!("Missing device type for '{}'", file));
    }

    let properties = properties_for(device_type);
    if properties.supports_file && !properties.removable && file.is_empty() {
        return Err("Missing filename".to_string());
    }

    let block_size = if def.block_size > 0 {
        def.block_size
    } else {
        default_block_size(device_type)
    };
    let image = (!file.is_empty()).then(|| image_file(state, &file, device_type));
    let block_count = image
        .as_ref()
        .map(|f| f.size / block_size.max(1) as u64)
        .unwrap_or(0);

    let mut params = def.params.clone();
    params.remove("file");

    let device = PbDevice {
        id: def.id,
        unit: def.unit,
        r#type: device_type as i32,
        status: Some(PbDeviceStatus {
            removed: properties.removable && file.is_empty(),
            ..Default::default()
        }),
        properties: Some(properties),
        file: image,
        params,
        vendor: non_empty_or(&def.vendor, FAKE_DEFAULT_VENDOR),
        product: non_empty_or(&def.product, default_product(device_type)),
        revision: non_empty_or(&def.revision, "2210"),
        block_size,
        block_count,
    };
    state.devices.insert((def.id, def.unit), device);
    Ok(())
}

fn insert_one(state: &mut EngineState, def: &PbDeviceDefinition) -> Result<(), String> {
    let file = def.params.get("file").cloned().unwrap_or_default();
    if file.is_empty() {
        return Err("Missing filename".to_string());
    }
    let images_dir = state.images_dir.clone();
    let known = state.images.get(&file).map(|f| f.size);
    let device = state
        .devices
        .get_mut(&(def.id, def.unit))
        .ok_or_else(|| format!("No device for ID {}, unit {}", def.id, def.unit))?;
    let removable = device.properties.as_ref().is_some_and(|p| p.removable);
    let removed = device.status.as_ref().is_some_and(|s| s.removed);
    if !removable {
        return Err(format!("Device ID {} is not removable", def.id));
    }
    if !removed {
        return Err(format!("Device ID {} already has media", def.id));
    }
    let size = known.unwrap_or(0);
    device.file = Some(PbImageFile {
        name: format!("{}/{}", images_dir, file),
        r#type: device.r#type,
        size,
        read_only: false,
    });
    device.block_count = size / device.block_size.max(1) as u64;
    if let Some(status) = device.status.as_mut() {
        status.removed = false;
    }
    Ok(())
}

fn detach_one(state: &mut EngineState, def: &PbDeviceDefinition) -> Result<(), String> {
    state
        .devices
        .remove(&(def.id, def.unit))
        .map(|_| ())
        .ok_or_else(|| format!("No device for ID {}, unit {}", def.id, def.unit))
}

fn eject_one(state: &mut EngineState, def: &PbDeviceDefinition) -> Result<(), String> {
    let device = state
        .devices
        .get_mut(&(def.id, def.unit))
        .ok_or_else(|| format!("No device for ID {}, unit {}", def.id, def.unit))?;
    if !device.properties.as_ref().is_some_and(|p| p.removable) {
        return Err(format!("Device ID {} is not removable", def.id));
    }
    device.file = None;
    device.block_count = 0;
    if let Some(status) = device.status.as_mut() {
        status.removed = true;
    }
    Ok(())
}

enum Flag {
    Protected(bool),
    Stopped(bool),
}

fn set_flag(state: &mut EngineState, def: &PbDeviceDefinition, flag: Flag) -> Result<(), String> {
    let device = state
        .devices
        .get_mut(&(def.id, def.unit))
        .ok_or_else(|| format!("No device for ID {}, unit {}", def.id, def.unit))?;
    let props = device.properties.clone().unwrap_or_default();
    let status = device.status.get_or_insert_with(Default::default);
    match flag {
        Flag::Protected(value) => {
            if !props.protectable {
                return Err(format!("Device ID {} is not protectable", def.id));
            }
            status.protected = value;
        }
        Flag::Stopped(value) => {
            if !props.stoppable {
                return Err(format!("Device ID {} is not stoppable", def.id));
            }
            status.stopped = value;
        }
    }
    Ok(())
}

fn reserve_ids(state: &mut EngineState, cmd: &PbCommand) -> PbResult {
    let raw = cmd.params.get("ids").cloned().unwrap_or_default();
    let mut ids = BTreeSet::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        match part.trim().parse::<i32>() {
            Ok(id) if (0..8).contains(&id) => {
                if state.devices.keys().any(|(dev_id, _)| *dev_id == id) {
                    return fail(format!("ID {} is currently in use", id));
                }
                ids.insert(id);
            }
            _ => return fail(format!("Invalid ID '{}'", part)),
        }
    }
    state.reserved = ids;
    ok()
}

fn devices_info(state: &EngineState, cmd: &PbCommand) -> PbResult {
    if cmd.devices.is_empty() {
        return PbResult {
            devices_info: Some(PbDevicesInfo {
                devices: state.devices.values().cloned().collect(),
            }),
            ..ok()
        };
    }
    let mut devices = Vec::new();
    for def in &cmd.devices {
        match state.devices.get(&(def.id, def.unit)) {
            Some(device) => devices.push(device.clone()),
            None => return fail(format!("No device for ID {}, unit {}", def.id, def.unit)),
        }
    }
    PbResult {
        devices_info: Some(PbDevicesInfo { devices }),
        ..ok()
    }
}

// ============================================================================
// Static tables
// ============================================================================

fn version_info() -> PbVersionInfo {
    PbVersionInfo {
        major_version: FAKE_VERSION.0,
        minor_version: FAKE_VERSION.1,
        patch_version: FAKE_VERSION.2,
    }
}

fn log_level_info(state: &EngineState) -> PbLogLevelInfo {
    PbLogLevelInfo {
        log_levels: LOG_LEVELS.iter().map(|l| l.to_string()).collect(),
        current_log_level: state.log_level.clone(),
    }
}

const SUFFIX_MAP: &[(&str, PbDeviceType)] = &[
    ("hd1", PbDeviceType::Sahd),
    ("hda", PbDeviceType::Schd),
    ("hds", PbDeviceType::Schd),
    ("hdi", PbDeviceType::Schd),
    ("nhd", PbDeviceType::Schd),
    ("hdn", PbDeviceType::Schd),
    ("hdr", PbDeviceType::Scrm),
    ("mos", PbDeviceType::Scmo),
    ("iso", PbDeviceType::Sccd),
];

fn type_for_file(file: &str) -> PbDeviceType {
    let suffix = file.rsplit_once('.').map(|(_, s)| s.to_ascii_lowercase());
    SUFFIX_MAP
        .iter()
        .find(|(s, _)| suffix.as_deref() == Some(*s))
        .map(|(_, t)| *t)
        .unwrap_or(PbDeviceType::Undefined)
}

fn mapping_info() -> PbMappingInfo {
    PbMappingInfo {
        mapping: SUFFIX_MAP
            .iter()
            .map(|(s, t)| (s.to_string(), *t as i32))
            .collect(),
    }
}

const ALL_TYPES: &[PbDeviceType] = &[
    PbDeviceType::Sahd,
    PbDeviceType::Schd,
    PbDeviceType::Scrm,
    PbDeviceType::Scmo,
    PbDeviceType::Sccd,
    PbDeviceType::Scbr,
    PbDeviceType::Scdp,
    PbDeviceType::Schs,
    PbDeviceType::Sclp,
];

fn properties_for(device_type: PbDeviceType) -> PbDeviceProperties {
    use PbDeviceType::*;

    let disk = matches!(device_type, Sahd | Schd | Scrm | Scmo | Sccd);
    let removable = matches!(device_type, Scrm | Scmo | Sccd);
    let mut default_params = BTreeMap::new();
    match device_type {
        Scbr | Scdp => {
            default_params.insert("interface".to_string(), "eth0,wlan0".to_string());
            default_params.insert("inet".to_string(), "10.10.20.1/24".to_string());
        }
        Sclp => {
            default_params.insert("cmd".to_string(), "lp -oraw %f".to_string());
        }
        _ => {}
    }
    let block_sizes = match device_type {
        Sahd => vec![256, 1024],
        Schd | Scrm => vec![512, 1024, 2048, 4096],
        Scmo => vec![512, 1024, 2048, 4096],
        _ => Vec::new(),
    };

    PbDeviceProperties {
        read_only: device_type == Sccd,
        protectable: disk && device_type != Sccd,
        stoppable: disk,
        removable,
        lockable: removable,
        supports_file: disk,
        supports_params: !default_params.is_empty(),
        default_params,
        luns: 32,
        block_sizes,
    }
}

fn device_types_info() -> PbDeviceTypesInfo {
    PbDeviceTypesInfo {
        properties: ALL_TYPES
            .iter()
            .map(|t| PbDeviceTypeProperties {
                r#type: *t as i32,
                properties: Some(properties_for(*t)),
            })
            .collect(),
    }
}

fn default_block_size(device_type: PbDeviceType) -> i32 {
    match device_type {
        PbDeviceType::Sahd => 256,
        PbDeviceType::Sccd => 2048,
        PbDeviceType::Schd | PbDeviceType::Scrm | PbDeviceType::Scmo => 512,
        _ => 0,
    }
}

fn default_product(device_type: PbDeviceType) -> &'static str {
    match device_type {
        PbDeviceType::Sahd => "SASI HD",
        PbDeviceType::Schd => "SCSI HD",
        PbDeviceType::Scrm => "SCSI HD (REM.)",
        PbDeviceType::Scmo => "SCSI MO",
        PbDeviceType::Sccd => "SCSI CD-ROM",
        PbDeviceType::Scbr => "SCSI HOST BRIDGE",
        PbDeviceType::Scdp => "SCSI/Link",
        PbDeviceType::Schs => "Host Services",
        PbDeviceType::Sclp => "SCSI PRINTER",
        PbDeviceType::Undefined => "",
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn image_file(state: &EngineState, file: &str, device_type: PbDeviceType) -> PbImageFile {
    let size = state.images.get(file).map(|f| f.size).unwrap_or(0);
    let name = if file.starts_with('/') {
        file.to_string()
    } else {
        format!("{}/{}", state.images_dir, file)
    };
    PbImageFile {
        name,
        r#type: device_type as i32,
        size,
        read_only: false,
    }
}

fn image_files_info(state: &EngineState) -> PbImageFilesInfo {
    PbImageFilesInfo {
        default_image_folder: state.images_dir.clone(),
        image_files: state.images.values().cloned().collect(),
        depth: 1,
    }
}

fn server_info(state: &EngineState) -> PbServerInfo {
    PbServerInfo {
        version_info: Some(version_info()),
        log_level_info: Some(log_level_info(state)),
        device_types_info: Some(device_types_info()),
        image_files_info: Some(image_files_info(state)),
        network_interfaces_info: Some(PbNetworkInterfacesInfo {
            name: vec!["eth0".into(), "wlan0".into()],
        }),
        mapping_info: Some(mapping_info()),
        reserved_ids_info: Some(PbReservedIdsInfo {
            ids: state.reserved.iter().copied().collect(),
        }),
        devices_info: Some(PbDevicesInfo {
            devices: state.devices.values().cloned().collect(),
        }),
    }
}
