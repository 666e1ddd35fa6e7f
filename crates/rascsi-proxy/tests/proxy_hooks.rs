//! Proxy forwarding and hook ordering against the fake engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rascsi_control::proto::{PbDeviceType, PbOperation, PbResult};
use rascsi_control::{CommandBuilder, SocketTransport, decode_result, encode_command};
use rascsi_core::{Error, Result};
use rascsi_proxy::{DeviceEvent, Hook, Plugin, PluginRegistry, ProxyServer};
use rascsi_test_utils::{FakeEngine, device_definition};

#[derive(Debug, Clone)]
struct Recorded {
    hook: Hook,
    event: DeviceEvent,
    /// Operations the engine had seen when the hook ran.
    upstream_ops: Vec<PbOperation>,
}

struct Recorder {
    engine: Arc<FakeEngine>,
    log: Arc<Mutex<Vec<Recorded>>>,
    fail: bool,
}

impl Recorder {
    fn record(&self, hook: Hook, event: &DeviceEvent) -> Result<()> {
        self.log.lock().unwrap().push(Recorded {
            hook,
            event: event.clone(),
            upstream_ops: self.engine.operations(),
        });
        if self.fail {
            return Err(Error::invalid_argument("hook refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn attach_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.record(Hook::Attach, event)
    }

    async fn insert_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.record(Hook::Insert, event)
    }

    async fn detach_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.record(Hook::Detach, event)
    }

    async fn eject_hook(&self, event: &DeviceEvent) -> Result<()> {
        self.record(Hook::Eject, event)
    }
}

struct Harness {
    engine: Arc<FakeEngine>,
    log: Arc<Mutex<Vec<Recorded>>>,
    proxy: SocketTransport,
}

impl Harness {
    async fn start(fail_hooks: bool) -> Self {
        let engine = Arc::new(FakeEngine::start_with_images_dir("/img").await);
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins = PluginRegistry::new().with_plugin(Recorder {
            engine: Arc::clone(&engine),
            log: Arc::clone(&log),
            fail: fail_hooks,
        });
        let upstream = SocketTransport::new("127.0.0.1", engine.port()).with_retries(0);
        let proxy_addr = spawn_proxy(upstream, plugins).await;

        Self {
            engine,
            log,
            proxy: SocketTransport::new("127.0.0.1", proxy_addr.port()).with_retries(0),
        }
    }

    async fn send(&self, builder: CommandBuilder) -> PbResult {
        let payload = encode_command(&builder.build()).unwrap();
        let response = self.proxy.send(&payload).await.unwrap();
        decode_result(&response).unwrap()
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }
}

async fn spawn_proxy(upstream: SocketTransport, plugins: PluginRegistry) -> SocketAddr {
    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), upstream, plugins)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn with_file(id: i32, device_type: PbDeviceType, file: &str) -> CommandBuilder {
    CommandBuilder::new(PbOperation::Attach).device(device_definition(id, device_type, Some(file)))
}

fn event(id: u32, device_type: &str, path: &str) -> DeviceEvent {
    DeviceEvent {
        id,
        unit: 0,
        device_type: device_type.to_string(),
        path: PathBuf::from(path),
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn detach_queries_then_forwards_then_runs_hooks() {
    let h = Harness::start(false).await;
    h.engine.preload(device_definition(2, PbDeviceType::Schd, Some("disk.hda")));

    let result = h.send(CommandBuilder::new(PbOperation::Detach).slot(2, None)).await;
    assert!(result.status, "{}", result.msg);

    let recorded = h.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].hook, Hook::Detach);
    assert_eq!(recorded[0].event, event(2, "SCHD", "/img/disk.hda"));
    assert_eq!(
        recorded[0].upstream_ops,
        vec![PbOperation::DevicesInfo, PbOperation::Detach]
    );
    assert_eq!(
        h.engine.operations(),
        vec![PbOperation::DevicesInfo, PbOperation::Detach]
    );
    assert!(h.engine.device(2, 0).is_none());
}

#[tokio::test]
async fn attach_hooks_run_before_forwarding() {
    let h = Harness::start(false).await;

    let result = h.send(with_file(1, PbDeviceType::Schd, "new.hds")).await;
    assert!(result.status, "{}", result.msg);

    let recorded = h.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].hook, Hook::Attach);
    assert_eq!(recorded[0].event, event(1, "SCHD", "/img/new.hds"));
    assert_eq!(recorded[0].upstream_ops, vec![PbOperation::DefaultImageFilesInfo]);
    assert!(h.engine.device(1, 0).is_some());
}

#[tokio::test]
async fn insert_and_eject_use_their_own_hooks() {
    let h = Harness::start(false).await;
    h.engine.preload(device_definition(3, PbDeviceType::Sccd, None));

    let insert = CommandBuilder::new(PbOperation::Insert)
        .device(device_definition(3, PbDeviceType::Sccd, Some("cd/x.iso")));
    assert!(h.send(insert).await.status);

    let eject = CommandBuilder::new(PbOperation::Eject).slot(3, None);
    assert!(h.send(eject).await.status);

    let recorded = h.recorded();
    let hooks: Vec<Hook> = recorded.iter().map(|r| r.hook).collect();
    assert_eq!(hooks, vec![Hook::Insert, Hook::Eject]);
    assert_eq!(recorded[0].event, event(3, "SCCD", "/img/cd/x.iso"));
    assert_eq!(recorded[1].event, event(3, "SCCD", "/img/cd/x.iso"));
}

#[tokio::test]
async fn every_device_in_a_command_is_observed() {
    let h = Harness::start(false).await;
    h.engine.preload(device_definition(4, PbDeviceType::Schd, Some("a.hds")));
    h.engine.preload(device_definition(5, PbDeviceType::Schd, Some("/mnt/usb/b.hds")));

    let detach = CommandBuilder::new(PbOperation::Detach).slot(4, None).slot(5, None);
    assert!(h.send(detach).await.status);

    let events: Vec<DeviceEvent> = h.recorded().into_iter().map(|r| r.event).collect();
    assert_eq!(
        events,
        vec![event(4, "SCHD", "/img/a.hds"), event(5, "SCHD", "/mnt/usb/b.hds")]
    );
}

// =============================================================================
// Forwarding
// =============================================================================

#[tokio::test]
async fn other_operations_pass_through_untouched() {
    let h = Harness::start(false).await;

    let result = h
        .send(CommandBuilder::new(PbOperation::LogLevel).param("level", "debug"))
        .await;
    assert!(result.status);
    assert_eq!(h.engine.log_level(), "debug");
    assert_eq!(h.engine.operations(), vec![PbOperation::LogLevel]);

    let info = h.send(CommandBuilder::new(PbOperation::VersionInfo)).await;
    assert_eq!(info.version_info.unwrap().major_version, 22);
    assert!(h.recorded().is_empty());
}

#[tokio::test]
async fn engine_rejections_are_forwarded_verbatim() {
    let h = Harness::start(false).await;

    let result = h.send(CommandBuilder::new(PbOperation::Detach).slot(6, None)).await;
    assert!(!result.status);
    assert_eq!(result.msg, "No device for ID 6, unit 0");
    assert!(h.recorded().is_empty());
}

#[tokio::test]
async fn failing_hooks_do_not_veto() {
    let h = Harness::start(true).await;

    let result = h.send(with_file(1, PbDeviceType::Schd, "disk.hds")).await;
    assert!(result.status);
    assert_eq!(h.recorded().len(), 1);
    assert!(h.engine.device(1, 0).is_some());
}

#[tokio::test]
async fn caller_token_is_used_for_lookups() {
    let h = Harness::start(false).await;
    h.engine.set_token(Some("secret"));

    let attach = with_file(1, PbDeviceType::Schd, "disk.hds").token(Some("secret"));
    let result = h.send(attach).await;
    assert!(result.status, "{}", result.msg);
    assert_eq!(h.recorded()[0].event, event(1, "SCHD", "/img/disk.hds"));
}

#[tokio::test]
async fn rejected_lookup_still_forwards_attach() {
    let h = Harness::start(false).await;
    h.engine.set_token(Some("secret"));

    let attach = with_file(1, PbDeviceType::Schd, "disk.hds").token(Some("wrong"));
    let result = h.send(attach).await;
    assert!(!result.status);
    assert_eq!(result.msg, "Authentication failed");
    assert!(h.recorded().is_empty());
    assert_eq!(
        h.engine.operations(),
        vec![PbOperation::DefaultImageFilesInfo, PbOperation::Attach]
    );
    assert!(h.engine.device(1, 0).is_none());
}

#[tokio::test]
async fn rejected_lookup_still_forwards_detach() {
    let h = Harness::start(false).await;
    h.engine.set_token(Some("secret"));
    h.engine.preload(device_definition(2, PbDeviceType::Schd, Some("disk.hda")));

    let detach = CommandBuilder::new(PbOperation::Detach).slot(2, None).token(Some("wrong"));
    let result = h.send(detach).await;
    assert!(!result.status);
    assert_eq!(result.msg, "Authentication failed");
    assert!(h.recorded().is_empty());
    assert!(h.engine.device(2, 0).is_some());
}

#[tokio::test]
async fn unreachable_upstream_closes_without_response() {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let upstream = SocketTransport::new("127.0.0.1", closed).with_retries(0);
    let addr = spawn_proxy(upstream, PluginRegistry::new()).await;
    let client = SocketTransport::new("127.0.0.1", addr.port()).with_retries(0);

    let payload = encode_command(&CommandBuilder::new(PbOperation::ServerInfo).build()).unwrap();
    let err = client.send(&payload).await.unwrap_err();
    assert_eq!(err.kind(), rascsi_core::ErrorKind::MalformedFrame);
}
