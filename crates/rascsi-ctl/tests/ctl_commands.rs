//! Operator CLI commands against the in-process fake engine.

use clap::Parser;
use rascsi_control::proto::PbDeviceType;
use rascsi_core::{ErrorKind, ReturnCode};
use rascsi_ctl::{Cli, Output};
use rascsi_test_utils::{FakeEngine, device_definition};
use serde_json::json;
use tempfile::TempDir;

struct Harness {
    engine: FakeEngine,
    images: TempDir,
    cfg: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let images = tempfile::tempdir().unwrap();
        let cfg = tempfile::tempdir().unwrap();
        let engine = FakeEngine::start_with_images_dir(images.path().display().to_string()).await;
        Self { engine, images, cfg }
    }

    async fn run(&self, args: &[&str]) -> Output {
        let port = self.engine.port().to_string();
        let cfg = self.cfg.path().display().to_string();
        let mut argv = vec!["rascsi-ctl", "--host", "127.0.0.1", "-p", &port, "--cfg-dir", &cfg];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        rascsi_ctl::run(&cli).await.unwrap()
    }
}

#[tokio::test]
async fn version_is_reported() {
    let h = Harness::start().await;
    let output = h.run(&["version"]).await;
    assert!(output.is_ok());
    assert_eq!(output.envelope.data, Some(json!("22.10.1")));
    assert!(output.table.is_none());
}

#[tokio::test]
async fn attach_then_list_prints_table() {
    let h = Harness::start().await;

    let attached = h.run(&["attach", "2", "-t", "schd", "-f", "disk.hds"]).await;
    assert!(attached.is_ok(), "{:?}", attached.envelope);
    assert!(h.engine.device(2, 0).is_some());

    let listed = h.run(&["list"]).await;
    assert!(listed.is_ok());
    let data = listed.envelope.data.clone().unwrap();
    assert_eq!(data.as_array().unwrap().len(), 1);
    assert_eq!(data[0]["id"], 2);
    assert_eq!(data[0]["device_type"], "SCHD");
    assert_eq!(data[0]["file"], "disk.hds");

    let table = listed.table.unwrap();
    assert_eq!(table.lines().count(), 2);
    assert!(table.lines().nth(1).unwrap().starts_with("2   0   SCHD"));
    assert!(table.contains("disk.hds"));
}

#[tokio::test]
async fn list_can_filter_one_slot() {
    let h = Harness::start().await;
    h.engine.preload(device_definition(1, PbDeviceType::Schd, Some("a.hds")));
    h.engine.preload(device_definition(4, PbDeviceType::Sccd, None));

    let listed = h.run(&["list", "--id", "4"]).await;
    let data = listed.envelope.data.unwrap();
    assert_eq!(data.as_array().unwrap().len(), 1);
    assert_eq!(data[0]["device_type"], "SCCD");
}

#[tokio::test]
async fn engine_rejection_is_a_failed_envelope() {
    let h = Harness::start().await;
    let output = h.run(&["detach", "6"]).await;
    assert!(!output.is_ok());
    assert_eq!(output.envelope.code, Some(ErrorKind::EngineRejected));
    assert_eq!(output.envelope.message.as_deref(), Some("No device for ID 6, unit 0"));

    let json: serde_json::Value = serde_json::from_str(&output.to_json().unwrap()).unwrap();
    assert_eq!(json["ok"], false);
}

#[tokio::test]
async fn unknown_device_type_never_reaches_engine() {
    let h = Harness::start().await;
    let output = h.run(&["attach", "1", "-t", "floppy", "-f", "x.img"]).await;
    assert!(!output.is_ok());
    assert_eq!(output.envelope.code, Some(ErrorKind::InvalidArgument));
    assert!(h.engine.commands().is_empty());
}

#[tokio::test]
async fn reserve_and_release() {
    let h = Harness::start().await;

    let reserved = h.run(&["reserve", "5", "-m", "scanner"]).await;
    assert!(reserved.is_ok());
    assert_eq!(reserved.envelope.parameters["memo"], "scanner");
    assert_eq!(h.engine.reserved_ids(), vec![5]);

    let listed = h.run(&["reserved"]).await;
    assert_eq!(listed.envelope.data, Some(json!([5])));

    assert!(h.run(&["release", "5"]).await.is_ok());
    assert!(h.engine.reserved_ids().is_empty());
}

#[tokio::test]
async fn log_level_is_forwarded() {
    let h = Harness::start().await;
    assert!(h.run(&["log-level", "debug"]).await.is_ok());
    assert_eq!(h.engine.log_level(), "debug");
}

#[tokio::test]
async fn image_file_lifecycle() {
    let h = Harness::start().await;

    let created = h.run(&["image", "create", "new.hds", "4096"]).await;
    assert!(created.is_ok(), "{:?}", created.envelope);
    assert_eq!(created.envelope.return_code, Some(ReturnCode::WriteFileSuccess));
    let path = h.images.path().join("new.hds");
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

    let again = h.run(&["image", "create", "new.hds", "4096"]).await;
    assert!(!again.is_ok());
    assert_eq!(again.envelope.return_code, Some(ReturnCode::WriteFileCouldNotOverwrite));

    assert!(h.run(&["image", "rename", "new.hds", "old.hds"]).await.is_ok());
    assert!(h.images.path().join("old.hds").exists());

    assert!(h.run(&["image", "delete", "old.hds"]).await.is_ok());
    assert!(!h.images.path().join("old.hds").exists());
}

#[tokio::test]
async fn traversal_is_rejected() {
    let h = Harness::start().await;
    let output = h.run(&["image", "delete", "../escape.hds"]).await;
    assert!(!output.is_ok());
    assert_eq!(output.envelope.return_code, Some(ReturnCode::InvalidPath));
    assert_eq!(output.envelope.parameters["path"], "../escape.hds");
}

#[tokio::test]
async fn config_save_and_list() {
    let h = Harness::start().await;
    h.engine.preload(device_definition(1, PbDeviceType::Schd, Some("boot.hds")));

    let saved = h.run(&["config", "save", "snap.json"]).await;
    assert!(saved.is_ok(), "{:?}", saved.envelope);
    assert!(h.cfg.path().join("snap.json").exists());

    let listed = h.run(&["config", "list"]).await;
    assert_eq!(listed.envelope.data, Some(json!(["snap.json"])));

    h.engine.clear_commands();
    let loaded = h.run(&["config", "load", "snap.json"]).await;
    assert!(loaded.is_ok(), "{:?}", loaded.envelope);
    assert!(h.engine.device(1, 0).is_some());
}

#[tokio::test]
async fn properties_write_then_read() {
    let h = Harness::start().await;

    let written = h
        .run(&[
            "properties",
            "write",
            "disk.hds.properties",
            "--vendor",
            "QUANTUM",
            "--block-size",
            "512",
        ])
        .await;
    assert!(written.is_ok());
    assert_eq!(written.envelope.return_code, Some(ReturnCode::WriteDrivePropsSuccess));

    let read = h.run(&["properties", "read", "disk.hds.properties"]).await;
    assert!(read.is_ok());
    let data = read.envelope.data.unwrap();
    assert_eq!(data["conf"]["vendor"], "QUANTUM");
    assert_eq!(data["conf"]["block_size"], 512);
    assert!(data["conf"].get("product").is_none());
}

#[tokio::test]
async fn disk_space_defaults_to_images_dir() {
    let h = Harness::start().await;
    let output = h.run(&["disk-space"]).await;
    assert!(output.is_ok(), "{:?}", output.envelope);
    let data = output.envelope.data.unwrap();
    assert!(data["total"].as_u64().unwrap() > 0);
    assert!(data["free"].as_u64().unwrap() <= data["total"].as_u64().unwrap());
}
