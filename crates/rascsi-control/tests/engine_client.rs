//! Engine client integration tests against the in-process fake engine.

use std::time::Duration;

use rascsi_control::proto::{PbDeviceType, PbOperation};
use rascsi_control::{AttachRequest, EngineClient, ShutdownMode, SocketTransport};
use rascsi_core::ErrorKind;
use rascsi_test_utils::{FAKE_IMAGES_DIR, FakeEngine, device_definition};

fn client_for(engine: &FakeEngine) -> EngineClient {
    EngineClient::new(
        SocketTransport::new("127.0.0.1", engine.port()).with_retry_delay(Duration::from_millis(10)),
    )
}

#[tokio::test]
async fn attach_hard_disk() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    let request = AttachRequest::new()
        .with_type(PbDeviceType::Schd)
        .with_file("test.hda");
    let outcome = client.attach(1, &request).await.unwrap();
    assert!(!outcome.inserted);

    let attaches = engine
        .operations()
        .into_iter()
        .filter(|op| *op == PbOperation::Attach)
        .count();
    assert_eq!(attaches, 1);

    let devices = client.list_devices(None, None).await.unwrap();
    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.id, 1);
    assert_eq!(device.unit, 0);
    assert_eq!(device.device_type, "SCHD");
    assert_eq!(device.image, format!("{}/test.hda", FAKE_IMAGES_DIR));
    assert_eq!(device.file, "test.hda");
}

#[tokio::test]
async fn attach_to_empty_removable_routes_to_insert() {
    let engine = FakeEngine::start().await;
    engine.preload(device_definition(3, PbDeviceType::Sccd, None));
    let client = client_for(&engine);

    let request = AttachRequest::new()
        .with_type(PbDeviceType::Sccd)
        .with_file("x.iso")
        .with_vendor("SONY");
    let outcome = client.attach(3, &request).await.unwrap();
    assert!(outcome.inserted);

    let commands = engine.commands();
    let last = commands.last().unwrap();
    assert_eq!(last.operation(), PbOperation::Insert);
    assert!(last.devices[0].vendor.is_empty());
    assert!(last.devices[0].product.is_empty());
    assert!(!engine.operations().contains(&PbOperation::Attach));
}

#[tokio::test]
async fn attach_removable_type_mismatch_sends_nothing() {
    let engine = FakeEngine::start().await;
    engine.preload(device_definition(3, PbDeviceType::Sccd, Some("x.iso")));
    let client = client_for(&engine);

    let request = AttachRequest::new()
        .with_type(PbDeviceType::Scmo)
        .with_file("x.mos");
    let err = client.attach(3, &request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);

    let ops = engine.operations();
    assert!(!ops.contains(&PbOperation::Attach));
    assert!(!ops.contains(&PbOperation::Insert));
    assert_eq!(engine.device(3, 0).unwrap().r#type(), PbDeviceType::Sccd);
}

#[tokio::test]
async fn second_attach_to_fixed_disk_is_rejected() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);
    let request = AttachRequest::new()
        .with_type(PbDeviceType::Schd)
        .with_file("a.hds");

    client.attach(2, &request).await.unwrap();
    let before = engine.devices();

    let err = client.attach(2, &request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineRejected);
    assert!(err.to_string().contains("Duplicate"));
    assert_eq!(engine.devices(), before);
}

#[tokio::test]
async fn attach_then_detach_restores_device_list() {
    let engine = FakeEngine::start().await;
    engine.preload(device_definition(0, PbDeviceType::Schd, Some("boot.hda")));
    let client = client_for(&engine);
    let before = client.list_devices(None, None).await.unwrap();

    let request = AttachRequest::new()
        .with_type(PbDeviceType::Scmo)
        .with_file("data.mos");
    client.attach(4, &request).await.unwrap();
    assert_eq!(client.list_devices(None, None).await.unwrap().len(), 2);

    client.detach(4, None).await.unwrap();
    assert_eq!(client.list_devices(None, None).await.unwrap(), before);
}

#[tokio::test]
async fn list_devices_for_empty_slot_is_empty() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);
    assert!(client.list_devices(Some(6), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_devices_passes_other_rejections_through() {
    let engine = FakeEngine::start().await;
    engine.set_token(Some("s3cret"));
    engine.preload(device_definition(1, PbDeviceType::Schd, Some("boot.hda")));

    let client = client_for(&engine).with_token(Some("wrong".into()));
    let err = client.list_devices(None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineRejected);
    assert_eq!(err.to_string(), "Authentication failed");

    let err = client.list_devices(Some(6), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineRejected);
}

#[tokio::test]
async fn eject_marks_no_media() {
    let engine = FakeEngine::start().await;
    engine.preload(device_definition(5, PbDeviceType::Sccd, Some("disc.iso")));
    let client = client_for(&engine);

    client.eject(5, None).await.unwrap();
    let devices = client.list_devices(Some(5), None).await.unwrap();
    assert_eq!(devices[0].status, "Read-Only, No Media");
}

#[tokio::test]
async fn reserve_ids_replaces_set() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    client.reserve_ids(&[6, 7]).await.unwrap();
    assert_eq!(client.reserved_ids().await.unwrap(), vec![6, 7]);

    client.reserve_ids(&[7]).await.unwrap();
    assert_eq!(engine.reserved_ids(), vec![7]);

    let last_reserve = engine
        .commands()
        .into_iter()
        .rev()
        .find(|c| c.operation() == PbOperation::ReserveIds)
        .unwrap();
    assert_eq!(last_reserve.params["ids"], "7");
}

#[tokio::test]
async fn server_info_summarizes_engine() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    let info = client.server_info().await.unwrap();
    assert_eq!(info.version, "22.10.1");
    assert_eq!(info.image_dir, FAKE_IMAGES_DIR);
    assert!(info.schd.contains(&"hds".to_string()));
    assert!(info.sccd.contains(&"iso".to_string()));
    assert_eq!(client.version().await.unwrap(), "22.10.1");
}

#[tokio::test]
async fn device_types_report_capabilities() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    let types = client.device_types().await.unwrap();
    assert!(types["SCCD"].removable);
    assert!(!types["SCHD"].removable);
    assert!(types["SCHD"].block_sizes.contains(&512));
    assert_eq!(types["SCBR"].params["interface"], "eth0,wlan0");

    let mut removable = client.removable_device_types().await.unwrap();
    removable.sort();
    assert_eq!(
        removable,
        vec![PbDeviceType::Scrm, PbDeviceType::Scmo, PbDeviceType::Sccd]
    );
}

#[tokio::test]
async fn token_is_sent_and_checked() {
    let engine = FakeEngine::start().await;
    engine.set_token(Some("s3cret"));

    let anonymous = client_for(&engine);
    let auth = anonymous.auth_check().await.unwrap();
    assert!(auth.token_required);
    let err = anonymous.detach_all().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineRejected);

    let authed = client_for(&engine).with_token(Some("s3cret".into()));
    authed.detach_all().await.unwrap();
    let check = engine
        .commands()
        .into_iter()
        .find(|c| c.operation() == PbOperation::CheckAuthentication)
        .unwrap();
    assert!(!check.params.contains_key("token"));
}

#[tokio::test]
async fn log_level_and_shutdown_params() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    client.set_log_level("debug").await.unwrap();
    assert_eq!(engine.log_level(), "debug");
    assert!(client.set_log_level("loud").await.is_err());

    client.shutdown(ShutdownMode::Process).await.unwrap();
    let cmd = engine.commands().pop().unwrap();
    assert_eq!(cmd.operation(), PbOperation::ShutDown);
    assert_eq!(cmd.params["mode"], "process");
}

#[tokio::test]
async fn engine_side_image_operations() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    client.create_image("new.hds", 1024 * 1024, false).await.unwrap();
    client.copy_image("new.hds", "copy.hds", false).await.unwrap();
    client.rename_image("copy.hds", "moved.hds").await.unwrap();
    client.protect_image("moved.hds").await.unwrap();

    let info = client.image_files_info().await.unwrap();
    let names: Vec<_> = info.image_files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["moved.hds", "new.hds"]);
    assert!(info.image_files[0].read_only);

    client.unprotect_image("moved.hds").await.unwrap();
    client.delete_image("moved.hds").await.unwrap();
    assert!(client.delete_image("moved.hds").await.is_err());
}

#[tokio::test]
async fn protect_and_stop_devices() {
    let engine = FakeEngine::start().await;
    engine.preload(device_definition(1, PbDeviceType::Schd, Some("a.hds")));
    let client = client_for(&engine);

    client.protect(1, None).await.unwrap();
    let devices = client.list_devices(Some(1), None).await.unwrap();
    assert_eq!(devices[0].status, "Write-Protected");

    client.unprotect(1, None).await.unwrap();
    client.stop(1, None).await.unwrap();
    client.start(1, None).await.unwrap();
    assert!(!engine.device(1, 0).unwrap().status.unwrap().stopped);
}

#[tokio::test]
async fn default_folder_and_interfaces() {
    let engine = FakeEngine::start().await;
    let client = client_for(&engine);

    client.set_default_folder("/srv/images").await.unwrap();
    assert_eq!(engine.images_dir(), "/srv/images");
    assert_eq!(
        client.network_interfaces().await.unwrap(),
        vec!["eth0".to_string(), "wlan0".to_string()]
    );
}
