//! rascsi-test-utils: Test infrastructure for the RaSCSI control plane.
//!
//! Provides:
//! - FakeEngine: in-process engine speaking the wire protocol on an ephemeral port
//! - Definition helpers for preloading devices

mod fake_engine;

pub use fake_engine::{FAKE_DEFAULT_VENDOR, FAKE_IMAGES_DIR, FAKE_VERSION, FakeEngine};

use rascsi_control::proto::{PbDeviceDefinition, PbDeviceType};

/// Device definition for `id` with a type and optional image file.
pub fn device_definition(id: i32, device_type: PbDeviceType, file: Option<&str>) -> PbDeviceDefinition {
    let mut def = PbDeviceDefinition {
        id,
        ..Default::default()
    };
    def.set_type(device_type);
    if let Some(file) = file {
        def.params.insert("file".to_string(), file.to_string());
    }
    def
}
