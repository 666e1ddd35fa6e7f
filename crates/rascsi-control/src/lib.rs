//! Wire protocol and command client for the RaSCSI engine.
//!
//! - [`proto`]: protobuf messages generated from `proto/rascsi_interface.proto`
//! - [`protocol`]: payload codec, command builder and debug rendering
//! - [`transport`]: framed TCP transport with connect retries
//! - [`client`]: semantic engine operations
//! - [`types`]: typed views over engine results and the attach routing rule

pub mod client;
pub mod protocol;
pub mod transport;
pub mod types;

/// Generated protobuf types.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/rascsi_interface.rs"));
}

pub use client::{EngineClient, extract_result};
pub use protocol::{CommandBuilder, decode_command, decode_result, encode_command, encode_result, format_command};
pub use transport::{SocketTransport, read_frame, read_magic, write_frame, write_request};
pub use types::{
    AttachOutcome, AttachRequest, AttachRoute, AuthStatus, DeviceInfo, DeviceTypeInfo,
    ImageFileEntry, ImageFilesInfo, ServerInfo, ShutdownMode, device_type_name,
    parse_device_type, route_attach,
};
