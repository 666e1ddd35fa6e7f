//! Protocol codec for the engine command channel.
//!
//! Payloads are protobuf-encoded [`PbCommand`] (requests) and [`PbResult`]
//! (responses). Framing lives in [`crate::transport`]; this module only maps
//! typed values to bytes and back, builds commands, and renders them for
//! debug logs with the token redacted.
//!
//! # Example
//!
//! ```ignore
//! use rascsi_control::protocol::{CommandBuilder, encode_command, decode_command};
//! use rascsi_control::proto::PbOperation;
//!
//! let cmd = CommandBuilder::new(PbOperation::DetachAll).token("secret").build();
//! let bytes = encode_command(&cmd)?;
//! assert_eq!(decode_command(&bytes)?, cmd);
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use bytes::{Bytes, BytesMut};
use prost::Message as ProstMessage;
use rascsi_core::constants::MAX_FRAME_SIZE;
use rascsi_core::{Error, Result};

use crate::proto::{PbCommand, PbDeviceDefinition, PbDeviceType, PbOperation, PbResult};

/// Command parameter carrying the authentication token.
pub const PARAM_TOKEN: &str = "token";

/// Command parameter carrying the locale for engine messages.
pub const PARAM_LOCALE: &str = "locale";

fn encode<M: ProstMessage>(msg: &M) -> Result<Bytes> {
    let len = msg.encoded_len();
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(len);
    msg.encode(&mut buf).map_err(|e| Error::Codec {
        message: e.to_string(),
    })?;
    Ok(buf.freeze())
}

fn decode<M: ProstMessage + Default>(bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|e| Error::Codec {
        message: e.to_string(),
    })
}

/// Serialize a command payload (no framing).
pub fn encode_command(cmd: &PbCommand) -> Result<Bytes> {
    encode(cmd)
}

/// Parse a command payload.
pub fn decode_command(bytes: &[u8]) -> Result<PbCommand> {
    decode(bytes)
}

/// Serialize a result payload (no framing).
pub fn encode_result(result: &PbResult) -> Result<Bytes> {
    encode(result)
}

/// Parse a result payload.
pub fn decode_result(bytes: &[u8]) -> Result<PbResult> {
    decode(bytes)
}

// ============================================================================
// Command construction
// ============================================================================

/// Builder for [`PbCommand`] values.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: PbCommand,
}

impl CommandBuilder {
    pub fn new(operation: PbOperation) -> Self {
        let mut command = PbCommand::default();
        command.set_operation(operation);
        Self { command }
    }

    /// Attach the authentication token; `None` and empty strings are skipped.
    pub fn token(self, token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => self.param(PARAM_TOKEN, token),
            _ => self,
        }
    }

    pub fn locale(self, locale: &str) -> Self {
        if locale.is_empty() {
            self
        } else {
            self.param(PARAM_LOCALE, locale)
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.params.insert(key.into(), value.into());
        self
    }

    pub fn device(mut self, device: PbDeviceDefinition) -> Self {
        self.command.devices.push(device);
        self
    }

    /// Add a bare `(id, unit)` selector.
    pub fn slot(self, id: u32, unit: Option<u32>) -> Self {
        self.device(PbDeviceDefinition {
            id: id as i32,
            unit: unit.unwrap_or(0) as i32,
            ..Default::default()
        })
    }

    pub fn build(self) -> PbCommand {
        self.command
    }
}

// ============================================================================
// Debug rendering
// ============================================================================

fn write_map(out: &mut String, map: &BTreeMap<String, String>, redact_token: bool) {
    out.push('{');
    for (i, (key, value)) in map.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let shown = if redact_token && key == PARAM_TOKEN {
            "***"
        } else {
            value.as_str()
        };
        let _ = write!(out, "'{}': '{}'", key, shown);
    }
    out.push('}');
}

/// Render a command for debug logs.
///
/// Shows the operation name, the parameters with the token masked as `***`,
/// and per device the id plus any of unit, type, params, vendor, product and
/// revision that are set.
pub fn format_command(cmd: &PbCommand) -> String {
    let operation = PbOperation::try_from(cmd.operation)
        .map(|op| op.as_str_name().to_string())
        .unwrap_or_else(|_| cmd.operation.to_string());

    let mut out = format!("Sending: {}, params: ", operation);
    write_map(&mut out, &cmd.params, true);

    for device in &cmd.devices {
        let _ = write!(out, ", device: {{'id': {}", device.id);
        if device.unit != 0 {
            let _ = write!(out, ", 'unit': {}", device.unit);
        }
        if device.r#type != 0 {
            let name = PbDeviceType::try_from(device.r#type)
                .map(|t| t.as_str_name().to_string())
                .unwrap_or_else(|_| device.r#type.to_string());
            let _ = write!(out, ", 'type': '{}'", name);
        }
        if !device.params.is_empty() {
            out.push_str(", 'params': ");
            write_map(&mut out, &device.params, false);
        }
        for (key, value) in [
            ("vendor", &device.vendor),
            ("product", &device.product),
            ("revision", &device.revision),
        ] {
            if !value.is_empty() {
                let _ = write!(out, ", '{}': '{}'", key, value);
            }
        }
        out.push('}');
    }

    out
}
