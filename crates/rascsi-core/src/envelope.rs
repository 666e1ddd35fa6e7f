//! Result envelopes handed to the presentation layer.
//!
//! An envelope pairs an outcome with a stable [`ReturnCode`] and a
//! `parameters` map. The presentation layer owns the message templates; it
//! substitutes `parameters` into the template selected by `return_code`.
//! When the engine itself rejects a request its message is carried verbatim
//! in `message`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Stable return codes, grouped by operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ReturnCode {
    DeleteFileSuccess = 0,
    DeleteFileNotFound = 1,
    DeleteFileUnableToDelete = 2,
    RenameFileSuccess = 10,
    RenameFileUnableToMove = 11,
    RenameFileCouldNotOverwrite = 12,
    DownloadFileToIsoSuccess = 20,
    DownloadToDirSuccess = 30,
    WriteFileSuccess = 40,
    WriteFileCouldNotWrite = 41,
    WriteFileCouldNotOverwrite = 42,
    ReadConfigSuccess = 50,
    ReadConfigCouldNotRead = 51,
    ReadConfigInvalidConfigFileFormat = 52,
    ReadDrivePropsSuccess = 60,
    ReadDrivePropsCouldNotRead = 61,
    AttachImageCouldNotAttach = 70,
    ExtractImageSuccess = 80,
    ExtractImageNoFilesSpecified = 81,
    ExtractImageNoFilesExtracted = 82,
    ExtractImageCommandError = 83,
    WriteConfigSuccess = 90,
    WriteConfigCouldNotWrite = 91,
    WriteDrivePropsSuccess = 100,
    WriteDrivePropsCouldNotWrite = 101,
    InvalidPath = 110,
}

impl ReturnCode {
    const ALL: [ReturnCode; 26] = [
        ReturnCode::DeleteFileSuccess,
        ReturnCode::DeleteFileNotFound,
        ReturnCode::DeleteFileUnableToDelete,
        ReturnCode::RenameFileSuccess,
        ReturnCode::RenameFileUnableToMove,
        ReturnCode::RenameFileCouldNotOverwrite,
        ReturnCode::DownloadFileToIsoSuccess,
        ReturnCode::DownloadToDirSuccess,
        ReturnCode::WriteFileSuccess,
        ReturnCode::WriteFileCouldNotWrite,
        ReturnCode::WriteFileCouldNotOverwrite,
        ReturnCode::ReadConfigSuccess,
        ReturnCode::ReadConfigCouldNotRead,
        ReturnCode::ReadConfigInvalidConfigFileFormat,
        ReturnCode::ReadDrivePropsSuccess,
        ReturnCode::ReadDrivePropsCouldNotRead,
        ReturnCode::AttachImageCouldNotAttach,
        ReturnCode::ExtractImageSuccess,
        ReturnCode::ExtractImageNoFilesSpecified,
        ReturnCode::ExtractImageNoFilesExtracted,
        ReturnCode::ExtractImageCommandError,
        ReturnCode::WriteConfigSuccess,
        ReturnCode::WriteConfigCouldNotWrite,
        ReturnCode::WriteDrivePropsSuccess,
        ReturnCode::WriteDrivePropsCouldNotWrite,
        ReturnCode::InvalidPath,
    ];

    /// Numeric identifier.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<ReturnCode> for u16 {
    fn from(code: ReturnCode) -> Self {
        code.code()
    }
}

impl TryFrom<u16> for ReturnCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ReturnCode::ALL
            .into_iter()
            .find(|code| code.code() == value)
            .ok_or_else(|| format!("unknown return code {}", value))
    }
}

/// Outcome of a public operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = ()> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<ReturnCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Successful outcome without a return code.
    pub fn ok() -> Self {
        Self {
            ok: true,
            code: None,
            return_code: None,
            message: None,
            parameters: BTreeMap::new(),
            data: None,
        }
    }

    /// Successful outcome with a return code.
    pub fn success(return_code: ReturnCode) -> Self {
        Self {
            return_code: Some(return_code),
            ..Self::ok()
        }
    }

    /// Failed outcome of the given kind.
    pub fn failure(kind: ErrorKind) -> Self {
        Self {
            ok: false,
            code: Some(kind),
            ..Self::ok()
        }
    }

    /// Failed outcome built from an error.
    ///
    /// Engine rejections keep the engine's own message; all other errors
    /// carry their rendered description.
    pub fn from_error(error: &Error) -> Self {
        let mut envelope = Self::failure(error.kind()).with_message(error.to_string());
        match error {
            Error::InvalidPath { path } => {
                envelope.return_code = Some(ReturnCode::InvalidPath);
                envelope
                    .parameters
                    .insert("path".into(), path.display().to_string());
            }
            Error::TypeMismatch { requested, current } => {
                envelope.return_code = Some(ReturnCode::AttachImageCouldNotAttach);
                envelope
                    .parameters
                    .insert("device_type".into(), requested.clone());
                envelope
                    .parameters
                    .insert("current_device_type".into(), current.clone());
            }
            Error::NoFilesSpecified => {
                envelope.return_code = Some(ReturnCode::ExtractImageNoFilesSpecified);
            }
            Error::NoFilesExtracted => {
                envelope.return_code = Some(ReturnCode::ExtractImageNoFilesExtracted);
            }
            Error::ArchiveCommandFailure { message }
            | Error::ArchiveOutputUnparseable { message } => {
                envelope.return_code = Some(ReturnCode::ExtractImageCommandError);
                envelope.parameters.insert("error".into(), message.clone());
            }
            Error::InvalidConfigFormat { .. } => {
                envelope.return_code = Some(ReturnCode::ReadConfigInvalidConfigFileFormat);
            }
            _ => {}
        }
        envelope
    }

    /// Override the return code.
    pub fn with_return_code(mut self, return_code: ReturnCode) -> Self {
        self.return_code = Some(return_code);
        self
    }

    /// Attach a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Add one template parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    /// Collapse a fallible computation that already produces an envelope.
    pub fn flatten(result: crate::Result<Envelope<T>>) -> Envelope<T> {
        result.unwrap_or_else(|e| Envelope::from_error(&e))
    }

    /// Convert the payload type, keeping everything else.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            ok: self.ok,
            code: self.code,
            return_code: self.return_code,
            message: self.message,
            parameters: self.parameters,
            data: self.data.map(f),
        }
    }
}

impl<T> From<crate::Result<T>> for Envelope<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Envelope::ok().with_data(data),
            Err(e) => Envelope::from_error(&e),
        }
    }
}
