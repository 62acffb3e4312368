//! Error handling.
//!
//! This module defines the `DsError` enum, which is used to represent errors
//! that can occur when handling requests to the device server, and
//! `DevError`, the structured failure produced by device backends and
//! replayed from polling buffers.
//!
//! Note that errors that occur during the initialization of the daemon are
//! handled with `anyhow` and eventually end up terminating the process.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};

/// A structured device failure (reason, description, origin).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{reason}: {desc}")]
pub struct DevError {
    pub reason: String,
    pub desc: String,
    pub origin: String,
}

impl DevError {
    pub fn new(
        reason: impl Into<String>,
        desc: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            reason: reason.into(),
            desc: desc.into(),
            origin: origin.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DsError {
    #[error("Incorrect number of inout arguments")]
    WrongNumberOfArgs,
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("{0}")]
    NotSupported(String),
    #[error("{0}")]
    NotSupportedFeature(String),
    #[error("{0}")]
    AlreadyPolled(String),
    #[error("Device {0} is not polled")]
    DeviceNotPolled(String),
    #[error("{0} not found in list of polled object")]
    PollObjNotFound(String),
    #[error("Command {0} not found")]
    CommandNotFound(String),
    #[error("Attribute {0} not found")]
    AttrNotFound(String),
    #[error("{0}")]
    IncompatibleCmdArgument(String),
    #[error("{0}")]
    BadConfigurationProperty(String),
    #[error("{0}")]
    DeviceLocked(String),
    #[error("{0}")]
    NoDataYet(String),
    #[error("{0}")]
    NotUpdatedAnyMore(String),
    #[error("{0}")]
    CmdNotPolled(String),
    #[error("{0}")]
    AttrNotPolled(String),
    #[error("{0}")]
    CommandTimedOut(String),
    #[error("{0}")]
    IncoherentDevData(String),
    #[error("Can't find a polling thread for device {0}")]
    PollingThreadNotFound(String),
    #[error(transparent)]
    Device(#[from] DevError),
    #[error("IOError: {0}")]
    IOError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Blocking task failed: {0}")]
    BlockingTaskFailed(String),
}

impl DsError {
    /// The wire reason string clients match on.
    pub fn reason(&self) -> &str {
        match self {
            DsError::WrongNumberOfArgs => "API_WrongNumberOfArgs",
            DsError::DeviceNotFound(_) => "API_DeviceNotFound",
            DsError::NotSupported(_) => "API_NotSupported",
            DsError::NotSupportedFeature(_) => "API_NotSupportedFeature",
            DsError::AlreadyPolled(_) => "API_AlreadyPolled",
            DsError::DeviceNotPolled(_) => "API_DeviceNotPolled",
            DsError::PollObjNotFound(_) => "API_PollObjNotFound",
            DsError::CommandNotFound(_) => "API_CommandNotFound",
            DsError::AttrNotFound(_) => "API_AttrNotFound",
            DsError::IncompatibleCmdArgument(_) => "API_IncompatibleCmdArgumentType",
            DsError::BadConfigurationProperty(_) => "API_BadConfigurationProperty",
            DsError::DeviceLocked(_) => "API_DeviceLocked",
            DsError::NoDataYet(_) => "API_NoDataYet",
            DsError::NotUpdatedAnyMore(_) => "API_NotUpdatedAnyMore",
            DsError::CmdNotPolled(_) => "API_CmdNotPolled",
            DsError::AttrNotPolled(_) => "API_AttrNotPolled",
            DsError::CommandTimedOut(_) => "API_CommandTimedOut",
            DsError::IncoherentDevData(_) => "API_IncoherentDevData",
            DsError::PollingThreadNotFound(_) => "API_PollingThreadNotFound",
            DsError::Device(e) => &e.reason,
            DsError::IOError(_) => "API_IOError",
            DsError::Json(_) => "API_JsonError",
            DsError::BlockingTaskFailed(_) => "API_BlockingTaskFailed",
        }
    }

    /// Flatten into the structured failure shape sent to clients and
    /// delivered to event subscribers.
    pub fn to_dev_error(&self, origin: &str) -> DevError {
        match self {
            DsError::Device(e) => e.clone(),
            other => DevError::new(other.reason(), other.to_string(), origin),
        }
    }
}

impl From<actix_web::error::BlockingError> for DsError {
    fn from(e: actix_web::error::BlockingError) -> Self {
        DsError::BlockingTaskFailed(e.to_string())
    }
}

/// This allows us to return a custom HTTP status code for each error variant.
impl ResponseError for DsError {
    fn status_code(&self) -> StatusCode {
        match self {
            DsError::WrongNumberOfArgs => StatusCode::BAD_REQUEST,
            DsError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            DsError::NotSupported(_) => StatusCode::BAD_REQUEST,
            DsError::NotSupportedFeature(_) => StatusCode::BAD_REQUEST,
            DsError::AlreadyPolled(_) => StatusCode::CONFLICT,
            DsError::DeviceNotPolled(_) => StatusCode::CONFLICT,
            DsError::PollObjNotFound(_) => StatusCode::NOT_FOUND,
            DsError::CommandNotFound(_) => StatusCode::NOT_FOUND,
            DsError::AttrNotFound(_) => StatusCode::NOT_FOUND,
            DsError::IncompatibleCmdArgument(_) => StatusCode::BAD_REQUEST,
            DsError::BadConfigurationProperty(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DsError::DeviceLocked(_) => StatusCode::LOCKED,
            DsError::NoDataYet(_) => StatusCode::CONFLICT,
            DsError::NotUpdatedAnyMore(_) => StatusCode::CONFLICT,
            DsError::CmdNotPolled(_) => StatusCode::CONFLICT,
            DsError::AttrNotPolled(_) => StatusCode::CONFLICT,
            DsError::CommandTimedOut(_) => StatusCode::SERVICE_UNAVAILABLE,
            DsError::IncoherentDevData(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DsError::PollingThreadNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DsError::Device(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DsError::IOError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DsError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DsError::BlockingTaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_dev_error("dserverd"))
    }
}
