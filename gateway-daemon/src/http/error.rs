//! Daemon-level error type exposed at the HTTP boundary, wrapping the
//! core engine's [`gateway_core::GatewayError`] the way the teacher's
//! `minidsp/src/bin/minidspd/http/error.rs` wraps `MiniDSPError`.

use gateway_core::GatewayError;
use thiserror::Error;

#[derive(Clone, Debug, serde::Serialize, Error)]
#[serde(tag = "type")]
pub enum Error {
    #[error("unknown device id: {id}")]
    UnknownDevice { id: String },

    #[error("device has no route: {0}")]
    NoRoute(String),

    #[error("device is not configured: {0}")]
    NotConfigured(String),

    #[error("the network transport is disabled")]
    TransportDisabled,

    #[error("couldn't parse parameter named {name}: {error}")]
    ParameterError { name: String, error: String },

    #[error("the request body could not be parsed: {0}")]
    ParseError(String),

    #[error(transparent)]
    #[serde(serialize_with = "ser_to_string")]
    InternalError(#[from] std::sync::Arc<anyhow::Error>),
}

fn ser_to_string<S, T>(t: &T, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: ToString,
{
    s.serialize_str(t.to_string().as_str())
}

impl Error {
    pub fn parameter_error<E: ToString>(name: &str, error: E) -> Self {
        Error::ParameterError {
            name: name.to_string(),
            error: error.to_string(),
        }
    }

    pub fn parameter_missing(name: &str) -> Self {
        Error::ParameterError {
            name: name.to_string(),
            error: "parameter is missing".to_string(),
        }
    }

    pub fn for_device(id: &str, e: GatewayError) -> Self {
        match e {
            GatewayError::UnknownDevice => Error::UnknownDevice { id: id.to_string() },
            GatewayError::NoRoute => Error::NoRoute(id.to_string()),
            GatewayError::NotConfigured => Error::NotConfigured(id.to_string()),
            GatewayError::TransportDisabled => Error::TransportDisabled,
            other => Error::from(anyhow::anyhow!(other)),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Self::from(std::sync::Arc::new(e))
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct FormattedError {
    message: String,
    error: Error,
}

impl From<Error> for FormattedError {
    fn from(error: Error) -> Self {
        Self {
            message: error.to_string(),
            error,
        }
    }
}
