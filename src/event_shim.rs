use log::debug;
use log::error;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_FIELD: &str = "hasEventNow";

#[derive(Debug, Error)]
pub enum SignalSourceError {
    #[error("Request to '{endpoint}' failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to '{endpoint}' answered with status {status}")]
    Status { endpoint: String, status: StatusCode },

    #[error("Malformed answer from '{endpoint}': {message}")]
    Payload { endpoint: String, message: String },
}

impl SignalSourceError {
    fn payload<S1: Into<String>, S2: Into<String>>(endpoint: S1, message: S2) -> Self {
        SignalSourceError::Payload {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Tells whether an event is currently running for a relay.
#[cfg_attr(test, mockall::automock)]
pub trait EventSignalSource {
    fn try_fetch(&self, endpoint: &str) -> Result<bool, SignalSourceError>;
}

/// Any failure of the source resolves to "no event", so a broken source
/// switches relays off instead of leaving them on.
pub fn desired_state_or_off<S>(source: &S, endpoint: &str) -> bool
where
    S: EventSignalSource + ?Sized,
{
    match source.try_fetch(endpoint) {
        Ok(has_event) => has_event,
        Err(e) => {
            error!(target: "critical", "{}, assuming no event", e);
            false
        }
    }
}

pub struct HttpEventSource {
    client: Client,
}

impl HttpEventSource {
    pub fn new() -> Result<HttpEventSource, reqwest::Error> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(HttpEventSource { client })
    }
}

impl EventSignalSource for HttpEventSource {
    fn try_fetch(&self, endpoint: &str) -> Result<bool, SignalSourceError> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .map_err(|source| SignalSourceError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SignalSourceError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        let body = response
            .text()
            .map_err(|source| SignalSourceError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let has_event = parse_event_body(endpoint, &body)?;
        debug!("'{}' reports {}={}", endpoint, EVENT_FIELD, has_event);
        Ok(has_event)
    }
}

/// Reads the event flag from the body of an OK answer.
pub fn parse_event_body(endpoint: &str, body: &str) -> Result<bool, SignalSourceError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| SignalSourceError::payload(endpoint, e.to_string()))?;

    match value.get(EVENT_FIELD) {
        Some(Value::Bool(has_event)) => Ok(*has_event),
        Some(other) => Err(SignalSourceError::payload(
            endpoint,
            format!("Field '{}' is not a boolean: {}", EVENT_FIELD, other),
        )),
        None => Err(SignalSourceError::payload(
            endpoint,
            format!("Field '{}' is missing", EVENT_FIELD),
        )),
    }
}
