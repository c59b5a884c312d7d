//! Min/max/average microservice endpoints.
//!
//! Every endpoint takes a JSON array of integers. Over NATS the endpoints
//! answer requests on `minmax.<endpoint>`; the in-memory backend calls
//! [`dispatch`] directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Subject prefix the endpoints listen on.
pub const SUBJECT_PREFIX: &str = "minmax";

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("Input must contain at least one number")]
    EmptyInput,
}

/// Result returned by an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "endpoint", rename_all = "lowercase")]
pub enum EndpointOutput {
    Min { value: i64 },
    Max { value: i64 },
    Average { value: f64 },
}

/// Reply body sent back over request/reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Ok(EndpointOutput),
    Error { error: String },
}

impl From<Result<EndpointOutput, EndpointError>> for Reply {
    fn from(result: Result<EndpointOutput, EndpointError>) -> Self {
        match result {
            Ok(output) => Reply::Ok(output),
            Err(e) => Reply::Error {
                error: e.to_string(),
            },
        }
    }
}

type Handler = fn(&[i64]) -> Result<EndpointOutput, EndpointError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Min,
    Max,
    Average,
}

impl Endpoint {
    pub const ALL: [Endpoint; 3] = [Endpoint::Min, Endpoint::Max, Endpoint::Average];

    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Min => "min",
            Endpoint::Max => "max",
            Endpoint::Average => "average",
        }
    }

    /// `minmax.<name>`
    pub fn subject(&self) -> String {
        format!("{}.{}", SUBJECT_PREFIX, self.name())
    }

    /// Resolve the endpoint a request subject is addressed to.
    pub fn from_subject(subject: &str) -> Result<Self, EndpointError> {
        subject
            .strip_prefix(SUBJECT_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| EndpointError::UnknownEndpoint(subject.to_string()))?
            .parse()
    }

    fn handler(&self) -> Handler {
        match self {
            Endpoint::Min => min,
            Endpoint::Max => max,
            Endpoint::Average => average,
        }
    }

    pub fn apply(&self, input: &[i64]) -> Result<EndpointOutput, EndpointError> {
        (self.handler())(input)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .into_iter()
            .find(|endpoint| endpoint.name() == s)
            .ok_or_else(|| EndpointError::UnknownEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn min(input: &[i64]) -> Result<EndpointOutput, EndpointError> {
    let value = input.iter().copied().min().ok_or(EndpointError::EmptyInput)?;
    Ok(EndpointOutput::Min { value })
}

fn max(input: &[i64]) -> Result<EndpointOutput, EndpointError> {
    let value = input.iter().copied().max().ok_or(EndpointError::EmptyInput)?;
    Ok(EndpointOutput::Max { value })
}

fn average(input: &[i64]) -> Result<EndpointOutput, EndpointError> {
    if input.is_empty() {
        return Err(EndpointError::EmptyInput);
    }
    // i128 so the sum of many large values cannot overflow
    let sum: i128 = input.iter().map(|&v| i128::from(v)).sum();
    Ok(EndpointOutput::Average {
        value: sum as f64 / input.len() as f64,
    })
}

/// Parse `payload` and run the endpoint called `name`.
pub fn dispatch(name: &str, payload: &[u8]) -> Result<EndpointOutput, EndpointError> {
    let endpoint: Endpoint = name.parse()?;
    let input: Vec<i64> = serde_json::from_slice(payload)?;
    endpoint.apply(&input)
}

#[cfg(feature = "nats")]
pub use service::{request, serve};

#[cfg(feature = "nats")]
mod service {
    use super::{Endpoint, Reply, SUBJECT_PREFIX, dispatch};
    use eyre::{Result, WrapErr};
    use futures::StreamExt;
    use tokio::sync::watch;
    use tracing::{debug, info, warn};

    /// Answer endpoint requests until `shutdown` flips to true.
    pub async fn serve(client: async_nats::Client, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let wildcard = format!("{}.*", SUBJECT_PREFIX);
        let mut requests = client
            .subscribe(wildcard.clone())
            .await
            .wrap_err_with(|| format!("Failed to subscribe to {}", wildcard))?;
        info!(subject = %wildcard, "Endpoints listening");

        loop {
            tokio::select! {
                request = requests.next() => {
                    let Some(request) = request else { break };
                    let Some(reply_to) = request.reply.clone() else {
                        warn!(subject = %request.subject, "Request without reply subject, dropping");
                        continue;
                    };

                    let subject: &str = &request.subject;
                    let result = Endpoint::from_subject(subject)
                        .and_then(|endpoint| dispatch(endpoint.name(), &request.payload));
                    let reply = Reply::from(result);
                    debug!(subject, ?reply, "Answering request");

                    let body = serde_json::to_vec(&reply).wrap_err("Failed to encode reply")?;
                    client
                        .publish(reply_to, body.into())
                        .await
                        .wrap_err("Failed to publish reply")?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Endpoints stopped");
        Ok(())
    }

    /// Call `endpoint` over request/reply.
    pub async fn request(client: &async_nats::Client, endpoint: Endpoint, input: &[i64]) -> Result<Reply> {
        let payload = serde_json::to_vec(input).wrap_err("Failed to encode request")?;
        let response = client
            .request(endpoint.subject(), payload.into())
            .await
            .wrap_err_with(|| format!("Request to {} failed", endpoint.subject()))?;
        serde_json::from_slice(&response.payload).wrap_err("Failed to decode reply")
    }
}
