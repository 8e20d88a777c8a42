//! Endpoint lists and the shared fallback-iteration loop (spec.md §4.5
//! "Endpoint iteration").

use crate::error::handlers::TransferErrorHandler;
use crate::error::TransferError;
use async_trait::async_trait;
use futures::future::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub version: Version,
}

impl Endpoint {
    pub fn v2(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: Version::V2 }
    }

    pub fn v1(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: Version::V1 }
    }
}

/// Looks up the ordered list of endpoints to try for a repository's
/// canonical name (spec.md §4.5 "Look up the endpoint list").
#[async_trait]
pub trait EndpointList: Send + Sync {
    async fn endpoints_for(&self, canonical_name: &str) -> Vec<Endpoint>;
}

/// A fixed, test-friendly [`EndpointList`].
pub struct StaticEndpointList(pub Vec<Endpoint>);

#[async_trait]
impl EndpointList for StaticEndpointList {
    async fn endpoints_for(&self, _canonical_name: &str) -> Vec<Endpoint> {
        self.0.clone()
    }
}

/// Drives `attempt` over `endpoints` in order. `attempt` returns
/// `(fallback, err)`: `fallback == true` means try the next endpoint
/// (recording `err` if present); `false` means stop, success or not.
///
/// `NoSupport` errors are deprioritized: they're only surfaced as the
/// final error if every endpoint returned one (spec.md §4.5 "Errors of
/// `NoSupport` kind are deprioritized").
pub async fn run_with_fallback<'a, F>(endpoints: &'a [Endpoint], mut attempt: F) -> Result<(), TransferError>
where
    F: FnMut(&'a Endpoint) -> BoxFuture<'a, (bool, Option<TransferError>)>,
{
    if endpoints.is_empty() {
        return Err(TransferError::EndpointFallback("no endpoints configured".to_string()));
    }

    let mut errors: Vec<TransferError> = Vec::new();

    for endpoint in endpoints {
        let (fallback, err) = attempt(endpoint).await;
        if !fallback {
            return match err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        if let Some(e) = err {
            errors.push(e);
        }
    }

    Err(TransferErrorHandler::summarize(&errors)
        .cloned()
        .unwrap_or_else(|| TransferError::EndpointFallback("all endpoints failed".to_string())))
}
