use std::collections::HashMap;
use std::fmt;

use reqwest::RequestBuilder;
use url::Url;

use super::error::TransportError;

/// Credentials attached to requests sent to an endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum EndpointCredentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl EndpointCredentials {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            EndpointCredentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            EndpointCredentials::Bearer(token) => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for EndpointCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointCredentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            EndpointCredentials::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}

/// A remote bus instance known to the local configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: Url,
    pub credentials: Option<EndpointCredentials>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, address: Url) -> Self {
        Self {
            name: name.into(),
            address: with_trailing_slash(address),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: EndpointCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Normalizes a base address so that relative paths join below it rather
/// than replacing its last segment.
pub fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Read-only set of endpoints, addressable by name or by base address.
#[derive(Debug, Clone, Default)]
pub struct EndpointCollection {
    endpoints: HashMap<String, Endpoint>,
}

impl EndpointCollection {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect(),
        }
    }

    pub fn by_name(&self, name: &str) -> Result<&Endpoint, TransportError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| TransportError::EndpointNotFound(name.to_string()))
    }

    pub fn by_address(&self, address: &Url) -> Option<&Endpoint> {
        let address = with_trailing_slash(address.clone());
        self.endpoints.values().find(|e| e.address == address)
    }

    pub fn credentials_for(&self, address: &Url) -> Option<EndpointCredentials> {
        self.by_address(address).and_then(|e| e.credentials.clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
