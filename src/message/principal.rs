use serde::{Deserialize, Serialize};

/// Current layout version written by [`SenderPrincipal::to_json`].
pub const PRINCIPAL_FORMAT_VERSION: u8 = 1;

/// A single identity claim carried with the sender principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub kind: String,
    pub value: String,
}

/// Identity of the party that enqueued a message.
///
/// Stored alongside queued messages as a small versioned JSON record so
/// that it survives restarts and can be read by any backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderPrincipal {
    pub version: u8,
    pub name: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

#[derive(Debug, thiserror::Error)]
pub enum PrincipalError {
    #[error("unsupported principal format version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed principal record: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl SenderPrincipal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: PRINCIPAL_FORMAT_VERSION,
            name: name.into(),
            claims: Vec::new(),
        }
    }

    pub fn with_claim(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.push(Claim {
            kind: kind.into(),
            value: value.into(),
        });
        self
    }

    /// Returns the values of every claim of the given kind.
    pub fn claim_values<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.claims
            .iter()
            .filter(move |c| c.kind == kind)
            .map(|c| c.value.as_str())
    }

    pub fn to_json(&self) -> Result<String, PrincipalError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PrincipalError> {
        let principal: SenderPrincipal = serde_json::from_str(json)?;
        if principal.version != PRINCIPAL_FORMAT_VERSION {
            return Err(PrincipalError::UnsupportedVersion(principal.version));
        }
        Ok(principal)
    }
}
