//! Handshake credential validation.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    #[error("credential rejected")]
    Rejected,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// How handshake credentials are checked.
#[derive(Clone)]
pub enum CredentialPolicy {
    /// Every client presents the same token. Only its SHA-256 digest is kept.
    SharedToken { digest: [u8; 32] },
    /// HS256 JWTs signed with any of `secrets`; `sub` names the client.
    Jwt { secrets: Vec<String> },
    /// Accept anything. Development only.
    Disabled,
}

impl CredentialPolicy {
    pub fn shared_token(token: &str) -> Self {
        CredentialPolicy::SharedToken {
            digest: sha256(token),
        }
    }

    pub fn jwt(secrets: Vec<String>) -> Self {
        CredentialPolicy::Jwt { secrets }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CredentialPolicy::SharedToken { .. } => "shared-token",
            CredentialPolicy::Jwt { .. } => "jwt",
            CredentialPolicy::Disabled => "disabled",
        }
    }
}

impl std::fmt::Debug for CredentialPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Who the client is, once its credential checked out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientClaims {
    sub: String,
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    policy: CredentialPolicy,
}

impl Authenticator {
    pub fn new(policy: CredentialPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    /// Validate a handshake credential. Runs before any sandbox exists.
    pub fn authenticate(&self, credential: &str) -> Result<ClientIdentity, AuthError> {
        match &self.policy {
            CredentialPolicy::Disabled => Ok(ClientIdentity::default()),
            CredentialPolicy::SharedToken { digest } => {
                if credential.is_empty() {
                    return Err(AuthError::Missing);
                }
                if sha256(credential) == *digest {
                    Ok(ClientIdentity::default())
                } else {
                    Err(AuthError::Rejected)
                }
            }
            CredentialPolicy::Jwt { secrets } => {
                if credential.is_empty() {
                    return Err(AuthError::Missing);
                }
                verify_jwt(credential, secrets)
            }
        }
    }
}

fn verify_jwt(token: &str, secrets: &[String]) -> Result<ClientIdentity, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.set_required_spec_claims(&["sub"]);

    let mut last_error = None;
    for secret in secrets {
        match decode::<ClientClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        ) {
            Ok(data) => {
                debug!(client_id = %data.claims.sub, "Client token verified");
                return Ok(ClientIdentity {
                    client_id: Some(data.claims.sub),
                });
            }
            Err(error) => last_error = Some(error),
        }
    }

    match last_error {
        Some(error) => {
            warn!(error = %error, "Client token verification failed");
            Err(AuthError::InvalidToken(error))
        }
        None => {
            warn!("No JWT secrets configured; rejecting token");
            Err(AuthError::Rejected)
        }
    }
}

fn sha256(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
