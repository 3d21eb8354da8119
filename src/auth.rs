//! Caller authentication for the HTTP boundary.
//!
//! Static username/password checks and issued bearer tokens sit behind one
//! [`Authenticator`] capability. The store and resolver never see a
//! [`Principal`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
};
use uuid::Uuid;

use crate::error::{Result, ServiceError};

const BAD_CREDENTIALS: &str = "Incorrect username or password";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credentials {
    /// Parse an `Authorization` header value.
    pub fn from_header(value: &str) -> Result<Self> {
        let (scheme, rest) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| unauthorized("malformed Authorization header"))?;
        let rest = rest.trim();

        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD
                .decode(rest)
                .map_err(|_| unauthorized("Basic credentials are not valid base64"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| unauthorized("Basic credentials are not valid UTF-8"))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| unauthorized("Basic credentials lack a ':' separator"))?;
            Ok(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            })
        } else if scheme.eq_ignore_ascii_case("bearer") && !rest.is_empty() {
            Ok(Credentials::Bearer(rest.to_string()))
        } else {
            Err(unauthorized("unsupported authorization scheme"))
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<Principal>;
}

impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        (**self).authenticate(credentials)
    }
}

fn unauthorized(reason: &str) -> ServiceError {
    ServiceError::Unauthorized(reason.to_string())
}

/// A single configured username and password.
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        match credentials {
            Credentials::Basic { username, password }
                if *username == self.username && *password == self.password =>
            {
                Ok(Principal {
                    name: username.clone(),
                })
            }
            _ => Err(unauthorized(BAD_CREDENTIALS)),
        }
    }
}

/// Bearer tokens handed out earlier. Only SHA-256 digests are kept.
#[derive(Default)]
pub struct IssuedTokens {
    digests: RwLock<HashSet<String>>,
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl IssuedTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token. The plain value is returned once and not stored.
    pub fn issue(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.register(&token);
        token
    }

    /// Accept a pre-shared token.
    pub fn register(&self, token: &str) {
        self.digests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest(token));
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.digests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&digest(token))
    }
}

impl Authenticator for IssuedTokens {
    fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        let Credentials::Bearer(token) = credentials else {
            return Err(unauthorized(BAD_CREDENTIALS));
        };
        let digest = digest(token);
        let known = self
            .digests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&digest);
        if known {
            Ok(Principal {
                name: format!("token:{}", &digest[..12]),
            })
        } else {
            Err(unauthorized("unknown or revoked token"))
        }
    }
}

/// Accepts whichever inner authenticator succeeds first.
pub struct AnyOf(pub Vec<Box<dyn Authenticator>>);

impl Authenticator for AnyOf {
    fn authenticate(&self, credentials: &Credentials) -> Result<Principal> {
        self.0
            .iter()
            .find_map(|auth| auth.authenticate(credentials).ok())
            .ok_or_else(|| unauthorized(BAD_CREDENTIALS))
    }
}
