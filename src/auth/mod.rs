//! Authentication and Authorization
//!
//! The protocol engine consults one [`AuthService`] at CONNECT (credentials,
//! then `Access::Connect`), on every PUBLISH (`Access::Publish`) and for
//! each filter of a SUBSCRIBE (`Access::Subscribe`). Backends implement the
//! trait; [`CompositeAuth`] chains them.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::protocol::QoS;


/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Connect,
    Publish,
    Subscribe,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Connect => "connect",
            Access::Publish => "publish",
            Access::Subscribe => "subscribe",
        }
    }
}

/// Authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Allow,
    Deny,
}

impl Authority {
    pub fn is_allowed(self) -> bool {
        self == Authority::Allow
    }
}

/// Everything an authorizer is told about a request
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub username: Option<&'a str>,
    pub ip: IpAddr,
    pub client_id: &'a str,
    /// Topic name for publish, filter for subscribe, empty for connect
    pub topic: &'a str,
    pub qos: QoS,
    pub access: Access,
}

/// Backend failure; the broker answers CONNACK "server unavailable"
#[derive(Debug)]
pub enum AuthError {
    Backend(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Backend(msg) => write!(f, "auth backend error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Check credentials
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool, AuthError>;

    /// Decide whether the request may proceed
    async fn authorize(&self, request: &AccessRequest<'_>) -> Result<Authority, AuthError>;
}

/// Accepts everything
pub struct AllowAll;

#[async_trait]
impl AuthService for AllowAll {
    async fn authenticate(&self, _: Option<&str>, _: Option<&[u8]>) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn authorize(&self, _: &AccessRequest<'_>) -> Result<Authority, AuthError> {
        Ok(Authority::Allow)
    }
}

enum Secret {
    Plain(String),
    /// argon2 PHC string
    Hash(String),
}

/// Users from the `[auth]` section
pub struct StaticAuth {
    enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, Secret>,
}

impl StaticAuth {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .filter_map(|user| {
                let secret = match (&user.password, &user.password_hash) {
                    (_, Some(hash)) => Secret::Hash(hash.clone()),
                    (Some(password), None) => Secret::Plain(password.clone()),
                    (None, None) => return None,
                };
                Some((user.username.clone(), secret))
            })
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn verify(secret: &Secret, password: &[u8]) -> bool {
        match secret {
            Secret::Plain(stored) => stored.as_bytes() == password,
            Secret::Hash(phc) => match PasswordHash::new(phc) {
                Ok(parsed) => Argon2::default().verify_password(password, &parsed).is_ok(),
                Err(e) => {
                    warn!("Unusable password hash: {}", e);
                    false
                }
            },
        }
    }
}

#[async_trait]
impl AuthService for StaticAuth {
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool, AuthError> {
        if !self.enabled {
            return Ok(true);
        }

        let Some(username) = username else {
            return Ok(self.allow_anonymous);
        };

        let Some(secret) = self.users.get(username) else {
            debug!("Unknown user '{}'", username);
            return Ok(false);
        };

        Ok(Self::verify(secret, password.unwrap_or(&[])))
    }

    async fn authorize(&self, _: &AccessRequest<'_>) -> Result<Authority, AuthError> {
        Ok(Authority::Allow)
    }
}

/// Every member must authenticate; the first deny wins
pub struct CompositeAuth {
    members: Vec<Arc<dyn AuthService>>,
}

impl CompositeAuth {
    pub fn new(members: Vec<Arc<dyn AuthService>>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl AuthService for CompositeAuth {
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<bool, AuthError> {
        for member in &self.members {
            if !member.authenticate(username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn authorize(&self, request: &AccessRequest<'_>) -> Result<Authority, AuthError> {
        for member in &self.members {
            if member.authorize(request).await? == Authority::Deny {
                return Ok(Authority::Deny);
            }
        }
        Ok(Authority::Allow)
    }
}
