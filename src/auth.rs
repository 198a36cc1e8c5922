//! Session verification
//!
//! Callers authenticate with a bearer JWT issued by the session provider
//! (HS256, shared secret). The token subject is the account the caller acts
//! as; its role decides whether the caller holds elevated privilege.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::LedgerError;

/// Permission level granted to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Authenticated,
    /// May post manual adjustments and change account status
    Admin,
}

/// A verified caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub account_id: String,
    pub permission: PermissionLevel,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.permission >= PermissionLevel::Admin
    }

    pub fn require_admin(&self) -> Result<(), LedgerError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::Forbidden(
                "elevated privilege required".to_string(),
            ))
        }
    }
}

/// External session provider seam
pub trait SessionVerifier: Send + Sync {
    fn verify(&self, bearer_token: &str) -> Result<Session, LedgerError>;
}

/// Token payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account ID
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Clone)]
pub struct JwtSessionVerifier {
    secret: String,
    audience: String,
    admin_roles: Vec<String>,
}

impl JwtSessionVerifier {
    /// Returns an error if the secret is missing or shorter than 32 characters
    pub fn new(config: &AuthConfig) -> Result<Self, LedgerError> {
        let secret = config
            .jwt_secret
            .clone()
            .ok_or_else(|| LedgerError::Config("auth.jwt_secret is required".to_string()))?;
        if secret.len() < 32 {
            return Err(LedgerError::Config(
                "auth.jwt_secret must be at least 32 characters".to_string(),
            ));
        }

        Ok(Self {
            secret,
            audience: config.audience.clone(),
            admin_roles: config.admin_roles.clone(),
        })
    }

    /// Sign a token for `account_id`. Used by the CLI and tests; production
    /// tokens come from the session provider.
    pub fn issue_token(
        &self,
        account_id: &str,
        role: Option<&str>,
        ttl_secs: u64,
    ) -> Result<String, LedgerError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| LedgerError::Unauthorized(format!("System time error: {}", e)))?
            .as_secs();

        let claims = Claims {
            sub: account_id.to_string(),
            role: role.map(str::to_string),
            aud: self.audience.clone(),
            iat: now,
            exp: now + ttl_secs,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| LedgerError::Unauthorized(format!("Failed to sign token: {}", e)))
    }
}

impl SessionVerifier for JwtSessionVerifier {
    fn verify(&self, bearer_token: &str) -> Result<Session, LedgerError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.as_str()]);

        let data = decode::<Claims>(
            bearer_token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|err| {
            let msg = match err.kind() {
                ErrorKind::ExpiredSignature => "Token expired",
                ErrorKind::InvalidSignature => "Invalid signature",
                ErrorKind::InvalidAudience => "Invalid audience",
                _ => "Invalid token",
            };
            LedgerError::Unauthorized(msg.to_string())
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(LedgerError::Unauthorized("Token has no subject".to_string()));
        }

        let permission = match &claims.role {
            Some(role) if self.admin_roles.iter().any(|r| r == role) => PermissionLevel::Admin,
            _ => PermissionLevel::Authenticated,
        };

        Ok(Session {
            account_id: claims.sub,
            permission,
        })
    }
}
