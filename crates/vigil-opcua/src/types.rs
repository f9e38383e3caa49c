// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Endpoint and security descriptor types.
//!
//! An [`Endpoint`] is the address plus security profile of one remote
//! automation server. It is immutable once a session has been created from it.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vigil_core::error::{SessionError, SessionResult};

/// URL scheme accepted for endpoints.
pub const ENDPOINT_SCHEME: &str = "opc.tcp://";

// =============================================================================
// SecurityPolicy
// =============================================================================

/// Security policy for the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security policy (use with `SecurityMode::None`).
    #[default]
    None,

    /// Basic128Rsa15 (deprecated, for legacy systems).
    Basic128Rsa15,

    /// Basic256 (deprecated, for legacy systems).
    Basic256,

    /// Basic256Sha256 (recommended minimum).
    Basic256Sha256,
}

impl SecurityPolicy {
    /// Returns the policy URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic128Rsa15 => "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
            Self::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
        }
    }

    /// Returns the short name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Basic128Rsa15 => "Basic128Rsa15",
            Self::Basic256 => "Basic256",
            Self::Basic256Sha256 => "Basic256Sha256",
        }
    }

    /// Returns `true` if this policy is deprecated.
    pub const fn is_deprecated(&self) -> bool {
        matches!(self, Self::Basic128Rsa15 | Self::Basic256)
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// SecurityMode
// =============================================================================

/// Message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No message security.
    #[default]
    None,

    /// Messages are signed.
    Sign,

    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Sign => write!(f, "Sign"),
            Self::SignAndEncrypt => write!(f, "SignAndEncrypt"),
        }
    }
}

// =============================================================================
// SecurityDescriptor
// =============================================================================

/// Security configuration of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityDescriptor {
    /// Security policy.
    #[serde(default)]
    pub policy: SecurityPolicy,

    /// Message security mode.
    #[serde(default)]
    pub mode: SecurityMode,

    /// Client certificate (DER or PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<PathBuf>,

    /// Client private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
}

impl SecurityDescriptor {
    /// Creates a descriptor for an unsecured channel.
    pub fn none() -> Self {
        Self::default()
    }

    /// Creates a descriptor with the given policy and mode.
    pub fn new(policy: SecurityPolicy, mode: SecurityMode) -> Self {
        Self {
            policy,
            mode,
            certificate_path: None,
            private_key_path: None,
        }
    }

    /// Sets the client certificate and key paths.
    pub fn with_certificate(
        mut self,
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
    ) -> Self {
        self.certificate_path = Some(certificate_path.into());
        self.private_key_path = Some(private_key_path.into());
        self
    }

    /// Returns `true` if the channel is secured.
    pub fn is_secure(&self) -> bool {
        self.mode != SecurityMode::None
    }

    /// Validates that policy, mode and credentials are consistent.
    pub fn validate(&self) -> SessionResult<()> {
        match (self.policy, self.mode) {
            (SecurityPolicy::None, SecurityMode::None) => Ok(()),
            (SecurityPolicy::None, mode) => Err(SessionError::invalid_argument(format!(
                "security mode {} requires a security policy",
                mode
            ))),
            (policy, SecurityMode::None) => Err(SessionError::invalid_argument(format!(
                "security policy {} requires mode Sign or SignAndEncrypt",
                policy
            ))),
            _ if self.certificate_path.is_none() || self.private_key_path.is_none() => {
                Err(SessionError::invalid_argument(
                    "secured endpoints require certificate_path and private_key_path",
                ))
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// Address and security profile of a remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    url: String,
    #[serde(default)]
    security: SecurityDescriptor,
}

impl Endpoint {
    /// Creates an unsecured endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            security: SecurityDescriptor::none(),
        }
    }

    /// Replaces the security descriptor.
    pub fn with_security(mut self, security: SecurityDescriptor) -> Self {
        self.security = security;
        self
    }

    /// Returns the endpoint URL.
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the security descriptor.
    #[inline]
    pub fn security(&self) -> &SecurityDescriptor {
        &self.security
    }

    /// Returns the `host:port` part of the URL.
    pub fn authority(&self) -> Option<&str> {
        let rest = self.url.strip_prefix(ENDPOINT_SCHEME)?;
        let authority = rest.split('/').next().unwrap_or(rest);
        (!authority.is_empty()).then_some(authority)
    }

    /// Validates the URL and the security descriptor.
    pub fn validate(&self) -> SessionResult<()> {
        if !self.url.starts_with(ENDPOINT_SCHEME) {
            return Err(SessionError::invalid_argument(format!(
                "endpoint '{}' must start with {}",
                self.url, ENDPOINT_SCHEME
            )));
        }
        if self.authority().is_none() {
            return Err(SessionError::invalid_argument(format!(
                "endpoint '{}' has no host",
                self.url
            )));
        }
        self.security.validate()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_validation() {
        let endpoint = Endpoint::new("opc.tcp://plc-01:4840/line");
        assert!(endpoint.validate().is_ok());
        assert_eq!(endpoint.authority(), Some("plc-01:4840"));

        assert!(Endpoint::new("http://plc-01:4840").validate().is_err());
        assert!(Endpoint::new("opc.tcp://").validate().is_err());
    }

    #[test]
    fn test_security_descriptor() {
        assert!(SecurityDescriptor::none().validate().is_ok());

        let missing_cert =
            SecurityDescriptor::new(SecurityPolicy::Basic256Sha256, SecurityMode::SignAndEncrypt);
        assert!(missing_cert.validate().is_err());

        let complete = missing_cert.with_certificate("pki/own/cert.der", "pki/private/key.pem");
        assert!(complete.validate().is_ok());
        assert!(complete.is_secure());

        let mismatched = SecurityDescriptor::new(SecurityPolicy::None, SecurityMode::Sign);
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn test_security_policy() {
        assert!(SecurityPolicy::Basic256.is_deprecated());
        assert!(!SecurityPolicy::Basic256Sha256.is_deprecated());
        assert!(SecurityPolicy::None.uri().ends_with("#None"));
    }

    #[test]
    fn test_endpoint_serde() {
        let endpoint: Endpoint =
            serde_json::from_str(r#"{"url": "opc.tcp://localhost:4840"}"#).unwrap();
        assert_eq!(endpoint.url(), "opc.tcp://localhost:4840");
        assert_eq!(endpoint.security().policy, SecurityPolicy::None);
    }
}
