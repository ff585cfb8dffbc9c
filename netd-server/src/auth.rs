//! Connection authentication gate.
//!
//! A new provider is checked against the class authenticator first and the
//! class's static credential list second. Either one admitting is enough.
//! Static credentials are compared by exact string equality.

use crate::config::{match_credentials, AuthConfig, Credential};
use crate::info::ConnClass;
use crate::provider::{ClientAuth, Provider};
use std::fmt;
use std::sync::Arc;

/// Pluggable credential check for one connection class.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, auth: &dyn ClientAuth) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&dyn ClientAuth) -> bool + Send + Sync,
{
    fn authenticate(&self, auth: &dyn ClientAuth) -> bool {
        self(auth)
    }
}

/// Outcome of the gate for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Admit,
    RejectNoAuthCapability,
    RejectCredentialsInvalid,
}

impl AuthDecision {
    /// Message sent to the peer before its provider is closed.
    pub fn rejection_message(&self) -> Option<&'static str> {
        match self {
            AuthDecision::Admit => None,
            AuthDecision::RejectNoAuthCapability => {
                Some("Error: Provider has no authentication. Authentication needed")
            }
            AuthDecision::RejectCredentialsInvalid => Some("Error: Authentication failed"),
        }
    }

    /// Label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthDecision::Admit => "admitted",
            AuthDecision::RejectNoAuthCapability => "no_auth_capability",
            AuthDecision::RejectCredentialsInvalid => "invalid_credentials",
        }
    }
}

/// Authentication settings for one connection class.
#[derive(Clone, Default)]
pub struct AuthPolicy {
    pub enabled: bool,
    pub required: bool,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub credentials: Vec<Credential>,
}

impl AuthPolicy {
    /// Builds the policy for `class` from configuration plus an optional
    /// injected authenticator.
    pub fn for_class(
        config: &AuthConfig,
        class: ConnClass,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            required: config.required,
            authenticator,
            credentials: config.credentials(class).to_vec(),
        }
    }

    /// Whether anything could ever admit a credentialed provider.
    pub fn has_source(&self) -> bool {
        self.authenticator.is_some() || !self.credentials.is_empty()
    }

    pub fn evaluate(&self, provider: &dyn Provider) -> AuthDecision {
        if !self.enabled {
            return AuthDecision::Admit;
        }

        let auth = match provider.client_auth() {
            Some(auth) => auth,
            None if self.required => return AuthDecision::RejectNoAuthCapability,
            None => return AuthDecision::Admit,
        };

        if let Some(ref authenticator) = self.authenticator {
            if authenticator.authenticate(auth) {
                return AuthDecision::Admit;
            }
            tracing::debug!(
                "Authenticator rejected '{}', checking static credentials",
                auth.credentials().username
            );
        }

        if match_credentials(&self.credentials, &auth.credentials()) {
            return AuthDecision::Admit;
        }

        AuthDecision::RejectCredentialsInvalid
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("enabled", &self.enabled)
            .field("required", &self.required)
            .field("authenticator", &self.authenticator.is_some())
            .field("credentials", &self.credentials.len())
            .finish()
    }
}
