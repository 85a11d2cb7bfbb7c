//! Authentication challenge types and the client-level handler contract

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Authentication scheme a server challenged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    Default,
    HttpBasic,
    HttpDigest,
    HtmlForm,
    Negotiate,
    Ntlm,
    ClientCertificate,
    ServerTrust,
}

impl ChallengeKind {
    /// Map a `WWW-Authenticate` scheme token to a challenge kind
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(ChallengeKind::HttpBasic),
            "digest" => Some(ChallengeKind::HttpDigest),
            "negotiate" => Some(ChallengeKind::Negotiate),
            "ntlm" => Some(ChallengeKind::Ntlm),
            "form" | "htmlform" => Some(ChallengeKind::HtmlForm),
            "bearer" | "default" => Some(ChallengeKind::Default),
            _ => None,
        }
    }

    /// Parse the scheme out of a full `WWW-Authenticate` header value.
    /// Unknown schemes are treated as [`ChallengeKind::Default`].
    pub fn from_header(value: &str) -> Self {
        let scheme = value.split_whitespace().next().unwrap_or_default();
        Self::from_scheme(scheme).unwrap_or(ChallengeKind::Default)
    }

    /// Challenges of these kinds count against `max_auth_retry`
    pub fn is_retry_capped(&self) -> bool {
        matches!(self, ChallengeKind::Default | ChallengeKind::HttpBasic)
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengeKind::Default => "default",
            ChallengeKind::HttpBasic => "basic",
            ChallengeKind::HttpDigest => "digest",
            ChallengeKind::HtmlForm => "form",
            ChallengeKind::Negotiate => "negotiate",
            ChallengeKind::Ntlm => "ntlm",
            ChallengeKind::ClientCertificate => "client-certificate",
            ChallengeKind::ServerTrust => "server-trust",
        };
        f.write_str(name)
    }
}

/// An authentication challenge raised by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub realm: Option<String>,
    pub host: Option<String>,
    /// How many times this transfer has already been challenged
    pub previous_failure_count: u32,
}

impl Challenge {
    pub fn new(kind: ChallengeKind) -> Self {
        Self { kind, realm: None, host: None, previous_failure_count: 0 }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_previous_failures(mut self, count: u32) -> Self {
        self.previous_failure_count = count;
        self
    }
}

/// Credential handed back to the transport
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic { username: username.into(), password: password.into() }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credential::Bearer(token.into())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credential::Bearer(_) => f.debug_tuple("Bearer").field(&"***").finish(),
        }
    }
}

/// How the transport should proceed with a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    UseCredential(Credential),
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

/// Client-level authentication handler.
///
/// Returning `Err` records a failure on the challenged task and cancels the
/// challenge; returning `Ok` leaves the task's outcome untouched.
pub trait AuthenticationHandler: Send + Sync {
    fn handle(&self, challenge: &Challenge) -> Result<Disposition, TaskError>;
}

impl<F> AuthenticationHandler for F
where
    F: Fn(&Challenge) -> Result<Disposition, TaskError> + Send + Sync,
{
    fn handle(&self, challenge: &Challenge) -> Result<Disposition, TaskError> {
        self(challenge)
    }
}

/// Handler that always answers with the same basic credential
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }
}

impl AuthenticationHandler for StaticCredentials {
    fn handle(&self, challenge: &Challenge) -> Result<Disposition, TaskError> {
        match challenge.kind {
            ChallengeKind::ServerTrust | ChallengeKind::ClientCertificate => {
                Ok(Disposition::PerformDefaultHandling)
            }
            _ => Ok(Disposition::UseCredential(self.credential.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_mapping() {
        assert_eq!(ChallengeKind::from_scheme("Basic"), Some(ChallengeKind::HttpBasic));
        assert_eq!(ChallengeKind::from_scheme("DIGEST"), Some(ChallengeKind::HttpDigest));
        assert_eq!(ChallengeKind::from_scheme("NTLM"), Some(ChallengeKind::Ntlm));
        assert_eq!(ChallengeKind::from_scheme("Hoba"), None);
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(
            ChallengeKind::from_header(r#"Basic realm="api", charset="UTF-8""#),
            ChallengeKind::HttpBasic
        );
        assert_eq!(ChallengeKind::from_header("Mutual realm=x"), ChallengeKind::Default);
        assert_eq!(ChallengeKind::from_header(""), ChallengeKind::Default);
    }

    #[test]
    fn test_retry_cap_classification() {
        assert!(ChallengeKind::Default.is_retry_capped());
        assert!(ChallengeKind::HttpBasic.is_retry_capped());
        assert!(!ChallengeKind::HttpDigest.is_retry_capped());
        assert!(!ChallengeKind::ServerTrust.is_retry_capped());
    }

    #[test]
    fn test_credential_debug_hides_secrets() {
        let debug = format!("{:?}", Credential::basic("alice", "hunter2"));
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_closure_handler() {
        let handler = |challenge: &Challenge| {
            if challenge.previous_failure_count > 1 {
                Err(TaskError::domain("too many attempts"))
            } else {
                Ok(Disposition::UseCredential(Credential::bearer("t0k")))
            }
        };
        let first = Challenge::new(ChallengeKind::HttpBasic);
        assert!(matches!(handler.handle(&first), Ok(Disposition::UseCredential(_))));
        let later = Challenge::new(ChallengeKind::HttpBasic).with_previous_failures(2);
        assert!(handler.handle(&later).is_err());
    }
}
