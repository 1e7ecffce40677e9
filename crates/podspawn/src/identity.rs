//! Identity validation.
//!
//! The identity is the sshd username. It ends up in a filesystem path (the
//! per-user key file), in a container name and inside the quoted
//! `command="..."` directive handed back to sshd, so it is checked once here
//! and only the validated [`Identity`] type is accepted downstream.

use std::fmt;

use thiserror::Error;

/// Default prefix for sandbox (container) names.
pub const DEFAULT_SANDBOX_PREFIX: &str = "podspawn-";

/// An identity failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identity {identity:?}: {reason}")]
pub struct InvalidIdentity {
    identity: String,
    reason: &'static str,
}

impl InvalidIdentity {
    fn new(identity: &str, reason: &'static str) -> Self {
        Self {
            identity: identity.to_string(),
            reason,
        }
    }

    /// The rejected input.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

/// A validated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Validate a raw identity.
    ///
    /// Rules:
    /// - Not empty
    /// - No path separators (/) or parent-directory sequences (..)
    /// - Only ASCII letters, digits, `.`, `_` and `-`
    /// - Must not start with `-` or `.`
    ///
    /// sshd runs the forced command through the user's shell, so anything
    /// outside this set could be interpreted on the host.
    pub fn parse(raw: &str) -> Result<Self, InvalidIdentity> {
        if raw.is_empty() {
            return Err(InvalidIdentity::new(raw, "identity is empty"));
        }
        if raw.contains('/') {
            return Err(InvalidIdentity::new(raw, "contains path separator"));
        }
        if raw.contains("..") {
            return Err(InvalidIdentity::new(raw, "contains '..' (path traversal)"));
        }
        if !raw.chars().all(is_identity_char) {
            return Err(InvalidIdentity::new(
                raw,
                "only ascii letters, digits, '.', '_' and '-' are allowed",
            ));
        }
        if raw.starts_with('-') || raw.starts_with('.') {
            return Err(InvalidIdentity::new(raw, "must not start with '-' or '.'"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of this identity's sandbox: `prefix` followed by the identity.
    pub fn sandbox_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

fn is_identity_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Identity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_usernames() {
        for name in ["deploy", "ci-runner", "alice_1", "bob.smith", "x"] {
            assert!(Identity::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_path_traversal() {
        for bad in ["../etc/shadow", "deploy/keys", "../../root", "..", "a..b"] {
            let err = Identity::parse(bad).unwrap_err();
            assert_eq!(err.identity(), bad);
        }
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(
            Identity::parse("").unwrap_err().reason(),
            "identity is empty"
        );
    }

    #[test]
    fn rejects_directive_injection() {
        // Would close the command="..." quote or start a new authorized_keys line
        assert!(Identity::parse("deploy\" ssh-rsa AAAA").is_err());
        assert!(Identity::parse("deploy\nssh-rsa AAAA").is_err());
        assert!(Identity::parse("deploy ssh-rsa").is_err());
        assert!(Identity::parse("deploy\0").is_err());
        assert!(Identity::parse("deploy\t").is_err());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in [
            "dev;sh",
            "dev$(sh)",
            "dev|sh",
            "dev`sh`",
            "dev&sh",
            "dev>out",
            "dev'x",
            "d\\ev",
            "dév",
        ] {
            let err = Identity::parse(bad).unwrap_err();
            assert_eq!(
                err.reason(),
                "only ascii letters, digits, '.', '_' and '-' are allowed",
                "{bad}"
            );
        }
    }

    #[test]
    fn rejects_leading_dash_or_dot() {
        assert!(Identity::parse("-oProxyCommand").is_err());
        assert!(Identity::parse(".hidden").is_err());
        assert!(Identity::parse(".").is_err());
        assert!(Identity::parse("a-b.c_d").is_ok());
    }

    #[test]
    fn sandbox_name_is_prefix_plus_identity() {
        let id = Identity::parse("ci-runner").unwrap();
        assert_eq!(id.sandbox_name(DEFAULT_SANDBOX_PREFIX), "podspawn-ci-runner");
        // Stable across calls
        assert_eq!(id.sandbox_name(DEFAULT_SANDBOX_PREFIX), id.sandbox_name("podspawn-"));
        assert_eq!(id.sandbox_name("dev-"), "dev-ci-runner");
    }

    #[test]
    fn parses_via_from_str() {
        let id: Identity = "deploy".parse().unwrap();
        assert_eq!(id.to_string(), "deploy");
        assert!("a/b".parse::<Identity>().is_err());
    }
}
