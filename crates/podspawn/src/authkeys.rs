//! `AuthorizedKeysCommand` handler.
//!
//! Reads the stored public keys for a user from `<key_dir>/<user>` and
//! writes them back as authorized_keys lines that pin the session to
//! `podspawn spawn --user <user>` with a fixed option set. sshd treats empty
//! output as "no keys here" and falls through to its other auth methods.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use crate::identity::{Identity, InvalidIdentity};

/// Options attached to every emitted key. `restrict` disables everything,
/// the rest re-enable what a dev shell needs.
pub const KEY_OPTIONS: &str = "restrict,pty,agent-forwarding,port-forwarding,X11-forwarding";

/// Subcommand the forced command enters.
pub const SPAWN_SUBCOMMAND: &str = "spawn";

/// Flag naming the user on the forced command line.
pub const USER_FLAG: &str = "--user";

#[derive(Debug, Error)]
pub enum AuthKeysError {
    #[error(transparent)]
    InvalidIdentity(#[from] InvalidIdentity),

    #[error("reading keys for {identity}: {source}")]
    Read {
        identity: String,
        written: usize,
        #[source]
        source: io::Error,
    },

    #[error("writing key for {identity}: {source}")]
    Write {
        identity: String,
        written: usize,
        #[source]
        source: io::Error,
    },
}

impl AuthKeysError {
    /// Lines already written before the failure. Those lines are complete
    /// and valid.
    pub fn written(&self) -> usize {
        match self {
            AuthKeysError::InvalidIdentity(_) => 0,
            AuthKeysError::Read { written, .. } | AuthKeysError::Write { written, .. } => *written,
        }
    }
}

/// One stored public key line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    line: String,
}

impl CredentialRecord {
    /// Parse a key file line. Blank lines and `#` comments yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        Some(Self {
            line: line.to_string(),
        })
    }

    /// Key type token, e.g. `ssh-ed25519`.
    pub fn key_type(&self) -> &str {
        self.line
            .split_whitespace()
            .next()
            .unwrap_or(self.line.as_str())
    }

    /// Everything after the key type (key material and optional comment).
    pub fn material(&self) -> &str {
        self.line
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim_start())
            .unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }
}

/// The command sshd is forced to run for `identity`.
pub fn forced_command(binary: &Path, identity: &Identity) -> String {
    format!(
        "{} {SPAWN_SUBCOMMAND} {USER_FLAG} {identity}",
        binary.display()
    )
}

/// Render one authorized_keys line (without trailing newline).
pub fn authorized_line(binary: &Path, identity: &Identity, record: &CredentialRecord) -> String {
    format!(
        "command=\"{}\",{KEY_OPTIONS} {}",
        forced_command(binary, identity),
        record.as_str()
    )
}

/// Write authorized_keys lines for `identity` to `out`.
///
/// Returns the number of keys written. A missing key file is not an error:
/// nothing is written and 0 is returned.
pub fn lookup<W: Write>(
    identity: &str,
    key_dir: &Path,
    binary: &Path,
    out: &mut W,
) -> Result<usize, AuthKeysError> {
    let identity = Identity::parse(identity)?;

    let key_file = key_dir.join(identity.as_str());
    let file = match File::open(&key_file) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(AuthKeysError::Read {
                identity: identity.to_string(),
                written: 0,
                source,
            });
        }
    };

    let mut written = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| AuthKeysError::Read {
            identity: identity.to_string(),
            written,
            source,
        })?;
        let Some(record) = CredentialRecord::parse(&line) else {
            continue;
        };
        writeln!(out, "{}", authorized_line(binary, &identity, &record)).map_err(|source| {
            AuthKeysError::Write {
                identity: identity.to_string(),
                written,
                source,
            }
        })?;
        written += 1;
    }

    out.flush().map_err(|source| AuthKeysError::Write {
        identity: identity.to_string(),
        written,
        source,
    })?;

    Ok(written)
}
