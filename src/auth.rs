//! Authentication
//!
//! Credentials and the hook that negotiates them on a socket.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::{self, Command};
use crate::error::{Error, Result};
use crate::socket::Socket;

/// Default credential mechanism
pub const DEFAULT_MECHANISM: &str = "SCRAM-SHA-1";

/// Login credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,

    /// Database the user is defined in
    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default = "default_mechanism")]
    pub mechanism: String,
}

fn default_source() -> String {
    "admin".to_string()
}

fn default_mechanism() -> String {
    DEFAULT_MECHANISM.to_string()
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source: source.into(),
            mechanism: default_mechanism(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Negotiates a credential on a freshly acquired socket
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, socket: &Socket, cred: &Credential) -> Result<()>;
}

/// Sends the credential as a single `authenticate` command
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandAuthenticator;

#[async_trait]
impl Authenticator for CommandAuthenticator {
    async fn login(&self, socket: &Socket, cred: &Credential) -> Result<()> {
        let cmd = Command::Authenticate {
            mechanism: cred.mechanism.clone(),
            source: cred.source.clone(),
            user: cred.username.clone(),
            password: cred.password.clone(),
        };
        command::run(socket, &cred.source, &cmd, true)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                Error::Command { message, .. } => Error::Auth {
                    user: cred.username.clone(),
                    database: cred.source.clone(),
                    reason: message,
                },
                other => other,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let cred = Credential::new("app", "hunter2", "app");
        let shown = format!("{:?}", cred);
        assert!(shown.contains("app"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_defaults_from_toml() {
        let cred: Credential = toml::from_str("username = \"u\"\npassword = \"p\"\n").unwrap();
        assert_eq!(cred.source, "admin");
        assert_eq!(cred.mechanism, DEFAULT_MECHANISM);
    }
}
