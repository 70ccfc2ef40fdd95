// Credential check for vote requests, backed by credentials.toml.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::config::CredentialsConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown user `{0}`")]
    UserNotFound(String),

    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Static login -> (password, user id) table.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, (String, Uuid)>,
}

impl CredentialStore {
    pub fn from_config(config: &CredentialsConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.login.clone(), (u.password.clone(), u.id)))
            .collect();
        CredentialStore { users }
    }

    /// Resolve `login`/`password` to the user's id.
    pub fn authenticate(&self, login: &str, password: &str) -> Result<Uuid, AuthError> {
        let (expected, id) = self
            .users
            .get(login)
            .ok_or_else(|| AuthError::UserNotFound(login.to_string()))?;
        if expected != password {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(*id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
