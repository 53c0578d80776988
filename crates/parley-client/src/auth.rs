//! Bearer token lookup.
//!
//! The engine never stores credentials; it asks a [`TokenSource`] each time
//! it needs one and treats an absent token as an authentication failure.

use std::sync::RwLock;

use crate::error::ClientError;

pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A token fixed at construction, replaceable by the shell after a login.
#[derive(Debug, Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }
}

pub(crate) fn require_token(source: &dyn TokenSource) -> Result<String, ClientError> {
    source
        .token()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ClientError::Auth("no token available".to_string()))
}
