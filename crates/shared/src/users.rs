use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::local_state::{KEY_CURRENT_USER, LocalStateStore, StateStoreError};
use crate::models::{UserId, UserProfile};

const AUTHORIZED_USERS: [(&str, &str, &str); 2] =
    [("abhay", "Abhay", "boyfriend"), ("piram", "Piram", "girlfriend")];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unauthorized user: {0}")]
    UnauthorizedUser(String),
    #[error(transparent)]
    State(#[from] StateStoreError),
}

pub fn authorized_users() -> Vec<UserProfile> {
    AUTHORIZED_USERS
        .iter()
        .map(|(id, name, relationship)| UserProfile {
            id: UserId::new(*id),
            name: (*name).to_string(),
            display_name: (*name).to_string(),
            relationship: (*relationship).to_string(),
        })
        .collect()
}

pub fn authorize(name: &str) -> Option<UserProfile> {
    let normalized = name.trim().to_ascii_lowercase();
    authorized_users()
        .into_iter()
        .find(|user| user.id.as_str() == normalized)
}

pub fn partner_of(user_id: &UserId) -> Option<UserProfile> {
    if authorize(user_id.as_str()).is_none() {
        return None;
    }

    authorized_users()
        .into_iter()
        .find(|user| &user.id != user_id)
}

/// Login-by-name backed by the local state store.
#[derive(Clone)]
pub struct IdentityStore {
    state: Arc<dyn LocalStateStore>,
}

impl IdentityStore {
    pub fn new(state: Arc<dyn LocalStateStore>) -> Self {
        Self { state }
    }

    pub fn login(&self, name: &str) -> Result<UserProfile, IdentityError> {
        let user =
            authorize(name).ok_or_else(|| IdentityError::UnauthorizedUser(name.to_string()))?;
        self.state.store_json(KEY_CURRENT_USER, &user)?;
        info!(user_id = %user.id, "user logged in");
        Ok(user)
    }

    pub fn current_user(&self) -> Result<Option<UserProfile>, IdentityError> {
        let stored = self.state.load_json::<UserProfile>(KEY_CURRENT_USER)?;
        // Only the predefined identities are honoured, even if the blob was edited.
        Ok(stored.and_then(|user| authorize(user.id.as_str())))
    }

    pub fn logout(&self) -> Result<(), IdentityError> {
        self.state.remove(KEY_CURRENT_USER)?;
        info!("user logged out");
        Ok(())
    }
}
