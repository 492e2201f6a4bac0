use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("email already registered")]
    EmailTaken,
}

impl NewUser {
    /// Validate a request body: an object with a string `email` and an
    /// optional string `username`.
    pub fn from_body(body: &Value) -> Result<Self, UserError> {
        let obj = body
            .as_object()
            .ok_or_else(|| UserError::InvalidPayload("body must be a JSON object".into()))?;

        let email = match obj.get("email") {
            Some(Value::String(s)) if s.contains('@') => s.trim().to_string(),
            Some(Value::String(_)) => {
                return Err(UserError::InvalidPayload("email is not an address".into()))
            }
            Some(_) => return Err(UserError::InvalidPayload("email must be a string".into())),
            None => return Err(UserError::InvalidPayload("email is required".into())),
        };

        let username = match obj.get("username") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(UserError::InvalidPayload("username must be a string".into()))
            }
        };

        Ok(Self { email, username })
    }
}

/// In-process user registry standing in for the service's persistence layer.
/// Emails are unique, compared case-insensitively.
#[derive(Default)]
pub struct UserDirectory {
    by_email: Mutex<HashMap<String, User>>,
    next_id: AtomicU64,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, new: NewUser) -> Result<User, UserError> {
        let mut users = self.by_email.lock();
        let email_key = new.email.to_ascii_lowercase();
        if users.contains_key(&email_key) {
            return Err(UserError::EmailTaken);
        }

        let user = User {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            email: new.email,
            username: new.username,
        };
        users.insert(email_key, user.clone());
        Ok(user)
    }

    pub fn len(&self) -> usize {
        self.by_email.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
