use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

/// A chat participant created by `user:create`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<i64>,
}

impl User {
    pub fn new(username: impl Into<String>, email: impl Into<String>, age: Option<i64>) -> Self {
        Self {
            id: UserId::new(),
            username: username.into(),
            email: email.into(),
            age,
        }
    }
}

/// A chat message. Never stored; it exists only long enough to be broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn from_user(author: &User, body: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            user_id: author.id.clone(),
            username: author.username.clone(),
            message: body.into(),
            timestamp: Utc::now(),
        }
    }
}
