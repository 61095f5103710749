//! Chat demo controller: user creation, listing and messaging.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hyperf_core::errors::SESSION_KEY;
use hyperf_core::{ConnectionId, FieldErrors, FieldSpec, Message, Payload, Schema, User, UserId};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::registry::{respond_with, Controller, EventBinding, EventHandler, HandlerContext, HandlerResult};
use crate::session::Session;

pub const USER_CREATE: &str = "user:create";
pub const USER_LIST: &str = "user:list";
pub const MESSAGE_SEND: &str = "message:send";
pub const USER_JOINED: &str = "user:joined";
pub const MESSAGE_RECEIVED: &str = "message:received";

const AGE_MIN: i64 = 13;
const AGE_MAX: i64 = 120;
const USERNAME_MIN_LENGTH: usize = 3;

/// Process-wide set of users with a live owning connection.
#[derive(Default)]
pub struct ActiveUsers {
    users: DashMap<UserId, (User, ConnectionId)>,
}

impl ActiveUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User, owner: ConnectionId) {
        self.users.insert(user.id.clone(), (user, owner));
    }

    pub fn remove(&self, id: &UserId) -> Option<User> {
        self.users.remove(id).map(|(_, (user, _))| user)
    }

    /// Snapshot ordered by id, which is creation order.
    pub fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().0.clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn owner(&self, id: &UserId) -> Option<ConnectionId> {
        self.users.get(id).map(|e| e.value().1.clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CreateUser {
    username: String,
    email: String,
    #[serde(default)]
    age: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendMessage {
    message: String,
}

pub struct UserController {
    users: Arc<ActiveUsers>,
}

impl UserController {
    pub fn new() -> Self {
        Self::with_users(Arc::new(ActiveUsers::new()))
    }

    pub fn with_users(users: Arc<ActiveUsers>) -> Self {
        Self { users }
    }

    pub fn users(&self) -> &Arc<ActiveUsers> {
        &self.users
    }
}

impl Default for UserController {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller for UserController {
    fn name(&self) -> &str {
        "user"
    }

    fn bindings(&self) -> Vec<EventBinding> {
        vec![
            EventBinding::new(
                USER_CREATE,
                Schema::new()
                    .field(FieldSpec::string("username").required().min_length(USERNAME_MIN_LENGTH))
                    .field(FieldSpec::email("email").required())
                    .field(FieldSpec::integer("age").range(AGE_MIN, AGE_MAX)),
                CreateUserHandler {
                    users: Arc::clone(&self.users),
                },
            ),
            EventBinding::new(
                USER_LIST,
                Schema::new(),
                ListUsersHandler {
                    users: Arc::clone(&self.users),
                },
            ),
            EventBinding::new(
                MESSAGE_SEND,
                Schema::new().field(FieldSpec::string("message").required().not_empty()),
                SendMessageHandler,
            ),
        ]
    }

    fn on_disconnect(&self, session: &Session) {
        if let Some(user) = &session.current_user {
            if self.users.remove(&user.id).is_some() {
                info!(
                    connection_id = %session.connection_id(),
                    user_id = %user.id,
                    "user left"
                );
            }
        }
    }
}

struct CreateUserHandler {
    users: Arc<ActiveUsers>,
}

#[async_trait]
impl EventHandler for CreateUserHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext<'_>) -> HandlerResult {
        let dto: CreateUser = payload.into_dto()?;
        let user = User::new(dto.username, dto.email, dto.age);

        // A connection owns at most one user; creating again replaces it.
        if let Some(previous) = ctx.session.current_user.replace(user.clone()) {
            self.users.remove(&previous.id);
            debug!(user_id = %previous.id, "replaced previous user");
        }
        self.users.insert(user.clone(), ctx.connection_id.clone());
        info!(user_id = %user.id, username = %user.username, "user created");

        ctx.gateway.broadcast(
            USER_JOINED,
            &json!({ "username": user.username }),
            Some(ctx.connection_id),
        );
        respond_with(&user)
    }
}

struct ListUsersHandler {
    users: Arc<ActiveUsers>,
}

#[async_trait]
impl EventHandler for ListUsersHandler {
    async fn handle(&self, _payload: Payload, _ctx: &mut HandlerContext<'_>) -> HandlerResult {
        respond_with(&self.users.list())
    }
}

struct SendMessageHandler;

#[async_trait]
impl EventHandler for SendMessageHandler {
    async fn handle(&self, payload: Payload, ctx: &mut HandlerContext<'_>) -> HandlerResult {
        let Some(author) = &ctx.session.current_user else {
            return Err(FieldErrors::single(
                SESSION_KEY,
                "user must be created before sending messages",
            ));
        };
        let dto: SendMessage = payload.into_dto()?;
        let message = Message::from_user(author, dto.message);

        let data = respond_with(&message)?;
        ctx.gateway
            .broadcast(MESSAGE_RECEIVED, &data, Some(ctx.connection_id));
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::gateway::Gateway;
    use crate::session::SessionStore;
    use hyperf_core::validate;

    struct Harness {
        controller: UserController,
        gateway: Gateway,
        sessions: SessionStore,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                controller: UserController::new(),
                gateway: Gateway::new(Arc::new(ConnectionRegistry::new(16))),
                sessions: SessionStore::new(),
            }
        }

        async fn call(&self, id: &ConnectionId, event: &str, raw: serde_json::Value) -> HandlerResult {
            let bindings = self.controller.bindings();
            let binding = bindings.iter().find(|b| b.event() == event).unwrap();
            let payload = validate(binding.schema(), &raw)?;
            let session = self.sessions.open(id);
            let mut guard = session.lock().await;
            let mut ctx = HandlerContext {
                connection_id: id,
                session: &mut guard,
                gateway: &self.gateway,
            };
            binding.handler().handle(payload, &mut ctx).await
        }
    }

    #[tokio::test]
    async fn create_sets_session_user_and_lists_it() {
        let h = Harness::new();
        let id = ConnectionId::new();

        let created = h
            .call(&id, USER_CREATE, json!({"username": "alice", "email": "a@b.io", "age": "30"}))
            .await
            .unwrap();
        assert_eq!(created["username"], "alice");
        assert_eq!(created["age"], 30);

        let session = h.sessions.get(&id).unwrap();
        assert_eq!(session.lock().await.current_user.as_ref().unwrap().username, "alice");

        let listed = h.call(&id, USER_LIST, json!({})).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], created["id"]);
    }

    #[tokio::test]
    async fn create_twice_replaces_user() {
        let h = Harness::new();
        let id = ConnectionId::new();

        h.call(&id, USER_CREATE, json!({"username": "first", "email": "f@x.io"}))
            .await
            .unwrap();
        h.call(&id, USER_CREATE, json!({"username": "second", "email": "s@x.io"}))
            .await
            .unwrap();

        let users = h.controller.users().list();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "second");
        assert_eq!(h.controller.users().owner(&users[0].id), Some(id));
    }

    #[tokio::test]
    async fn message_requires_user() {
        let h = Harness::new();
        let id = ConnectionId::new();

        let err = h.call(&id, MESSAGE_SEND, json!({"message": "hi"})).await.unwrap_err();
        assert_eq!(
            err.get("_session").unwrap(),
            ["user must be created before sending messages"]
        );

        h.call(&id, USER_CREATE, json!({"username": "bob", "email": "b@x.io"}))
            .await
            .unwrap();
        let sent = h.call(&id, MESSAGE_SEND, json!({"message": "hi"})).await.unwrap();
        assert_eq!(sent["message"], "hi");
        assert_eq!(sent["username"], "bob");
        assert!(sent["userId"].as_str().unwrap().starts_with("user_"));
    }

    #[tokio::test]
    async fn disconnect_hook_removes_user() {
        let h = Harness::new();
        let id = ConnectionId::new();
        h.call(&id, USER_CREATE, json!({"username": "carol", "email": "c@x.io"}))
            .await
            .unwrap();
        assert_eq!(h.controller.users().len(), 1);

        let session = h.sessions.remove(&id).await.unwrap();
        h.controller.on_disconnect(&session);
        assert!(h.controller.users().is_empty());
    }

    #[test]
    fn schemas_are_well_formed() {
        let controller = UserController::new();
        for binding in controller.bindings() {
            binding.schema().check().unwrap();
        }
    }
}
