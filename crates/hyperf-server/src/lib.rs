//! Declarative event routing over duplex connections.
//!
//! Controllers declare `(event, schema, handler)` bindings. The
//! [`Dispatcher`] validates each inbound payload against its binding's
//! schema, runs the handler with the connection's [`Session`], and answers
//! through an acknowledgment slot. Handlers reach other connections through
//! the [`Gateway`].

pub mod ack;
pub mod config;
pub mod connection;
pub mod controllers;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use ack::{AckError, AckHandle, AckReceiver, AckResponse};
pub use config::{ConfigError, ServerConfig};
pub use connection::ConnectionRegistry;
pub use controllers::UserController;
pub use dispatcher::{Dispatcher, InboundEvent};
pub use error::ServerError;
pub use gateway::Gateway;
pub use registry::{
    Controller, ControllerRegistry, EventBinding, EventHandler, HandlerContext, HandlerResult,
    RegistryError,
};
pub use server::{start, ServerHandle};
pub use session::{Session, SessionStore};
