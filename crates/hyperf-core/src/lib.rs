//! Domain types and the payload validation engine shared by the hyperf crates.

pub mod errors;
pub mod ids;
pub mod models;
pub mod validation;

pub use errors::FieldErrors;
pub use ids::{ConnectionId, MessageId, UserId};
pub use models::{Message, User};
pub use validation::{validate, FieldKind, FieldSpec, Payload, Schema, SchemaError};
