//! Controllers bundled with the server.

pub mod user;

pub use user::{ActiveUsers, UserController};
