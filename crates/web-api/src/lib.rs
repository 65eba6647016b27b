pub mod auth;
pub mod handlers;
pub mod response;
pub mod server;

pub use auth::{Authenticated, TokenRegistry};
pub use response::{ApiError, Envelope};
pub use server::{ApiServer, AppState};
