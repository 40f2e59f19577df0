//! HTTP gateway, WebSocket presence and event fan-out for the screening
//! workflow engine.

pub mod auth;
pub mod error;
pub mod event_bridge;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod wire;
pub mod ws;

pub use auth::{Authenticator, StaticTokenAuthenticator};
pub use error::ApiError;
pub use presence::{Broadcaster, PresenceRegistry};
pub use server::{AppState, ScreenflowServer, ServerConfig, ServerHandle};
