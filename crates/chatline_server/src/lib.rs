#![forbid(unsafe_code)]

pub mod config;
pub mod server;
pub mod util;

pub use server::acceptor::Acceptor;
pub use server::connection::ConnectionSettings;
pub use server::presence::{PresenceSettings, spawn_presence_monitor};
pub use server::registry::{RegistryPolicy, SessionRegistry};
