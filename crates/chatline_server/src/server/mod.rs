#![forbid(unsafe_code)]

pub mod acceptor;
pub mod connection;
pub mod delivery;
pub mod peer;
pub mod presence;
pub mod registry;
