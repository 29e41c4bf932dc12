//! Configuration, bootstrap, and the per-invocation [`session::Session`].

pub mod bootstrap;
pub mod config;
pub mod secret;
pub mod session;

pub use config::Config;
pub use session::Session;
