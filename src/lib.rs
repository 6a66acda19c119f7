pub mod auth;
pub mod capabilities;
pub mod client_session;
pub mod config;
pub mod context;
pub mod event_store;
pub mod events;
pub mod handler;
pub mod http;
pub mod idmap;
pub mod logging;
pub mod naming;
pub mod proxy;
pub mod router;
pub mod secrets;
pub mod session_store;
pub mod supervisor;
pub mod transport;
