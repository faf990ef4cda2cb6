//! Reverse-tunneling gateway.
//!
//! A [`server::TttServer`] listens on public "forward" ports and on a control
//! port. A [`client::TttClient`] running inside a private network connects to
//! the control port, authenticates with a name and key, and from then on every
//! connection accepted on a forward port is relayed over one dedicated data
//! connection to an endpoint the client dials locally.
//!
//! Everything runs on a single-threaded tokio runtime with a [`tokio::task::LocalSet`];
//! shared state is `Rc<RefCell<...>>` and is only mutated between suspension
//! points.

pub mod cache;
pub mod client;
pub mod config;
pub mod http;
pub mod net;
pub mod proto;
pub mod runtime;
pub mod server;
pub mod sysinfo;
