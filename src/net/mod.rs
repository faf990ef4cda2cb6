//! Socket plumbing: the buffered [`socket::Connection`] abstraction and TLS
//! acceptor/connector construction.

pub mod socket;
pub mod tls;
