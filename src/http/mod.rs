//! HTTP awareness for forward ports: an incremental parser ([`pipe`]) and the
//! rewriting proxy wrapper ([`handler`]).

pub mod handler;
pub mod pipe;
