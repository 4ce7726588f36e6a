//! Request and response bodies exchanged over HTTP.

pub mod v1;
