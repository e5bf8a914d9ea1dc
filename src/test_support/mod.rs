//! Helpers shared by unit tests that need a local HTTP server.

pub mod socket_guard;
