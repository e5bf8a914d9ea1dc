//! Skips mock-server tests on hosts that cannot bind localhost.
//!
//! Unit tests reach this as `crate::test_support::socket_guard`; the
//! integration test binaries include the same file from `tests/support/`.

#![allow(dead_code)]

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_SOCKET_TESTS_ENV: &str = "RFETCH_REQUIRE_SOCKET_TESTS";

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_SOCKET_TESTS_ENV)
        .ok()
        .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Returns true (after logging) when localhost cannot be bound.
///
/// Panics instead when `RFETCH_REQUIRE_SOCKET_TESTS` is set, so CI never
/// silently skips mock-server tests.
#[track_caller]
pub fn should_skip_socket_bound_test() -> bool {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return false;
    }

    let location = Location::caller();
    let message = format!(
        "[socket-bound-test] cannot bind localhost at {}:{}",
        location.file(),
        location.line()
    );
    assert!(
        !socket_tests_required(),
        "{message}; unset {REQUIRE_SOCKET_TESTS_ENV} to allow skipping"
    );
    eprintln!("{message}; skipping (set {REQUIRE_SOCKET_TESTS_ENV}=1 to fail instead)");
    true
}

/// Starts a wiremock server, or `None` if sockets are unavailable.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if should_skip_socket_bound_test() {
        None
    } else {
        Some(MockServer::start().await)
    }
}

/// Value a skipped test returns, for both `()` and `Result` test bodies.
pub trait SocketSkipReturn {
    fn socket_skip_return() -> Self;
}

impl SocketSkipReturn for () {
    fn socket_skip_return() -> Self {}
}

impl SocketSkipReturn for Result<(), Box<dyn std::error::Error>> {
    fn socket_skip_return() -> Self {
        Ok(())
    }
}

pub fn socket_skip_return<T: SocketSkipReturn>() -> T {
    T::socket_skip_return()
}
