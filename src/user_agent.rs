//! User-Agent string sent with every probe and segment request.

/// Project URL for User-Agent identification (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/fierce/resumable-fetch";

/// Default User-Agent for download requests (identifies the tool and version).
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("resumable-fetch/{version} (+{PROJECT_UA_URL})")
}
