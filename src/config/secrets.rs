//! Secret handling utilities.
//!
//! Re-exports secrecy types and redacts credentials embedded in
//! connection strings before they reach logs.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a database URL with its password replaced, for logging.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.split_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => format!("{scheme}://{rest}"),
    }
}
