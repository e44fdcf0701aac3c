//! Destination filter that keeps the proxy from forwarding to itself

/// Host prefixes that are never proxied
pub const BLACKLIST: &[&str] = &["localhost", "127.0.0.1"];

/// Whether a request for `host` may be intercepted and forwarded
///
/// Empty hosts and hosts starting with a [`BLACKLIST`] entry are refused.
pub fn is_eligible(host: &str) -> bool {
  if host.is_empty() {
    tracing::error!("Got request with empty host");
    return false;
  }

  if BLACKLIST.iter().any(|blacklisted| host.starts_with(blacklisted)) {
    tracing::error!("Got request with blacklisted host: {}", host);
    return false;
  }

  true
}
