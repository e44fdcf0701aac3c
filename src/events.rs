//! Session events emitted by the proxy

#[cfg(feature = "serde")]
use serde::Serialize;

/// Version of the [`SpoofedResponse`] schema
pub const SPOOFED_RESPONSE_VERSION: u16 = 1;

/// Recorded whenever a hook replaced a request or response
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SpoofedResponse {
  /// Schema version
  pub version: u16,
  /// Address of the client receiving the synthetic response
  pub to: String,
  /// Request method
  pub method: String,
  /// Request host
  pub host: String,
  /// Request path
  pub path: String,
  /// Size of the synthetic body
  pub size: usize,
}

/// Payload of a session event
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
#[non_exhaustive]
pub enum EventPayload {
  /// A hook tampered with an exchange
  SpoofedResponse(SpoofedResponse),
}

/// Fire-and-forget sink for session events
pub trait EventSink: Send + Sync {
  /// Record an event under `tag`, e.g. `https.proxy.spoofed-response`
  fn add(&self, tag: &str, payload: EventPayload);
}

/// Sink that writes events to the `tracing` log
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
  fn add(&self, tag: &str, payload: EventPayload) {
    match payload {
      EventPayload::SpoofedResponse(event) => tracing::info!(
        "[{}] {} {} {}{} ({} bytes)",
        tag,
        event.to,
        event.method,
        event.host,
        event.path,
        event.size
      ),
    }
  }
}
