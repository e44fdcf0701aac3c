//! Intercepted traffic and the hook dispatcher wrapped around it

use crate::events::{EventPayload, EventSink, SpoofedResponse, SPOOFED_RESPONSE_VERSION};
use crate::hook::{Action, Hook};
use bytes::Bytes;
use http::{Method, Request, Response};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Connection metadata shared by both legs of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
  /// Client address
  pub remote_addr: SocketAddr,
  /// Request method
  pub method: Method,
  /// Effective destination host, as declared by the client
  pub host: String,
  /// Request path
  pub path: String,
  /// Milliseconds since the epoch when the request was intercepted
  pub timestamp: u64,
}

impl Exchange {
  fn new(remote_addr: SocketAddr, host: String, request: &Request<Bytes>) -> Self {
    Self {
      remote_addr,
      method: request.method().clone(),
      host,
      path: request.uri().path().to_string(),
      timestamp: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0),
    }
  }
}

/// A decrypted request with its connection metadata
pub struct MitmRequest {
  exchange: Exchange,
  request: Request<Bytes>,
}

impl MitmRequest {
  /// Wrap a request sent by `remote_addr` to `host`
  pub fn new(remote_addr: SocketAddr, host: impl Into<String>, request: Request<Bytes>) -> Self {
    Self {
      exchange: Exchange::new(remote_addr, host.into(), &request),
      request,
    }
  }

  /// Connection metadata
  pub fn exchange(&self) -> &Exchange {
    &self.exchange
  }

  /// Get the underlying request
  pub fn request(&self) -> &Request<Bytes> {
    &self.request
  }

  /// Get a mutable reference to the underlying request
  pub fn request_mut(&mut self) -> &mut Request<Bytes> {
    &mut self.request
  }

  /// Request body
  pub fn body(&self) -> &Bytes {
    self.request.body()
  }

  /// Replace the request body
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    *self.request.body_mut() = body.into();
  }

  /// Split into metadata and request
  pub fn into_parts(self) -> (Exchange, Request<Bytes>) {
    (self.exchange, self.request)
  }
}

impl fmt::Debug for MitmRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MitmRequest")
      .field("exchange", &self.exchange)
      .field("uri", self.request.uri())
      .field("body_len", &self.request.body().len())
      .finish()
  }
}

/// An upstream response with the metadata of the request that caused it
pub struct MitmResponse {
  exchange: Exchange,
  response: Response<Bytes>,
}

impl MitmResponse {
  /// Wrap the response to the exchange described by `exchange`
  pub fn new(exchange: Exchange, response: Response<Bytes>) -> Self {
    Self { exchange, response }
  }

  /// Connection metadata
  pub fn exchange(&self) -> &Exchange {
    &self.exchange
  }

  /// Get the underlying response
  pub fn response(&self) -> &Response<Bytes> {
    &self.response
  }

  /// Get a mutable reference to the underlying response
  pub fn response_mut(&mut self) -> &mut Response<Bytes> {
    &mut self.response
  }

  /// Response body
  pub fn body(&self) -> &Bytes {
    self.response.body()
  }

  /// Replace the response body
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    *self.response.body_mut() = body.into();
  }

  /// Take the response
  pub fn into_response(self) -> Response<Bytes> {
    self.response
  }
}

impl fmt::Debug for MitmResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MitmResponse")
      .field("exchange", &self.exchange)
      .field("status", &self.response.status())
      .field("body_len", &self.response.body().len())
      .finish()
  }
}

/// Outcome of one hook invocation
#[derive(Debug)]
pub enum Decision {
  /// Continue with the (possibly edited) traffic
  PassThrough,
  /// Answer the client with this response instead
  Replace(Response<Bytes>),
}

impl Decision {
  /// Whether the hook replaced the traffic
  pub fn is_replace(&self) -> bool {
    matches!(self, Decision::Replace(_))
  }
}

/// Runs the hook around both legs and records every tampering
#[derive(Clone)]
pub struct HookDispatcher {
  name: String,
  hook: Arc<dyn Hook>,
  events: Arc<dyn EventSink>,
}

impl HookDispatcher {
  /// Create a dispatcher logging as `name`
  pub fn new(name: impl Into<String>, hook: Arc<dyn Hook>, events: Arc<dyn EventSink>) -> Self {
    Self {
      name: name.into(),
      hook,
      events,
    }
  }

  /// Proxy name used in logs and event tags
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Request leg, before anything is sent upstream
  pub async fn on_outbound_request(&self, request: &mut MitmRequest) -> Decision {
    let exchange = request.exchange();
    tracing::debug!(
      "({}) < {} {} {}{}",
      self.name,
      exchange.remote_addr,
      exchange.method,
      exchange.host,
      exchange.path
    );
    match self.hook.on_request(request).await {
      Ok(Some(action)) => {
        self.log_action(request.exchange(), &action);
        Decision::Replace(action.into_response())
      }
      Ok(None) => Decision::PassThrough,
      Err(e) => {
        tracing::warn!("({}) request hook failed, passing through: {}", self.name, e);
        Decision::PassThrough
      }
    }
  }

  /// Response leg, after the upstream answered
  pub async fn on_inbound_response(&self, response: &mut MitmResponse) -> Decision {
    let exchange = response.exchange();
    tracing::debug!(
      "({}) > {} {} {}{}",
      self.name,
      exchange.remote_addr,
      exchange.method,
      exchange.host,
      exchange.path
    );
    match self.hook.on_response(response).await {
      Ok(Some(action)) => {
        self.log_action(response.exchange(), &action);
        Decision::Replace(action.into_response())
      }
      Ok(None) => Decision::PassThrough,
      Err(e) => {
        tracing::warn!("({}) response hook failed, passing through: {}", self.name, e);
        Decision::PassThrough
      }
    }
  }

  fn log_action(&self, exchange: &Exchange, action: &Action) {
    self.events.add(
      &format!("{}.spoofed-response", self.name),
      EventPayload::SpoofedResponse(SpoofedResponse {
        version: SPOOFED_RESPONSE_VERSION,
        to: exchange.remote_addr.ip().to_string(),
        method: exchange.method.to_string(),
        host: exchange.host.clone(),
        path: exchange.path.clone(),
        size: action.size(),
      }),
    );
  }
}
