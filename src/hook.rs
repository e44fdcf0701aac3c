//! Inspection/modification hooks run around every intercepted exchange

use crate::error::{Error, Result};
use crate::interceptor::{MitmRequest, MitmResponse};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Response, StatusCode};
use std::path::Path;
use std::sync::Arc;

/// A synthetic response produced by a hook
#[derive(Debug, Clone)]
pub struct Action {
  /// Status code sent to the client
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap,
  /// Response body
  pub body: Bytes,
}

impl Action {
  /// Create an action with no headers
  pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  /// Add a header
  pub fn header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
    self.headers.append(name, value);
    self
  }

  /// Body size recorded in events
  pub fn size(&self) -> usize {
    self.body.len()
  }

  /// Build the terminal response sent back to the client
  ///
  /// Framing headers are dropped so the HTTP engine recomputes them for the body.
  pub fn into_response(self) -> Response<Bytes> {
    let mut response = Response::new(self.body);
    *response.status_mut() = self.status;
    *response.headers_mut() = self.headers;
    response.headers_mut().remove(CONTENT_LENGTH);
    response.headers_mut().remove(TRANSFER_ENCODING);
    response
  }
}

/// Hook capability consulted on both legs of an exchange
///
/// Returning `Ok(None)` passes the exchange through (hooks may still edit it
/// in place). Returning an [`Action`] replaces the traffic with a synthetic
/// response. Errors are logged and treated as pass-through.
#[async_trait::async_trait]
pub trait Hook: Send + Sync {
  /// Called before the request is sent upstream
  async fn on_request(&self, request: &mut MitmRequest) -> Result<Option<Action>>;

  /// Called after the upstream answered
  async fn on_response(&self, response: &mut MitmResponse) -> Result<Option<Action>>;
}

/// Hook used when no script is configured: every exchange passes through
pub struct NoHook;

#[async_trait::async_trait]
impl Hook for NoHook {
  async fn on_request(&self, _request: &mut MitmRequest) -> Result<Option<Action>> {
    Ok(None)
  }

  async fn on_response(&self, _response: &mut MitmResponse) -> Result<Option<Action>> {
    Ok(None)
  }
}

/// Loads a hook from a proxy script path, once at configuration time
pub trait ScriptLoader: Send + Sync {
  /// Load the script at `path`
  fn load(&self, path: &Path) -> Result<Arc<dyn Hook>>;
}

/// Loader for sessions without a scripting engine; every load fails
pub struct NoScriptEngine;

impl ScriptLoader for NoScriptEngine {
  fn load(&self, path: &Path) -> Result<Arc<dyn Hook>> {
    Err(Error::script_error(format!(
      "No script engine available to load {}",
      path.display()
    )))
  }
}
