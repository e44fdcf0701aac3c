//! External collaborators the proxy is wired to

use crate::events::{EventSink, TracingEventSink};
use crate::firewall::Firewall;
use crate::hook::{NoScriptEngine, ScriptLoader};
use std::sync::Arc;

/// Services shared with the rest of the toolkit
#[derive(Clone)]
pub struct Session {
  /// Name of the interface redirections are installed on
  pub interface: String,
  /// Firewall service
  pub firewall: Arc<dyn Firewall>,
  /// Event sink
  pub events: Arc<dyn EventSink>,
  /// Proxy script loader
  pub scripts: Arc<dyn ScriptLoader>,
}

impl Session {
  /// Create a session logging events through `tracing` and without a script engine
  pub fn new(interface: impl Into<String>, firewall: Arc<dyn Firewall>) -> Self {
    Self {
      interface: interface.into(),
      firewall,
      events: Arc::new(TracingEventSink),
      scripts: Arc::new(NoScriptEngine),
    }
  }

  /// Use another event sink
  pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
    self.events = events;
    self
  }

  /// Use another script loader
  pub fn with_scripts(mut self, scripts: Arc<dyn ScriptLoader>) -> Self {
    self.scripts = scripts;
    self
  }
}
