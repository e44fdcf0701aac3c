//! Firewall redirection rules installed while the proxy runs

use crate::error::Result;
use std::fmt;
use std::net::IpAddr;

/// A NAT rule redirecting `from_port` on an interface to the proxy listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
  /// Interface the rule applies to
  pub interface: String,
  /// Transport protocol, always `TCP` for the proxy
  pub protocol: String,
  /// External port being redirected
  pub from_port: u16,
  /// Address the traffic is redirected to
  pub to_address: IpAddr,
  /// Port the traffic is redirected to
  pub to_port: u16,
}

impl Redirection {
  /// TCP redirection from `from_port` to `to_address:to_port`
  pub fn tcp(interface: impl Into<String>, from_port: u16, to_address: IpAddr, to_port: u16) -> Self {
    Self {
      interface: interface.into(),
      protocol: "TCP".to_string(),
      from_port,
      to_address,
      to_port,
    }
  }
}

impl fmt::Display for Redirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{}] ({}) {} -> {}:{}",
      self.interface, self.protocol, self.from_port, self.to_address, self.to_port
    )
  }
}

/// OS firewall service that owns forwarding and NAT rules
///
/// Both operations are expected to be idempotent.
pub trait Firewall: Send + Sync {
  /// Whether IP forwarding is enabled
  fn is_forwarding_enabled(&self) -> bool;

  /// Enable or disable IP forwarding
  fn enable_forwarding(&self, enabled: bool) -> Result<()>;

  /// Install (`enabled = true`) or remove a redirection rule
  fn enable_redirection(&self, redirection: &Redirection, enabled: bool) -> Result<()>;
}

/// Firewall that changes nothing; for setups where traffic already reaches the proxy
pub struct NullFirewall;

impl Firewall for NullFirewall {
  fn is_forwarding_enabled(&self) -> bool {
    true
  }

  fn enable_forwarding(&self, _enabled: bool) -> Result<()> {
    Ok(())
  }

  fn enable_redirection(&self, redirection: &Redirection, enabled: bool) -> Result<()> {
    tracing::debug!("Ignoring redirection {} (enabled: {})", redirection, enabled);
    Ok(())
  }
}
