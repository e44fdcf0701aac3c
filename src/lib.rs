#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! HTTP/HTTPS interception proxy
//!
//! This crate is the man-in-the-middle core of a network attack toolkit. It
//! serves traffic that a firewall redirects to it, terminates TLS with
//! certificates forged on demand, and lets a [`Hook`] inspect, edit or
//! replace every request and response before they are relayed.
//!
//! # Features
//!
//! - Plain HTTP proxy mode and SNI-sniffing HTTPS mode
//! - Certificates forged per `(host, port)` and cached for the proxy's lifetime
//! - `CONNECT` tunnels are always intercepted
//! - Host filter keeping the proxy from forwarding to itself
//! - Firewall redirection installed on configure and removed on stop
//!
//! # Example
//!
//! ```no_run
//! use http_intercept::{HttpProxy, NullFirewall, ProxyConfig, Session, TlsConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let session = Session::new("eth0", Arc::new(NullFirewall));
//!   let mut proxy = HttpProxy::new(session);
//!
//!   let config = ProxyConfig {
//!     proxy_port: 8083,
//!     http_port: 443,
//!     ..Default::default()
//!   };
//!   let tls = TlsConfig::new("ca.pem", "ca.key").generate_missing(true);
//!   proxy.configure_tls(config, tls).await?;
//!   proxy.start().await?;
//!
//!   tokio::time::sleep(Duration::from_secs(600)).await;
//!   proxy.stop().await?;
//!   Ok(())
//! }
//! ```

mod bridge;
mod ca;
mod cache;
mod error;
mod events;
mod filter;
mod firewall;
mod hook;
mod interceptor;
mod proxy;
mod rewind;
mod server;
mod session;
mod sni;
mod upstream;

pub use bridge::{bridge, ConnectShim, SniBridge, HTTPS_PORT};
pub use ca::{CertificateAuthority, LeafInfo, SignedLeaf};
pub use cache::{CertificateCache, ForgedCertificate};
pub use error::{Error, Result};
pub use events::{EventPayload, EventSink, SpoofedResponse, TracingEventSink, SPOOFED_RESPONSE_VERSION};
pub use filter::{is_eligible, BLACKLIST};
pub use firewall::{Firewall, NullFirewall, Redirection};
pub use hook::{Action, Hook, NoHook, NoScriptEngine, ScriptLoader};
pub use interceptor::{Decision, Exchange, HookDispatcher, MitmRequest, MitmResponse};
pub use proxy::{ConnectTarget, MitmProxy, CONNECT_ESTABLISHED};
pub use rewind::Rewind;
pub use server::{HttpProxy, ProxyConfig, ProxyMode, TlsConfig};
pub use session::Session;
pub use sni::{parse_server_name, sniff_client_hello, ClientHelloPeek};
pub use upstream::{strip_hop_by_hop, Upstream};
