//! Listener and lifecycle management
//!
//! An [`HttpProxy`] is configured once in one of two modes:
//!
//! - [`ProxyMode::Plain`]: a forward proxy served by the HTTP engine, drained
//!   gracefully on stop;
//! - [`ProxyMode::Tls`]: a raw accept loop feeding every connection through
//!   the [`SniBridge`], closed abruptly on stop.
//!
//! Both modes install a firewall redirection from the external port to the
//! proxy port at configuration time and remove it on stop.
//!

use crate::bridge::SniBridge;
use crate::ca::CertificateAuthority;
use crate::cache::CertificateCache;
use crate::error::{Error, Result};
use crate::firewall::Redirection;
use crate::hook::{Hook, NoHook};
use crate::interceptor::HookDispatcher;
use crate::proxy::{stopping, MitmProxy};
use crate::session::Session;
use crate::upstream::Upstream;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Listen backlog of the proxy socket
const LISTEN_BACKLOG: i32 = 1024;

/// Operating mode, fixed at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
  /// Forward proxy for redirected plain HTTP
  Plain,
  /// SNI-sniffing listener for redirected HTTPS
  Tls,
}

impl ProxyMode {
  /// Name used in logs and event tags
  pub fn name(&self) -> &'static str {
    match self {
      ProxyMode::Plain => "http.proxy",
      ProxyMode::Tls => "https.proxy",
    }
  }
}

impl fmt::Display for ProxyMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Options shared by both modes
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address the proxy binds to and traffic is redirected to
  pub address: IpAddr,
  /// Port the proxy listens on
  pub proxy_port: u16,
  /// External port redirected to the proxy
  pub http_port: u16,
  /// Proxy script providing the hooks
  pub script_path: Option<PathBuf>,
  /// Grace period for in-flight requests when a plain proxy stops
  pub shutdown_timeout: Duration,
  /// Timeout for connecting to and hearing back from upstreams
  pub upstream_timeout: Duration,
  /// Fixed upstream addresses by hostname, bypassing DNS
  pub resolve: HashMap<String, SocketAddr>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      address: IpAddr::V4(Ipv4Addr::LOCALHOST),
      proxy_port: 8080,
      http_port: 80,
      script_path: None,
      shutdown_timeout: Duration::from_secs(5),
      upstream_timeout: Duration::from_secs(30),
      resolve: HashMap::new(),
    }
  }
}

impl ProxyConfig {
  /// Socket address the listener binds to
  pub fn bind_addr(&self) -> SocketAddr {
    SocketAddr::new(self.address, self.proxy_port)
  }
}

/// CA material required by TLS mode
#[derive(Debug, Clone)]
pub struct TlsConfig {
  /// PEM file holding the CA certificate
  pub ca_cert_path: PathBuf,
  /// PEM file holding the CA private key
  pub ca_key_path: PathBuf,
  /// Generate and save a new CA when either file is missing
  pub generate_missing: bool,
}

impl TlsConfig {
  /// Use an existing CA pair
  pub fn new(ca_cert_path: impl Into<PathBuf>, ca_key_path: impl Into<PathBuf>) -> Self {
    Self {
      ca_cert_path: ca_cert_path.into(),
      ca_key_path: ca_key_path.into(),
      generate_missing: false,
    }
  }

  /// Whether to create the CA pair on first use
  pub fn generate_missing(mut self, generate: bool) -> Self {
    self.generate_missing = generate;
    self
  }

  async fn load(&self) -> Result<CertificateAuthority> {
    if self.generate_missing {
      CertificateAuthority::load_or_generate(&self.ca_cert_path, &self.ca_key_path).await
    } else {
      CertificateAuthority::load(&self.ca_cert_path, &self.ca_key_path).await
    }
  }
}

struct Worker {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
  local_addr: SocketAddr,
}

/// The interception proxy as seen by the rest of the toolkit
pub struct HttpProxy {
  session: Session,
  config: ProxyConfig,
  mode: Option<ProxyMode>,
  proxy: Option<Arc<MitmProxy>>,
  redirection: Option<Redirection>,
  worker: Option<Worker>,
}

impl HttpProxy {
  /// Create an unconfigured proxy bound to a session
  pub fn new(session: Session) -> Self {
    Self {
      session,
      config: ProxyConfig::default(),
      mode: None,
      proxy: None,
      redirection: None,
      worker: None,
    }
  }

  /// Configure a plain HTTP proxy
  ///
  /// Tunnels opened with `CONNECT` are still intercepted, using a CA that
  /// only lives in memory.
  pub async fn configure(&mut self, config: ProxyConfig) -> Result<()> {
    self.ensure_stopped()?;
    self.disarm(ProxyMode::Plain);
    let ca = CertificateAuthority::generate()?;
    self.install(config, ProxyMode::Plain, ca)
  }

  /// Configure the SNI-sniffing HTTPS proxy with the CA described by `tls`
  pub async fn configure_tls(&mut self, config: ProxyConfig, tls: TlsConfig) -> Result<()> {
    self.ensure_stopped()?;
    self.disarm(ProxyMode::Tls);
    let ca = tls.load().await?;
    self.install(config, ProxyMode::Tls, ca)
  }

  fn ensure_stopped(&self) -> Result<()> {
    if self.is_running() {
      return Err(Error::config_error(
        "Proxy must be stopped before it is reconfigured",
      ));
    }
    Ok(())
  }

  /// Drop the previous configuration so a failed reconfigure cannot start
  fn disarm(&mut self, mode: ProxyMode) {
    self.proxy = None;
    self.mode = None;
    if let Some(previous) = self.redirection.take() {
      if let Err(e) = self.session.firewall.enable_redirection(&previous, false) {
        tracing::warn!("({}) Failed to remove redirection {}: {}", mode.name(), previous, e);
      }
    }
  }

  /// Wire up a configured proxy; nothing is kept if any step fails
  fn install(&mut self, config: ProxyConfig, mode: ProxyMode, ca: CertificateAuthority) -> Result<()> {
    let name = mode.name();

    let hook: Arc<dyn Hook> = match &config.script_path {
      Some(path) => {
        tracing::info!("({}) Loading proxy script {}", name, path.display());
        self.session.scripts.load(path)?
      }
      None => Arc::new(NoHook),
    };

    let firewall = &self.session.firewall;
    if !firewall.is_forwarding_enabled() {
      tracing::info!("({}) Enabling forwarding.", name);
      firewall.enable_forwarding(true)?;
    }

    let redirection = Redirection::tcp(
      self.session.interface.clone(),
      config.http_port,
      config.address,
      config.proxy_port,
    );
    firewall.enable_redirection(&redirection, true).map_err(|e| {
      Error::redirection_error(format!("Failed to apply redirection {}: {}", redirection, e))
    })?;
    tracing::debug!("({}) Applied redirection {}", name, redirection);

    let dispatcher = HookDispatcher::new(name, hook, self.session.events.clone());
    let upstream = Upstream::new(config.upstream_timeout).with_overrides(config.resolve.clone());
    let certificates = Arc::new(CertificateCache::new(ca));

    self.proxy = Some(Arc::new(MitmProxy::new(certificates, dispatcher, upstream)));
    self.redirection = Some(redirection);
    self.mode = Some(mode);
    self.config = config;
    Ok(())
  }

  /// Bind the listener and launch the worker of the configured mode
  ///
  /// Returns once the listener is bound. Failures while serving are logged.
  pub async fn start(&mut self) -> Result<()> {
    let (Some(proxy), Some(mode)) = (self.proxy.clone(), self.mode) else {
      return Err(Error::config_error("Proxy is not configured"));
    };
    self.ensure_stopped()?;

    let listener = bind(self.config.bind_addr()).map_err(|e| {
      Error::connection_error(format!(
        "({}) Failed to bind {}: {}",
        mode,
        self.config.bind_addr(),
        e
      ))
    })?;
    let local_addr = listener.local_addr()?;
    let (shutdown, rx) = watch::channel(false);

    let handle = match mode {
      ProxyMode::Plain => tokio::spawn(serve_plain(
        proxy,
        listener,
        rx,
        self.config.shutdown_timeout,
      )),
      ProxyMode::Tls => tokio::spawn(serve_sniffed(SniBridge::new(proxy), listener, rx)),
    };
    tracing::info!("({}) started on {}", mode, local_addr);

    self.worker = Some(Worker {
      shutdown,
      handle,
      local_addr,
    });
    Ok(())
  }

  /// Remove the redirection and shut the listener down
  ///
  /// The listener is shut down even when the firewall refuses to remove the
  /// redirection; that error is returned afterwards.
  pub async fn stop(&mut self) -> Result<()> {
    let name = self.mode.map(|m| m.name()).unwrap_or("proxy");
    let mut result = Ok(());

    if let Some(redirection) = self.redirection.take() {
      tracing::debug!("({}) Disabling redirection {}", name, redirection);
      if let Err(e) = self.session.firewall.enable_redirection(&redirection, false) {
        result = Err(Error::redirection_error(format!(
          "Failed to remove redirection {}: {}",
          redirection, e
        )));
      }
    }

    if let Some(worker) = self.worker.take() {
      let _ = worker.shutdown.send(true);
      if self.mode == Some(ProxyMode::Tls) {
        worker.handle.abort();
      }
      match worker.handle.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!("({}) Worker failed: {}", name, e),
      }
      tracing::info!("({}) stopped", name);
    }

    result
  }

  /// Whether the worker is running
  pub fn is_running(&self) -> bool {
    self
      .worker
      .as_ref()
      .is_some_and(|worker| !worker.handle.is_finished())
  }

  /// Configured mode
  pub fn mode(&self) -> Option<ProxyMode> {
    self.mode
  }

  /// Active configuration
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Redirection currently installed
  pub fn redirection(&self) -> Option<&Redirection> {
    self.redirection.as_ref()
  }

  /// Address the listener is bound to while running
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.worker.as_ref().map(|worker| worker.local_addr)
  }

  /// Certificate cache of the configured proxy
  pub fn certificates(&self) -> Option<&Arc<CertificateCache>> {
    self.proxy.as_ref().map(|proxy| proxy.certificates())
  }
}

impl Drop for HttpProxy {
  fn drop(&mut self) {
    if let Some(redirection) = self.redirection.take() {
      if let Err(e) = self.session.firewall.enable_redirection(&redirection, false) {
        tracing::warn!("Failed to remove redirection {}: {}", redirection, e);
      }
    }
    if let Some(worker) = self.worker.take() {
      let _ = worker.shutdown.send(true);
      worker.handle.abort();
    }
  }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
  let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  socket.listen(LISTEN_BACKLOG)?;
  TcpListener::from_std(socket.into())
}

/// Plain mode accept loop; drains connections for up to `grace` once stopped
async fn serve_plain(
  proxy: Arc<MitmProxy>,
  listener: TcpListener,
  mut shutdown: watch::Receiver<bool>,
  grace: Duration,
) {
  let name = proxy.name().to_string();
  let mut connections = JoinSet::new();
  loop {
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let proxy = proxy.clone();
          let shutdown = shutdown.clone();
          let name = name.clone();
          connections.spawn(async move {
            if let Err(e) = proxy.serve_connection(stream, peer, shutdown).await {
              tracing::debug!("({}) Connection from {} closed: {}", name, peer, e);
            }
          });
        }
        Err(e) => tracing::warn!("({}) Failed to accept connection: {}", name, e),
      },
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
      true = stopping(&mut shutdown) => break,
    }
  }
  drop(listener);

  let drain = async { while connections.join_next().await.is_some() {} };
  if tokio::time::timeout(grace, drain).await.is_err() {
    tracing::warn!(
      "({}) {} connections still open after {:?}, closing them",
      name,
      connections.len(),
      grace
    );
    connections.abort_all();
  }
}

/// TLS mode accept loop; in-flight connections die with it
async fn serve_sniffed(bridge: SniBridge, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
  let mut connections = JoinSet::new();
  loop {
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          let bridge = bridge.clone();
          connections.spawn(async move { bridge.handle(stream, peer).await });
        }
        Err(e) => tracing::warn!("({}) Failed to accept connection: {}", ProxyMode::Tls, e),
      },
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
      true = stopping(&mut shutdown) => break,
    }
  }
  connections.abort_all();
}
