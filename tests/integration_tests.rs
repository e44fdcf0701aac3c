//! Integration tests for http-intercept

use http::StatusCode;
use http_intercept::{
  bridge, Action, CertificateAuthority, CertificateCache, ConnectShim, EventPayload, EventSink,
  Hook, HookDispatcher, HttpProxy, MitmProxy, MitmRequest, MitmResponse, NoHook, NullFirewall,
  ProxyConfig, ProxyMode, Result, ScriptLoader, Session, SniBridge, TlsConfig, Upstream,
  CONNECT_ESTABLISHED,
};
use rustls_pki_types::ServerName;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const UPSTREAM_BODY: &str = "hello from upstream";

#[derive(Default)]
struct MemorySink(Mutex<Vec<(String, EventPayload)>>);

impl EventSink for MemorySink {
  fn add(&self, tag: &str, payload: EventPayload) {
    self.0.lock().unwrap().push((tag.to_string(), payload));
  }
}

/// Hook recording every host it sees, optionally blocking requests
#[derive(Default)]
struct RecordingHook {
  block_requests: bool,
  hosts: Mutex<Vec<String>>,
  responses: AtomicUsize,
}

#[async_trait::async_trait]
impl Hook for RecordingHook {
  async fn on_request(&self, request: &mut MitmRequest) -> Result<Option<Action>> {
    self
      .hosts
      .lock()
      .unwrap()
      .push(request.exchange().host.clone());
    if self.block_requests {
      return Ok(Some(Action::new(StatusCode::IM_A_TEAPOT, "blocked by hook")));
    }
    Ok(None)
  }

  async fn on_response(&self, _response: &mut MitmResponse) -> Result<Option<Action>> {
    self.responses.fetch_add(1, Ordering::SeqCst);
    Ok(None)
  }
}

/// Script loader handing out one prepared hook
struct StaticScripts(Arc<RecordingHook>);

impl ScriptLoader for StaticScripts {
  fn load(&self, _path: &Path) -> Result<Arc<dyn Hook>> {
    Ok(self.0.clone())
  }
}

fn client_hello(host: &str) -> Vec<u8> {
  let config = ClientConfig::builder()
    .with_root_certificates(RootCertStore::empty())
    .with_no_client_auth();
  let name = ServerName::try_from(host.to_string()).unwrap();
  let mut conn = ClientConnection::new(Arc::new(config), name).unwrap();
  let mut out = Vec::new();
  conn.write_tls(&mut out).unwrap();
  out
}

/// Plain HTTP upstream answering every request with [`UPSTREAM_BODY`]
async fn spawn_upstream() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        read_head(&mut stream).await;
        let _ = stream.write_all(canned_response().as_bytes()).await;
      });
    }
  });
  addr
}

/// TLS upstream with a certificate the proxy does not verify
async fn spawn_tls_upstream(host: &str) -> SocketAddr {
  let signed = CertificateAuthority::generate().unwrap().sign_host(host).unwrap();
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(signed.cert_chain, signed.key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        read_head(&mut tls).await;
        let _ = tls.write_all(canned_response().as_bytes()).await;
        let _ = tls.shutdown().await;
      });
    }
  });
  addr
}

fn canned_response() -> String {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
    UPSTREAM_BODY.len(),
    UPSTREAM_BODY
  )
}

async fn read_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) {
  let mut head = Vec::new();
  let mut buf = [0u8; 1024];
  while !head.windows(4).any(|w| w == b"\r\n\r\n") {
    match stream.read(&mut buf).await {
      Ok(0) | Err(_) => return,
      Ok(n) => head.extend_from_slice(&buf[..n]),
    }
  }
}

/// Send a raw request and collect whatever comes back until the peer closes
async fn exchange<S>(mut stream: S, request: &str) -> String
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut out = Vec::new();
  let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out)).await;
  String::from_utf8_lossy(&out).into_owned()
}

/// Read one response head byte by byte so nothing past it is consumed
async fn read_reply_head<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    match stream.read(&mut byte).await {
      Ok(0) | Err(_) => break,
      Ok(_) => head.push(byte[0]),
    }
  }
  String::from_utf8_lossy(&head).into_owned()
}

/// Client trusting only the CA of a configured proxy
fn trusting_client(proxy: &HttpProxy) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots
    .add(proxy.certificates().unwrap().authority().ca_cert_der().clone())
    .unwrap();
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

fn plain_config(resolve: HashMap<String, SocketAddr>) -> ProxyConfig {
  ProxyConfig {
    proxy_port: 0,
    shutdown_timeout: Duration::from_secs(1),
    upstream_timeout: Duration::from_secs(5),
    resolve,
    ..Default::default()
  }
}

#[tokio::test]
async fn test_forged_certificate_is_issued_by_ca() {
  let cache = CertificateCache::new(CertificateAuthority::generate().unwrap());
  let first = cache.get_or_create("never-seen.test", 443).await.unwrap();
  let second = cache.get_or_create("never-seen.test", 443).await.unwrap();
  assert_eq!(first.leaf_der(), second.leaf_der(), "Cache hit should not re-sign");
  assert_eq!(cache.signed_count(), 1);

  let (_, leaf) = x509_parser::parse_x509_certificate(first.leaf_der()).unwrap();
  let (_, ca) = x509_parser::parse_x509_certificate(cache.authority().ca_cert_der()).unwrap();
  assert_eq!(leaf.issuer(), ca.subject());
  assert_eq!(first.cert_chain().len(), 2);
  assert_eq!(first.leaf().common_name, "never-seen.test");
}

#[tokio::test]
async fn test_concurrent_first_access_signs_once() {
  let cache = Arc::new(CertificateCache::new(CertificateAuthority::generate().unwrap()));
  let lookups = (0..16).map(|_| {
    let cache = cache.clone();
    async move { cache.get_or_create("race.test", 443).await.unwrap() }
  });
  let results = futures::future::join_all(lookups).await;

  assert_eq!(cache.signed_count(), 1);
  assert!(results.iter().all(|cert| Arc::ptr_eq(cert, &results[0])));
}

#[tokio::test]
async fn test_bridge_turns_client_hello_into_connect() {
  let hello = client_hello("example.com");
  let (mut client, server) = tokio::io::duplex(8192);
  client.write_all(&hello).await.unwrap();

  let (request, mut shim) = bridge(server).await.unwrap();
  assert_eq!(request.method(), http::Method::CONNECT);
  assert_eq!(request.uri().authority().unwrap().as_str(), "example.com:443");

  // The sniffed bytes are still there for the real handshake
  let mut replayed = vec![0u8; hello.len()];
  shim.read_exact(&mut replayed).await.unwrap();
  assert_eq!(replayed, hello);
}

#[tokio::test]
async fn test_bridge_abandons_non_tls_connections() {
  let (mut client, server) = tokio::io::duplex(8192);
  client
    .write_all(b"\x00\x13\x37garbage that is not a handshake")
    .await
    .unwrap();
  assert!(bridge(server).await.is_err());

  let cache = Arc::new(CertificateCache::new(CertificateAuthority::generate().unwrap()));
  let core = Arc::new(MitmProxy::new(
    cache.clone(),
    HookDispatcher::new("https.proxy", Arc::new(NoHook), Arc::new(MemorySink::default())),
    Upstream::new(Duration::from_secs(1)),
  ));
  let (mut client, server) = tokio::io::duplex(8192);
  client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
  SniBridge::new(core)
    .handle(server, "10.0.0.5:40000".parse().unwrap())
    .await;

  let mut buf = Vec::new();
  client.read_to_end(&mut buf).await.unwrap();
  assert!(buf.is_empty(), "Nothing should be written back");
  assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_shim_only_drops_connect_reply() {
  let (inner, mut raw) = tokio::io::duplex(8192);
  let mut shim = ConnectShim::new(inner);

  let written = shim.write(CONNECT_ESTABLISHED).await.unwrap();
  assert_eq!(written, CONNECT_ESTABLISHED.len());

  let payload = b"HTTP/1.1 200 OK\r\n\r\n";
  let written = shim.write(payload).await.unwrap();
  assert_eq!(written, payload.len());
  drop(shim);

  let mut received = Vec::new();
  raw.read_to_end(&mut received).await.unwrap();
  assert_eq!(received, payload);
}

#[tokio::test]
async fn test_plain_proxy_forwards_and_refuses_loops() {
  let upstream = spawn_upstream().await;
  let mut proxy = HttpProxy::new(Session::new("lo", Arc::new(NullFirewall)));
  proxy
    .configure(plain_config(HashMap::from([("test.local".to_string(), upstream)])))
    .await
    .unwrap();
  proxy.start().await.unwrap();
  let addr = proxy.local_addr().unwrap();

  let response = exchange(
    TcpStream::connect(addr).await.unwrap(),
    "GET http://test.local/ HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
  assert!(response.ends_with(UPSTREAM_BODY), "{}", response);

  let response = exchange(
    TcpStream::connect(addr).await.unwrap(),
    "GET http://localhost/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 403"), "{}", response);
  assert!(!response.contains(UPSTREAM_BODY));

  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_replacement_short_circuits() {
  // Nothing listens here: reaching the upstream would answer 502
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let unreachable = closed.local_addr().unwrap();
  drop(closed);

  let hook = Arc::new(RecordingHook {
    block_requests: true,
    ..Default::default()
  });
  let sink = Arc::new(MemorySink::default());
  let session = Session::new("lo", Arc::new(NullFirewall))
    .with_events(sink.clone())
    .with_scripts(Arc::new(StaticScripts(hook.clone())));

  let mut proxy = HttpProxy::new(session);
  let mut config = plain_config(HashMap::from([("test.local".to_string(), unreachable)]));
  config.script_path = Some("block.js".into());
  proxy.configure(config).await.unwrap();
  proxy.start().await.unwrap();

  let response = exchange(
    TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap(),
    "GET http://test.local/path?q=1 HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 418"), "{}", response);
  assert!(response.ends_with("blocked by hook"), "{}", response);
  assert_eq!(hook.responses.load(Ordering::SeqCst), 0);

  let events = sink.0.lock().unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].0, "http.proxy.spoofed-response");
  let EventPayload::SpoofedResponse(event) = &events[0].1 else {
    panic!("Unexpected event {:?}", events[0].1);
  };
  assert_eq!(event.host, "test.local");
  assert_eq!(event.path, "/path");
  assert_eq!(event.size, "blocked by hook".len());
  drop(events);

  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_tls_proxy_intercepts_sniffed_connection() {
  let upstream = spawn_tls_upstream("secure.test").await;
  let dir = std::env::temp_dir().join(format!("http-intercept-ca-{}", std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }

  let hook = Arc::new(RecordingHook::default());
  let session = Session::new("lo", Arc::new(NullFirewall))
    .with_scripts(Arc::new(StaticScripts(hook.clone())));
  let mut proxy = HttpProxy::new(session);
  let mut config = plain_config(HashMap::from([("secure.test".to_string(), upstream)]));
  config.script_path = Some("record.js".into());
  let tls = TlsConfig::new(dir.join("ca.pem"), dir.join("ca.key")).generate_missing(true);
  proxy.configure_tls(config, tls).await.unwrap();
  assert_eq!(proxy.mode(), Some(ProxyMode::Tls));
  assert!(dir.join("ca.pem").exists());
  proxy.start().await.unwrap();

  let certificates = proxy.certificates().unwrap().clone();
  let connector = trusting_client(&proxy);

  let tcp = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
  let tls = connector
    .connect(ServerName::try_from("secure.test").unwrap(), tcp)
    .await
    .expect("Handshake with a forged certificate should succeed");
  let response = exchange(
    tls,
    "GET /secret HTTP/1.1\r\nHost: secure.test\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
  assert!(response.ends_with(UPSTREAM_BODY), "{}", response);

  assert_eq!(certificates.signed_count(), 1);
  let forged = certificates.get_or_create("secure.test", 443).await.unwrap();
  assert_eq!(forged.host(), "secure.test");
  assert_eq!(certificates.signed_count(), 1);
  assert_eq!(hook.hosts.lock().unwrap().as_slice(), &["secure.test".to_string()]);
  assert_eq!(hook.responses.load(Ordering::SeqCst), 1);

  proxy.stop().await.unwrap();
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
  for mode in [ProxyMode::Plain, ProxyMode::Tls] {
    let mut proxy = HttpProxy::new(Session::new("lo", Arc::new(NullFirewall)));
    match mode {
      ProxyMode::Plain => proxy.configure(plain_config(HashMap::new())).await.unwrap(),
      ProxyMode::Tls => {
        let dir = std::env::temp_dir().join(format!("http-intercept-stop-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let tls = TlsConfig::new(dir.join("ca.pem"), dir.join("ca.key")).generate_missing(true);
        proxy
          .configure_tls(plain_config(HashMap::new()), tls)
          .await
          .unwrap();
      }
    }
    proxy.start().await.unwrap();
    let addr = proxy.local_addr().unwrap();
    assert!(TcpStream::connect(addr).await.is_ok());

    proxy.stop().await.unwrap();
    assert!(!proxy.is_running());
    assert!(
      TcpStream::connect(addr).await.is_err(),
      "{:?} listener still accepting after stop",
      mode
    );
  }
}

#[tokio::test]
async fn test_start_requires_configuration() {
  let mut proxy = HttpProxy::new(Session::new("lo", Arc::new(NullFirewall)));
  assert!(proxy.start().await.is_err());
  assert!(proxy.stop().await.is_ok());
}

#[tokio::test]
async fn test_plain_proxy_intercepts_connect_tunnel() {
  let upstream = spawn_tls_upstream("secure.test").await;
  let hook = Arc::new(RecordingHook::default());
  let session = Session::new("lo", Arc::new(NullFirewall))
    .with_scripts(Arc::new(StaticScripts(hook.clone())));
  let mut proxy = HttpProxy::new(session);
  let mut config = plain_config(HashMap::from([("secure.test".to_string(), upstream)]));
  config.script_path = Some("record.js".into());
  proxy.configure(config).await.unwrap();
  proxy.start().await.unwrap();

  let mut tcp = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
  tcp
    .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
    .await
    .unwrap();
  let head = read_reply_head(&mut tcp).await;
  assert_eq!(head.as_bytes(), CONNECT_ESTABLISHED);

  let tls = trusting_client(&proxy)
    .connect(ServerName::try_from("secure.test").unwrap(), tcp)
    .await
    .expect("Tunnel should be terminated with a forged certificate");
  let response = exchange(
    tls,
    "GET /inside HTTP/1.1\r\nHost: secure.test\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
  assert!(response.ends_with(UPSTREAM_BODY), "{}", response);
  assert_eq!(hook.hosts.lock().unwrap().as_slice(), &["secure.test".to_string()]);
  assert_eq!(proxy.certificates().unwrap().signed_count(), 1);

  proxy.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_after_plain_request_on_same_connection() {
  let plain = spawn_upstream().await;
  let secure = spawn_tls_upstream("secure.test").await;
  let mut proxy = HttpProxy::new(Session::new("lo", Arc::new(NullFirewall)));
  proxy
    .configure(plain_config(HashMap::from([
      ("test.local".to_string(), plain),
      ("secure.test".to_string(), secure),
    ])))
    .await
    .unwrap();
  proxy.start().await.unwrap();

  let mut tcp = TcpStream::connect(proxy.local_addr().unwrap()).await.unwrap();
  tcp
    .write_all(b"GET http://test.local/ HTTP/1.1\r\nHost: test.local\r\n\r\n")
    .await
    .unwrap();
  let head = read_reply_head(&mut tcp).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  let mut body = vec![0u8; UPSTREAM_BODY.len()];
  tcp.read_exact(&mut body).await.unwrap();
  assert_eq!(body, UPSTREAM_BODY.as_bytes());

  tcp
    .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
    .await
    .unwrap();
  let head = read_reply_head(&mut tcp).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

  let tls = trusting_client(&proxy)
    .connect(ServerName::try_from("secure.test").unwrap(), tcp)
    .await
    .expect("Upgraded tunnel should be terminated with a forged certificate");
  let response = exchange(
    tls,
    "GET /upgraded HTTP/1.1\r\nHost: secure.test\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
  assert!(response.ends_with(UPSTREAM_BODY), "{}", response);

  proxy.stop().await.unwrap();
}
