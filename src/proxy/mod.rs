// src/proxy/mod.rs

//! Intercepting HTTP proxy.
//!
//! One listener serves plain HTTP, CONNECT tunnels and, in transparent mode,
//! redirected connections that never asked for a proxy. Responses small
//! enough to buffer go through the rule engine; everything else streams.

pub mod http;
pub mod tls;
pub mod upstream;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, EXPECT};
use ::http::{HeaderMap, HeaderValue};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use self::http::{header_str, BodyKind, RequestHead, ResponseHead, Target};
use self::tls::Peeked;
use self::upstream::{BoxedIo, OriginConnector, TcpConnector};
use crate::actions::{resolve_action, ResponseParts};
use crate::certs::CertificateAuthority;
use crate::error::{Error, Result};
use crate::events::SessionRecorder;
use crate::rules::{collect_rule_candidates, normalize_content_type, select_best_rule, select_rule, MatchContext};
use crate::store::{ResourceStore, RuleSource, SessionEntry, SessionSource};

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
/// Certificate subject for transparent TLS clients that send no SNI
const FALLBACK_HOST: &str = "localhost";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n";

/// What happens to CONNECT and transparent TLS traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpsMode {
    /// Terminate TLS with a minted certificate and inspect
    Mitm,
    /// Splice bytes to the origin untouched
    #[default]
    Tunnel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Clients are configured to use the proxy
    #[default]
    Explicit,
    /// Connections arrive redirected at the packet level
    Transparent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    pub host: IpAddr,
    pub port: u16,
    pub https_mode: HttpsMode,
    pub listen_mode: ListenMode,
    /// Largest response body buffered for rule evaluation
    pub max_body_bytes: usize,
    pub upstream_timeout_secs: u64,
    /// Skip origin certificate verification
    pub insecure_upstream: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            https_mode: HttpsMode::default(),
            listen_mode: ListenMode::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            upstream_timeout_secs: 30,
            insecure_upstream: false,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }
}

/// Collaborators the proxy decides with and records to.
#[derive(Clone)]
pub struct ProxyServices {
    pub rules: Arc<dyn RuleSource>,
    pub resources: Arc<dyn ResourceStore>,
    pub recorder: SessionRecorder,
    pub ca: Option<Arc<CertificateAuthority>>,
    /// Defaults to [`TcpConnector`]
    pub connector: Option<Arc<dyn OriginConnector>>,
}

impl ProxyServices {
    pub fn new<S>(store: Arc<S>, recorder: SessionRecorder) -> Self
    where
        S: RuleSource + ResourceStore + 'static,
    {
        ProxyServices {
            rules: store.clone(),
            resources: store,
            recorder,
            ca: None,
            connector: None,
        }
    }

    pub fn with_ca(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn OriginConnector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

struct Shared {
    config: ProxyConfig,
    rules: Arc<dyn RuleSource>,
    resources: Arc<dyn ResourceStore>,
    recorder: SessionRecorder,
    ca: Option<Arc<CertificateAuthority>>,
    connector: Arc<dyn OriginConnector>,
}

impl Shared {
    fn interceptor(&self) -> Option<&CertificateAuthority> {
        match self.config.https_mode {
            HttpsMode::Mitm => self.ca.as_deref(),
            HttpsMode::Tunnel => None,
        }
    }
}

/// Where a request came from, for target reconstruction.
#[derive(Debug, Clone)]
struct Origin {
    client: SocketAddr,
    local_port: u16,
    tls: bool,
    /// Stands in for a missing Host header
    host: Option<String>,
    allow_connect: bool,
}

/// A running proxy listener.
pub struct ProxyServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyServer {
    /// Binds the listener and starts accepting connections.
    ///
    /// In MITM mode the CA is loaded or generated up front so the first
    /// intercepted connection does not pay for it.
    pub async fn start(config: ProxyConfig, services: ProxyServices) -> Result<Self> {
        if config.https_mode == HttpsMode::Mitm {
            let ca = services
                .ca
                .as_ref()
                .ok_or_else(|| Error::config("HTTPS interception needs a certificate authority"))?;
            ca.ensure_ca().await?;
        }

        let connector = match services.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(config.insecure_upstream)?),
        };

        let listener = TcpListener::bind((config.host, config.port))
            .await
            .map_err(|e| {
                Error::Connection(format!("Cannot listen on {}:{}: {}", config.host, config.port, e))
            })?;
        let local_addr = listener.local_addr()?;
        info!(
            "Proxy listening on {} ({:?}, HTTPS {:?})",
            local_addr, config.listen_mode, config.https_mode
        );

        let shared = Arc::new(Shared {
            config,
            rules: services.rules,
            resources: services.resources,
            recorder: services.recorder,
            ca: services.ca,
            connector,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, shared, shutdown_rx));

        Ok(ProxyServer {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    /// Stops accepting and closes every open connection.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Proxy task ended abnormally: {}", e);
        }
        info!("Proxy on {} stopped", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!("Accepted connection from {}", peer);
                    let shared = Arc::clone(&shared);
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(&shared, stream, peer).await {
                            debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    debug!("Closing {} open proxy connections", connections.len());
    connections.shutdown().await;
}

async fn handle_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let origin = Origin {
        client: peer,
        local_port: stream.local_addr()?.port(),
        tls: false,
        host: None,
        allow_connect: true,
    };

    if shared.config.listen_mode == ListenMode::Transparent {
        match tls::peek_protocol(&stream).await? {
            Peeked::Closed => return Ok(()),
            Peeked::Tls { server_name } => {
                return handle_transparent_tls(shared, stream, origin, server_name).await
            }
            Peeked::Plain => {}
        }
    }

    let mut conn = BufReader::new(stream);
    match serve(shared, &mut conn, &origin).await? {
        Next::Close => Ok(()),
        Next::Upgrade(head) => handle_connect(shared, conn, head, origin).await,
    }
}

enum Next {
    Close,
    /// A CONNECT request took over the connection
    Upgrade(RequestHead),
}

/// Serves requests on one client connection until it closes or upgrades.
async fn serve<IO>(shared: &Shared, conn: &mut BufReader<IO>, origin: &Origin) -> Result<Next>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let head = match http::read_request_head(conn).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(Next::Close),
            Err(e) => {
                let _ = http::write_simple_response(conn, 400, "Bad request", true).await;
                return Err(e);
            }
        };

        if head.is_connect() {
            if origin.allow_connect {
                return Ok(Next::Upgrade(head));
            }
            http::write_simple_response(conn, 405, "CONNECT not supported here", true).await?;
            return Ok(Next::Close);
        }

        if !exchange(shared, conn, head, origin).await? {
            return Ok(Next::Close);
        }
    }
}

/// Records exactly one session per request.
///
/// Paths that end without calling [`SessionGuard::finish`] (client gone,
/// stream error, task aborted) record the entry as aborted when dropped.
struct SessionGuard<'a> {
    recorder: &'a SessionRecorder,
    entry: Option<SessionEntry>,
    started: Instant,
}

impl<'a> SessionGuard<'a> {
    fn new(
        recorder: &'a SessionRecorder,
        url: String,
        method: &str,
        started: Instant,
        source: SessionSource,
    ) -> Self {
        SessionGuard {
            recorder,
            entry: Some(SessionEntry {
                url,
                method: method.to_string(),
                source,
                ..Default::default()
            }),
            started,
        }
    }

    fn update<F: FnOnce(&mut SessionEntry)>(&mut self, f: F) {
        if let Some(entry) = self.entry.as_mut() {
            f(entry);
        }
    }

    fn finish<F: FnOnce(&mut SessionEntry)>(mut self, f: F) {
        if let Some(mut entry) = self.entry.take() {
            f(&mut entry);
            entry.duration_ms = self.started.elapsed().as_millis() as u64;
            self.recorder.record(entry);
        }
    }

    fn fail(self, status: u16, error: &Error) {
        self.finish(|entry| {
            entry.status = status;
            entry.error = Some(error.to_string());
        });
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.error.get_or_insert_with(|| "aborted".to_string());
            entry.duration_ms = self.started.elapsed().as_millis() as u64;
            debug!("{} {} aborted", entry.method, entry.url);
            self.recorder.record(entry);
        }
    }
}

/// Whether a response can be buffered for rule evaluation.
fn inspectable(headers: &HeaderMap, kind: BodyKind, max_body_bytes: usize) -> bool {
    let encoding = header_str(headers, CONTENT_ENCODING).trim();
    if !(encoding.is_empty() || encoding.eq_ignore_ascii_case("identity")) {
        return false;
    }
    match kind {
        BodyKind::Empty => true,
        BodyKind::Length(len) => len <= max_body_bytes as u64,
        BodyKind::Chunked | BodyKind::UntilClose => false,
    }
}

fn may_carry_body(method: &str, status: u16) -> bool {
    !(method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304)
}

/// Sends the request upstream and waits for the final response head.
async fn forward_request<IO>(
    shared: &Shared,
    conn: &mut BufReader<IO>,
    head: &RequestHead,
    target: &Target,
) -> Result<(BufReader<BoxedIo>, ResponseHead)>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    let body_kind = http::request_body_kind(&head.headers)?;
    let mut headers = http::upstream_request_headers(head, target)?;
    let expects_continue = header_str(&head.headers, EXPECT).eq_ignore_ascii_case("100-continue");
    headers.remove(EXPECT);

    let stream = shared
        .connector
        .connect(&target.host, target.port, target.is_tls())
        .await?;
    let mut upstream = BufReader::new(stream);
    upstream
        .write_all(&http::encode_request_head(&head.method, &target.path, &headers))
        .await?;

    if expects_continue && body_kind != BodyKind::Empty {
        conn.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        conn.flush().await?;
    }
    http::copy_body(conn, &mut upstream, body_kind).await?;

    loop {
        let response = http::read_response_head(&mut upstream).await?;
        if (100..200).contains(&response.status) {
            trace!("Skipping interim {} from {}", response.status, target.host);
            continue;
        }
        return Ok((upstream, response));
    }
}

/// Proxies one request. Returns whether the client connection may be reused.
async fn exchange<IO>(
    shared: &Shared,
    conn: &mut BufReader<IO>,
    head: RequestHead,
    origin: &Origin,
) -> Result<bool>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let target = match http::resolve_target(&head, origin.tls, origin.local_port, origin.host.as_deref()) {
        Ok(target) => target,
        Err(e) => {
            debug!("Rejecting request from {}: {}", origin.client, e);
            SessionGuard::new(&shared.recorder, head.target.clone(), &head.method, started, SessionSource::Proxy)
                .fail(400, &e);
            http::write_simple_response(conn, 400, "Invalid target URL", true).await?;
            return Ok(false);
        }
    };

    let mut guard = SessionGuard::new(
        &shared.recorder,
        target.url.clone(),
        &head.method,
        started,
        SessionSource::Proxy,
    );
    guard.update(|entry| entry.request_headers = Some(http::headers_to_map(&head.headers)));
    let keep_alive = head.keep_alive();

    let forwarded = tokio::time::timeout(
        shared.config.upstream_timeout(),
        forward_request(shared, conn, &head, &target),
    )
    .await
    .unwrap_or_else(|_| Err(Error::Timeout(format!("waiting for {}", target.url))));
    let (mut upstream, response) = match forwarded {
        Ok(forwarded) => forwarded,
        Err(e) => {
            warn!("{} {} failed: {}", head.method, target.url, e);
            guard.fail(502, &e);
            let _ = http::write_simple_response(conn, 502, "Bad gateway", true).await;
            return Ok(false);
        }
    };

    let body_kind = match http::response_body_kind(&head.method, response.status, &response.headers) {
        Ok(kind) => kind,
        Err(e) => {
            guard.fail(502, &e);
            let _ = http::write_simple_response(conn, 502, "Bad gateway", true).await;
            return Ok(false);
        }
    };
    guard.update(|entry| entry.status = response.status);

    let raw_content_type = header_str(&response.headers, CONTENT_TYPE).to_string();
    let rules = shared.rules.list();
    let ctx = MatchContext {
        method: &head.method,
        url: &target.url,
        content_type: &raw_content_type,
        headers: &head.headers,
        body_text: None,
    };
    let candidates = collect_rule_candidates(&rules, &ctx);
    let early = select_best_rule(&candidates.matches);
    let wanted = early.is_some() || !candidates.needs_body.is_empty();

    if !(wanted && inspectable(&response.headers, body_kind, shared.config.max_body_bytes)) {
        let reusable = keep_alive && body_kind.is_framed();
        let mut headers = response.headers;
        http::strip_hop_by_hop(&mut headers);
        if !reusable {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        conn.write_all(&http::encode_response_head(response.status, &response.reason, &headers))
            .await?;
        let size = http::copy_body(&mut upstream, conn, body_kind).await?;

        guard.finish(|entry| {
            entry.content_type = normalize_content_type(&raw_content_type);
            entry.size_bytes = size;
            entry.matched_rule_id = early.map(|rule| rule.id.clone());
            entry.response_headers = Some(http::headers_to_map(&headers));
        });
        return Ok(reusable);
    }

    let len = match body_kind {
        BodyKind::Length(len) => len,
        _ => 0,
    };
    let read = tokio::time::timeout(shared.config.upstream_timeout(), http::read_body(&mut upstream, len))
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(format!("reading body of {}", target.url))));
    let body = match read {
        Ok(body) => body,
        Err(e) => {
            warn!("{} {} body read failed: {}", head.method, target.url, e);
            guard.fail(502, &e);
            let _ = http::write_simple_response(conn, 502, "Bad gateway", true).await;
            return Ok(false);
        }
    };
    let rule = if candidates.needs_body.is_empty() {
        early
    } else {
        let text = String::from_utf8_lossy(&body);
        select_rule(&rules, &ctx.with_body(&text))
    };

    let original_status = response.status;
    let resolution = resolve_action(
        rule.and_then(|rule| rule.action.as_ref()),
        ResponseParts {
            status: response.status,
            headers: response.headers,
            body,
            content_type: raw_content_type.clone(),
        },
        Some(shared.resources.as_ref()),
    );
    if let Some(err) = resolution.error {
        warn!("Rule action for {} not applied: {}", target.url, err.as_str());
    }

    let ResponseParts {
        status,
        mut headers,
        body,
        content_type,
    } = resolution.response;
    http::strip_hop_by_hop(&mut headers);
    if resolution.modified {
        http::set_body_headers(&mut headers, &content_type, body.len());
    }
    if !keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let reason = if status == original_status { response.reason.as_str() } else { "" };
    let mut out = http::encode_response_head(status, reason, &headers);
    if may_carry_body(&head.method, status) {
        out.extend_from_slice(&body);
    }
    conn.write_all(&out).await?;
    conn.flush().await?;

    if resolution.modified {
        debug!("Rule {:?} rewrote {}", rule.map(|r| r.id.as_str()), target.url);
    }
    guard.finish(|entry| {
        entry.status = status;
        entry.content_type = normalize_content_type(if resolution.modified {
            &content_type
        } else {
            &raw_content_type
        });
        entry.size_bytes = body.len() as u64;
        entry.matched_rule_id = rule.map(|rule| rule.id.clone());
        entry.applied = resolution.modified;
        entry.error = resolution.error.map(|err| err.as_str().to_string());
        entry.response_headers = Some(http::headers_to_map(&headers));
    });
    Ok(keep_alive)
}

async fn handle_connect(
    shared: &Shared,
    mut conn: BufReader<TcpStream>,
    head: RequestHead,
    origin: Origin,
) -> Result<()> {
    let started = Instant::now();
    let (host, port) = match http::parse_authority(&head.target) {
        Ok(authority) => authority,
        Err(e) => {
            http::write_simple_response(&mut conn, 400, "Invalid CONNECT target", true).await?;
            return Err(e);
        }
    };

    match shared.interceptor() {
        Some(ca) => intercept_connect(shared, conn, ca, host, port, origin, started).await,
        None => tunnel(shared, conn, &host, port, started, true).await,
    }
}

async fn intercept_connect(
    shared: &Shared,
    mut conn: BufReader<TcpStream>,
    ca: &CertificateAuthority,
    host: String,
    port: u16,
    origin: Origin,
    started: Instant,
) -> Result<()> {
    let url = format!("https://{}:{}", host, port);

    // mint before answering so a CA failure is a visible 502
    if let Err(e) = ca.get_certificate(&host).await {
        let _ = conn.write_all(CONNECT_FAILED).await;
        SessionGuard::new(&shared.recorder, url, "CONNECT", started, SessionSource::Proxy).fail(502, &e);
        return Err(e);
    }
    conn.write_all(CONNECT_ESTABLISHED).await?;
    conn.flush().await?;

    let (stream, server_name) = match tls::accept(conn, ca, &host).await {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!("TLS handshake with {} for {} failed: {}", origin.client, host, e);
            SessionGuard::new(&shared.recorder, url, "CONNECT", started, SessionSource::Proxy).fail(502, &e);
            return Err(e);
        }
    };
    trace!("Intercepting {} (SNI {})", url, server_name);

    let default_host = if port == 443 {
        host
    } else {
        format!("{}:{}", host, port)
    };
    let origin = Origin {
        tls: true,
        host: Some(default_host),
        allow_connect: false,
        ..origin
    };
    let mut conn = BufReader::new(stream);
    serve(shared, &mut conn, &origin).await?;
    Ok(())
}

/// Splices `client` to `host:port`, recording only volume and duration.
async fn tunnel<C>(
    shared: &Shared,
    mut client: C,
    host: &str,
    port: u16,
    started: Instant,
    reply: bool,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let guard = SessionGuard::new(
        &shared.recorder,
        format!("https://{}:{}", host, port),
        "CONNECT",
        started,
        SessionSource::Tunnel,
    );

    let connected = tokio::time::timeout(
        shared.config.upstream_timeout(),
        shared.connector.connect(host, port, false),
    )
    .await
    .unwrap_or_else(|_| Err(Error::Timeout(format!("connecting to {}:{}", host, port))));
    let mut upstream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Tunnel to {}:{} failed: {}", host, port, e);
            if reply {
                let _ = client.write_all(CONNECT_FAILED).await;
            }
            guard.fail(502, &e);
            return Ok(());
        }
    };

    if reply {
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;
    }
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => guard.finish(|entry| {
            entry.status = 200;
            entry.size_bytes = sent + received;
        }),
        Err(e) => guard.finish(|entry| {
            entry.status = 200;
            entry.error = Some(e.to_string());
        }),
    }
    Ok(())
}

async fn handle_transparent_tls(
    shared: &Shared,
    stream: TcpStream,
    origin: Origin,
    server_name: Option<String>,
) -> Result<()> {
    let started = Instant::now();
    if let Some(ca) = shared.interceptor() {
        let fallback = server_name.as_deref().unwrap_or(FALLBACK_HOST);
        let (stream, host) = tls::accept(stream, ca, fallback).await?;
        let origin = Origin {
            tls: true,
            host: Some(host),
            allow_connect: false,
            ..origin
        };
        let mut conn = BufReader::new(stream);
        serve(shared, &mut conn, &origin).await?;
        return Ok(());
    }

    match server_name {
        Some(host) => tunnel(shared, stream, &host, 443, started, false).await,
        None => {
            debug!("TLS from {} without SNI, no destination to tunnel to", origin.client);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_config_defaults() {
        let config: ProxyConfig = serde_json::from_str(r#"{"httpsMode": "mitm"}"#).unwrap();
        assert_eq!(config.port, 8888);
        assert_eq!(config.https_mode, HttpsMode::Mitm);
        assert_eq!(config.listen_mode, ListenMode::Explicit);
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_inspectable() {
        let mut headers = HeaderMap::new();
        assert!(inspectable(&headers, BodyKind::Length(10), 10));
        assert!(!inspectable(&headers, BodyKind::Length(11), 10));
        assert!(inspectable(&headers, BodyKind::Empty, 10));
        assert!(!inspectable(&headers, BodyKind::Chunked, 10));
        assert!(!inspectable(&headers, BodyKind::UntilClose, 10));

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(!inspectable(&headers, BodyKind::Length(5), 10));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(inspectable(&headers, BodyKind::Length(5), 10));
    }

    #[test]
    fn test_guard_records_once() {
        let store = Arc::new(MemoryStore::new());
        let recorder = SessionRecorder::new(store.clone());

        let guard = SessionGuard::new(&recorder, "http://a/".into(), "GET", Instant::now(), SessionSource::Proxy);
        guard.finish(|entry| entry.status = 200);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entry.status, 200);
        assert!(sessions[0].entry.error.is_none());
    }

    #[test]
    fn test_dropped_guard_records_aborted() {
        let store = Arc::new(MemoryStore::new());
        let recorder = SessionRecorder::new(store.clone());

        let mut guard = SessionGuard::new(&recorder, "http://a/".into(), "GET", Instant::now(), SessionSource::Proxy);
        guard.update(|entry| entry.status = 200);
        drop(guard);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].entry.status, 200);
        assert_eq!(sessions[0].entry.error.as_deref(), Some("aborted"));
    }

    #[test]
    fn test_may_carry_body() {
        assert!(may_carry_body("GET", 200));
        assert!(!may_carry_body("HEAD", 200));
        assert!(!may_carry_body("GET", 304));
        assert!(!may_carry_body("GET", 204));
    }

    #[tokio::test]
    async fn test_mitm_requires_ca() {
        let store = Arc::new(MemoryStore::new());
        let services = ProxyServices::new(store.clone(), SessionRecorder::new(store));
        let config = ProxyConfig {
            port: 0,
            https_mode: HttpsMode::Mitm,
            ..Default::default()
        };
        assert!(matches!(
            ProxyServer::start(config, services).await,
            Err(Error::Config(_))
        ));
    }
}
