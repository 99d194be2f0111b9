//! Server Connection
//!
//! One physical server endpoint: its socket pool, its last known role and
//! a background pinger measuring round-trip latency.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::session::Mode;
use crate::socket::Socket;
use crate::window::LatencyWindow;

/// Latency difference below which two servers count as equally near
pub const PING_HYSTERESIS: Duration = Duration::from_millis(15);

/// Sample recorded when a ping fails
const FAILED_PING: Duration = Duration::from_secs(3600);

/// Replica tag set (`dc = east`, `rack = 2`, ...)
pub type ServerTags = BTreeMap<String, String>;

/// What the last handshake reported about a server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub master: bool,
    /// Sharding router; treated as a master
    pub mongos: bool,
    pub tags: ServerTags,
    pub max_wire_version: i32,
    pub set_name: Option<String>,
}

impl ServerInfo {
    /// Whether the server carries every tag of at least one requested set.
    /// An empty request matches anything.
    pub fn matches_tags(&self, wanted: &[ServerTags]) -> bool {
        if wanted.is_empty() {
            return true;
        }
        wanted
            .iter()
            .any(|set| set.iter().all(|(k, v)| self.tags.get(k) == Some(v)))
    }
}

/// Handle to one server endpoint
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    addr: String,
    resolved: SocketAddr,
    state: Mutex<ServerState>,
    resync: mpsc::Sender<()>,
    cancel: CancellationToken,
    diagnostics: Arc<dyn Diagnostics>,
}

struct ServerState {
    /// Every open socket, in use or not
    live: Vec<Socket>,
    /// Idle subset of `live`
    unused: Vec<Socket>,
    dialing: usize,
    closed: bool,
    /// A socket died abnormally since the last handshake
    abended: bool,
    info: Arc<ServerInfo>,
    ping_value: Duration,
    ping_window: LatencyWindow,
}

/// Serializable view of a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSummary {
    pub addr: String,
    pub resolved: String,
    pub master: bool,
    pub mongos: bool,
    pub set_name: Option<String>,
    pub tags: ServerTags,
    pub ping_ms: u64,
    pub live_sockets: usize,
    pub unused_sockets: usize,
    pub abended: bool,
}

impl Server {
    /// Create a server record and start its pinger
    pub fn new(
        addr: String,
        resolved: SocketAddr,
        resync: mpsc::Sender<()>,
        ping_delay: Duration,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Server {
        let inner = Arc::new(ServerInner {
            addr,
            resolved,
            state: Mutex::new(ServerState {
                live: Vec::new(),
                unused: Vec::new(),
                dialing: 0,
                closed: false,
                abended: false,
                info: Arc::new(ServerInfo::default()),
                ping_value: Duration::ZERO,
                ping_window: LatencyWindow::new(),
            }),
            resync,
            cancel: CancellationToken::new(),
            diagnostics,
        });
        tokio::spawn(pinger(Arc::downgrade(&inner), inner.cancel.clone(), ping_delay));
        Server { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ServerInner>) -> Server {
        Server { inner }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn resolved_addr(&self) -> SocketAddr {
        self.inner.resolved
    }

    pub fn ptr_eq(&self, other: &Server) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Hand out a socket, reusing an idle one when possible.
    ///
    /// The flag reports whether a socket to this server died abnormally
    /// since its role was last confirmed.
    pub async fn acquire_socket(&self, pool_limit: usize, timeout: Option<Duration>) -> Result<(Socket, bool)> {
        loop {
            let (reuse, abended, info) = {
                let mut st = self.inner.state.lock();
                if st.closed {
                    return Err(self.closed_error());
                }
                let abended = st.abended;
                let info = st.info.clone();
                match st.unused.pop() {
                    Some(socket) => (Some(socket), abended, info),
                    None => {
                        let in_use = st.live.len().saturating_sub(st.unused.len()) + st.dialing;
                        if pool_limit > 0 && in_use >= pool_limit {
                            return Err(Error::PoolLimit(self.inner.addr.clone()));
                        }
                        st.dialing += 1;
                        (None, abended, info)
                    }
                }
            };

            let Some(socket) = reuse else {
                let dialed = self.dial(info, timeout).await;
                let mut st = self.inner.state.lock();
                st.dialing -= 1;
                let socket = dialed?;
                if st.closed {
                    drop(st);
                    socket.close();
                    return Err(self.closed_error());
                }
                st.live.push(socket.clone());
                return Ok((socket, abended));
            };

            match socket.initial_acquire(info, timeout) {
                Ok(()) => return Ok((socket, abended)),
                Err(e) => {
                    tracing::debug!("Skipping dead pooled socket to {}: {}", self.inner.addr, e);
                }
            }
        }
    }

    async fn dial(&self, info: Arc<ServerInfo>, timeout: Option<Duration>) -> Result<Socket> {
        let addr = &self.inner.addr;
        tracing::debug!("Establishing new connection to {} (timeout={:?})", addr, timeout);

        let connect = TcpStream::connect(self.inner.resolved);
        let connected = match timeout {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|_| Error::ConnectionTimeout(addr.clone()))?,
            None => connect.await,
        };
        let stream = connected.map_err(|e| Error::ConnectionFailed {
            address: addr.clone(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;

        tracing::info!("Connection to {} established", addr);
        Ok(Socket::new(
            stream,
            addr.clone(),
            Some(Arc::downgrade(&self.inner)),
            info,
            timeout,
            self.inner.diagnostics.clone(),
        ))
    }

    fn closed_error(&self) -> Error {
        Error::Network(format!("server {} is closed", self.inner.addr))
    }

    /// Put a released socket back in the idle list
    pub(crate) fn recycle_socket(&self, socket: Socket) {
        let mut st = self.inner.state.lock();
        if st.closed {
            drop(st);
            socket.close();
            return;
        }
        // Killed while being released; already dropped from `live`.
        if socket.is_dead() || !st.live.iter().any(|s| s.ptr_eq(&socket)) {
            return;
        }
        st.unused.push(socket);
    }

    /// Forget a socket that died abnormally and ask for a resync
    pub(crate) fn abend_socket(&self, socket: &Socket) {
        {
            let mut st = self.inner.state.lock();
            st.abended = true;
            st.live.retain(|s| !s.ptr_eq(socket));
            st.unused.retain(|s| !s.ptr_eq(socket));
        }
        self.request_resync();
    }

    /// Forget a socket that was closed on purpose
    pub(crate) fn remove_socket(&self, socket: &Socket) {
        let mut st = self.inner.state.lock();
        st.live.retain(|s| !s.ptr_eq(socket));
        st.unused.retain(|s| !s.ptr_eq(socket));
    }

    fn request_resync(&self) {
        // A full channel already carries a pending request.
        let _ = self.inner.resync.try_send(());
    }

    /// Close every socket and stop the pinger
    pub fn close(&self) {
        let sockets = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.unused.clear();
            std::mem::take(&mut st.live)
        };
        self.inner.cancel.cancel();
        tracing::debug!("Closing server {} with {} sockets", self.inner.addr, sockets.len());
        for socket in sockets {
            socket.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_abended(&self) -> bool {
        self.inner.state.lock().abended
    }

    /// Record a fresh handshake result; clears the abended flag
    pub fn set_info(&self, info: ServerInfo) {
        let mut st = self.inner.state.lock();
        st.info = Arc::new(info);
        st.abended = false;
    }

    pub fn info(&self) -> Arc<ServerInfo> {
        self.inner.state.lock().info.clone()
    }

    /// Worst round-trip time in the latency window
    pub fn ping_value(&self) -> Duration {
        self.inner.state.lock().ping_value
    }

    pub(crate) fn record_ping(&self, sample: Duration) {
        let mut st = self.inner.state.lock();
        st.ping_window.push(sample);
        st.ping_value = st.ping_window.max();
    }

    /// Sockets currently checked out
    pub fn in_use(&self) -> usize {
        let st = self.inner.state.lock();
        st.live.len().saturating_sub(st.unused.len())
    }

    pub fn live_sockets(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    pub fn unused_sockets(&self) -> usize {
        self.inner.state.lock().unused.len()
    }

    /// One ping round-trip on a pooled socket
    pub async fn ping_once(&self, timeout: Option<Duration>) -> Result<Duration> {
        let (socket, _) = self.acquire_socket(0, timeout).await?;
        let start = Instant::now();
        let result = command::ping(&socket).await.map(|_| start.elapsed());
        socket.release()?;
        result
    }

    pub fn summary(&self) -> ServerSummary {
        let st = self.inner.state.lock();
        ServerSummary {
            addr: self.inner.addr.clone(),
            resolved: self.inner.resolved.to_string(),
            master: st.info.master,
            mongos: st.info.mongos,
            set_name: st.info.set_name.clone(),
            tags: st.info.tags.clone(),
            ping_ms: st.ping_value.as_millis() as u64,
            live_sockets: st.live.len(),
            unused_sockets: st.unused.len(),
            abended: st.abended,
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.addr)
            .field("resolved", &self.inner.resolved)
            .finish()
    }
}

async fn pinger(server: Weak<ServerInner>, cancel: CancellationToken, delay: Duration) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let Some(inner) = server.upgrade() else {
            return;
        };
        let server = Server::from_inner(inner);
        match server.ping_once(Some(delay)).await {
            Ok(rtt) => {
                tracing::trace!("Ping for {} is {:?}", server.addr(), rtt);
                server.record_ping(rtt);
            }
            Err(e) => {
                if server.is_closed() {
                    return;
                }
                tracing::debug!("Ping to {} failed: {}", server.addr(), e);
                server.record_ping(FAILED_PING);
                server.request_resync();
            }
        }
    }
}

/// Pick the server best suited to `mode` among `servers`.
///
/// Candidates are compared against the current best in order, and the
/// first applicable rule decides: required tags, secondary preference,
/// role preference, latency beyond [`PING_HYSTERESIS`], and finally the
/// number of sockets checked out.
pub fn best_fit(mode: Mode, servers: &[Server], tags: &[ServerTags]) -> Option<Server> {
    let mut best: Option<(&Server, Arc<ServerInfo>, Duration, usize)> = None;

    for next in servers {
        if next.is_closed() {
            continue;
        }
        let info = next.info();
        let tagged = info.mongos || info.matches_tags(tags);

        let (best_info, best_ping, best_load) = match &best {
            Some((_, info, ping, load)) => (info.clone(), *ping, *load),
            None => {
                if tagged {
                    best = Some((next, info, next.ping_value(), next.in_use()));
                }
                continue;
            }
        };

        let ping = next.ping_value();
        let load = next.in_use();
        let ping_gap = if ping > best_ping { ping - best_ping } else { best_ping - ping };
        let swap = if !tagged {
            false
        } else if mode.prefers_secondary() && info.master && !info.mongos && !best_info.master {
            false
        } else if info.master != best_info.master && mode != Mode::Nearest {
            (mode == Mode::PrimaryPreferred) != best_info.master
        } else if ping_gap > PING_HYSTERESIS {
            ping < best_ping
        } else {
            load < best_load
        };

        if swap {
            best = Some((next, info, ping, load));
        }
    }

    let (server, info, _, _) = best?;
    if mode == Mode::Secondary && info.master && !info.mongos {
        return None;
    }
    Some(server.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics;
    use crate::mock::{wait_for, MockConfig, MockServer};

    fn server_at(addr: &str) -> (Server, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let resolved: SocketAddr = addr.parse().unwrap();
        let server = Server::new(addr.to_string(), resolved, tx, Duration::from_secs(3600), diagnostics::noop());
        (server, rx)
    }

    fn fake(port: u16, master: bool, ping_ms: u64) -> Server {
        let (server, _) = server_at(&format!("127.0.0.1:{}", port));
        server.set_info(ServerInfo { master, ..Default::default() });
        server.record_ping(Duration::from_millis(ping_ms));
        server
    }

    fn tags(pairs: &[(&str, &str)]) -> ServerTags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_tag_matching() {
        let info = ServerInfo { tags: tags(&[("dc", "east"), ("rack", "1")]), ..Default::default() };
        assert!(info.matches_tags(&[]));
        assert!(info.matches_tags(&[tags(&[("dc", "east")])]));
        assert!(!info.matches_tags(&[tags(&[("dc", "west")])]));
        assert!(info.matches_tags(&[tags(&[("dc", "west")]), tags(&[("rack", "1")])]));
    }

    #[tokio::test]
    async fn test_socket_recycled_after_release() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, _rx) = server_at(&mock.addr());

        let (first, abended) = server.acquire_socket(0, None).await.unwrap();
        assert!(!abended);
        assert_eq!(server.in_use(), 1);
        first.release().unwrap();
        assert_eq!(server.in_use(), 0);
        assert_eq!(server.unused_sockets(), 1);

        let (second, _) = server.acquire_socket(0, None).await.unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(server.live_sockets(), 1);
        wait_for(|| mock.connections() == 1, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_pooled_socket_cannot_be_revived() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, _rx) = server_at(&mock.addr());

        let (socket, _) = server.acquire_socket(0, None).await.unwrap();
        socket.release().unwrap();
        assert_eq!(server.unused_sockets(), 1);

        assert!(matches!(socket.acquire(), Err(Error::InvariantViolation(_))));
        assert_eq!(socket.references(), 0);
        assert_eq!(server.in_use(), 0);

        let (again, _) = server.acquire_socket(0, None).await.unwrap();
        assert!(again.ptr_eq(&socket));
        assert_eq!(again.references(), 1);
        assert_eq!(server.unused_sockets(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_pool_limit() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, _rx) = server_at(&mock.addr());

        let (r1, r2) = tokio::join!(server.acquire_socket(1, None), server.acquire_socket(1, None));
        let (held, failed) = match (r1, r2) {
            (Ok((socket, _)), Err(e)) | (Err(e), Ok((socket, _))) => (socket, e),
            (r1, r2) => panic!("expected one success and one failure, got {:?} and {:?}", r1.is_ok(), r2.is_ok()),
        };
        assert!(matches!(failed, Error::PoolLimit(_)));
        assert_eq!(server.live_sockets(), 1);
        held.release().unwrap();
    }

    #[tokio::test]
    async fn test_pool_limit_fails_fast() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, _rx) = server_at(&mock.addr());

        let (held, _) = server.acquire_socket(1, None).await.unwrap();
        let started = Instant::now();
        let err = server.acquire_socket(1, None).await.unwrap_err();
        assert!(matches!(err, Error::PoolLimit(_)));
        assert!(started.elapsed() < Duration::from_millis(100));

        held.release().unwrap();
        let (again, _) = server.acquire_socket(1, None).await.unwrap();
        assert!(again.ptr_eq(&held));
    }

    #[tokio::test]
    async fn test_abend_flags_server_and_requests_resync() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, mut rx) = server_at(&mock.addr());

        let (socket, _) = server.acquire_socket(0, None).await.unwrap();
        mock.stop();
        wait_for(|| socket.is_dead(), Duration::from_secs(2)).await;

        assert!(server.is_abended());
        assert_eq!(server.live_sockets(), 0);
        assert!(rx.try_recv().is_ok());

        server.set_info(ServerInfo { master: true, ..Default::default() });
        assert!(!server.is_abended());
    }

    #[tokio::test]
    async fn test_close_shuts_sockets() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, mut rx) = server_at(&mock.addr());

        let (socket, _) = server.acquire_socket(0, None).await.unwrap();
        server.close();
        assert!(socket.is_dead());
        assert!(!server.is_abended());
        assert!(rx.try_recv().is_err());
        assert!(server.acquire_socket(0, None).await.is_err());
        // A late release of a closed socket is harmless.
        socket.release().unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (server, _rx) = server_at(&addr);
        let err = server.acquire_socket(0, Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(server.live_sockets(), 0);
    }

    #[tokio::test]
    async fn test_ping_once() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let (server, _rx) = server_at(&mock.addr());
        let rtt = server.ping_once(Some(Duration::from_secs(1))).await.unwrap();
        assert!(rtt < Duration::from_secs(1));
        assert_eq!(server.in_use(), 0);
    }

    #[tokio::test]
    async fn test_best_fit_role_preference() {
        let primary = fake(20001, true, 5);
        let secondary = fake(20002, false, 5);
        let servers = vec![primary.clone(), secondary.clone()];

        let pick = |mode| best_fit(mode, &servers, &[]).unwrap();
        assert!(pick(Mode::Secondary).ptr_eq(&secondary));
        assert!(pick(Mode::SecondaryPreferred).ptr_eq(&secondary));
        assert!(pick(Mode::Monotonic).ptr_eq(&secondary));
        assert!(pick(Mode::PrimaryPreferred).ptr_eq(&primary));
        // Nearest ignores roles and falls through to latency and load.
        assert!(pick(Mode::Nearest).ptr_eq(&primary));
    }

    #[tokio::test]
    async fn test_best_fit_rejects_primary_after_secondary() {
        let secondary = fake(20011, false, 40);
        let primary = fake(20012, true, 1);
        let servers = vec![secondary.clone(), primary];
        assert!(best_fit(Mode::SecondaryPreferred, &servers, &[]).unwrap().ptr_eq(&secondary));
        // Without the secondary preference, latency alone decides.
        assert!(!best_fit(Mode::Nearest, &servers, &[]).unwrap().ptr_eq(&secondary));
    }

    #[tokio::test]
    async fn test_best_fit_latency_hysteresis() {
        let far = fake(20021, false, 50);
        let near = fake(20022, false, 10);
        let close = fake(20023, false, 55);
        assert!(best_fit(Mode::Nearest, &[far.clone(), near.clone()], &[]).unwrap().ptr_eq(&near));
        // Within the hysteresis the first candidate is kept.
        assert!(best_fit(Mode::Nearest, &[far.clone(), close], &[]).unwrap().ptr_eq(&far));
    }

    #[tokio::test]
    async fn test_best_fit_tags_and_secondary_only() {
        let east = fake(20031, false, 5);
        east.set_info(ServerInfo { tags: tags(&[("dc", "east")]), ..Default::default() });
        let west = fake(20032, false, 5);
        west.set_info(ServerInfo { tags: tags(&[("dc", "west")]), ..Default::default() });
        let servers = vec![east.clone(), west.clone()];

        let wanted = [tags(&[("dc", "west")])];
        assert!(best_fit(Mode::Nearest, &servers, &wanted).unwrap().ptr_eq(&west));
        assert!(best_fit(Mode::Nearest, &servers, &[tags(&[("dc", "north")])]).is_none());

        let primary = fake(20033, true, 5);
        assert!(best_fit(Mode::Secondary, &[primary.clone()], &[]).is_none());
        assert!(best_fit(Mode::Strong, &[primary.clone()], &[]).unwrap().ptr_eq(&primary));
    }

    #[tokio::test]
    async fn test_best_fit_skips_closed_servers() {
        let closed = fake(20041, false, 1);
        let open = fake(20042, false, 50);
        closed.close();
        let picked = best_fit(Mode::Nearest, &[closed.clone(), open.clone()], &[]).unwrap();
        assert!(picked.ptr_eq(&open));
        assert!(best_fit(Mode::Nearest, &[closed], &[]).is_none());
    }

    #[tokio::test]
    async fn test_best_fit_prefers_less_loaded() {
        let busy_mock = MockServer::start(MockConfig::secondary()).await;
        let idle_mock = MockServer::start(MockConfig::secondary()).await;
        let (busy, _r1) = server_at(&busy_mock.addr());
        let (idle, _r2) = server_at(&idle_mock.addr());

        let (_held, _) = busy.acquire_socket(0, None).await.unwrap();
        let picked = best_fit(Mode::Nearest, &[busy.clone(), idle.clone()], &[]).unwrap();
        assert!(picked.ptr_eq(&idle));
    }
}
