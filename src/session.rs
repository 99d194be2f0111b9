//! Sessions
//!
//! A session is the handle callers run operations through. It picks
//! sockets from the cluster according to its consistency mode and, unless
//! the mode is eventual, keeps them pinned so later operations observe
//! earlier ones.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::auth::{Authenticator, CommandAuthenticator, Credential};
use crate::cluster::Cluster;
use crate::command::{self, Command, CommandReply};
use crate::config::DialInfo;
use crate::diagnostics::{self, Diagnostics};
use crate::error::{Error, Result};
use crate::server::ServerTags;
use crate::socket::Socket;
use crate::wire::{Op, Reply, QUERY_SLAVE_OK};

/// Consistency mode and read preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Any server, nothing pinned
    Eventual,
    /// Pinned to a secondary until the first write, then to the primary
    Monotonic,
    /// Primary only
    #[default]
    #[serde(alias = "primary")]
    Strong,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl Mode {
    /// Whether selection should favour secondaries over the primary
    pub fn prefers_secondary(self) -> bool {
        matches!(self, Mode::Secondary | Mode::SecondaryPreferred)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Eventual => "eventual",
            Mode::Monotonic => "monotonic",
            Mode::Strong => "strong",
            Mode::PrimaryPreferred => "primaryPreferred",
            Mode::Secondary => "secondary",
            Mode::SecondaryPreferred => "secondaryPreferred",
            Mode::Nearest => "nearest",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "eventual" => Ok(Mode::Eventual),
            "monotonic" => Ok(Mode::Monotonic),
            "strong" | "primary" => Ok(Mode::Strong),
            "primarypreferred" => Ok(Mode::PrimaryPreferred),
            "secondary" => Ok(Mode::Secondary),
            "secondarypreferred" => Ok(Mode::SecondaryPreferred),
            "nearest" => Ok(Mode::Nearest),
            _ => Err(Error::Config(format!("unknown mode: {}", s))),
        }
    }
}

/// Client handle over a cluster
pub struct Session {
    cluster: Cluster,
    state: Mutex<SessionState>,
    /// Serializes the slow acquisition path
    acquire_lock: tokio::sync::Mutex<()>,
    authenticator: Arc<dyn Authenticator>,
}

#[derive(Clone)]
struct SessionState {
    mode: Mode,
    /// Mode restored by `new_session`
    default_mode: Mode,
    slave_ok: bool,
    master_socket: Option<Socket>,
    slave_socket: Option<Socket>,
    sync_timeout: Option<Duration>,
    sock_timeout: Option<Duration>,
    pool_limit: usize,
    tags: Vec<ServerTags>,
    /// Replayed on every newly acquired socket
    creds: Vec<Credential>,
    dial_creds: Vec<Credential>,
    /// Acknowledge writes with getLastError
    safe: bool,
    closed: bool,
}

impl SessionState {
    fn unpinned(&self) -> SessionState {
        SessionState {
            master_socket: None,
            slave_socket: None,
            closed: false,
            ..self.clone()
        }
    }
}

impl Session {
    fn new(cluster: Cluster, mode: Mode, info: &DialInfo, authenticator: Arc<dyn Authenticator>) -> Session {
        let creds: Vec<Credential> = info.credential.iter().cloned().collect();
        Session {
            cluster,
            state: Mutex::new(SessionState {
                mode,
                default_mode: info.mode,
                slave_ok: mode != Mode::Strong,
                master_socket: None,
                slave_socket: None,
                sync_timeout: info.timeout(),
                sock_timeout: info.socket_timeout(),
                pool_limit: info.pool_limit,
                tags: Vec::new(),
                dial_creds: creds.clone(),
                creds,
                safe: true,
                closed: false,
            }),
            acquire_lock: tokio::sync::Mutex::new(()),
            authenticator,
        }
    }

    fn derive(&self, state: SessionState) -> Session {
        self.cluster.acquire();
        Session {
            cluster: self.cluster.clone(),
            state: Mutex::new(state),
            acquire_lock: tokio::sync::Mutex::new(()),
            authenticator: self.authenticator.clone(),
        }
    }

    /// Independent session with the same settings and credentials,
    /// starting without pinned sockets
    pub fn copy(&self) -> Session {
        let state = self.state.lock().unpinned();
        self.derive(state)
    }

    /// Like [`Session::copy`], but back in the dial mode and holding only
    /// the dial credentials
    pub fn new_session(&self) -> Session {
        let mut state = self.state.lock().unpinned();
        state.mode = state.default_mode;
        state.slave_ok = state.mode != Mode::Strong;
        state.creds = state.dial_creds.clone();
        self.derive(state)
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Change the consistency mode. With `refresh`, pinned sockets are
    /// released and the session may read from secondaries again unless
    /// the mode is strong.
    pub fn set_mode(&self, mode: Mode, refresh: bool) {
        let pins = {
            let mut st = self.state.lock();
            st.mode = mode;
            if refresh {
                st.slave_ok = mode != Mode::Strong;
                take_pins(&mut st)
            } else {
                if mode == Mode::Strong {
                    st.slave_ok = false;
                } else if st.master_socket.is_none() {
                    st.slave_ok = true;
                }
                Vec::new()
            }
        };
        release_all(pins);
    }

    /// Release pinned sockets so the next operation selects afresh
    pub fn refresh(&self) {
        let mode = self.mode();
        self.set_mode(mode, true);
    }

    /// How long to wait for a suitable server (`None` waits forever)
    pub fn set_sync_timeout(&self, timeout: Option<Duration>) {
        self.state.lock().sync_timeout = timeout;
    }

    /// Per-request socket timeout (`None` disables it)
    pub fn set_socket_timeout(&self, timeout: Option<Duration>) {
        let mut st = self.state.lock();
        st.sock_timeout = timeout;
        for socket in st.master_socket.iter().chain(st.slave_socket.iter()) {
            socket.set_timeout(timeout);
        }
    }

    /// Sockets per server this session may cause to exist (0 = unlimited)
    pub fn set_pool_limit(&self, limit: usize) {
        self.state.lock().pool_limit = limit;
    }

    /// Toggle write acknowledgement
    pub fn set_safe(&self, safe: bool) {
        self.state.lock().safe = safe;
    }

    /// Restrict secondary reads to servers carrying one of the tag sets
    pub fn select_servers(&self, tags: Vec<ServerTags>) {
        self.state.lock().tags = tags;
    }

    /// Addresses of the servers currently known to the cluster
    pub fn live_servers(&self) -> Vec<String> {
        self.cluster.live_servers()
    }

    /// Reuse a compatible pinned socket, dropping dead pins on the way
    fn reuse_pinned(&self, slave_ok: bool) -> Result<Option<Socket>> {
        let dead = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(Error::SessionClosed);
            }
            let mut dead = Vec::new();
            if st.master_socket.as_ref().map_or(false, Socket::is_dead) {
                dead.extend(st.master_socket.take());
            }
            if st.slave_socket.as_ref().map_or(false, Socket::is_dead) {
                dead.extend(st.slave_socket.take());
            }

            let slave_fits = st.slave_ok
                && slave_ok
                && (st.master_socket.is_none() || !matches!(st.mode, Mode::PrimaryPreferred | Mode::Monotonic));
            let candidate = match (&st.slave_socket, &st.master_socket) {
                (Some(slave), _) if slave_fits => Some(slave.clone()),
                (_, Some(master)) => Some(master.clone()),
                _ => None,
            };
            if let Some(socket) = candidate {
                if socket.acquire().is_ok() {
                    drop(st);
                    release_all(dead);
                    return Ok(Some(socket));
                }
            }
            dead
        };
        if !dead.is_empty() {
            tracing::debug!("Dropping {} dead pinned socket(s)", dead.len());
        }
        release_all(dead);
        Ok(None)
    }

    /// Socket for the next operation. The caller owns one reference.
    async fn acquire_socket(&self, slave_ok: bool) -> Result<Socket> {
        if let Some(socket) = self.reuse_pinned(slave_ok)? {
            return Ok(socket);
        }

        let _guard = self.acquire_lock.lock().await;
        if let Some(socket) = self.reuse_pinned(slave_ok)? {
            return Ok(socket);
        }

        let (mode, allow_slave, sync_timeout, sock_timeout, tags, pool_limit, creds) = {
            let st = self.state.lock();
            (
                st.mode,
                slave_ok && st.slave_ok,
                st.sync_timeout,
                st.sock_timeout,
                st.tags.clone(),
                st.pool_limit,
                st.creds.clone(),
            )
        };

        let socket = self
            .cluster
            .acquire_socket(mode, allow_slave, sync_timeout, sock_timeout, &tags, pool_limit)
            .await?;

        for cred in &creds {
            if let Err(e) = socket.login(cred, self.authenticator.as_ref()).await {
                release_all(vec![socket]);
                return Err(e);
            }
        }

        let pinned = {
            let mut st = self.state.lock();
            if st.closed {
                drop(st);
                release_all(vec![socket]);
                return Err(Error::SessionClosed);
            }
            let pinned = if st.mode != Mode::Eventual {
                set_socket(&mut st, &socket)
            } else {
                Ok(())
            };
            if !slave_ok && st.mode == Mode::Monotonic {
                st.slave_ok = false;
            }
            pinned
        };
        if let Err(e) = pinned {
            release_all(vec![socket]);
            return Err(e);
        }
        Ok(socket)
    }

    /// Run a command against `db`
    pub async fn run(&self, db: &str, cmd: &Command) -> Result<CommandReply> {
        let socket = self.acquire_socket(true).await?;
        let slave_ok = self.state.lock().slave_ok || !socket.server_info().master;
        let result = command::run(&socket, db, cmd, slave_ok).await;
        socket.release()?;
        result
    }

    /// Round-trip to a server selected by the current mode
    pub async fn ping(&self) -> Result<()> {
        self.run("admin", &Command::Ping).await.map(|_| ())
    }

    /// Send read operations and wait for all their replies
    pub async fn read(&self, ops: Vec<Op>) -> Result<Vec<Reply>> {
        let socket = self.acquire_socket(true).await?;
        let slave_ok = self.state.lock().slave_ok || !socket.server_info().master;
        let ops = ops
            .into_iter()
            .map(|op| match op {
                Op::Query(mut q) if slave_ok => {
                    q.flags |= QUERY_SLAVE_OK;
                    Op::Query(q)
                }
                other => other,
            })
            .collect();

        let result = wait_all(&socket, ops).await;
        socket.release()?;
        result
    }

    /// Send write operations to the primary. With safe writes enabled a
    /// getLastError is appended to the same batch and its verdict
    /// returned.
    pub async fn write(&self, mut ops: Vec<Op>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let socket = self.acquire_socket(false).await?;
        let safe = self.state.lock().safe;
        if safe {
            let db = ops.iter().find_map(database_of).unwrap_or_else(|| "admin".to_string());
            match command::command_op(&db, &Command::GetLastError, false) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    socket.release()?;
                    return Err(e);
                }
            }
        }

        let result = match wait_all(&socket, ops).await {
            Ok(replies) if safe => match replies.last() {
                Some(reply) => command::decode_reply(reply)
                    .and_then(CommandReply::into_result)
                    .map(|_| ()),
                None => Err(Error::Protocol("missing getLastError reply".into())),
            },
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        socket.release()?;
        result
    }

    /// Log in and remember the credential for future sockets
    pub async fn login(&self, cred: Credential) -> Result<()> {
        let mut sockets = Vec::new();
        {
            let st = self.state.lock();
            if st.closed {
                return Err(Error::SessionClosed);
            }
            for socket in st.master_socket.iter().chain(st.slave_socket.iter()) {
                if socket.acquire().is_ok() {
                    sockets.push(socket.clone());
                }
            }
        }
        if sockets.is_empty() {
            sockets.push(self.acquire_socket(true).await?);
        }

        let mut result = Ok(());
        for socket in &sockets {
            if let Err(e) = socket.login(&cred, self.authenticator.as_ref()).await {
                result = Err(e);
                break;
            }
        }
        release_all(sockets);
        result?;

        let mut st = self.state.lock();
        st.creds.retain(|c| c.source != cred.source);
        st.creds.push(cred);
        Ok(())
    }

    /// Forget the credential for `source` and log it out of pinned sockets
    pub fn logout(&self, source: &str) {
        let mut st = self.state.lock();
        st.creds.retain(|c| c.source != source);
        st.dial_creds.retain(|c| c.source != source);
        for socket in st.master_socket.iter().chain(st.slave_socket.iter()) {
            socket.logout(source);
        }
    }

    /// Forget every credential
    pub fn logout_all(&self) {
        let mut st = self.state.lock();
        st.creds.clear();
        st.dial_creds.clear();
        for socket in st.master_socket.iter().chain(st.slave_socket.iter()) {
            socket.logout_all();
        }
    }

    /// Release pinned sockets and the cluster reference
    pub fn close(&self) {
        let pins = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            take_pins(&mut st)
        };
        release_all(pins);
        if let Err(e) = self.cluster.release() {
            tracing::warn!("Closing session: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Clone for Session {
    /// Shares the pinned sockets of the source session
    fn clone(&self) -> Session {
        let mut state = self.state.lock().unpinned();
        {
            let st = self.state.lock();
            let share = |pin: &Option<Socket>| pin.as_ref().filter(|s| s.acquire().is_ok()).cloned();
            state.master_socket = share(&st.master_socket);
            state.slave_socket = share(&st.slave_socket);
        }
        self.derive(state)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Session")
            .field("mode", &st.mode)
            .field("slave_ok", &st.slave_ok)
            .field("master_pinned", &st.master_socket.is_some())
            .field("slave_pinned", &st.slave_socket.is_some())
            .field("closed", &st.closed)
            .finish()
    }
}

/// Pin `socket` in the slot matching its role
fn set_socket(st: &mut SessionState, socket: &Socket) -> Result<()> {
    let info = socket.acquire()?;
    let slot = if info.master {
        &mut st.master_socket
    } else {
        &mut st.slave_socket
    };
    if slot.is_some() {
        release_all(vec![socket.clone()]);
        return Err(Error::InvariantViolation(format!(
            "a {} socket is already pinned",
            if info.master { "master" } else { "slave" }
        )));
    }
    tracing::debug!("Pinning {} socket to {}", if info.master { "master" } else { "slave" }, socket.addr());
    *slot = Some(socket.clone());
    Ok(())
}

fn take_pins(st: &mut SessionState) -> Vec<Socket> {
    st.master_socket.take().into_iter().chain(st.slave_socket.take()).collect()
}

fn release_all(sockets: Vec<Socket>) {
    for socket in sockets {
        if let Err(e) = socket.release() {
            tracing::warn!("Releasing socket to {}: {}", socket.addr(), e);
        }
    }
}

/// Database named by an operation's collection
fn database_of(op: &Op) -> Option<String> {
    let collection = match op {
        Op::Query(q) => &q.collection,
        Op::GetMore { collection, .. }
        | Op::Insert { collection, .. }
        | Op::Update { collection, .. }
        | Op::Delete { collection, .. } => collection,
        Op::KillCursors { .. } => return None,
    };
    collection.split('.').next().map(str::to_string)
}

async fn wait_all(socket: &Socket, ops: Vec<Op>) -> Result<Vec<Reply>> {
    let pending = socket.query(ops).await?;
    let mut replies = Vec::with_capacity(pending.len());
    for reply in pending {
        replies.push(reply.wait().await?);
    }
    Ok(replies)
}

/// Connect using a `mongodb://` URL
pub async fn dial(url: &str) -> Result<Session> {
    dial_with_info(DialInfo::parse_url(url)?).await
}

/// Connect using a URL, waiting at most `timeout` for a server
pub async fn dial_with_timeout(url: &str, timeout: Duration) -> Result<Session> {
    let mut info = DialInfo::parse_url(url)?;
    info.timeout_ms = timeout.as_millis() as u64;
    dial_with_info(info).await
}

/// Connect using explicit settings
pub async fn dial_with_info(info: DialInfo) -> Result<Session> {
    dial_with(info, diagnostics::noop(), Arc::new(CommandAuthenticator)).await
}

/// Connect with injected diagnostics and authenticator.
///
/// Fails unless some server answers a ping within the configured timeout.
pub async fn dial_with(
    info: DialInfo,
    diagnostics: Arc<dyn Diagnostics>,
    authenticator: Arc<dyn Authenticator>,
) -> Result<Session> {
    info.validate()?;
    tracing::info!("Dialing {} (direct={})", info.addrs.join(","), info.direct);

    let cluster = Cluster::new(&info, diagnostics);
    let session = Session::new(cluster, Mode::Eventual, &info, authenticator);
    session.ping().await?;
    session.set_mode(info.mode, true);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncTuning;
    use crate::mock::{MockConfig, MockServer};
    use bytes::Bytes;

    async fn replica_set() -> (MockServer, MockServer, MockServer) {
        let b = MockServer::start(MockConfig::secondary()).await;
        let c = MockServer::start(MockConfig::secondary()).await;
        let a = MockServer::start(MockConfig::primary()).await;
        let hosts = vec![a.addr(), b.addr(), c.addr()];
        for mock in [&a, &b, &c] {
            let hosts = hosts.clone();
            mock.update(move |cfg| cfg.hosts = hosts);
        }
        (a, b, c)
    }

    fn info_for(addrs: Vec<String>) -> DialInfo {
        let mut info = DialInfo::default();
        info.addrs = addrs;
        info.timeout_ms = 5_000;
        info.tuning = SyncTuning {
            sync_short_delay_ms: 50,
            sync_servers_delay_ms: 30_000,
            sync_socket_timeout_ms: 1_000,
            ping_delay_ms: 3_600_000,
        };
        info
    }

    fn insert() -> Op {
        Op::Insert {
            collection: "app.items".into(),
            flags: 0,
            documents: vec![Bytes::from_static(b"doc")],
        }
    }

    fn find() -> Op {
        Op::Query(crate::wire::QueryOp {
            collection: "app.items".into(),
            flags: 0,
            skip: 0,
            limit: 1,
            query: Bytes::from_static(b"q"),
            selector: None,
        })
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("primary".parse::<Mode>().unwrap(), Mode::Strong);
        assert_eq!("Strong".parse::<Mode>().unwrap(), Mode::Strong);
        assert_eq!("secondaryPreferred".parse::<Mode>().unwrap(), Mode::SecondaryPreferred);
        assert_eq!("primary_preferred".parse::<Mode>().unwrap(), Mode::PrimaryPreferred);
        assert!("fastest".parse::<Mode>().is_err());
        assert!(Mode::SecondaryPreferred.prefers_secondary());
        assert!(!Mode::Nearest.prefers_secondary());
    }

    #[tokio::test]
    async fn test_strong_session_uses_primary() {
        let (a, _b, _c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        assert_eq!(session.mode(), Mode::Strong);

        let socket = session.acquire_socket(true).await.unwrap();
        assert_eq!(socket.addr(), a.addr());
        socket.release().unwrap();
        assert!(session.state.lock().master_socket.is_some());
    }

    #[tokio::test]
    async fn test_monotonic_switches_to_primary_on_write() {
        let (a, b, c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr(), b.addr(), c.addr()])).await.unwrap();
        crate::mock::wait_for(|| session.live_servers().len() == 3, Duration::from_secs(5)).await;
        session.set_mode(Mode::Monotonic, true);

        session.read(vec![find()]).await.unwrap();
        let slave = session.state.lock().slave_socket.clone().unwrap();
        assert_ne!(slave.addr(), a.addr());
        assert!(session.state.lock().master_socket.is_none());

        // Reads keep going to the same secondary.
        session.read(vec![find()]).await.unwrap();
        assert!(session.state.lock().slave_socket.as_ref().unwrap().ptr_eq(&slave));

        session.write(vec![insert()]).await.unwrap();
        assert_eq!(a.writes(), 1);
        let master = session.state.lock().master_socket.clone().unwrap();
        assert_eq!(master.addr(), a.addr());

        let socket = session.acquire_socket(true).await.unwrap();
        assert!(socket.ptr_eq(&master));
        socket.release().unwrap();
    }

    #[tokio::test]
    async fn test_eventual_does_not_pin() {
        let (a, _b, _c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        session.set_mode(Mode::Eventual, true);
        session.ping().await.unwrap();
        let st = session.state.lock();
        assert!(st.master_socket.is_none());
        assert!(st.slave_socket.is_none());
    }

    #[tokio::test]
    async fn test_dead_pin_is_replaced() {
        let (a, _b, _c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        session.ping().await.unwrap();

        let pinned = session.state.lock().master_socket.clone().unwrap();
        pinned.close();
        session.ping().await.unwrap();

        let repinned = session.state.lock().master_socket.clone().unwrap();
        assert!(!repinned.ptr_eq(&pinned));
        assert!(!repinned.is_dead());
    }

    #[tokio::test]
    async fn test_pool_limit_surfaces_immediately() {
        let (a, _b, _c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        session.ping().await.unwrap();

        let first = session.copy();
        first.ping().await.unwrap();
        let second = session.copy();
        second.set_pool_limit(1);
        assert!(matches!(second.ping().await, Err(Error::PoolLimit(_))));
    }

    #[tokio::test]
    async fn test_copy_semantics() {
        let (a, _b, _c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        session.ping().await.unwrap();
        let pinned = session.state.lock().master_socket.clone().unwrap();
        assert_eq!(session.cluster().references(), 1);

        let cloned = session.clone();
        assert!(cloned.state.lock().master_socket.as_ref().unwrap().ptr_eq(&pinned));
        let copied = session.copy();
        assert!(copied.state.lock().master_socket.is_none());
        session.set_mode(Mode::Eventual, false);
        let fresh = session.new_session();
        assert_eq!(fresh.mode(), Mode::Strong);
        assert_eq!(session.cluster().references(), 4);

        drop(cloned);
        drop(copied);
        drop(fresh);
        assert_eq!(session.cluster().references(), 1);
        // The original still holds its pin.
        assert_eq!(pinned.references(), 1);
    }

    #[tokio::test]
    async fn test_dial_credential_replayed() {
        let a = MockServer::start(MockConfig::primary().user("app", "secret")).await;
        let mut info = info_for(vec![a.addr()]);
        info.credential = Some(Credential::new("app", "secret", "app"));
        let session = dial_with_info(info).await.unwrap();
        assert_eq!(a.logins(), 1);
        session.ping().await.unwrap();
        assert_eq!(a.logins(), 1);

        let mut bad = info_for(vec![a.addr()]);
        bad.credential = Some(Credential::new("app", "nope", "app"));
        assert!(matches!(dial_with_info(bad).await, Err(Error::Auth { .. })));
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let a = MockServer::start(MockConfig::primary().user("app", "secret")).await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        session.login(Credential::new("app", "secret", "app")).await.unwrap();
        assert_eq!(a.logins(), 1);

        session.logout("app");
        session.ping().await.unwrap();
        assert_eq!(a.logouts(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let (a, _b, _c) = replica_set().await;
        let session = dial_with_info(info_for(vec![a.addr()])).await.unwrap();
        session.ping().await.unwrap();
        let pinned = session.state.lock().master_socket.clone().unwrap();

        session.close();
        session.close();
        assert!(session.cluster().is_closed());
        assert!(pinned.is_dead());
        assert!(matches!(session.ping().await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_unreachable_dial_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut info = info_for(vec![addr]);
        info.timeout_ms = 300;
        assert!(matches!(dial_with_info(info).await, Err(Error::NoReachableServers)));
    }
}
