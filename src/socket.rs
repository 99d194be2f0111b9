//! Multiplexed Socket
//!
//! One TCP connection to one server. Many requests may be in flight at
//! once; a single reader task matches replies to requests by id. Sockets
//! are reference counted and go back to their server's pool when the last
//! reference is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, Credential};
use crate::command::{self, Command};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::server::{Server, ServerInfo, ServerInner};
use crate::wire::{encode_op, Op, Reply, ReplyCodec};

type ReplySender = oneshot::Sender<Result<Reply>>;

/// Handle to a multiplexed connection.
///
/// Cloning the handle does not take a reference; use [`Socket::acquire`].
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    addr: String,
    state: Mutex<SocketState>,
    /// Write half; `None` once the socket is dead
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    next_request_id: AtomicU32,
    /// Wakes the reader when a new deadline is armed
    submitted: Notify,
    cancel: CancellationToken,
    diagnostics: Arc<dyn Diagnostics>,
}

struct SocketState {
    replies: HashMap<u32, ReplySender>,
    references: usize,
    dead: Option<Error>,
    server: Option<Weak<ServerInner>>,
    info: Arc<ServerInfo>,
    /// Credentials logged in on this connection
    creds: Vec<Credential>,
    /// Credentials to log out with the next write
    logout: Vec<Credential>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    /// Role at connect time, for the connection gauge
    master: bool,
}

/// Reply that has not arrived yet
#[derive(Debug)]
pub struct PendingReply {
    request_id: u32,
    addr: String,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl PendingReply {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Wait for the reply or for the error that killed the socket
    pub async fn wait(self) -> Result<Reply> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::SocketClosed(self.addr)),
        }
    }
}

impl Socket {
    /// Wrap a connected stream and start its reader task.
    ///
    /// The new socket holds one reference on behalf of the caller.
    pub(crate) fn new(
        stream: TcpStream,
        addr: String,
        server: Option<Weak<ServerInner>>,
        info: Arc<ServerInfo>,
        timeout: Option<Duration>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Socket {
        let (reader, writer) = stream.into_split();
        let master = info.master;
        let socket = Socket {
            inner: Arc::new(SocketInner {
                addr,
                state: Mutex::new(SocketState {
                    replies: HashMap::new(),
                    references: 1,
                    dead: None,
                    server,
                    info,
                    creds: Vec::new(),
                    logout: Vec::new(),
                    deadline: None,
                    timeout,
                    master,
                }),
                writer: tokio::sync::Mutex::new(Some(writer)),
                next_request_id: AtomicU32::new(0),
                submitted: Notify::new(),
                cancel: CancellationToken::new(),
                diagnostics,
            }),
        };

        let diag = &socket.inner.diagnostics;
        diag.sockets_alive(1);
        diag.conn(master, 1);
        diag.sockets_in_use(1);
        diag.socket_refs(1);

        tokio::spawn(read_loop(socket.clone(), FramedRead::new(reader, ReplyCodec)));
        socket
    }

    /// Address of the server this socket talks to
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Snapshot of the server's role taken when the socket was acquired
    pub fn server_info(&self) -> Arc<ServerInfo> {
        self.inner.state.lock().info.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.state.lock().dead.is_some()
    }

    /// Error the socket died with, if any
    pub fn dead_error(&self) -> Option<Error> {
        self.inner.state.lock().dead.clone()
    }

    /// Current number of references
    pub fn references(&self) -> usize {
        self.inner.state.lock().references
    }

    /// Credentials currently logged in
    pub fn credentials(&self) -> Vec<Credential> {
        self.inner.state.lock().creds.clone()
    }

    /// Set the per-request timeout (`None` waits forever)
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().timeout = timeout;
    }

    pub fn ptr_eq(&self, other: &Socket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Write `ops` as one buffer and return a pending reply for each
    /// operation that expects one, in order.
    ///
    /// Pending logouts are flushed ahead of the operations.
    pub async fn query(&self, ops: Vec<Op>) -> Result<Vec<PendingReply>> {
        let mut writer = self.inner.writer.lock().await;

        let (buf, pending, timeout) = {
            let mut st = self.inner.state.lock();
            if let Some(err) = &st.dead {
                return Err(err.clone());
            }

            let mut buf = BytesMut::new();
            for cred in &st.logout {
                let op = command::command_op(&cred.source, &Command::Logout, true)?;
                encode_op(&mut buf, self.next_request_id(), &op)?;
            }
            let mut ids = Vec::new();
            for op in &ops {
                let id = self.next_request_id();
                encode_op(&mut buf, id, op)?;
                if op.expects_reply() {
                    ids.push(id);
                }
            }
            st.logout.clear();

            let mut pending = Vec::with_capacity(ids.len());
            for id in ids {
                let (tx, rx) = oneshot::channel();
                st.replies.insert(id, tx);
                pending.push(PendingReply {
                    request_id: id,
                    addr: self.inner.addr.clone(),
                    rx,
                });
            }
            if !pending.is_empty() {
                if let Some(t) = st.timeout {
                    st.deadline = Some(Instant::now() + t);
                }
            }
            (buf, pending, st.timeout)
        };
        self.inner.submitted.notify_one();

        let Some(stream) = writer.as_mut() else {
            return Err(self
                .dead_error()
                .unwrap_or_else(|| Error::SocketClosed(self.inner.addr.clone())));
        };

        let write = stream.write_all(&buf);
        let result = match timeout {
            Some(t) => match tokio::time::timeout(t, write).await {
                Ok(r) => r.map_err(Error::from),
                Err(_) => Err(Error::SocketTimeout(self.inner.addr.clone())),
            },
            None => write.await.map_err(Error::from),
        };

        if let Err(e) = result {
            writer.take();
            drop(writer);
            tracing::warn!("Write to {} failed: {}", self.inner.addr, e);
            self.kill(e.clone(), true);
            return Err(e);
        }
        if self.is_dead() {
            writer.take();
        }

        self.inner.diagnostics.sent_ops(ops.len() as u64);
        Ok(pending)
    }

    /// Send one operation and wait for its reply
    pub async fn simple_query(&self, op: Op) -> Result<Reply> {
        if !op.expects_reply() {
            return Err(Error::InvariantViolation(format!(
                "{} does not produce a reply",
                op.type_name()
            )));
        }
        let mut pending = self.query(vec![op]).await?;
        match pending.pop() {
            Some(reply) => reply.wait().await,
            None => Err(Error::InvariantViolation("no reply registered".into())),
        }
    }

    fn dispatch(&self, reply: Reply) {
        let diag = &self.inner.diagnostics;
        diag.received_ops(1);
        diag.received_docs(reply.docs.len() as u64);

        let tx = {
            let mut st = self.inner.state.lock();
            let tx = st.replies.remove(&reply.response_to);
            if st.replies.is_empty() {
                st.deadline = None;
            }
            tx
        };

        match tx {
            Some(tx) => {
                let result = if reply.is_query_failure() {
                    Err(command::failure_from_reply(&reply))
                } else {
                    Ok(reply)
                };
                let _ = tx.send(result);
            }
            None => {
                tracing::trace!(
                    "Discarding reply to untracked request {} from {}",
                    reply.response_to,
                    self.inner.addr
                );
            }
        }
    }

    /// Mark the socket dead, fail every pending reply and detach it from
    /// its server. Only the first call has any effect.
    pub(crate) fn kill(&self, err: Error, abend: bool) {
        let (replies, server, master) = {
            let mut st = self.inner.state.lock();
            if st.dead.is_some() {
                return;
            }
            st.dead = Some(err.clone());
            st.deadline = None;
            (std::mem::take(&mut st.replies), st.server.take(), st.master)
        };

        if abend {
            tracing::info!("Connection to {} lost: {}", self.inner.addr, err);
        } else {
            tracing::debug!("Closing connection to {}", self.inner.addr);
        }

        self.inner.cancel.cancel();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }

        let diag = &self.inner.diagnostics;
        diag.sockets_alive(-1);
        diag.conn(master, -1);

        for (_, tx) in replies {
            let _ = tx.send(Err(err.clone()));
        }

        if let Some(server) = server.and_then(|weak| weak.upgrade()) {
            let server = Server::from_inner(server);
            if abend {
                server.abend_socket(self);
            } else {
                server.remove_socket(self);
            }
        }
    }

    /// Close the socket without flagging its server
    pub fn close(&self) {
        self.kill(Error::SocketClosed(self.inner.addr.clone()), false);
    }

    /// Take an additional reference on a socket that is already held.
    ///
    /// An idle socket belongs to its server's pool and can only be handed
    /// out again by the server.
    pub fn acquire(&self) -> Result<Arc<ServerInfo>> {
        let mut st = self.inner.state.lock();
        if let Some(err) = &st.dead {
            return Err(err.clone());
        }
        if st.references == 0 {
            return Err(Error::InvariantViolation(format!(
                "socket to {} acquired while idle in its pool",
                self.inner.addr
            )));
        }
        st.references += 1;
        self.inner.diagnostics.socket_refs(1);
        Ok(st.info.clone())
    }

    /// Take the first reference of a socket coming out of the unused list
    pub(crate) fn initial_acquire(&self, info: Arc<ServerInfo>, timeout: Option<Duration>) -> Result<()> {
        let mut st = self.inner.state.lock();
        if let Some(err) = &st.dead {
            return Err(err.clone());
        }
        if st.references != 0 {
            return Err(Error::InvariantViolation(format!(
                "socket to {} handed out with {} live references",
                self.inner.addr, st.references
            )));
        }
        st.references = 1;
        st.info = info;
        st.timeout = timeout;
        self.inner.diagnostics.sockets_in_use(1);
        self.inner.diagnostics.socket_refs(1);
        Ok(())
    }

    /// Drop a reference. The last release logs out every credential and
    /// hands the socket back to its server.
    pub fn release(&self) -> Result<()> {
        let (server, alive) = {
            let mut st = self.inner.state.lock();
            if st.references == 0 {
                return Err(Error::InvariantViolation(format!(
                    "socket to {} released more times than acquired",
                    self.inner.addr
                )));
            }
            st.references -= 1;
            self.inner.diagnostics.socket_refs(-1);
            if st.references > 0 {
                return Ok(());
            }
            self.inner.diagnostics.sockets_in_use(-1);
            let creds = std::mem::take(&mut st.creds);
            st.logout.extend(creds);
            (st.server.clone(), st.dead.is_none())
        };

        if alive {
            match server.and_then(|weak| weak.upgrade()) {
                Some(server) => Server::from_inner(server).recycle_socket(self.clone()),
                None => self.close(),
            }
        }
        Ok(())
    }

    /// Log `cred` in on this socket unless it already is
    pub async fn login(&self, cred: &Credential, authenticator: &dyn Authenticator) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if st.creds.contains(cred) {
                return Ok(());
            }
            if let Some(pos) = st.logout.iter().position(|c| c == cred) {
                st.logout.remove(pos);
                st.creds.push(cred.clone());
                return Ok(());
            }
        }

        authenticator.login(self, cred).await?;
        tracing::debug!("Authenticated {}@{} on {}", cred.username, cred.source, self.inner.addr);

        let mut st = self.inner.state.lock();
        st.creds.retain(|c| c.source != cred.source);
        st.creds.push(cred.clone());
        Ok(())
    }

    /// Queue a logout for the credential on `source`
    pub fn logout(&self, source: &str) {
        let mut st = self.inner.state.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut st.creds)
            .into_iter()
            .partition(|c| c.source == source);
        st.creds = kept;
        st.logout.extend(gone);
    }

    /// Queue a logout for every credential
    pub fn logout_all(&self) {
        let mut st = self.inner.state.lock();
        let creds = std::mem::take(&mut st.creds);
        st.logout.extend(creds);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Socket")
            .field("addr", &self.inner.addr)
            .field("references", &st.references)
            .field("pending", &st.replies.len())
            .field("dead", &st.dead.is_some())
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_loop(socket: Socket, mut frames: FramedRead<OwnedReadHalf, ReplyCodec>) {
    let addr = socket.inner.addr.clone();
    loop {
        let deadline = socket.inner.state.lock().deadline;
        let frame = tokio::select! {
            _ = socket.inner.cancel.cancelled() => return,
            _ = socket.inner.submitted.notified() => continue,
            _ = sleep_until(deadline) => {
                socket.kill(Error::SocketTimeout(addr.clone()), true);
                return;
            }
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(reply)) => socket.dispatch(reply),
            Some(Err(e)) => {
                socket.kill(e, true);
                return;
            }
            None => {
                socket.kill(Error::SocketClosed(addr.clone()), true);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CommandAuthenticator;
    use crate::command::CommandReply;
    use crate::diagnostics::{self, Stats};
    use crate::mock::{MockConfig, MockServer};
    use crate::wire::QueryOp;
    use bytes::Bytes;

    async fn connect(mock: &MockServer, timeout: Option<Duration>, diag: Arc<dyn Diagnostics>) -> Socket {
        let stream = TcpStream::connect(mock.addr()).await.unwrap();
        Socket::new(stream, mock.addr(), None, Arc::new(ServerInfo::default()), timeout, diag)
    }

    fn echo(payload: &'static [u8]) -> Op {
        Op::Query(QueryOp {
            collection: "app.items".into(),
            flags: 0,
            skip: 0,
            limit: 1,
            query: Bytes::from_static(payload),
            selector: None,
        })
    }

    #[tokio::test]
    async fn test_replies_matched_by_request_id() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;

        let pending = socket.query(vec![echo(b"one"), echo(b"two"), echo(b"three")]).await.unwrap();
        assert_eq!(pending.len(), 3);
        let ids: Vec<u32> = pending.iter().map(|p| p.request_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| *id != 0));

        let mut docs = Vec::new();
        for p in pending {
            docs.push(p.wait().await.unwrap().docs[0].clone());
        }
        assert_eq!(docs, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"three")]);
    }

    #[tokio::test]
    async fn test_writes_without_reply_register_nothing() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        let insert = Op::Insert {
            collection: "app.items".into(),
            flags: 0,
            documents: vec![Bytes::from_static(b"doc")],
        };
        let pending = socket.query(vec![insert, echo(b"after")]).await.unwrap();
        assert_eq!(pending.len(), 1);
        pending.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(mock.writes(), 1);
    }

    #[tokio::test]
    async fn test_kill_fails_every_pending_reply_once() {
        let mock = MockServer::start(MockConfig::primary().hang()).await;
        let stats = Arc::new(Stats::new());
        let socket = connect(&mock, None, stats.clone()).await;

        let pending = socket.query(vec![echo(b"a"), echo(b"b"), echo(b"c")]).await.unwrap();
        socket.close();
        socket.close();

        for p in pending {
            assert!(matches!(p.wait().await, Err(Error::SocketClosed(_))));
        }
        assert!(socket.is_dead());
        assert!(socket.query(vec![echo(b"late")]).await.is_err());
        assert_eq!(stats.snapshot().sockets_alive, 0);
    }

    #[tokio::test]
    async fn test_deadline_kills_stalled_socket() {
        let mock = MockServer::start(MockConfig::primary().hang()).await;
        let socket = connect(&mock, Some(Duration::from_millis(100)), diagnostics::noop()).await;
        let result = socket.simple_query(echo(b"slow")).await;
        assert!(matches!(result, Err(Error::SocketTimeout(_))));
        assert!(socket.is_dead());
    }

    #[tokio::test]
    async fn test_idle_socket_outlives_timeout() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let socket = connect(&mock, Some(Duration::from_millis(50)), diagnostics::noop()).await;
        socket.simple_query(echo(b"x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!socket.is_dead());
    }

    #[tokio::test]
    async fn test_query_failure_keeps_socket_alive() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        let fail = Command::Named { name: "fail".into(), payload: vec![] };
        let err = command::run(&socket, "app", &fail, false).await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
        assert!(!socket.is_dead());
        command::ping(&socket).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_abnormal() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        command::ping(&socket).await.unwrap();
        mock.stop();
        crate::mock::wait_for(|| socket.is_dead(), Duration::from_secs(2)).await;
        assert!(socket.dead_error().is_some());
    }

    #[tokio::test]
    async fn test_over_release_is_invariant_violation() {
        let mock = MockServer::start(MockConfig::primary()).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        socket.acquire().unwrap();
        assert_eq!(socket.references(), 2);
        socket.release().unwrap();
        socket.release().unwrap();
        assert!(matches!(socket.release(), Err(Error::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn test_login_idempotent_and_logout_flushed() {
        let mock = MockServer::start(MockConfig::primary().user("app", "secret")).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        let cred = Credential::new("app", "secret", "app");

        socket.login(&cred, &CommandAuthenticator).await.unwrap();
        socket.login(&cred, &CommandAuthenticator).await.unwrap();
        assert_eq!(mock.logins(), 1);

        socket.logout("app");
        assert!(socket.credentials().is_empty());
        // Logging back in before the logout is flushed cancels it.
        socket.login(&cred, &CommandAuthenticator).await.unwrap();
        assert_eq!(mock.logins(), 1);

        socket.logout_all();
        command::ping(&socket).await.unwrap();
        assert_eq!(mock.logouts(), 1);
    }

    #[tokio::test]
    async fn test_bad_credential_rejected() {
        let mock = MockServer::start(MockConfig::primary().user("app", "secret")).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        let cred = Credential::new("app", "wrong", "app");
        let err = socket.login(&cred, &CommandAuthenticator).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        assert!(socket.credentials().is_empty());
    }

    #[tokio::test]
    async fn test_is_master_round_trip() {
        let mock = MockServer::start(MockConfig::primary().set_name("rs0")).await;
        let socket = connect(&mock, None, diagnostics::noop()).await;
        let result = command::is_master(&socket).await.unwrap();
        assert!(result.is_master);
        assert_eq!(result.set_name.as_deref(), Some("rs0"));
        let reply = command::run(&socket, "admin", &Command::Ping, true).await.unwrap();
        assert_eq!(reply, CommandReply::ok());
    }
}
