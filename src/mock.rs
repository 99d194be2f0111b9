//! In-process replica set member for tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandReply, IsMasterResult};
use crate::server::ServerTags;
use crate::wire::{encode_reply, Op, Reply, RequestCodec, REPLY_QUERY_FAILURE};

/// How a mock member answers
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub master: bool,
    pub secondary: bool,
    pub primary: Option<String>,
    pub hosts: Vec<String>,
    pub set_name: Option<String>,
    pub tags: ServerTags,
    pub users: Vec<(String, String)>,
    pub mongos: bool,
    /// Read requests but never answer
    pub hang: bool,
}

impl MockConfig {
    pub fn primary() -> Self {
        Self { master: true, ..Default::default() }
    }

    pub fn secondary() -> Self {
        Self { secondary: true, ..Default::default() }
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn set_name(mut self, name: &str) -> Self {
        self.set_name = Some(name.to_string());
        self
    }

    pub fn user(mut self, name: &str, password: &str) -> Self {
        self.users.push((name.to_string(), password.to_string()));
        self
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    logins: AtomicUsize,
    logouts: AtomicUsize,
    writes: AtomicUsize,
}

pub struct MockServer {
    addr: SocketAddr,
    config: Arc<Mutex<MockConfig>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl MockServer {
    pub async fn start(config: MockConfig) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("mock address");
        let server = MockServer {
            addr,
            config: Arc::new(Mutex::new(config)),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
        };

        let config = server.config.clone();
        let counters = server.counters.clone();
        let cancel = server.cancel.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };
                counters.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, config.clone(), counters.clone(), cancel.child_token()));
            }
        });
        server
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn update(&self, f: impl FnOnce(&mut MockConfig)) {
        f(&mut self.config.lock());
    }

    /// Stop listening and drop every connection
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.counters.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.counters.logouts.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(stream: TcpStream, config: Arc<Mutex<MockConfig>>, counters: Arc<Counters>, cancel: CancellationToken) {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, RequestCodec);
    let mut next_id = 0u32;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };
        let Some(Ok((header, op))) = frame else {
            return;
        };

        let cfg = config.lock().clone();
        let Some(mut reply) = answer(&op, &cfg, &counters) else {
            continue;
        };
        if cfg.hang {
            continue;
        }

        reply.response_to = header.request_id;
        next_id += 1;
        let mut buf = BytesMut::new();
        if encode_reply(&mut buf, next_id, &reply).is_err() || writer.write_all(&buf).await.is_err() {
            return;
        }
    }
}

fn answer(op: &Op, cfg: &MockConfig, counters: &Counters) -> Option<Reply> {
    match op {
        Op::Query(q) if q.collection.ends_with(".$cmd") => {
            let reply = match Command::deserialize(&q.query) {
                Ok(cmd) => run_command(cmd, cfg, counters),
                Err(e) => CommandReply::Error { code: 2, message: e.to_string() },
            };
            Some(command_reply(reply))
        }
        Op::Query(q) => Some(Reply::new(0, vec![q.query.clone()])),
        Op::GetMore { .. } => Some(Reply::new(0, Vec::new())),
        Op::Insert { .. } | Op::Update { .. } | Op::Delete { .. } => {
            counters.writes.fetch_add(1, Ordering::SeqCst);
            None
        }
        Op::KillCursors { .. } => None,
    }
}

fn run_command(cmd: Command, cfg: &MockConfig, counters: &Counters) -> CommandReply {
    match cmd {
        Command::IsMaster => CommandReply::IsMaster(IsMasterResult {
            is_master: cfg.master,
            secondary: cfg.secondary,
            primary: cfg.primary.clone(),
            hosts: cfg.hosts.clone(),
            passives: Vec::new(),
            tags: cfg.tags.clone(),
            set_name: cfg.set_name.clone(),
            max_wire_version: 2,
            msg: cfg.mongos.then(|| crate::command::MONGOS_MSG.to_string()),
        }),
        Command::Ping | Command::GetLastError => CommandReply::ok(),
        Command::Logout => {
            counters.logouts.fetch_add(1, Ordering::SeqCst);
            CommandReply::ok()
        }
        Command::Authenticate { user, password, .. } => {
            if cfg.users.iter().any(|(u, p)| *u == user && *p == password) {
                counters.logins.fetch_add(1, Ordering::SeqCst);
                CommandReply::ok()
            } else {
                CommandReply::Error { code: 18, message: "auth failed".into() }
            }
        }
        Command::Named { name, .. } if name == "fail" => CommandReply::Error {
            code: 59,
            message: "command failed".into(),
        },
        Command::Named { payload, .. } => CommandReply::Ok { payload },
    }
}

fn command_reply(reply: CommandReply) -> Reply {
    let failed = matches!(reply, CommandReply::Error { .. });
    let doc = reply.serialize().map(Bytes::from).unwrap_or_default();
    let mut out = Reply::new(0, vec![doc]);
    if failed {
        out.flags |= REPLY_QUERY_FAILURE;
    }
    out
}

/// Poll `cond` until it holds, panicking after `timeout`
pub async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
