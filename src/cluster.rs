//! Cluster Topology
//!
//! Tracks the servers of one deployment. A background task repeatedly
//! contacts every known address, follows the host lists the servers
//! report and keeps the server and master sets current. Socket
//! acquisition waits on a generation channel until a suitable server is
//! known.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::command;
use crate::config::{DialInfo, SyncTuning};
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::server::{best_fit, Server, ServerInfo, ServerSummary, ServerTags};
use crate::session::Mode;
use crate::socket::Socket;

/// Port assumed when an address carries none
pub const DEFAULT_PORT: u16 = 27017;

/// Pause before retrying when no server fits the request
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Handshake attempts per server and round
const SYNC_TRIES: usize = 3;

/// Servers ordered by resolved address
#[derive(Debug, Default, Clone)]
pub struct ServerSet {
    slice: Vec<Server>,
}

impl ServerSet {
    fn search(&self, resolved: SocketAddr) -> std::result::Result<usize, usize> {
        self.slice.binary_search_by(|s| s.resolved_addr().cmp(&resolved))
    }

    pub fn get(&self, resolved: SocketAddr) -> Option<&Server> {
        self.search(resolved).ok().map(|i| &self.slice[i])
    }

    /// Insert unless a server with the same resolved address is present
    pub fn add(&mut self, server: Server) -> bool {
        match self.search(server.resolved_addr()) {
            Ok(_) => false,
            Err(i) => {
                self.slice.insert(i, server);
                true
            }
        }
    }

    pub fn remove(&mut self, server: &Server) -> bool {
        match self.search(server.resolved_addr()) {
            Ok(i) if self.slice[i].ptr_eq(server) => {
                self.slice.remove(i);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    pub fn as_slice(&self) -> &[Server] {
        &self.slice
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.slice.iter()
    }
}

/// Shared handle to a cluster
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    user_seeds: Vec<String>,
    direct: bool,
    fail_fast: bool,
    set_name: Option<String>,
    tuning: SyncTuning,
    state: Mutex<ClusterState>,
    /// Bumped on every membership change and after every sync round
    generation: watch::Sender<u64>,
    /// Completed sync rounds
    sync_count: AtomicU64,
    resync: mpsc::Sender<()>,
    cancel: CancellationToken,
    diagnostics: Arc<dyn Diagnostics>,
}

struct ClusterState {
    servers: ServerSet,
    /// Subset of `servers`
    masters: ServerSet,
    /// Addresses learned from the last complete sync
    dyn_seeds: Vec<String>,
    /// Reachable servers no master has vouched for yet
    pending: HashMap<String, Server>,
    references: usize,
    closed: bool,
}

/// Serializable view of a cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub sync_count: u64,
    pub masters: Vec<String>,
    pub dynamic_seeds: Vec<String>,
    pub pending: Vec<String>,
    pub servers: Vec<ServerSummary>,
}

/// Bookkeeping shared by the tasks of one sync round
#[derive(Default)]
struct SyncRound {
    seen: HashSet<SocketAddr>,
    /// Named by a master; add as soon as reached
    add_if_found: HashSet<SocketAddr>,
    /// Reached but not vouched for by a master yet
    not_yet_added: HashMap<SocketAddr, (Server, ServerInfo)>,
    complete: bool,
}

impl Cluster {
    /// Create a cluster for `info` and start its sync loop.
    ///
    /// The caller owns the first reference.
    pub fn new(info: &DialInfo, diagnostics: Arc<dyn Diagnostics>) -> Cluster {
        let (resync_tx, resync_rx) = mpsc::channel(1);
        let (generation, _) = watch::channel(0u64);
        let inner = Arc::new(ClusterInner {
            user_seeds: info.addrs.clone(),
            direct: info.direct,
            fail_fast: info.fail_fast,
            set_name: info.replica_set_name.clone(),
            tuning: info.tuning.clone(),
            state: Mutex::new(ClusterState {
                servers: ServerSet::default(),
                masters: ServerSet::default(),
                dyn_seeds: Vec::new(),
                pending: HashMap::new(),
                references: 1,
                closed: false,
            }),
            generation,
            sync_count: AtomicU64::new(0),
            resync: resync_tx,
            cancel: CancellationToken::new(),
            diagnostics,
        });
        inner.diagnostics.cluster(1);
        tokio::spawn(sync_loop(Arc::downgrade(&inner), resync_rx, inner.cancel.clone()));
        Cluster { inner }
    }

    /// Take a reference keeping the cluster alive
    pub fn acquire(&self) {
        let mut st = self.inner.state.lock();
        st.references += 1;
        tracing::trace!("Cluster has {} references", st.references);
    }

    /// Drop a reference; the last one tears the cluster down
    pub fn release(&self) -> Result<()> {
        let last = {
            let mut st = self.inner.state.lock();
            if st.references == 0 {
                return Err(Error::InvariantViolation(
                    "cluster released more times than acquired".into(),
                ));
            }
            st.references -= 1;
            st.references == 0
        };
        if last {
            self.close();
        }
        Ok(())
    }

    /// Stop syncing and close every server
    pub fn close(&self) {
        let servers: Vec<Server> = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.masters = ServerSet::default();
            let mut servers = std::mem::take(&mut st.servers).slice;
            servers.extend(st.pending.drain().map(|(_, s)| s));
            servers
        };
        tracing::info!("Closing cluster with {} servers", servers.len());
        self.inner.cancel.cancel();
        for server in servers {
            server.close();
        }
        self.inner.diagnostics.cluster(-1);
        self.bump_generation();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn references(&self) -> usize {
        self.inner.state.lock().references
    }

    /// Ask the sync loop for an early round. Requests coalesce.
    pub fn resync(&self) {
        let _ = self.inner.resync.try_send(());
    }

    /// Number of completed sync rounds
    pub fn sync_count(&self) -> u64 {
        self.inner.sync_count.load(Ordering::Acquire)
    }

    /// Addresses of every known server
    pub fn live_servers(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        st.servers.iter().map(|s| s.addr().to_string()).collect()
    }

    /// Addresses of the known masters
    pub fn masters(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        st.masters.iter().map(|s| s.addr().to_string()).collect()
    }

    pub fn dynamic_seeds(&self) -> Vec<String> {
        self.inner.state.lock().dyn_seeds.clone()
    }

    /// Addresses reached but not yet confirmed by a master
    pub fn pending_servers(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        let mut addrs: Vec<String> = st.pending.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn summary(&self) -> ClusterSummary {
        let st = self.inner.state.lock();
        let mut pending: Vec<String> = st.pending.keys().cloned().collect();
        pending.sort();
        ClusterSummary {
            sync_count: self.sync_count(),
            masters: st.masters.iter().map(|s| s.addr().to_string()).collect(),
            dynamic_seeds: st.dyn_seeds.clone(),
            pending,
            servers: st.servers.iter().map(|s| s.summary()).collect(),
        }
    }

    fn bump_generation(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Acquire a socket suited to `mode`, waiting up to `sync_timeout`
    /// (`None` waits forever) for a matching server to be known.
    pub async fn acquire_socket(
        &self,
        mode: Mode,
        slave_ok: bool,
        sync_timeout: Option<Duration>,
        socket_timeout: Option<Duration>,
        tags: &[ServerTags],
        pool_limit: usize,
    ) -> Result<Socket> {
        let started = Instant::now();
        let sync_count = self.sync_count();
        let mut generation = self.inner.generation.subscribe();
        let mut warned = false;

        loop {
            loop {
                generation.borrow_and_update();
                let (masters, slaves) = {
                    let st = self.inner.state.lock();
                    if st.closed {
                        return Err(Error::ShuttingDown);
                    }
                    (st.masters.len(), st.servers.len() - st.masters.len())
                };
                let ready = (masters > 0 && !(slave_ok && mode == Mode::Secondary)) || (slaves > 0 && slave_ok);
                if ready {
                    break;
                }
                if self.inner.fail_fast && self.sync_count() != sync_count {
                    return Err(Error::NoReachableServers);
                }
                let wait = match sync_timeout {
                    Some(limit) => {
                        let elapsed = started.elapsed();
                        if elapsed >= limit {
                            return Err(Error::NoReachableServers);
                        }
                        limit - elapsed
                    }
                    None => self.inner.tuning.servers_delay(),
                };
                if !warned {
                    warned = true;
                    tracing::warn!("Waiting for servers to synchronize...");
                }
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => return Err(Error::ShuttingDown),
                    changed = tokio::time::timeout(wait, generation.changed()) => {
                        if let Ok(Err(_)) = changed {
                            return Err(Error::ShuttingDown);
                        }
                    }
                }
            }

            let server = {
                let st = self.inner.state.lock();
                if slave_ok {
                    best_fit(mode, st.servers.as_slice(), tags)
                } else {
                    best_fit(mode, st.masters.as_slice(), &[])
                }
            };

            let Some(server) = server else {
                // Nothing matched the requested tags.
                self.pause_or_expire(started, sync_timeout).await?;
                continue;
            };

            let (socket, abended) = match server.acquire_socket(pool_limit, socket_timeout).await {
                Ok(acquired) => acquired,
                Err(e @ Error::PoolLimit(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Cannot get a socket from {}: {}", server.addr(), e);
                    self.remove_server(&server);
                    self.resync();
                    continue;
                }
            };

            if abended && !slave_ok {
                let confirmed = match command::is_master(&socket).await {
                    Ok(result) => result.is_master || result.is_mongos(),
                    Err(e) => {
                        tracing::debug!("isMaster on {} failed: {}", server.addr(), e);
                        false
                    }
                };
                if !confirmed {
                    tracing::info!("Cannot confirm server {} as master", server.addr());
                    socket.release()?;
                    self.resync();
                    self.pause_or_expire(started, sync_timeout).await?;
                    continue;
                }
            }

            return Ok(socket);
        }
    }

    async fn pause_or_expire(&self, started: Instant, sync_timeout: Option<Duration>) -> Result<()> {
        if let Some(limit) = sync_timeout {
            if started.elapsed() >= limit {
                return Err(Error::NoReachableServers);
            }
        }
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::ShuttingDown),
            _ = tokio::time::sleep(RETRY_PAUSE) => Ok(()),
        }
    }

    /// Every address worth contacting in the next round
    fn known_addrs(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        let mut seen = HashSet::new();
        self.inner
            .user_seeds
            .iter()
            .cloned()
            .chain(st.dyn_seeds.iter().cloned())
            .chain(st.servers.iter().map(|s| s.addr().to_string()))
            .chain(st.pending.keys().cloned())
            .filter(|addr| seen.insert(addr.clone()))
            .collect()
    }

    /// Existing record for `resolved`, or a fresh one
    fn server_for(&self, addr: &str, resolved: SocketAddr) -> Server {
        let st = self.inner.state.lock();
        if let Some(server) = st.servers.get(resolved) {
            return server.clone();
        }
        if let Some(server) = st.pending.values().find(|s| s.resolved_addr() == resolved) {
            return server.clone();
        }
        Server::new(
            addr.to_string(),
            resolved,
            self.inner.resync.clone(),
            self.inner.tuning.ping_delay(),
            self.inner.diagnostics.clone(),
        )
    }

    fn is_member(&self, server: &Server) -> bool {
        let st = self.inner.state.lock();
        st.servers
            .get(server.resolved_addr())
            .map(|s| s.ptr_eq(server))
            .unwrap_or(false)
    }

    fn add_server(&self, server: &Server, info: ServerInfo) {
        {
            let mut st = self.inner.state.lock();
            if st.closed {
                drop(st);
                server.close();
                return;
            }
            st.pending.retain(|_, s| !s.ptr_eq(server));
            match st.servers.get(server.resolved_addr()) {
                None => {
                    tracing::info!(
                        "SYNC Adding {} to cluster as a {}",
                        server.addr(),
                        if info.master { "master" } else { "slave" }
                    );
                    st.servers.add(server.clone());
                }
                Some(current) if !current.ptr_eq(server) => {
                    tracing::warn!("SYNC Ignoring duplicate record for {}", server.addr());
                    return;
                }
                Some(_) => {}
            }
            if info.master {
                if st.masters.add(server.clone()) {
                    tracing::info!("SYNC {} is now a master", server.addr());
                }
            } else if st.masters.remove(server) {
                tracing::info!("SYNC {} is no longer a master", server.addr());
            }
            server.set_info(info);
        }
        self.bump_generation();
    }

    fn remove_server(&self, server: &Server) {
        let removed = {
            let mut st = self.inner.state.lock();
            let removed = st.servers.remove(server);
            st.masters.remove(server);
            st.pending.retain(|_, s| !s.ptr_eq(server));
            removed
        };
        server.close();
        if removed {
            tracing::info!("SYNC Removing {} from cluster", server.addr());
            self.bump_generation();
        }
    }

    /// Role handshake with retries
    async fn sync_server(&self, server: &Server) -> Result<(ServerInfo, Vec<String>)> {
        let tries = if self.inner.fail_fast { 1 } else { SYNC_TRIES };
        let mut attempt = 0;
        let result = loop {
            if attempt > 0 {
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => return Err(Error::ShuttingDown),
                    _ = tokio::time::sleep(self.inner.tuning.short_delay()) => {}
                }
            }
            attempt += 1;
            match self.handshake(server).await {
                Ok(result) => break result,
                Err(e) => {
                    tracing::debug!("SYNC Failed to get server status from {}: {}", server.addr(), e);
                    if attempt >= tries {
                        return Err(e);
                    }
                }
            }
        };

        if let Some(expected) = &self.inner.set_name {
            if result.set_name.as_deref() != Some(expected.as_str()) {
                tracing::warn!(
                    "SYNC Server {} is not a member of replica set {:?}",
                    server.addr(),
                    expected
                );
                return Err(Error::SetNameMismatch {
                    address: server.addr().to_string(),
                    expected: expected.clone(),
                    actual: result.set_name,
                });
            }
        }

        let mongos = result.is_mongos();
        let master = result.is_master || mongos;
        if master {
            tracing::debug!("SYNC {} is a master", server.addr());
        } else if result.secondary {
            tracing::debug!("SYNC {} is a slave", server.addr());
        } else if self.inner.direct {
            tracing::info!("SYNC {} is neither a master nor a slave; keeping it for a direct connection", server.addr());
        } else {
            return Err(Error::Network(format!(
                "{} is neither a master nor a slave",
                server.addr()
            )));
        }

        let mut hosts = Vec::new();
        hosts.extend(result.primary.clone());
        hosts.extend(result.hosts.iter().cloned());
        hosts.extend(result.passives.iter().cloned());

        let info = ServerInfo {
            master,
            mongos,
            tags: result.tags,
            max_wire_version: result.max_wire_version,
            set_name: result.set_name,
        };
        Ok((info, hosts))
    }

    async fn handshake(&self, server: &Server) -> Result<command::IsMasterResult> {
        let (socket, _) = server
            .acquire_socket(0, Some(self.inner.tuning.socket_timeout()))
            .await?;
        let result = command::is_master(&socket).await;
        socket.release()?;
        result
    }

    /// Contact one address; returns the hosts it reported, tagged with
    /// whether a master reported them.
    async fn probe(self, addr: String, by_master: bool, round: Arc<Mutex<SyncRound>>) -> Vec<(String, bool)> {
        let resolved = match resolve_addr(&addr, self.inner.tuning.socket_timeout()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!("SYNC Failed to resolve {}: {}", addr, e);
                return Vec::new();
            }
        };

        {
            let mut r = round.lock();
            if by_master {
                if let Some((server, info)) = r.not_yet_added.remove(&resolved) {
                    r.complete = true;
                    drop(r);
                    self.add_server(&server, info);
                    return Vec::new();
                }
                r.add_if_found.insert(resolved);
            }
            if !r.seen.insert(resolved) {
                return Vec::new();
            }
        }

        let server = self.server_for(&addr, resolved);
        let (info, hosts) = match self.sync_server(&server).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("SYNC Dropping {}: {}", addr, e);
                self.remove_server(&server);
                return Vec::new();
            }
        };

        let master = info.master;
        let confirmed = {
            let mut r = round.lock();
            let confirmed = self.inner.direct || master || r.add_if_found.contains(&resolved);
            if confirmed {
                r.complete = true;
            } else {
                r.not_yet_added.insert(resolved, (server.clone(), info.clone()));
            }
            confirmed
        };
        if confirmed || self.is_member(&server) {
            self.add_server(&server, info);
        }

        if self.inner.direct {
            return Vec::new();
        }
        hosts.into_iter().map(|host| (host, master)).collect()
    }

    /// One full topology round
    async fn sync_servers(&self) {
        let round = Arc::new(Mutex::new(SyncRound::default()));
        let mut tasks = JoinSet::new();
        for addr in self.known_addrs() {
            tasks.spawn(self.clone().probe(addr, false, round.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(hosts) => {
                    for (host, by_master) in hosts {
                        tasks.spawn(self.clone().probe(host, by_master, round.clone()));
                    }
                }
                Err(e) => tracing::warn!("SYNC probe task failed: {}", e),
            }
        }

        let (complete, leftovers) = {
            let mut r = round.lock();
            (r.complete, std::mem::take(&mut r.not_yet_added))
        };

        if complete {
            // No master lists these any more, members included.
            for (server, _) in leftovers.into_values() {
                tracing::info!("SYNC Discarding unconfirmed server {}", server.addr());
                self.remove_server(&server);
            }
            let stale: Vec<Server> = {
                let mut st = self.inner.state.lock();
                let stale = st.pending.drain().map(|(_, s)| s).collect();
                st.dyn_seeds = st.servers.iter().map(|s| s.addr().to_string()).collect();
                tracing::info!(
                    "SYNC Synchronization completed: {} master(s) and {} slave(s) alive",
                    st.masters.len(),
                    st.servers.len() - st.masters.len()
                );
                stale
            };
            for server in stale {
                tracing::info!("SYNC Discarding unconfirmed server {}", server.addr());
                server.close();
            }
        } else {
            let mut st = self.inner.state.lock();
            if !st.closed {
                for (server, info) in leftovers.into_values() {
                    let member = st
                        .servers
                        .get(server.resolved_addr())
                        .map_or(false, |s| s.ptr_eq(&server));
                    if !member {
                        server.set_info(info);
                        st.pending.insert(server.addr().to_string(), server);
                    }
                }
            }
            tracing::info!(
                "SYNC Partial synchronization: no master reached, {} server(s) pending",
                st.pending.len()
            );
        }
        self.bump_generation();
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("seeds", &self.inner.user_seeds)
            .field("direct", &self.inner.direct)
            .field("sync_count", &self.sync_count())
            .finish()
    }
}

/// Resolve `addr`, adding the default port when none is given
pub async fn resolve_addr(addr: &str, timeout: Duration) -> Result<SocketAddr> {
    let has_port = match addr.rfind(':') {
        Some(i) => !addr[i..].contains(']'),
        None => false,
    };
    let target = if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    };

    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host(target.clone()))
        .await
        .map_err(|_| Error::ConnectionTimeout(target.clone()))?;
    let mut addrs = lookup.map_err(|e| Error::ConnectionFailed {
        address: target.clone(),
        reason: e.to_string(),
    })?;
    addrs.next().ok_or_else(|| Error::ConnectionFailed {
        address: target,
        reason: "no addresses found".into(),
    })
}

async fn sync_loop(cluster: Weak<ClusterInner>, mut resync: mpsc::Receiver<()>, cancel: CancellationToken) {
    loop {
        let Some(inner) = cluster.upgrade() else {
            return;
        };
        let cluster_ref = Cluster { inner };
        if cluster_ref.is_closed() {
            return;
        }

        tracing::debug!("SYNC Starting full topology synchronization...");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = cluster_ref.sync_servers() => {}
        }
        while resync.try_recv().is_ok() {}

        let tuning = cluster_ref.inner.tuning.clone();
        let fail_fast = cluster_ref.inner.fail_fast;
        let direct = cluster_ref.inner.direct;
        drop(cluster_ref);

        if !fail_fast {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(tuning.short_delay()) => {}
            }
        }

        let Some(inner) = cluster.upgrade() else {
            return;
        };
        let cluster_ref = Cluster { inner };
        cluster_ref.inner.sync_count.fetch_add(1, Ordering::AcqRel);
        cluster_ref.bump_generation();
        let restart = {
            let st = cluster_ref.inner.state.lock();
            (!direct && st.masters.is_empty()) || st.servers.is_empty()
        };
        drop(cluster_ref);

        if restart {
            tracing::debug!("SYNC No masters found. Will synchronize again.");
            if fail_fast {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(tuning.short_delay()) => {}
                }
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            request = resync.recv() => {
                if request.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(tuning.servers_delay()) => {}
        }
    }
}
