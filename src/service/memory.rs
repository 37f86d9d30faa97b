//! In-process coordination ensemble
//!
//! Implements the full [`CoordinationSession`] contract in memory: sessions,
//! ephemeral and sequential nodes, one-shot existence watches, atomic multi-op
//! batches and the `envi`/`mntr` diagnostic commands. Every session handed out by
//! the same [`MemoryEnsemble`] observes the same tree, so independent sessions can
//! race each other exactly like separate processes against a real ensemble.
//!
//! Watch callbacks are spawned on the current tokio runtime, off the task that
//! caused the change.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;

use super::Connector;
use super::CoordinationSession;
use super::CreateMode;
use super::Op;
use super::OpOutcome;
use super::ServiceError;
use super::ServiceResult;
use super::SessionParams;
use super::Stat;
use super::WatchCallback;
use super::WatchedEvent;
use super::WatchedEventKind;

const ROOT: &str = "/";
const SERVER_VERSION: &str = "d-coord-memory-1.0";

/// Shared in-memory ensemble
///
/// Cloning is cheap; all clones share the same tree and sessions.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

struct EnsembleInner {
    tree: Mutex<Tree>,
    /// Existence watches keyed by absolute path
    watches: DashMap<String, Vec<ExistsWatch>>,
    /// Live sessions and their chroot
    sessions: DashMap<i64, Option<String>>,
    next_session_id: AtomicI64,
    connect_attempts: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    last_hosts: Mutex<Vec<String>>,
}

struct ExistsWatch {
    session_id: i64,
    chroot: Option<String>,
    callback: WatchCallback,
}

#[derive(Clone)]
struct Tree {
    nodes: HashMap<String, Node>,
    zxid: i64,
}

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
    next_sequence: i32,
}

type Events = Vec<(String, WatchedEventKind)>;

impl Default for EnsembleInner {
    fn default() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT.to_string(), Node::new(Vec::new(), 0, 0));
        Self {
            tree: Mutex::new(Tree { nodes, zxid: 0 }),
            watches: DashMap::new(),
            sessions: DashMap::new(),
            next_session_id: AtomicI64::new(1),
            connect_attempts: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            connect_delay: Mutex::new(None),
            last_hosts: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` connect attempts fail with [`ServiceError::ConnectionLoss`]
    pub fn fail_next_connects(
        &self,
        count: usize,
    ) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Every subsequent connect attempt sleeps for `delay` before answering
    pub fn set_connect_delay(
        &self,
        delay: Option<Duration>,
    ) {
        *self.inner.connect_delay.lock() = delay;
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Host list passed to the most recent connect attempt
    pub fn last_hosts(&self) -> Vec<String> {
        self.inner.last_hosts.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn node_count(&self) -> usize {
        self.inner.tree.lock().nodes.len()
    }

    /// Simulates the death of a session: its ephemeral nodes vanish and its
    /// pending watches are discarded.
    pub fn expire_session(
        &self,
        session_id: i64,
    ) {
        self.inner.end_session(session_id);
    }

    /// Starts a session directly, bypassing connect failure injection
    pub fn session(
        &self,
        chroot: Option<String>,
    ) -> MemorySession {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions.insert(id, chroot.clone());
        debug!(session_id = id, ?chroot, "memory session started");
        MemorySession {
            id,
            chroot,
            closed: AtomicBool::new(false),
            ensemble: self.inner.clone(),
        }
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(
        &self,
        params: &SessionParams,
    ) -> ServiceResult<Arc<dyn CoordinationSession>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_hosts.lock() = params.hosts.clone();

        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.inner.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(ServiceError::ConnectionLoss);
        }

        if let Some(chroot) = &params.chroot {
            validate_path(chroot)?;
        }
        Ok(Arc::new(self.session(params.chroot.clone())))
    }
}

/// One session against a [`MemoryEnsemble`]
pub struct MemorySession {
    id: i64,
    chroot: Option<String>,
    closed: AtomicBool,
    ensemble: Arc<EnsembleInner>,
}

impl MemorySession {
    fn check_open(&self) -> ServiceResult<()> {
        if self.closed.load(Ordering::SeqCst) || !self.ensemble.sessions.contains_key(&self.id) {
            return Err(ServiceError::SessionExpired);
        }
        Ok(())
    }

    fn absolute(
        &self,
        path: &str,
    ) -> ServiceResult<String> {
        validate_path(path)?;
        Ok(prefix(self.chroot.as_deref(), path))
    }

    fn localize_err(
        &self,
        err: ServiceError,
    ) -> ServiceError {
        match err {
            ServiceError::NoNode { path } => ServiceError::NoNode {
                path: strip(self.chroot.as_deref(), &path),
            },
            ServiceError::NodeExists { path } => ServiceError::NodeExists {
                path: strip(self.chroot.as_deref(), &path),
            },
            ServiceError::NotEmpty { path } => ServiceError::NotEmpty {
                path: strip(self.chroot.as_deref(), &path),
            },
            other => other,
        }
    }

    /// Runs a mutation against the tree and dispatches the watches it triggered
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Tree, &mut Events) -> ServiceResult<R>,
    ) -> ServiceResult<R> {
        let (result, fired) = {
            let mut tree = self.ensemble.tree.lock();
            let mut events = Events::new();
            let result = f(&mut tree, &mut events);
            (result, self.ensemble.take_watches(&events))
        };
        dispatch(fired);
        result.map_err(|e| self.localize_err(e))
    }
}

#[async_trait]
impl CoordinationSession for MemorySession {
    async fn get_data(
        &self,
        path: &str,
    ) -> ServiceResult<(Vec<u8>, Stat)> {
        self.check_open()?;
        let full = self.absolute(path)?;
        let tree = self.ensemble.tree.lock();
        match tree.nodes.get(&full) {
            Some(node) => Ok((node.data.clone(), node.stat)),
            None => Err(ServiceError::NoNode { path: path.to_string() }),
        }
    }

    async fn exists(
        &self,
        path: &str,
        watch: Option<WatchCallback>,
    ) -> ServiceResult<Option<Stat>> {
        self.check_open()?;
        let full = self.absolute(path)?;
        let tree = self.ensemble.tree.lock();
        let stat = tree.nodes.get(&full).map(|n| n.stat);
        if let Some(callback) = watch {
            trace!(session_id = self.id, path = %full, "exists watch registered");
            self.ensemble.watches.entry(full).or_default().push(ExistsWatch {
                session_id: self.id,
                chroot: self.chroot.clone(),
                callback,
            });
        }
        Ok(stat)
    }

    async fn get_children(
        &self,
        path: &str,
    ) -> ServiceResult<Vec<String>> {
        self.check_open()?;
        let full = self.absolute(path)?;
        let tree = self.ensemble.tree.lock();
        match tree.nodes.get(&full) {
            Some(node) => Ok(node.children.iter().cloned().collect()),
            None => Err(ServiceError::NoNode { path: path.to_string() }),
        }
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_path: bool,
    ) -> ServiceResult<String> {
        self.check_open()?;
        let full = self.absolute(path)?;
        let owner = if mode.is_ephemeral() { self.id } else { 0 };
        let created = self.mutate(|tree, events| tree.create(&full, data, mode, make_path, owner, events))?;
        Ok(strip(self.chroot.as_deref(), &created))
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> ServiceResult<Stat> {
        self.check_open()?;
        let full = self.absolute(path)?;
        self.mutate(|tree, events| tree.set_data(&full, data, events))
    }

    async fn delete(
        &self,
        path: &str,
    ) -> ServiceResult<()> {
        self.check_open()?;
        let full = self.absolute(path)?;
        self.mutate(|tree, events| tree.delete(&full, events))
    }

    async fn multi(
        &self,
        ops: Vec<Op>,
    ) -> ServiceResult<Vec<ServiceResult<OpOutcome>>> {
        self.check_open()?;
        let mut absolute_ops = Vec::with_capacity(ops.len());
        for op in ops {
            let full = self.absolute(op.path())?;
            absolute_ops.push(match op {
                Op::Create { data, mode, .. } => Op::Create { path: full, data, mode },
                Op::SetData { data, .. } => Op::SetData { path: full, data },
                Op::Delete { .. } => Op::Delete { path: full },
            });
        }

        let (results, fired) = {
            let mut tree = self.ensemble.tree.lock();
            let mut scratch = tree.clone();
            let mut events = Events::new();
            let mut outcomes = Vec::with_capacity(absolute_ops.len());
            let mut failed_at = None;
            let op_count = absolute_ops.len();

            for (i, op) in absolute_ops.into_iter().enumerate() {
                let outcome = match op {
                    Op::Create { path, data, mode } => {
                        let owner = if mode.is_ephemeral() { self.id } else { 0 };
                        scratch
                            .create(&path, data, mode, false, owner, &mut events)
                            .map(|p| OpOutcome::Created(strip(self.chroot.as_deref(), &p)))
                    }
                    Op::SetData { path, data } => scratch.set_data(&path, data, &mut events).map(OpOutcome::SetData),
                    Op::Delete { path } => scratch.delete(&path, &mut events).map(|_| OpOutcome::Deleted),
                };
                match outcome {
                    Ok(o) => outcomes.push(Ok(o)),
                    Err(e) => {
                        outcomes.push(Err(self.localize_err(e)));
                        failed_at = Some(i);
                        break;
                    }
                }
            }

            match failed_at {
                None => {
                    *tree = scratch;
                    (outcomes, self.ensemble.take_watches(&events))
                }
                Some(index) => {
                    debug!(session_id = self.id, failed_at = index, "multi rolled back");
                    let failure = outcomes.swap_remove(index);
                    let mut results: Vec<ServiceResult<OpOutcome>> =
                        (0..index).map(|_| Err(ServiceError::RolledBack)).collect();
                    results.push(failure);
                    results.extend((index + 1..op_count).map(|_| Err(ServiceError::RuntimeInconsistency)));
                    (results, Vec::new())
                }
            }
        };
        dispatch(fired);
        Ok(results)
    }

    async fn four_letter_word(
        &self,
        command: &str,
    ) -> ServiceResult<String> {
        self.check_open()?;
        let tree = self.ensemble.tree.lock();
        let ephemerals = tree.nodes.values().filter(|n| n.stat.ephemeral_owner != 0).count();
        let watch_count: usize = self.ensemble.watches.iter().map(|w| w.value().len()).sum();
        match command {
            "envi" => Ok(format!(
                "Environment:\nzookeeper.version={SERVER_VERSION}\nhost.name=localhost\nsession.count={}\n",
                self.ensemble.sessions.len()
            )),
            "mntr" => Ok(format!(
                "zk_version\t{SERVER_VERSION}\nzk_server_state\tstandalone\nzk_znode_count\t{}\nzk_watch_count\t{}\nzk_ephemerals_count\t{}\nzk_last_zxid\t{}\n",
                tree.nodes.len(),
                watch_count,
                ephemerals,
                tree.zxid
            )),
            "ruok" => Ok("imok".to_string()),
            other => Err(ServiceError::BadArguments(format!("unknown command: {other}"))),
        }
    }

    fn session_id(&self) -> i64 {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.check_open().is_ok()
    }

    async fn close(&self) -> ServiceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ensemble.end_session(self.id);
        Ok(())
    }
}

impl Node {
    fn new(
        data: Vec<u8>,
        zxid: i64,
        ephemeral_owner: i64,
    ) -> Self {
        let data_length = data.len() as i32;
        Self {
            data,
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                ephemeral_owner,
                data_length,
                ..Stat::default()
            },
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }
}

impl Tree {
    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_path: bool,
        owner: i64,
        events: &mut Events,
    ) -> ServiceResult<String> {
        if path == ROOT {
            return Err(ServiceError::NodeExists { path: path.to_string() });
        }
        let parent = parent_of(path);
        if !self.nodes.contains_key(parent) {
            if !make_path {
                return Err(ServiceError::NoNode { path: path.to_string() });
            }
            self.create_parents(parent, events);
        }

        let actual = match mode.is_sequential() {
            true => {
                let parent_node = self.nodes.get_mut(parent).ok_or_else(|| ServiceError::NoNode {
                    path: parent.to_string(),
                })?;
                let sequence = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{path}{sequence:010}")
            }
            false => path.to_string(),
        };
        if self.nodes.contains_key(&actual) {
            return Err(ServiceError::NodeExists { path: actual });
        }

        let zxid = self.next_zxid();
        self.nodes.insert(actual.clone(), Node::new(data, zxid, owner));
        self.link_child(&actual);
        events.push((actual.clone(), WatchedEventKind::NodeCreated));
        Ok(actual)
    }

    fn create_parents(
        &mut self,
        path: &str,
        events: &mut Events,
    ) {
        let mut missing = Vec::new();
        let mut cursor = path;
        while !self.nodes.contains_key(cursor) {
            missing.push(cursor.to_string());
            cursor = parent_of(cursor);
        }
        for node_path in missing.into_iter().rev() {
            let zxid = self.next_zxid();
            self.nodes.insert(node_path.clone(), Node::new(Vec::new(), zxid, 0));
            self.link_child(&node_path);
            events.push((node_path, WatchedEventKind::NodeCreated));
        }
    }

    fn link_child(
        &mut self,
        path: &str,
    ) {
        let name = child_name(path).to_string();
        if let Some(parent) = self.nodes.get_mut(parent_of(path)) {
            parent.children.insert(name);
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.children.len() as i32;
        }
    }

    fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        events: &mut Events,
    ) -> ServiceResult<Stat> {
        let zxid = self.zxid + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| ServiceError::NoNode { path: path.to_string() })?;
        node.stat.data_length = data.len() as i32;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.data = data;
        let stat = node.stat;
        self.zxid = zxid;
        events.push((path.to_string(), WatchedEventKind::NodeDataChanged));
        Ok(stat)
    }

    fn delete(
        &mut self,
        path: &str,
        events: &mut Events,
    ) -> ServiceResult<()> {
        if path == ROOT {
            return Err(ServiceError::BadArguments("the root node cannot be deleted".to_string()));
        }
        match self.nodes.get(path) {
            None => return Err(ServiceError::NoNode { path: path.to_string() }),
            Some(node) if !node.children.is_empty() => {
                return Err(ServiceError::NotEmpty { path: path.to_string() });
            }
            Some(_) => {}
        }
        self.remove_subtree(path, events);
        Ok(())
    }

    /// Removes `path` and all of its descendants, deepest first
    fn remove_subtree(
        &mut self,
        path: &str,
        events: &mut Events,
    ) {
        let children: Vec<String> = match self.nodes.get(path) {
            Some(node) => node.children.iter().map(|c| join(path, c)).collect(),
            None => return,
        };
        for child in children {
            self.remove_subtree(&child, events);
        }
        self.nodes.remove(path);
        self.next_zxid();
        if let Some(parent) = self.nodes.get_mut(parent_of(path)) {
            parent.children.remove(child_name(path));
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.children.len() as i32;
        }
        events.push((path.to_string(), WatchedEventKind::NodeDeleted));
    }
}

impl EnsembleInner {
    /// Detaches every watch triggered by `events`. Called with the tree lock held so
    /// a watch registered after the change is never consumed by it.
    fn take_watches(
        &self,
        events: &Events,
    ) -> Vec<(WatchedEvent, WatchCallback)> {
        let mut fired = Vec::new();
        for (path, kind) in events {
            if let Some((_, watches)) = self.watches.remove(path) {
                for watch in watches {
                    let event = WatchedEvent {
                        kind: *kind,
                        path: strip(watch.chroot.as_deref(), path),
                    };
                    fired.push((event, watch.callback));
                }
            }
        }
        fired
    }

    fn end_session(
        &self,
        session_id: i64,
    ) {
        if self.sessions.remove(&session_id).is_none() {
            return;
        }
        let fired = {
            let mut tree = self.tree.lock();
            let mut owned: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, n)| n.stat.ephemeral_owner == session_id)
                .map(|(p, _)| p.clone())
                .collect();
            owned.sort_by_key(|p| std::cmp::Reverse(p.len()));

            let mut events = Events::new();
            for path in &owned {
                tree.remove_subtree(path, &mut events);
            }
            self.watches.retain(|_, watches| {
                watches.retain(|w| w.session_id != session_id);
                !watches.is_empty()
            });
            debug!(session_id, ephemerals = owned.len(), "memory session ended");
            self.take_watches(&events)
        };
        dispatch(fired);
    }
}

/// Delivers watch events asynchronously when a runtime is available
fn dispatch(fired: Vec<(WatchedEvent, WatchCallback)>) {
    for (event, callback) in fired {
        trace!(path = %event.path, kind = ?event.kind, "watch fired");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { callback(event) });
            }
            Err(_) => callback(event),
        }
    }
}

fn validate_path(path: &str) -> ServiceResult<()> {
    let valid = path.starts_with('/')
        && (path == ROOT || !path.ends_with('/'))
        && !path.contains("//")
        && !path.chars().any(|c| c == '\0');
    if !valid {
        return Err(ServiceError::BadArguments(format!("invalid path: {path:?}")));
    }
    Ok(())
}

fn prefix(
    chroot: Option<&str>,
    path: &str,
) -> String {
    match chroot {
        Some(root) if path == ROOT => root.to_string(),
        Some(root) => format!("{root}{path}"),
        None => path.to_string(),
    }
}

fn strip(
    chroot: Option<&str>,
    path: &str,
) -> String {
    match chroot {
        Some(root) if path == root => ROOT.to_string(),
        Some(root) => match path.strip_prefix(root) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        },
        None => path.to_string(),
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(i) => &path[..i],
    }
}

fn child_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn join(
    parent: &str,
    child: &str,
) -> String {
    match parent {
        ROOT => format!("/{child}"),
        _ => format!("{parent}/{child}"),
    }
}
