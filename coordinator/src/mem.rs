//! In-process [`Coordinator`] implementation.
//!
//! Implements the full contract including parent-scoped sequential naming,
//! versioned writes, atomic multi-ops and exists-watches, so the rest of the
//! workspace can be exercised without a real coordination service.

use crate::{
    Coordinator, CoordinatorError, CreateMode, NodeEvent, Op, OpResult, Result, Stat,
};
use async_trait::async_trait;
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use shard_time::{SystemProvider, TimeProvider};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct MemNode {
    value: String,
    stat: Stat,
    ephemeral: bool,
    next_sequential: u64,
}

#[derive(Debug, Default)]
struct MemState {
    nodes: BTreeMap<String, MemNode>,
    watches: HashMap<String, Vec<Arc<NodeEvent>>>,
}

/// An in-memory coordinator.
///
/// All state lives behind a single mutex; multi-ops validate and apply
/// against a scratch copy so a failing op leaves nothing behind.
#[derive(Debug)]
pub struct MemCoordinator {
    state: Mutex<MemState>,
    time_provider: Arc<dyn TimeProvider>,
    connection_lost: AtomicBool,
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordinator {
    /// Create an empty coordinator on the system clock.
    pub fn new() -> Self {
        Self::new_with_time(Arc::new(SystemProvider::new()))
    }

    /// Create an empty coordinator with the given clock.
    pub fn new_with_time(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            time_provider,
            connection_lost: AtomicBool::new(false),
        }
    }

    /// While `true`, every operation fails with `ConnectionLoss`.
    pub fn simulate_connection_loss(&self, lost: bool) {
        self.connection_lost.store(lost, Ordering::SeqCst);
    }

    fn check_connection(&self) -> Result<()> {
        if self.connection_lost.load(Ordering::SeqCst) {
            return Err(CoordinatorError::connection_loss("simulated connection loss"));
        }
        Ok(())
    }

    fn now_secs(&self) -> i64 {
        self.time_provider.now().timestamp()
    }

    /// Drop every node created by an ephemeral mode, as an expiring session
    /// would. Watches on the removed paths fire.
    pub fn expire_session(&self) {
        let mut state = self.state.lock();
        let removed: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &removed {
            state.nodes.remove(path);
        }
        let fired = Self::fire_watches(&mut state, &removed);
        drop(state);
        for event in fired {
            event.set();
        }
    }

    /// Fire and drop the watches registered for each touched path.
    fn fire_watches(state: &mut MemState, touched: &[String]) -> Vec<Arc<NodeEvent>> {
        let mut fired = Vec::new();
        for path in touched {
            if let Some(events) = state.watches.remove(path) {
                fired.extend(events);
            }
        }
        fired
    }
}

fn parent_of(path: &str) -> Result<&str> {
    let (parent, name) = path
        .rsplit_once('/')
        .ok_or_else(|| CoordinatorError::unknown(format!("path '{path}' is not absolute")))?;
    if name.is_empty() {
        return Err(CoordinatorError::unknown(format!(
            "path '{path}' has an empty final component"
        )));
    }
    Ok(if parent.is_empty() { "/" } else { parent })
}

fn parent_exists(nodes: &BTreeMap<String, MemNode>, parent: &str) -> bool {
    parent == "/" || nodes.contains_key(parent)
}

fn has_children(nodes: &BTreeMap<String, MemNode>, path: &str) -> bool {
    let prefix = format!("{path}/");
    nodes
        .range(prefix.clone()..)
        .next()
        .map(|(k, _)| k.starts_with(&prefix))
        .unwrap_or(false)
}

/// Apply one op against `nodes`, returning its result and the path whose
/// watches it fires.
fn apply_op(
    nodes: &mut BTreeMap<String, MemNode>,
    op: &Op,
    now: i64,
) -> Result<(OpResult, String)> {
    match op {
        Op::Create { path, value, mode } => {
            let created = apply_create(nodes, path, value, *mode, now)?;
            Ok((OpResult::Created { path: created.clone() }, created))
        }
        Op::SetData {
            path,
            value,
            version,
        } => {
            let stat = apply_set(nodes, path, value, *version)?;
            Ok((OpResult::SetData { stat }, path.clone()))
        }
        Op::Remove { path, version } => {
            apply_remove(nodes, path, *version)?;
            Ok((OpResult::Removed, path.clone()))
        }
        Op::Check { path, version } => {
            let node = nodes
                .get(path)
                .ok_or_else(|| CoordinatorError::node_not_exist(format!("no node at '{path}'")))?;
            if *version != -1 && node.stat.version != *version {
                return Err(CoordinatorError::bad_version(format!(
                    "check of '{path}' expected version {version}, found {}",
                    node.stat.version
                )));
            }
            Ok((OpResult::Checked, path.clone()))
        }
    }
}

fn apply_create(
    nodes: &mut BTreeMap<String, MemNode>,
    path: &str,
    value: &str,
    mode: CreateMode,
    now: i64,
) -> Result<String> {
    let parent = parent_of(path)?;
    if !parent_exists(nodes, parent) {
        return Err(CoordinatorError::node_not_exist(format!(
            "parent '{parent}' of '{path}' does not exist"
        )));
    }

    let full_path = if mode.is_sequential() {
        // The sequence counter is scoped to the parent node, as with real
        // sequential znodes; the padding keeps lexicographic order equal to
        // creation order.
        let parent_node = nodes
            .get_mut(parent)
            .ok_or_else(|| CoordinatorError::node_not_exist(format!(
                "sequential create under '{parent}' requires an existing parent node"
            )))?;
        let seq = parent_node.next_sequential;
        parent_node.next_sequential += 1;
        format!("{path}{seq:010}")
    } else {
        path.to_owned()
    };

    if nodes.contains_key(&full_path) {
        return Err(CoordinatorError::node_exists(format!(
            "node '{full_path}' already exists"
        )));
    }

    nodes.insert(
        full_path.clone(),
        MemNode {
            value: value.to_owned(),
            stat: Stat {
                version: 0,
                ctime: now,
            },
            ephemeral: mode.is_ephemeral(),
            next_sequential: 0,
        },
    );
    Ok(full_path)
}

fn apply_set(
    nodes: &mut BTreeMap<String, MemNode>,
    path: &str,
    value: &str,
    version: i32,
) -> Result<Stat> {
    let node = nodes
        .get_mut(path)
        .ok_or_else(|| CoordinatorError::node_not_exist(format!("no node at '{path}'")))?;
    if version != -1 && node.stat.version != version {
        return Err(CoordinatorError::bad_version(format!(
            "set of '{path}' expected version {version}, found {}",
            node.stat.version
        )));
    }
    node.value = value.to_owned();
    node.stat.version += 1;
    Ok(node.stat)
}

fn apply_remove(nodes: &mut BTreeMap<String, MemNode>, path: &str, version: i32) -> Result<()> {
    let node = nodes
        .get(path)
        .ok_or_else(|| CoordinatorError::node_not_exist(format!("no node at '{path}'")))?;
    if version != -1 && node.stat.version != version {
        return Err(CoordinatorError::bad_version(format!(
            "remove of '{path}' expected version {version}, found {}",
            node.stat.version
        )));
    }
    if has_children(nodes, path) {
        return Err(CoordinatorError::unknown(format!(
            "node '{path}' still has children"
        )));
    }
    nodes.remove(path);
    Ok(())
}

#[async_trait]
impl Coordinator for MemCoordinator {
    async fn get(&self, path: &str) -> Result<(String, Stat)> {
        self.check_connection()?;
        let state = self.state.lock();
        state
            .nodes
            .get(path)
            .map(|n| (n.value.clone(), n.stat))
            .ok_or_else(|| CoordinatorError::node_not_exist(format!("no node at '{path}'")))
    }

    async fn try_get(&self, path: &str) -> Result<Option<(String, Stat)>> {
        self.check_connection()?;
        let state = self.state.lock();
        Ok(state.nodes.get(path).map(|n| (n.value.clone(), n.stat)))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_connection()?;
        let state = self.state.lock();
        if !parent_exists(&state.nodes, path) {
            return Err(CoordinatorError::node_not_exist(format!(
                "no node at '{path}'"
            )));
        }
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let name = &k[prefix.len()..];
                (!name.contains('/')).then(|| name.to_owned())
            })
            .collect())
    }

    async fn set(&self, path: &str, value: &str, version: i32) -> Result<Stat> {
        self.check_connection()?;
        let mut state = self.state.lock();
        let stat = apply_set(&mut state.nodes, path, value, version)?;
        let fired = Self::fire_watches(&mut state, &[path.to_owned()]);
        drop(state);
        for event in fired {
            event.set();
        }
        Ok(stat)
    }

    async fn create(&self, path: &str, value: &str, mode: CreateMode) -> Result<String> {
        self.check_connection()?;
        let now = self.now_secs();
        let mut state = self.state.lock();
        let created = apply_create(&mut state.nodes, path, value, mode, now)?;
        let fired = Self::fire_watches(&mut state, &[created.clone()]);
        drop(state);
        for event in fired {
            event.set();
        }
        Ok(created)
    }

    async fn try_remove(&self, path: &str) -> Result<bool> {
        self.check_connection()?;
        let mut state = self.state.lock();
        match apply_remove(&mut state.nodes, path, -1) {
            Ok(()) => {
                let fired = Self::fire_watches(&mut state, &[path.to_owned()]);
                drop(state);
                for event in fired {
                    event.set();
                }
                Ok(true)
            }
            Err(e) if e.kind() == crate::CoordinatorErrorKind::NodeNotExist => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>> {
        self.check_connection()?;
        let now = self.now_secs();
        let mut state = self.state.lock();

        // Validate-and-apply against a scratch copy; swap in only on full
        // success so a failing op leaves no trace (including sequence
        // counters).
        let mut scratch = state.nodes.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut touched = Vec::with_capacity(ops.len());
        for op in &ops {
            let (result, path) = apply_op(&mut scratch, op, now)?;
            results.push(result);
            touched.push(path);
        }
        state.nodes = scratch;

        let fired = Self::fire_watches(&mut state, &touched);
        drop(state);
        debug!(n_ops = ops.len(), "committed multi-op transaction");
        for event in fired {
            event.set();
        }
        Ok(results)
    }

    async fn exists(&self, path: &str, watch: Option<Arc<NodeEvent>>) -> Result<bool> {
        self.check_connection()?;
        let mut state = self.state.lock();
        if let Some(event) = watch {
            state
                .watches
                .entry(path.to_owned())
                .or_default()
                .push(event);
        }
        Ok(state.nodes.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoordinatorErrorKind;

    fn mem() -> MemCoordinator {
        MemCoordinator::new()
    }

    #[tokio::test]
    async fn create_get_set_remove() {
        let coord = mem();
        coord
            .create("/root", "", CreateMode::Persistent)
            .await
            .unwrap();
        coord
            .create("/root/a", "hello", CreateMode::Persistent)
            .await
            .unwrap();

        let (value, stat) = coord.get("/root/a").await.unwrap();
        assert_eq!(value, "hello");
        assert_eq!(stat.version, 0);

        let stat = coord.set("/root/a", "world", -1).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(coord.get("/root/a").await.unwrap().0, "world");

        assert!(coord.try_remove("/root/a").await.unwrap());
        assert!(!coord.try_remove("/root/a").await.unwrap());
        assert!(coord.try_get("/root/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_parent_is_rejected() {
        let coord = mem();
        let err = coord
            .create("/no/such/parent", "", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CoordinatorErrorKind::NodeNotExist);
    }

    #[tokio::test]
    async fn versioned_set_conflicts() {
        let coord = mem();
        coord
            .create("/n", "v0", CreateMode::Persistent)
            .await
            .unwrap();
        coord.set("/n", "v1", 0).await.unwrap();

        let err = coord.set("/n", "v2", 0).await.unwrap_err();
        assert_eq!(err.kind(), CoordinatorErrorKind::BadVersion);
        assert_eq!(coord.get("/n").await.unwrap().0, "v1");
    }

    #[tokio::test]
    async fn sequential_names_are_padded_and_ordered() {
        let coord = mem();
        coord
            .create("/queue", "", CreateMode::Persistent)
            .await
            .unwrap();

        let first = coord
            .create("/queue/item-", "a", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = coord
            .create("/queue/item-", "b", CreateMode::PersistentSequential)
            .await
            .unwrap();

        assert_eq!(first, "/queue/item-0000000000");
        assert_eq!(second, "/queue/item-0000000001");

        let children = coord.get_children("/queue").await.unwrap();
        assert_eq!(children, vec!["item-0000000000", "item-0000000001"]);
    }

    #[tokio::test]
    async fn children_do_not_recurse() {
        let coord = mem();
        coord.create("/a", "", CreateMode::Persistent).await.unwrap();
        coord
            .create("/a/b", "", CreateMode::Persistent)
            .await
            .unwrap();
        coord
            .create("/a/b/c", "", CreateMode::Persistent)
            .await
            .unwrap();

        assert_eq!(coord.get_children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn multi_is_atomic() {
        let coord = mem();
        coord
            .create("/queue", "", CreateMode::Persistent)
            .await
            .unwrap();
        coord
            .create("/pointer", "0", CreateMode::Persistent)
            .await
            .unwrap();

        // Second op fails: nothing of the first op may remain.
        let err = coord
            .multi(vec![
                Op::create("/queue/item-", "a", CreateMode::PersistentSequential),
                Op::set_data("/missing", "x", -1),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), CoordinatorErrorKind::NodeNotExist);
        assert!(coord.get_children("/queue").await.unwrap().is_empty());

        // A successful transaction reports created paths in op order, and
        // the failed attempt above did not burn a sequence number.
        let results = coord
            .multi(vec![
                Op::create("/queue/item-", "a", CreateMode::PersistentSequential),
                Op::set_data("/pointer", "1", -1),
            ])
            .await
            .unwrap();
        assert_eq!(
            results[0],
            OpResult::Created {
                path: "/queue/item-0000000000".to_owned()
            }
        );
        assert_eq!(coord.get("/pointer").await.unwrap().0, "1");
    }

    #[tokio::test]
    async fn exists_watch_fires_on_create() {
        let coord = mem();
        let event = Arc::new(NodeEvent::new());

        assert!(!coord
            .exists("/later", Some(Arc::clone(&event)))
            .await
            .unwrap());
        assert!(!event.is_set());

        coord
            .create("/later", "", CreateMode::Persistent)
            .await
            .unwrap();
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn exists_watch_fires_on_multi() {
        let coord = mem();
        coord
            .create("/pointer", "0", CreateMode::Persistent)
            .await
            .unwrap();

        let event = Arc::new(NodeEvent::new());
        assert!(coord
            .exists("/pointer", Some(Arc::clone(&event)))
            .await
            .unwrap());

        coord
            .multi(vec![Op::set_data("/pointer", "1", -1)])
            .await
            .unwrap();
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn connection_loss_is_transient() {
        let coord = mem();
        coord.simulate_connection_loss(true);
        let err = coord.get_children("/").await.unwrap_err();
        assert_eq!(err.kind(), CoordinatorErrorKind::ConnectionLoss);

        coord.simulate_connection_loss(false);
        assert!(coord.get_children("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_a_parent_is_rejected() {
        let coord = mem();
        coord.create("/a", "", CreateMode::Persistent).await.unwrap();
        coord
            .create("/a/b", "", CreateMode::Persistent)
            .await
            .unwrap();

        let err = coord.try_remove("/a").await.unwrap_err();
        assert_eq!(err.kind(), CoordinatorErrorKind::Unknown);
        assert!(coord.try_remove("/a/b").await.unwrap());
        assert!(coord.try_remove("/a").await.unwrap());
    }

    #[tokio::test]
    async fn session_expiry_removes_ephemeral_nodes() {
        let coord = mem();
        coord
            .create("/replica-alive", "", CreateMode::Ephemeral)
            .await
            .unwrap();
        coord
            .create("/durable", "", CreateMode::Persistent)
            .await
            .unwrap();

        let event = Arc::new(NodeEvent::new());
        assert!(coord
            .exists("/replica-alive", Some(Arc::clone(&event)))
            .await
            .unwrap());

        coord.expire_session();

        assert!(coord.try_get("/replica-alive").await.unwrap().is_none());
        assert!(coord.try_get("/durable").await.unwrap().is_some());
        assert!(event.is_set());
    }
}
