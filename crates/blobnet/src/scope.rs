//! Hierarchical blob and graph store.
//!
//! Name lookup order is: local blobs, then the forwarding table (resolved in
//! the owning scope), then the parent chain. Parents and forwarding owners are
//! held as [`Weak`] references; a parent must outlive its children.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, error, trace, warn};

use crate::blob::{Blob, BlobRef};
use crate::error::{Result, RuntimeError};
use crate::graph::Graph;
use crate::record::{GraphRecord, OperatorRecord};
use crate::runtime::Runtime;

/// Shared handle to a graph instance owned by a scope.
pub type GraphHandle = Arc<Mutex<Box<dyn Graph>>>;

struct Forward {
    owner: Weak<Scope>,
    remote: String,
}

/// Named blobs and graph instances with parent delegation and forwarding.
pub struct Scope {
    runtime: Arc<Runtime>,
    parent: Option<Weak<Scope>>,
    blobs: RwLock<HashMap<String, BlobRef>>,
    forwards: RwLock<HashMap<String, Forward>>,
    graphs: Mutex<BTreeMap<String, GraphHandle>>,
    last_failed_op_position: Mutex<Option<usize>>,
}

impl Scope {
    /// Creates a root scope.
    pub fn new(runtime: Arc<Runtime>) -> Arc<Scope> {
        Arc::new(Scope::with_parent(runtime, None))
    }

    /// Creates a child that reads through to `parent` and shares its runtime.
    pub fn new_child(parent: &Arc<Scope>) -> Arc<Scope> {
        Arc::new(Scope::with_parent(
            Arc::clone(&parent.runtime),
            Some(Arc::downgrade(parent)),
        ))
    }

    fn with_parent(runtime: Arc<Runtime>, parent: Option<Weak<Scope>>) -> Scope {
        Scope {
            runtime,
            parent,
            blobs: RwLock::new(HashMap::new()),
            forwards: RwLock::new(HashMap::new()),
            graphs: Mutex::new(BTreeMap::new()),
            last_failed_op_position: Mutex::new(None),
        }
    }

    /// Runtime whose registries this scope constructs operators and graphs from.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Enclosing scope, or `None` for a root or when the parent was dropped.
    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn local(&self, name: &str) -> Option<BlobRef> {
        self.blobs
            .read()
            .expect("scope blobs poisoned")
            .get(name)
            .cloned()
    }

    /// `Some(target)` when a forwarding entry exists; the target is `None` if it went away.
    fn forwarded(&self, name: &str) -> Option<Option<BlobRef>> {
        let forwards = self.forwards.read().expect("scope forwards poisoned");
        let forward = forwards.get(name)?;
        let owner = forward.owner.upgrade();
        let remote = forward.remote.clone();
        drop(forwards);
        Some(owner.and_then(|owner| owner.resolve(&remote)))
    }

    fn resolve(&self, name: &str) -> Option<BlobRef> {
        if let Some(blob) = self.local(name) {
            return Some(blob);
        }
        if let Some(target) = self.forwarded(name) {
            return target;
        }
        self.parent().and_then(|parent| parent.resolve(name))
    }

    /// Whether `name` resolves here, through a forward, or in an ancestor.
    pub fn has_blob(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Looks `name` up along the resolution chain; a miss is logged, not an error.
    pub fn get_blob(&self, name: &str) -> Option<BlobRef> {
        let blob = self.resolve(name);
        if blob.is_none() {
            warn!(blob = name, "blob not in scope");
        }
        blob
    }

    /// Returns the blob `name` resolves to, creating an empty local blob if none.
    ///
    /// A forwarding entry whose target no longer exists is dropped and replaced
    /// by a fresh local blob.
    pub fn create_blob(&self, name: &str) -> BlobRef {
        if let Some(blob) = self.local(name) {
            trace!(blob = name, "blob already exists; skipping");
            return blob;
        }
        match self.forwarded(name) {
            Some(Some(blob)) => {
                trace!(blob = name, "blob is forwarded; skipping");
                return blob;
            }
            Some(None) => {
                debug!(blob = name, "forwarding target is gone; creating local blob");
                self.forwards
                    .write()
                    .expect("scope forwards poisoned")
                    .remove(name);
            }
            None => {
                if let Some(blob) = self.parent().and_then(|parent| parent.resolve(name)) {
                    trace!(blob = name, "blob inherited from parent; skipping");
                    return blob;
                }
            }
        }
        debug!(blob = name, "creating blob");
        let mut blobs = self.blobs.write().expect("scope blobs poisoned");
        Arc::clone(blobs.entry(name.to_string()).or_insert_with(Blob::new))
    }

    /// Returns the local blob `name`, creating it even if an ancestor has one.
    pub fn create_local_blob(&self, name: &str) -> BlobRef {
        let mut blobs = self.blobs.write().expect("scope blobs poisoned");
        Arc::clone(blobs.entry(name.to_string()).or_insert_with(Blob::new))
    }

    /// Removes a local blob or forwarding entry. Inherited blobs are untouched.
    pub fn remove_blob(&self, name: &str) -> bool {
        let removed_local = self
            .blobs
            .write()
            .expect("scope blobs poisoned")
            .remove(name)
            .is_some();
        let removed_forward = self
            .forwards
            .write()
            .expect("scope forwards poisoned")
            .remove(name)
            .is_some();
        if removed_local || removed_forward {
            debug!(blob = name, "removed blob");
        }
        removed_local || removed_forward
    }

    /// Makes `local` in this scope resolve to `remote` in `owner`.
    pub fn forward_blob(&self, local: &str, owner: &Arc<Scope>, remote: &str) -> Result<()> {
        if !owner.has_blob(remote) {
            return Err(RuntimeError::MissingBlob(remote.to_string()));
        }
        if self.local(local).is_some() {
            return Err(RuntimeError::invalid_argument(
                local,
                "cannot forward a name that already has a local blob",
            ));
        }
        self.forwards.write().expect("scope forwards poisoned").insert(
            local.to_string(),
            Forward {
                owner: Arc::downgrade(owner),
                remote: remote.to_string(),
            },
        );
        Ok(())
    }

    /// Every name visible from this scope: local, live forwards, and inherited.
    pub fn blob_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .blobs
            .read()
            .expect("scope blobs poisoned")
            .keys()
            .cloned()
            .collect();
        let forwarded: Vec<String> = self
            .forwards
            .read()
            .expect("scope forwards poisoned")
            .keys()
            .cloned()
            .collect();
        names.extend(
            forwarded
                .into_iter()
                .filter(|name| matches!(self.forwarded(name), Some(Some(_)))),
        );
        if let Some(parent) = self.parent() {
            names.extend(parent.blob_names());
        }
        names
    }

    /// Names of blobs owned by this scope, sorted.
    pub fn local_blob_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .read()
            .expect("scope blobs poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Instantiates a graph and stores it under the record's name.
    ///
    /// With `overwrite`, an existing instance of the same name is dropped
    /// before the replacement is constructed.
    pub fn create_graph(
        self: &Arc<Self>,
        record: impl Into<Arc<GraphRecord>>,
        overwrite: bool,
    ) -> Result<GraphHandle> {
        let record = record.into();
        if record.name.is_empty() {
            return Err(RuntimeError::MissingGraphName);
        }
        let name = record.name.clone();
        {
            let mut graphs = self.graphs.lock().expect("scope graphs poisoned");
            if graphs.contains_key(&name) {
                if !overwrite {
                    return Err(RuntimeError::DuplicateGraphName(name));
                }
                debug!(graph = %name, "deleting existing graph of the same name");
                let previous = graphs.remove(&name);
                drop(graphs);
                drop(previous);
            }
        }

        debug!(graph = %name, graph_type = %record.graph_type, "initializing graph");
        let graph = self
            .runtime
            .graphs()
            .create(record, self)
            .map_err(|err| {
                error!(graph = %name, error = %err, "error when creating the graph");
                err
            })?;
        let handle: GraphHandle = Arc::new(Mutex::new(graph));
        self.graphs
            .lock()
            .expect("scope graphs poisoned")
            .insert(name, Arc::clone(&handle));
        Ok(handle)
    }

    /// Graph registered under `name` in this scope.
    pub fn get_graph(&self, name: &str) -> Option<GraphHandle> {
        self.graphs
            .lock()
            .expect("scope graphs poisoned")
            .get(name)
            .cloned()
    }

    pub fn has_graph(&self, name: &str) -> bool {
        self.graphs
            .lock()
            .expect("scope graphs poisoned")
            .contains_key(name)
    }

    /// Drops the graph registered under `name`; `false` if there was none.
    pub fn delete_graph(&self, name: &str) -> bool {
        self.graphs
            .lock()
            .expect("scope graphs poisoned")
            .remove(name)
            .is_some()
    }

    /// Names of the graphs registered in this scope, sorted.
    pub fn graph_names(&self) -> Vec<String> {
        self.graphs
            .lock()
            .expect("scope graphs poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Runs a previously created graph.
    pub fn run_graph(&self, name: &str) -> Result<()> {
        let handle = self.get_graph(name).ok_or_else(|| {
            error!(graph = name, "graph does not exist yet");
            RuntimeError::GraphNotFound(name.to_string())
        })?;
        let mut graph = handle.lock().expect("graph poisoned");
        graph.run()
    }

    /// Builds and runs a single operator; the instance is dropped afterwards.
    pub fn run_operator_once(self: &Arc<Self>, record: OperatorRecord) -> Result<()> {
        let op_type = record.op_type.clone();
        let mut op = self
            .runtime
            .factory()
            .create_operator(Arc::new(record), self, None)
            .map_err(|err| {
                error!(op_type = %op_type, error = %err, "cannot create operator");
                err
            })?;
        op.run().map_err(|err| {
            error!(op_type = %op_type, error = %err, "error when running operator");
            err
        })
    }

    /// Builds and runs a graph without registering it in the scope.
    pub fn run_graph_once(self: &Arc<Self>, record: impl Into<Arc<GraphRecord>>) -> Result<()> {
        let mut graph = self.runtime.graphs().create(record.into(), self)?;
        graph.run()
    }

    /// Graph position of the most recent operator whose construction failed.
    pub fn last_failed_op_position(&self) -> Option<usize> {
        *self
            .last_failed_op_position
            .lock()
            .expect("scope failure position poisoned")
    }

    pub(crate) fn set_last_failed_op_position(&self, position: usize) {
        *self
            .last_failed_op_position
            .lock()
            .expect("scope failure position poisoned") = Some(position);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("blobs", &self.local_blob_names())
            .field("graphs", &self.graph_names())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
