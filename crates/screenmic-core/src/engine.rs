//! The patch bay engine.
//!
//! [`PatchBay`] ties the pieces together: it reads a snapshot from its
//! backend, selects nodes with a [`FilterSet`], plans the port links and
//! commits them as one [`LinkSession`].
//!
//! Calls are serialized through a single read/write lock: `list` calls may run
//! concurrently with each other, while `link` and `unlink` run alone.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::backend::GraphBackend;
use crate::error::{Error, Result};
use crate::filter::{FilterSet, select};
use crate::graph::Snapshot;
use crate::plan::LinkPlanner;
use crate::session::{LinkExecutor, LinkSession};

/// Keys projected by `list` when the caller does not name any.
pub const DEFAULT_LIST_PROPS: &[&str] = &["application.name", "node.name"];

/// What to do when `link` is called while a session is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacePolicy {
    /// Tear the active session down and commit the new one
    #[default]
    Replace,
    /// Fail with [`Error::SessionActive`] until `unlink` is called
    Reject,
}

/// Engine behaviour switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Policy for a second `link` while a session is active
    pub replace_policy: ReplacePolicy,
}

/// Summary of the active link session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Whether a session is active
    pub active: bool,
    /// Capture endpoint node ID, if it exists
    pub capture_node: Option<u32>,
    /// `(output port, input port)` pairs of the session's links
    pub links: Vec<(u32, u32)>,
}

struct EngineState<B> {
    backend: B,
    executor: LinkExecutor,
    capture_node: Option<u32>,
    /// Filter of the active session, re-applied by `refresh`
    filter: Option<FilterSet>,
}

impl<B: GraphBackend> EngineState<B> {
    /// Drop every piece of state that depended on the lost connection.
    fn invalidate(&mut self) {
        self.executor.forget();
        self.capture_node = None;
        self.filter = None;
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_graph_lost() {
                error!(error = %e, "Graph connection lost, session state dropped");
                self.invalidate();
            }
        }
        result
    }

    fn link(&mut self, filter: &FilterSet, policy: ReplacePolicy) -> Result<bool> {
        if self.executor.is_active() {
            if policy == ReplacePolicy::Reject {
                return Err(Error::SessionActive);
            }
            info!("Replacing active link session");
        }

        // Tear down first so the new plan does not see our own links as existing
        self.filter = None;
        self.executor.teardown(&mut self.backend)?;

        let capture = self.backend.ensure_capture_node()?;
        self.capture_node = Some(capture);

        let snapshot = self.backend.snapshot()?;
        let candidates = select(&snapshot, filter)?;
        let plan = LinkPlanner::new(&snapshot, capture).plan(&candidates, filter.mode());

        if plan.is_empty() {
            info!(candidates = candidates.len(), "Nothing to link");
            return Ok(false);
        }

        self.executor.commit(&mut self.backend, &plan)?;
        self.filter = Some(filter.clone());
        Ok(true)
    }

    fn refresh(&mut self) -> Result<usize> {
        let (Some(filter), Some(capture)) = (self.filter.as_ref(), self.capture_node) else {
            return Ok(0);
        };

        let snapshot = self.backend.snapshot()?;
        let candidates = select(&snapshot, filter)?;
        let plan = LinkPlanner::new(&snapshot, capture).plan(&candidates, filter.mode());

        if plan.is_empty() {
            trace!(version = snapshot.version, "Session up to date");
            return Ok(0);
        }

        self.executor.extend(&mut self.backend, &plan)
    }

    fn unlink(&mut self) -> Result<()> {
        self.filter = None;
        self.executor.teardown(&mut self.backend)?;

        if self.capture_node.take().is_some() {
            self.backend.release_capture_node()?;
        }

        Ok(())
    }
}

/// A patch bay bound to one graph backend.
pub struct PatchBay<B: GraphBackend> {
    state: RwLock<EngineState<B>>,
    options: EngineOptions,
}

impl<B: GraphBackend> PatchBay<B> {
    /// Create an engine over a connected backend.
    #[must_use]
    pub fn new(backend: B, options: EngineOptions) -> Self {
        Self {
            state: RwLock::new(EngineState {
                backend,
                executor: LinkExecutor::new(),
                capture_node: None,
                filter: None,
            }),
            options,
        }
    }

    /// List the nodes that can produce audio, projected onto `props`.
    ///
    /// With `None` (or an empty list) the projection is [`DEFAULT_LIST_PROPS`]
    /// and nodes lacking any of those keys are omitted. Explicitly requested
    /// keys never omit a node; a missing key maps to an empty string.
    ///
    /// # Errors
    /// Returns [`Error::GraphUnavailable`] if the backend cannot produce a snapshot.
    pub fn list(&self, props: Option<&[String]>) -> Result<Vec<BTreeMap<String, String>>> {
        let state = self.state.read();
        let snapshot = state.backend.snapshot().map_err(Error::from)?;

        let requested: Vec<&str> = match props {
            Some(keys) if !keys.is_empty() => keys.iter().map(String::as_str).collect(),
            _ => DEFAULT_LIST_PROPS.to_vec(),
        };
        let require_all = props.is_none_or(<[String]>::is_empty);

        let entries = project(&snapshot, &requested, require_all, state.capture_node);
        debug!(count = entries.len(), keys = ?requested, "Listed nodes");

        Ok(entries)
    }

    /// Route the nodes selected by `filter` into the capture endpoint.
    ///
    /// Returns `true` when a session with at least one link was committed and
    /// `false` when the filter matched nothing linkable.
    ///
    /// # Errors
    /// - [`Error::InvalidFilter`] before touching the graph
    /// - [`Error::SessionActive`] under [`ReplacePolicy::Reject`]
    /// - [`Error::CommitFailed`] after a clean rollback
    /// - [`Error::GraphUnavailable`] when the connection was lost
    pub fn link(&self, filter: &FilterSet) -> Result<bool> {
        filter.validate()?;

        let mut state = self.state.write();
        let result = state.link(filter, self.options.replace_policy);
        state.guard(result)
    }

    /// Link nodes that started matching the active session's filter.
    ///
    /// Streams that appear after `link` (a new browser tab, a player that
    /// starts later) are planned against a fresh snapshot and added to the
    /// session with the same all-or-nothing rule. Returns the number of links
    /// added; without an active session nothing happens.
    ///
    /// # Errors
    /// - [`Error::CommitFailed`] after a clean rollback of the added links;
    ///   the existing session is kept
    /// - [`Error::GraphUnavailable`] when the connection was lost
    pub fn refresh(&self) -> Result<usize> {
        let mut state = self.state.write();
        let result = state.refresh();
        state.guard(result)
    }

    /// Tear down the active session and the capture endpoint.
    ///
    /// Succeeds without side effects when nothing is linked.
    ///
    /// # Errors
    /// Returns [`Error::GraphUnavailable`] if the connection was lost.
    pub fn unlink(&self) -> Result<()> {
        let mut state = self.state.write();
        let result = state.unlink();
        state.guard(result)
    }

    /// Describe the active session.
    #[must_use]
    pub fn session(&self) -> SessionInfo {
        let state = self.state.read();
        let session = state.executor.session();

        SessionInfo {
            active: session.is_some(),
            capture_node: state.capture_node,
            links: session
                .map(LinkSession::links)
                .unwrap_or_default()
                .iter()
                .map(|l| (l.link.output_port, l.link.input_port))
                .collect(),
        }
    }
}

impl<B: GraphBackend> Drop for PatchBay<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Err(e) = state.unlink() {
            warn!(error = %e, "Failed to release graph resources on shutdown");
        }
    }
}

fn project(
    snapshot: &Snapshot,
    keys: &[&str],
    require_all: bool,
    capture: Option<u32>,
) -> Vec<BTreeMap<String, String>> {
    snapshot
        .nodes
        .iter()
        .filter(|n| Some(n.id) != capture)
        .filter(|n| n.max_output_ports > 0)
        .filter(|n| !require_all || keys.iter().all(|k| n.prop(k).is_some_and(|v| !v.is_empty())))
        .map(|n| {
            keys.iter()
                .map(|k| ((*k).to_string(), n.prop(k).unwrap_or_default().to_string()))
                .collect()
        })
        .collect()
}
