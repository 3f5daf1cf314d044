//! screenmic core - node selection, link planning and link sessions.
//!
//! This crate holds the graph model and the engine logic shared by the
//! PipeWire backend, the IPC layer and the daemon. It never talks to the
//! server directly; everything goes through [`GraphBackend`].

pub mod backend;
pub mod engine;
pub mod error;
pub mod filter;
pub mod graph;
pub mod plan;
pub mod request;
pub mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backend::{BackendError, BackendErrorKind, BackendResult, GraphBackend, LinkHandle};
pub use engine::{DEFAULT_LIST_PROPS, EngineOptions, PatchBay, ReplacePolicy, SessionInfo};
pub use error::{Error, Result};
pub use filter::{FilterSet, PropertyPredicate, RoutingMode, Target, select};
pub use graph::{Link, Node, Port, PortDirection, Snapshot};
pub use plan::{LinkPlan, LinkPlanner, PlannedLink};
pub use session::{EstablishedLink, LinkExecutor, LinkSession};
