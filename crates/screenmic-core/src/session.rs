//! All-or-nothing link commits and the active link session.

use tracing::{debug, error, info, warn};

use crate::backend::{GraphBackend, LinkHandle};
use crate::error::{Error, Result};
use crate::plan::{LinkPlan, PlannedLink};

/// A link that exists on the server and belongs to the active session.
#[derive(Debug, Clone)]
pub struct EstablishedLink {
    /// Backend handle used for teardown
    pub handle: LinkHandle,
    /// What the link connects
    pub link: PlannedLink,
}

/// The set of links created by the most recent successful commit.
#[derive(Debug, Clone, Default)]
pub struct LinkSession {
    links: Vec<EstablishedLink>,
}

impl LinkSession {
    /// Links in creation order.
    #[must_use]
    pub fn links(&self) -> &[EstablishedLink] {
        &self.links
    }

    /// Number of links in the session.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the session holds no links.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Applies link plans and owns the active session.
#[derive(Debug, Default)]
pub struct LinkExecutor {
    session: Option<LinkSession>,
}

impl LinkExecutor {
    /// Create an executor with no active session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The active session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&LinkSession> {
        self.session.as_ref()
    }

    /// Whether a session is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Drop the session without touching the server.
    ///
    /// Used when the connection is lost and the links are gone with it.
    pub fn forget(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(links = session.len(), "Forgetting link session");
        }
    }

    /// Create every link of `plan`, replacing the active session.
    ///
    /// Any previous session is torn down first. If a link fails, every link
    /// created by this call is destroyed in reverse order before the error is
    /// returned, so no partial session is ever left behind.
    ///
    /// # Errors
    /// Returns [`Error::CommitFailed`] when the server rejected a link and the
    /// rollback completed, or [`Error::GraphUnavailable`] when the connection
    /// was lost; in that case no session is considered active.
    pub fn commit<B>(&mut self, backend: &mut B, plan: &LinkPlan) -> Result<usize>
    where
        B: GraphBackend + ?Sized,
    {
        self.teardown(backend)?;

        let created = create_all(backend, plan)?;

        let count = created.len();
        info!(links = count, version = plan.version, "Link session committed");
        self.session = Some(LinkSession { links: created });

        Ok(count)
    }

    /// Add every link of `plan` to the active session.
    ///
    /// The same all-or-nothing rule applies to the added links: on failure
    /// only the links created by this call are rolled back and the existing
    /// session stays as it was. Without an active session nothing is created.
    ///
    /// # Errors
    /// Same as [`LinkExecutor::commit`]. On [`Error::GraphUnavailable`] the
    /// whole session is forgotten.
    pub fn extend<B>(&mut self, backend: &mut B, plan: &LinkPlan) -> Result<usize>
    where
        B: GraphBackend + ?Sized,
    {
        if self.session.is_none() || plan.is_empty() {
            return Ok(0);
        }

        let created = match create_all(backend, plan) {
            Ok(created) => created,
            Err(e) => {
                if e.is_graph_lost() {
                    self.forget();
                }
                return Err(e);
            }
        };

        let count = created.len();
        if let Some(session) = self.session.as_mut() {
            session.links.extend(created);
            info!(added = count, links = session.len(), version = plan.version, "Link session extended");
        }

        Ok(count)
    }

    /// Destroy every link of the active session and clear it.
    ///
    /// A no-op without an active session. Links the server no longer knows
    /// are skipped.
    ///
    /// # Errors
    /// Returns [`Error::GraphUnavailable`] if the connection is lost; the
    /// session is cleared regardless.
    pub fn teardown<B>(&mut self, backend: &mut B) -> Result<()>
    where
        B: GraphBackend + ?Sized,
    {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let count = session.len();

        for established in session.links.into_iter().rev() {
            match backend.destroy_link(established.handle) {
                Ok(()) => debug!(handle = established.handle.0, "Link destroyed"),
                Err(e) if e.is_unavailable() => {
                    error!(error = %e, "Connection lost during teardown");
                    return Err(Error::GraphUnavailable(e.message));
                }
                Err(e) => {
                    warn!(handle = established.handle.0, error = %e, "Link already gone");
                }
            }
        }

        info!(links = count, "Link session torn down");
        Ok(())
    }
}

/// Create every link of `plan`, rolling back on the first failure.
fn create_all<B>(backend: &mut B, plan: &LinkPlan) -> Result<Vec<EstablishedLink>>
where
    B: GraphBackend + ?Sized,
{
    let mut created: Vec<EstablishedLink> = Vec::with_capacity(plan.len());

    for link in plan.links() {
        match backend.create_link(link) {
            Ok(handle) => {
                debug!(
                    handle = handle.0,
                    output = link.output_port,
                    input = link.input_port,
                    channel = ?link.channel,
                    "Link created"
                );
                created.push(EstablishedLink { handle, link: link.clone() });
            }
            Err(e) => {
                warn!(
                    output = link.output_port,
                    input = link.input_port,
                    error = %e,
                    created = created.len(),
                    "Link creation failed, rolling back"
                );
                rollback(backend, created)?;
                return Err(e.into());
            }
        }
    }

    Ok(created)
}

/// Destroy the links of a failed commit, newest first.
///
/// A `CommitFailed` promises a clean graph, so connection loss here turns
/// into [`Error::GraphUnavailable`] and stops the rollback.
fn rollback<B>(backend: &mut B, created: Vec<EstablishedLink>) -> Result<()>
where
    B: GraphBackend + ?Sized,
{
    for established in created.into_iter().rev() {
        match backend.destroy_link(established.handle) {
            Ok(()) => debug!(handle = established.handle.0, "Link rolled back"),
            Err(e) if e.is_unavailable() => {
                error!(handle = established.handle.0, error = %e, "Rollback interrupted by connection loss");
                return Err(Error::GraphUnavailable(e.message));
            }
            Err(e) => {
                warn!(handle = established.handle.0, error = %e, "Rollback could not destroy link");
            }
        }
    }

    Ok(())
}
