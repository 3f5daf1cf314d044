//! Request handling for the IPC server.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use screenmic_core::request::{parse_filter, parse_list_props};
use screenmic_core::{Error, GraphBackend, PatchBay, SessionInfo};
use screenmic_ipc::messages::{ErrorInfo, Method};

/// Side effect the main loop must act on after a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The session was committed, replaced or torn down
    SessionChanged(SessionInfo),
    /// The engine lost its graph and must be rebuilt
    GraphLost(String),
}

/// Result of handling a request.
#[derive(Debug)]
pub struct HandleResult {
    pub response: Result<Value, ErrorInfo>,
    pub effect: Option<Effect>,
}

impl HandleResult {
    fn ok(value: Value) -> Self {
        Self { response: Ok(value), effect: None }
    }

    fn changed(value: Value, session: SessionInfo) -> Self {
        Self { response: Ok(value), effect: Some(Effect::SessionChanged(session)) }
    }

    fn failed(error: &Error) -> Self {
        let effect = error.is_graph_lost().then(|| Effect::GraphLost(error.to_string()));
        Self { response: Err(ErrorInfo::from(error)), effect }
    }
}

/// Handle an engine request.
///
/// Blocks on the backend; call it from a blocking context. `Probe`,
/// `Shutdown` and subscriptions belong to the main loop and the connection
/// tasks and are refused here.
pub fn handle_request<B: GraphBackend>(method: &Method, engine: &PatchBay<B>) -> HandleResult {
    match method {
        Method::List { props } => {
            let keys = match parse_list_props(props.as_ref()) {
                Ok(keys) => keys,
                Err(e) => return HandleResult::failed(&e),
            };

            match engine.list(keys.as_deref()) {
                Ok(entries) => HandleResult::ok(json!(entries)),
                Err(e) => HandleResult::failed(&e),
            }
        }

        Method::Link { filter } => {
            let filter = match parse_filter(filter) {
                Ok(filter) => filter,
                Err(e) => {
                    debug!(error = %e, "Rejected link request");
                    return HandleResult::failed(&e);
                }
            };

            match engine.link(&filter) {
                Ok(linked) => {
                    let session = engine.session();
                    info!(linked, links = session.links.len(), "Link request handled");
                    HandleResult::changed(Value::Bool(linked), session)
                }
                Err(e) => {
                    warn!(error = %e, "Link request failed");
                    HandleResult::failed(&e)
                }
            }
        }

        Method::Unlink => match engine.unlink() {
            Ok(()) => HandleResult::changed(Value::Bool(true), engine.session()),
            Err(e) => HandleResult::failed(&e),
        },

        Method::GetSession => HandleResult::ok(json!(engine.session())),

        Method::Probe | Method::Shutdown | Method::Subscribe { .. } | Method::Unsubscribe { .. } => {
            HandleResult::failed(&Error::InvalidArgument("not an engine request".into()))
        }
    }
}

/// Re-apply the active session's filter after the graph changed.
///
/// Blocks on the backend like [`handle_request`]. A refused link only drops
/// the new links, so it is logged and the session carries on.
pub fn refresh_session<B: GraphBackend>(engine: &PatchBay<B>) -> Option<Effect> {
    match engine.refresh() {
        Ok(0) => None,
        Ok(added) => {
            let session = engine.session();
            info!(added, links = session.links.len(), "Linked newly matching streams");
            Some(Effect::SessionChanged(session))
        }
        Err(e) if e.is_graph_lost() => Some(Effect::GraphLost(e.to_string())),
        Err(e) => {
            warn!(error = %e, "Could not extend link session");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use screenmic_core::EngineOptions;
    use screenmic_core::testing::{FakeGraph, Fault};

    use super::*;

    fn engine(graph: &FakeGraph) -> PatchBay<FakeGraph> {
        PatchBay::new(graph.clone(), EngineOptions::default())
    }

    #[test]
    fn test_list_with_default_projection() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);

        let result = handle_request(&Method::List { props: None }, &bay);
        let listed = result.response.expect("Failed to list");

        assert_eq!(listed.as_array().map(Vec::len), Some(2));
        assert_eq!(listed[0]["node.name"], "Firefox");
        assert!(result.effect.is_none());
    }

    #[test]
    fn test_list_rejects_non_array_props() {
        let bay = engine(&FakeGraph::with_browsers());

        let result = handle_request(&Method::List { props: Some(json!("node.name")) }, &bay);
        assert_matches!(result.response, Err(ErrorInfo { code: 400, .. }));
    }

    #[test]
    fn test_link_reports_session_change() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);

        let result = handle_request(&Method::Link { filter: json!("Firefox") }, &bay);

        assert_eq!(result.response.expect("Failed to link"), Value::Bool(true));
        assert_matches!(result.effect, Some(Effect::SessionChanged(SessionInfo { active: true, ref links, .. })) if links.len() == 2);
        assert_eq!(graph.active_links().len(), 2);
    }

    #[test]
    fn test_invalid_filter_touches_nothing() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);

        let result = handle_request(&Method::Link { filter: json!({"include": []}) }, &bay);

        assert_matches!(result.response, Err(ErrorInfo { code: 422, .. }));
        assert!(result.effect.is_none());
        assert_eq!(graph.calls(), 0);
    }

    #[test]
    fn test_unlink_clears_session() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);
        handle_request(&Method::Link { filter: json!("Chrome") }, &bay)
            .response
            .expect("Failed to link");

        let result = handle_request(&Method::Unlink, &bay);

        assert_eq!(result.effect, Some(Effect::SessionChanged(SessionInfo::default())));
        assert!(graph.active_links().is_empty());
        assert!(graph.capture_node().is_none());
    }

    #[test]
    fn test_connection_loss_is_reported() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);
        graph.inject(Fault::Disconnected);

        let result = handle_request(&Method::Link { filter: json!("Firefox") }, &bay);

        assert_matches!(result.response, Err(ErrorInfo { code: 502, .. }));
        assert_matches!(result.effect, Some(Effect::GraphLost(_)));
    }

    #[test]
    fn test_loop_methods_are_refused() {
        let bay = engine(&FakeGraph::with_browsers());

        let result = handle_request(&Method::Probe, &bay);
        assert_matches!(result.response, Err(ErrorInfo { code: 400, .. }));
    }

    #[test]
    fn test_refresh_picks_up_new_stream() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);
        handle_request(&Method::Link { filter: json!({"key": "application.name", "value": "Chrome"}) }, &bay)
            .response
            .expect("Failed to link");

        graph.add_stream(40, &[("node.name", "Chrome-tab"), ("application.name", "Chrome")], 1);

        let effect = refresh_session(&bay);
        // A mono stream fans out to both capture channels
        assert_matches!(effect, Some(Effect::SessionChanged(SessionInfo { ref links, .. })) if links.len() == 4);
        assert!(refresh_session(&bay).is_none());
    }

    #[test]
    fn test_refresh_reports_graph_loss() {
        let graph = FakeGraph::with_browsers();
        let bay = engine(&graph);
        handle_request(&Method::Link { filter: json!("Firefox") }, &bay)
            .response
            .expect("Failed to link");

        graph.inject(Fault::Disconnected);

        assert_matches!(refresh_session(&bay), Some(Effect::GraphLost(_)));
        assert!(!bay.session().active);
    }
}
