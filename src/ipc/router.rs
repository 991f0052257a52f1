use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::evaluator::try_handle,
    handlers::users::try_handle,
    handlers::teachers::try_handle,
    handlers::students::try_handle,
    handlers::courses::try_handle,
    handlers::attendance::try_handle,
    handlers::student_views::try_handle,
    handlers::justifications::try_handle,
    handlers::batches::try_handle,
    handlers::reports::try_handle,
    handlers::setup::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    log::debug!("dispatch {} (id={})", req.method, req.id);
    let resp = FAMILIES
        .iter()
        .find_map(|try_handle| try_handle(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = resp
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        log::warn!("{} failed: {}", req.method, code);
    }
    resp
}
