use crate::config::{self, SetupSection};
use crate::ipc::helpers::{get_required_str, with_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn setup_get(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut out = serde_json::Map::new();
    for section in SetupSection::ALL {
        let v = config::load_section(conn, section).map_err(HandlerErr::query)?;
        out.insert(section.name().to_string(), v);
    }
    Ok(serde_json::Value::Object(out))
}

fn setup_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let section_raw = get_required_str(params, "section")?;
    let Some(section) = SetupSection::parse(&section_raw) else {
        return Err(HandlerErr::bad_params("unknown section")
            .with_details(json!({ "section": section_raw })));
    };
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    match config::update_section(conn, section, patch) {
        Ok(Ok(updated)) => {
            log::info!("setup section {} updated", section.name());
            Ok(json!({ "ok": true, "section": section.name(), "value": updated }))
        }
        Ok(Err(msg)) => Err(HandlerErr::bad_params(msg)),
        Err(e) => Err(HandlerErr::new("db_update_failed", e.to_string())),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(with_db(state, req, setup_get)),
        "setup.update" => Some(with_db(state, req, setup_update)),
        _ => None,
    }
}
