use crate::ipc::helpers::{
    exists, get_filter_str, get_required_str, now_timestamp, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

const ROLES: [&str; 3] = ["admin", "teacher", "student"];
const STATUSES: [&str; 2] = ["active", "inactive"];

fn parse_role(raw: &str) -> Result<String, HandlerErr> {
    let r = raw.trim().to_ascii_lowercase();
    if !ROLES.contains(&r.as_str()) {
        return Err(HandlerErr::bad_params(
            "role must be one of: admin, teacher, student",
        ));
    }
    Ok(r)
}

fn parse_status(raw: &str) -> Result<String, HandlerErr> {
    let s = raw.trim().to_ascii_lowercase();
    if !STATUSES.contains(&s.as_str()) {
        return Err(HandlerErr::bad_params("status must be one of: active, inactive"));
    }
    Ok(s)
}

fn validate_email(email: &str) -> Result<(), HandlerErr> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(HandlerErr::bad_params("email is not valid")),
    }
}

fn user_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "userId": r.get::<_, String>(0)?,
        "username": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "fullName": r.get::<_, String>(3)?,
        "role": r.get::<_, String>(4)?,
        "status": r.get::<_, String>(5)?,
        "createdAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, Option<String>>(7)?
    }))
}

const USER_COLUMNS: &str =
    "id, username, email, full_name, role, status, created_at, updated_at";

fn load_user(conn: &Connection, user_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        [user_id],
        user_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("user"))
}

fn roles_list() -> serde_json::Value {
    let roles: Vec<serde_json::Value> = ROLES
        .iter()
        .map(|r| {
            let label = match *r {
                "admin" => "Administrador",
                "teacher" => "Docente",
                _ => "Estudiante",
            };
            json!({ "role": r, "label": label })
        })
        .collect();
    json!({ "roles": roles })
}

fn users_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = get_filter_str(params, "role")?
        .map(|r| parse_role(&r))
        .transpose()?;
    let status = get_filter_str(params, "status")?
        .map(|s| parse_status(&s))
        .transpose()?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM users
             WHERE (?1 IS NULL OR role = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY full_name, username",
            USER_COLUMNS
        ))
        .map_err(HandlerErr::query)?;
    let users = stmt
        .query_map((role, status), user_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "users": users }))
}

fn users_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    load_user(conn, &user_id)
}

fn users_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let email = get_required_str(params, "email")?;
    let full_name = get_required_str(params, "fullName")?;
    let role = parse_role(&get_required_str(params, "role")?)?;
    validate_email(&email)?;

    if exists(conn, "SELECT 1 FROM users WHERE username = ?", &username)? {
        return Err(HandlerErr::new("conflict", "username already exists")
            .with_details(json!({ "username": username })));
    }

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, email, full_name, role, status, created_at)
         VALUES(?, ?, ?, ?, ?, 'active', ?)",
        (&user_id, &username, &email, &full_name, &role, now_timestamp()),
    )
    .map_err(|e| HandlerErr::insert(e, "users"))?;
    log::info!("user created: {} ({})", username, role);
    load_user(conn, &user_id)
}

fn users_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let Some(patch_value) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if !exists(conn, "SELECT 1 FROM users WHERE id = ?", &user_id)? {
        return Err(HandlerErr::not_found("user"));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<String> = Vec::new();
    for k in patch_value.as_object().into_iter().flat_map(|o| o.keys()) {
        let v = get_required_str(patch_value, k)?;
        match k.as_str() {
            "email" => {
                validate_email(&v)?;
                sets.push("email = ?");
                values.push(v);
            }
            "fullName" => {
                sets.push("full_name = ?");
                values.push(v);
            }
            "role" => {
                sets.push("role = ?");
                values.push(parse_role(&v)?);
            }
            "status" => {
                sets.push("status = ?");
                values.push(parse_status(&v)?);
            }
            "userId" | "username" | "createdAt" => {
                return Err(HandlerErr::bad_params(format!("{} is not editable", k)));
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown user field: {}", k))),
        }
    }
    if sets.is_empty() {
        return load_user(conn, &user_id);
    }
    sets.push("updated_at = ?");
    values.push(now_timestamp());
    values.push(user_id.clone());

    let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
        .map_err(|e| HandlerErr::update(e, "users"))?;
    load_user(conn, &user_id)
}

fn set_user_status(conn: &Connection, params: &serde_json::Value, status: &str) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let changed = conn
        .execute(
            "UPDATE users SET status = ?, updated_at = ? WHERE id = ?",
            (status, now_timestamp(), &user_id),
        )
        .map_err(|e| HandlerErr::update(e, "users"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("user"));
    }
    load_user(conn, &user_id)
}

fn users_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let changed = conn
        .execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| HandlerErr::delete(e, "users"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("user"));
    }
    log::info!("user deleted: {}", user_id);
    Ok(json!({ "ok": true }))
}

fn users_stats(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT role, status, COUNT(*) FROM users GROUP BY role, status")
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut by_role: BTreeMap<String, i64> = ROLES.iter().map(|r| (r.to_string(), 0)).collect();
    let mut by_status: BTreeMap<String, i64> =
        STATUSES.iter().map(|s| (s.to_string(), 0)).collect();
    let mut total = 0;
    for (role, status, n) in rows {
        *by_role.entry(role).or_insert(0) += n;
        *by_status.entry(status).or_insert(0) += n;
        total += n;
    }
    Ok(json!({
        "totalUsers": total,
        "byStatus": by_status,
        "byRole": by_role
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roles.list" => Some(crate::ipc::error::ok(&req.id, roles_list())),
        "users.list" => Some(with_db(state, req, users_list)),
        "users.get" => Some(with_db(state, req, users_get)),
        "users.create" => Some(with_db(state, req, users_create)),
        "users.update" => Some(with_db(state, req, users_update)),
        "users.deactivate" => Some(with_db(state, req, |c, p| set_user_status(c, p, "inactive"))),
        "users.restore" => Some(with_db(state, req, |c, p| set_user_status(c, p, "active"))),
        "users.delete" => Some(with_db(state, req, users_delete)),
        "users.stats" => Some(with_db(state, req, users_stats)),
        _ => None,
    }
}
