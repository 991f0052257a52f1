use crate::ipc::helpers::{
    exists, get_filter_str, get_optional_str, get_required_str, now_timestamp, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const TEACHER_COLUMNS: &str =
    "id, teacher_code, first_name, last_name, email, specialty, status, created_at, updated_at";

fn teacher_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "teacherId": r.get::<_, String>(0)?,
        "teacherCode": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "lastName": r.get::<_, String>(3)?,
        "email": r.get::<_, Option<String>>(4)?,
        "specialty": r.get::<_, Option<String>>(5)?,
        "status": r.get::<_, String>(6)?,
        "createdAt": r.get::<_, String>(7)?,
        "updatedAt": r.get::<_, Option<String>>(8)?
    }))
}

fn load_teacher(conn: &Connection, teacher_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM teachers WHERE id = ?", TEACHER_COLUMNS),
        [teacher_id],
        teacher_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("teacher"))
}

fn parse_status(raw: &str) -> Result<String, HandlerErr> {
    match raw {
        "active" | "inactive" => Ok(raw.to_string()),
        _ => Err(HandlerErr::bad_params("status must be one of: active, inactive")),
    }
}

fn teachers_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = get_filter_str(params, "status")?
        .map(|s| parse_status(&s))
        .transpose()?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM teachers
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY last_name, first_name",
            TEACHER_COLUMNS
        ))
        .map_err(HandlerErr::query)?;
    let teachers = stmt
        .query_map([status], teacher_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    load_teacher(conn, &teacher_id)
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_code = get_required_str(params, "teacherCode")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let email = get_optional_str(params, "email")?;
    let specialty = get_optional_str(params, "specialty")?;

    if exists(conn, "SELECT 1 FROM teachers WHERE teacher_code = ?", &teacher_code)? {
        return Err(HandlerErr::new("conflict", "teacherCode already exists")
            .with_details(json!({ "teacherCode": teacher_code })));
    }
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, teacher_code, first_name, last_name, email, specialty, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 'active', ?)",
        (
            &teacher_id,
            &teacher_code,
            &first_name,
            &last_name,
            &email,
            &specialty,
            now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "teachers"))?;
    load_teacher(conn, &teacher_id)
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if !exists(conn, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("teacher"));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for k in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match k.as_str() {
            "firstName" => {
                sets.push("first_name = ?");
                values.push(Value::Text(get_required_str(patch, k)?));
            }
            "lastName" => {
                sets.push("last_name = ?");
                values.push(Value::Text(get_required_str(patch, k)?));
            }
            "email" => {
                sets.push("email = ?");
                values.push(get_optional_str(patch, k)?.map(Value::Text).unwrap_or(Value::Null));
            }
            "specialty" => {
                sets.push("specialty = ?");
                values.push(get_optional_str(patch, k)?.map(Value::Text).unwrap_or(Value::Null));
            }
            "status" => {
                sets.push("status = ?");
                values.push(Value::Text(parse_status(&get_required_str(patch, k)?)?));
            }
            // Identity fields are fixed after creation; clients echo them back.
            "teacherId" | "teacherCode" | "createdAt" | "updatedAt" => {}
            _ => return Err(HandlerErr::bad_params(format!("unknown teacher field: {}", k))),
        }
    }
    if !sets.is_empty() {
        sets.push("updated_at = ?");
        values.push(Value::Text(now_timestamp()));
        values.push(Value::Text(teacher_id.clone()));
        let sql = format!("UPDATE teachers SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| HandlerErr::update(e, "teachers"))?;
    }
    load_teacher(conn, &teacher_id)
}

fn set_teacher_status(
    conn: &Connection,
    params: &serde_json::Value,
    status: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let changed = conn
        .execute(
            "UPDATE teachers SET status = ?, updated_at = ? WHERE id = ?",
            (status, now_timestamp(), &teacher_id),
        )
        .map_err(|e| HandlerErr::update(e, "teachers"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("teacher"));
    }
    load_teacher(conn, &teacher_id)
}

fn teachers_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    if !exists(conn, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("teacher"));
    }
    let course_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM courses WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if course_count > 0 {
        return Err(
            HandlerErr::new("conflict", "teacher is assigned to courses; deactivate instead")
                .with_details(json!({ "courseCount": course_count })),
        );
    }
    conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::delete(e, "teachers"))?;
    Ok(json!({ "ok": true }))
}

fn teachers_status_counts(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (total, active, inactive): (i64, i64, i64) = conn
        .query_row(
            "SELECT
               COUNT(*),
               COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'inactive' THEN 1 ELSE 0 END), 0)
             FROM teachers",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(HandlerErr::query)?;
    Ok(json!({ "total": total, "active": active, "inactive": inactive }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(with_db(state, req, teachers_list)),
        "teachers.get" => Some(with_db(state, req, teachers_get)),
        "teachers.create" => Some(with_db(state, req, teachers_create)),
        "teachers.update" => Some(with_db(state, req, teachers_update)),
        "teachers.deactivate" => Some(with_db(state, req, |c, p| set_teacher_status(c, p, "inactive"))),
        "teachers.restore" => Some(with_db(state, req, |c, p| set_teacher_status(c, p, "active"))),
        "teachers.delete" => Some(with_db(state, req, teachers_delete)),
        "teachers.statusCounts" => Some(with_db(state, req, teachers_status_counts)),
        _ => None,
    }
}
