use crate::ipc::helpers::{
    exists, get_filter_str, get_optional_i64, get_optional_str, get_required_str, now_timestamp,
    with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ACADEMIC_STATUSES: [&str; 4] = ["active", "inactive", "graduated", "withdrawn"];
const MAX_PAGE: i64 = 500;

fn parse_academic_status(raw: &str) -> Result<String, HandlerErr> {
    let s = raw.trim().to_ascii_lowercase();
    if !ACADEMIC_STATUSES.contains(&s.as_str()) {
        return Err(HandlerErr::bad_params(
            "academicStatus must be one of: active, inactive, graduated, withdrawn",
        ));
    }
    Ok(s)
}

fn parse_semester(v: Option<i64>) -> Result<Option<i64>, HandlerErr> {
    match v {
        Some(n) if !(1..=12).contains(&n) => Err(HandlerErr::bad_params("semester must be in 1..=12")),
        other => Ok(other),
    }
}

const STUDENT_COLUMNS: &str = "s.id, s.student_code, s.first_name, s.last_name, s.email,
    s.career_id, c.name, s.semester, s.academic_status, s.created_at, s.updated_at";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "studentId": r.get::<_, String>(0)?,
        "studentCode": r.get::<_, String>(1)?,
        "firstName": r.get::<_, String>(2)?,
        "lastName": r.get::<_, String>(3)?,
        "email": r.get::<_, Option<String>>(4)?,
        "careerId": r.get::<_, Option<String>>(5)?,
        "careerName": r.get::<_, Option<String>>(6)?,
        "semester": r.get::<_, Option<i64>>(7)?,
        "academicStatus": r.get::<_, String>(8)?,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, Option<String>>(10)?
    }))
}

fn load_student(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM students s LEFT JOIN careers c ON c.id = s.career_id WHERE s.id = ?",
            STUDENT_COLUMNS
        ),
        [student_id],
        student_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("student"))
}

fn ensure_career(conn: &Connection, career_id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(id) = career_id {
        if !exists(conn, "SELECT 1 FROM careers WHERE id = ?", id)? {
            return Err(HandlerErr::not_found("career"));
        }
    }
    Ok(())
}

fn careers_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code FROM careers ORDER BY name")
        .map_err(HandlerErr::query)?;
    let careers = stmt
        .query_map([], |r| {
            Ok(json!({
                "careerId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "careers": careers }))
}

fn careers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_optional_str(params, "code")?;
    if exists(conn, "SELECT 1 FROM careers WHERE name = ?", &name)? {
        return Err(HandlerErr::new("conflict", "career already exists"));
    }
    let career_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO careers(id, name, code) VALUES(?, ?, ?)",
        (&career_id, &name, &code),
    )
    .map_err(|e| HandlerErr::insert(e, "careers"))?;
    Ok(json!({ "careerId": career_id, "name": name, "code": code }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let career_id = get_optional_str(params, "careerId")?;
    let semester = parse_semester(get_optional_i64(params, "semester")?)?;
    let status = get_filter_str(params, "status")?
        .map(|s| parse_academic_status(&s))
        .transpose()?;
    let skip = get_optional_i64(params, "skip")?.unwrap_or(0).max(0);
    let limit = get_optional_i64(params, "limit")?
        .unwrap_or(100)
        .clamp(1, MAX_PAGE);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM students s
             LEFT JOIN careers c ON c.id = s.career_id
             WHERE (?1 IS NULL OR s.career_id = ?1)
               AND (?2 IS NULL OR s.semester = ?2)
               AND (?3 IS NULL OR s.academic_status = ?3)
             ORDER BY s.last_name, s.first_name, s.student_code
             LIMIT ?4 OFFSET ?5",
            STUDENT_COLUMNS
        ))
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map((career_id, semester, status, limit, skip), student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students, "skip": skip, "limit": limit }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    load_student(conn, &student_id)
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_code = get_required_str(params, "studentCode")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let email = get_optional_str(params, "email")?;
    let career_id = get_optional_str(params, "careerId")?;
    let semester = parse_semester(get_optional_i64(params, "semester")?)?;
    let academic_status = match get_optional_str(params, "academicStatus")? {
        Some(s) => parse_academic_status(&s)?,
        None => "active".to_string(),
    };
    ensure_career(conn, career_id.as_deref())?;
    if exists(conn, "SELECT 1 FROM students WHERE student_code = ?", &student_code)? {
        return Err(HandlerErr::new("conflict", "studentCode already exists")
            .with_details(json!({ "studentCode": student_code })));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, student_code, first_name, last_name, email, career_id, semester, academic_status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &student_code,
            &first_name,
            &last_name,
            &email,
            &career_id,
            semester,
            &academic_status,
            now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "students"))?;
    load_student(conn, &student_id)
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::not_found("student"));
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
            "careerId" => {
                let career_id = get_optional_str(patch, k)?;
                ensure_career(conn, career_id.as_deref())?;
                sets.push("career_id = ?");
                values.push(career_id.map(Value::Text).unwrap_or(Value::Null));
            }
            "semester" => {
                sets.push("semester = ?");
                values.push(
                    parse_semester(get_optional_i64(patch, k)?)?
                        .map(Value::Integer)
                        .unwrap_or(Value::Null),
                );
            }
            "academicStatus" => {
                sets.push("academic_status = ?");
                values.push(Value::Text(parse_academic_status(&get_required_str(patch, k)?)?));
            }
            "studentId" | "studentCode" | "createdAt" | "updatedAt" => {
                return Err(HandlerErr::bad_params(format!("{} is not editable", k)));
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown student field: {}", k))),
        }
    }
    if !sets.is_empty() {
        sets.push("updated_at = ?");
        values.push(Value::Text(now_timestamp()));
        values.push(Value::Text(student_id.clone()));
        let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| HandlerErr::update(e, "students"))?;
    }
    load_student(conn, &student_id)
}

fn set_academic_status(
    conn: &Connection,
    params: &serde_json::Value,
    status: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let changed = conn
        .execute(
            "UPDATE students SET academic_status = ?, updated_at = ? WHERE id = ?",
            (status, now_timestamp(), &student_id),
        )
        .map_err(|e| HandlerErr::update(e, "students"))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student"));
    }
    load_student(conn, &student_id)
}

fn students_stats(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT academic_status, COUNT(*) FROM students GROUP BY academic_status")
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut out = json!({
        "total": 0,
        "active": 0,
        "inactive": 0,
        "graduated": 0,
        "withdrawn": 0
    });
    let mut total = 0;
    for (status, n) in rows {
        total += n;
        if ACADEMIC_STATUSES.contains(&status.as_str()) {
            out[status.as_str()] = json!(n);
        }
    }
    out["total"] = json!(total);
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "careers.list" => Some(with_db(state, req, careers_list)),
        "careers.create" => Some(with_db(state, req, careers_create)),
        "students.list" => Some(with_db(state, req, students_list)),
        "students.get" => Some(with_db(state, req, students_get)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.update" => Some(with_db(state, req, students_update)),
        "students.deactivate" => Some(with_db(state, req, |c, p| set_academic_status(c, p, "inactive"))),
        "students.restore" => Some(with_db(state, req, |c, p| set_academic_status(c, p, "active"))),
        "students.stats" => Some(with_db(state, req, students_stats)),
        _ => None,
    }
}
