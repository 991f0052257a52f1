use crate::ipc::helpers::{
    exists, get_optional_str, get_required_str, now_timestamp, parse_date, parse_time, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rollup::AttendanceMark;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct SessionRow {
    id: String,
    course_id: String,
    class_date: String,
    class_time: Option<String>,
    topic: Option<String>,
}

fn load_session(conn: &Connection, session_id: &str) -> Result<SessionRow, HandlerErr> {
    conn.query_row(
        "SELECT id, course_id, class_date, class_time, topic FROM class_sessions WHERE id = ?",
        [session_id],
        |r| {
            Ok(SessionRow {
                id: r.get(0)?,
                course_id: r.get(1)?,
                class_date: r.get(2)?,
                class_time: r.get(3)?,
                topic: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("session"))
}

fn parse_mark(raw: &str) -> Result<AttendanceMark, HandlerErr> {
    AttendanceMark::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("status must be one of: present, absent, late, justified")
            .with_details(json!({ "status": raw }))
    })
}

fn is_enrolled(conn: &Connection, student_id: &str, course_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?",
        (student_id, course_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

/// Cancels justifications that a corrected mark makes moot. A present or late
/// mark withdraws pending and approved requests. Going back to absent withdraws
/// an approval, so the absence can be justified again.
fn withdraw_justifications(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    mark: AttendanceMark,
) -> Result<usize, HandlerErr> {
    let statuses = match mark {
        AttendanceMark::Justified => return Ok(0),
        AttendanceMark::Absent => "('approved')",
        AttendanceMark::Present | AttendanceMark::Late => "('pending', 'approved')",
    };
    let sql = format!(
        "UPDATE justifications SET status = 'cancelled'
         WHERE attendance_id = (
             SELECT id FROM attendance_records WHERE session_id = ? AND student_id = ?
         )
           AND status IN {}",
        statuses
    );
    let n = conn
        .execute(&sql, (session_id, student_id))
        .map_err(|e| HandlerErr::update(e, "justifications"))?;
    if n > 0 {
        log::info!(
            "{} justification(s) withdrawn after mark change to {} (session {}, student {})",
            n,
            mark.as_str(),
            session_id,
            student_id
        );
    }
    Ok(n)
}

fn upsert_mark(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    mark: AttendanceMark,
    recorded_at: &str,
) -> Result<(), HandlerErr> {
    withdraw_justifications(conn, session_id, student_id, mark)?;
    conn.execute(
        "INSERT INTO attendance_records(id, session_id, student_id, status, recorded_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(session_id, student_id) DO UPDATE SET
           status = excluded.status,
           recorded_at = excluded.recorded_at",
        (
            Uuid::new_v4().to_string(),
            session_id,
            student_id,
            mark.as_str(),
            recorded_at,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "attendance_records"))?;
    Ok(())
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let class_date = get_required_str(params, "classDate")?;
    let Some(date) = parse_date(&class_date) else {
        return Err(HandlerErr::bad_params("classDate must be YYYY-MM-DD"));
    };
    let class_time = match get_optional_str(params, "classTime")? {
        None => None,
        Some(raw) => match parse_time(&raw) {
            Some(t) => Some(t.format("%H:%M").to_string()),
            None => return Err(HandlerErr::bad_params("classTime must be HH:MM")),
        },
    };
    let topic = get_optional_str(params, "topic")?;
    if !exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
        return Err(HandlerErr::not_found("course"));
    }

    let session_id = Uuid::new_v4().to_string();
    let class_date = date.format("%Y-%m-%d").to_string();
    conn.execute(
        "INSERT INTO class_sessions(id, course_id, class_date, class_time, topic, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &course_id,
            &class_date,
            &class_time,
            &topic,
            now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "class_sessions"))?;
    Ok(json!({
        "sessionId": session_id,
        "courseId": course_id,
        "classDate": class_date,
        "classTime": class_time,
        "topic": topic
    }))
}

fn sessions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    if !exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
        return Err(HandlerErr::not_found("course"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT cs.id, cs.class_date, cs.class_time, cs.topic,
                    (SELECT COUNT(*) FROM attendance_records ar WHERE ar.session_id = cs.id)
             FROM class_sessions cs
             WHERE cs.course_id = ?
             ORDER BY cs.class_date, cs.class_time",
        )
        .map_err(HandlerErr::query)?;
    let sessions = stmt
        .query_map([&course_id], |r| {
            Ok(json!({
                "sessionId": r.get::<_, String>(0)?,
                "classDate": r.get::<_, String>(1)?,
                "classTime": r.get::<_, Option<String>>(2)?,
                "topic": r.get::<_, Option<String>>(3)?,
                "markedCount": r.get::<_, i64>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "courseId": course_id, "sessions": sessions }))
}

fn session_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let session = load_session(conn, &session_id)?;

    let mut marks: HashMap<String, (String, String)> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT student_id, id, status FROM attendance_records WHERE session_id = ?")
            .map_err(HandlerErr::query)?;
        let rows = stmt
            .query_map([&session.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        for (student_id, record_id, status) in rows {
            marks.insert(student_id, (record_id, status));
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.student_code, s.last_name, s.first_name
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.course_id = ?
             ORDER BY s.last_name, s.first_name, s.student_code",
        )
        .map_err(HandlerErr::query)?;
    let roster = stmt
        .query_map([&session.course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let rows: Vec<serde_json::Value> = roster
        .into_iter()
        .map(|(id, code, last, first)| {
            let mark = marks.get(&id);
            json!({
                "studentId": id,
                "studentCode": code,
                "displayName": format!("{}, {}", last, first),
                "attendanceId": mark.map(|m| m.0.clone()),
                "status": mark.map(|m| m.1.clone())
            })
        })
        .collect();

    Ok(json!({
        "session": {
            "sessionId": session.id,
            "courseId": session.course_id,
            "classDate": session.class_date,
            "classTime": session.class_time,
            "topic": session.topic
        },
        "students": rows
    }))
}

fn attendance_take(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let Some(raw_marks) = params.get("marks").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing marks"));
    };
    let session = load_session(conn, &session_id)?;

    let mut marks: Vec<(String, AttendanceMark)> = Vec::with_capacity(raw_marks.len());
    for m in raw_marks {
        let student_id = get_required_str(m, "studentId")?;
        let mark = parse_mark(&get_required_str(m, "status")?)?;
        if marks.iter().any(|(sid, _)| *sid == student_id) {
            return Err(HandlerErr::bad_params("duplicate studentId in marks")
                .with_details(json!({ "studentId": student_id })));
        }
        if !is_enrolled(conn, &student_id, &session.course_id)? {
            return Err(HandlerErr::new("bad_state", "student is not enrolled in the course")
                .with_details(json!({ "studentId": student_id, "courseId": session.course_id })));
        }
        marks.push((student_id, mark));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let recorded_at = now_timestamp();
    for (student_id, mark) in &marks {
        upsert_mark(&tx, &session.id, student_id, *mark, &recorded_at)?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    log::debug!("session {}: {} marks recorded", session.id, marks.len());
    Ok(json!({ "sessionId": session.id, "recorded": marks.len() }))
}

fn attendance_set_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = match params.get("status") {
        None => return Err(HandlerErr::bad_params("missing status")),
        Some(serde_json::Value::Null) => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params("status must be string or null"));
            };
            Some(parse_mark(s)?)
        }
    };
    let session = load_session(conn, &session_id)?;
    if !is_enrolled(conn, &student_id, &session.course_id)? {
        return Err(HandlerErr::new("bad_state", "student is not enrolled in the course")
            .with_details(json!({ "studentId": student_id, "courseId": session.course_id })));
    }

    match status {
        Some(mark) => {
            let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
            upsert_mark(&tx, &session.id, &student_id, mark, &now_timestamp())?;
            tx.commit().map_err(HandlerErr::commit)?;
        }
        None => {
            let referenced: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM justifications j
                     JOIN attendance_records ar ON ar.id = j.attendance_id
                     WHERE ar.session_id = ? AND ar.student_id = ?",
                    (&session.id, &student_id),
                    |r| r.get(0),
                )
                .map_err(HandlerErr::query)?;
            if referenced > 0 {
                return Err(HandlerErr::new(
                    "conflict",
                    "mark has justifications and cannot be cleared",
                ));
            }
            conn.execute(
                "DELETE FROM attendance_records WHERE session_id = ? AND student_id = ?",
                (&session.id, &student_id),
            )
            .map_err(|e| HandlerErr::delete(e, "attendance_records"))?;
        }
    }
    Ok(json!({
        "sessionId": session.id,
        "studentId": student_id,
        "status": status.map(|m| m.as_str())
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(with_db(state, req, sessions_create)),
        "sessions.list" => Some(with_db(state, req, sessions_list)),
        "attendance.sessionOpen" => Some(with_db(state, req, session_open)),
        "attendance.take" => Some(with_db(state, req, attendance_take)),
        "attendance.setMark" => Some(with_db(state, req, attendance_set_mark)),
        _ => None,
    }
}
