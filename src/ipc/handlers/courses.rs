use crate::ipc::helpers::{
    exists, get_optional_i64, get_optional_str, get_required_str, get_string_array,
    now_timestamp, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, CourseInfo};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn course_json(conn: &Connection, course: &CourseInfo) -> Result<serde_json::Value, HandlerErr> {
    let (student_count, session_count): (i64, i64) = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = ?1),
               (SELECT COUNT(*) FROM class_sessions cs WHERE cs.course_id = ?1)",
            [&course.course_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::query)?;
    let mut v = serde_json::to_value(course).map_err(HandlerErr::query)?;
    v["studentCount"] = json!(student_count);
    v["sessionCount"] = json!(session_count);
    Ok(v)
}

fn courses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let period = get_required_str(params, "period")?;
    let credits = get_optional_i64(params, "credits")?.unwrap_or(0);
    if credits < 0 {
        return Err(HandlerErr::bad_params("credits must be >= 0"));
    }
    let teacher_id = get_optional_str(params, "teacherId")?;
    let room = get_optional_str(params, "room")?;
    let schedule = get_optional_str(params, "schedule")?;

    if let Some(tid) = teacher_id.as_deref() {
        if !exists(conn, "SELECT 1 FROM teachers WHERE id = ?", tid)? {
            return Err(HandlerErr::not_found("teacher"));
        }
    }
    let duplicate = conn
        .query_row(
            "SELECT COUNT(*) FROM courses WHERE code = ? AND period = ?",
            (&code, &period),
            |r| r.get::<_, i64>(0),
        )
        .map_err(HandlerErr::query)?;
    if duplicate > 0 {
        return Err(HandlerErr::new("conflict", "course code already exists in period")
            .with_details(json!({ "code": code, "period": period })));
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, code, name, period, credits, teacher_id, room, schedule)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &code,
            &name,
            &period,
            credits,
            &teacher_id,
            &room,
            &schedule,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "courses"))?;

    let course = rollup::load_course(conn, &course_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("course"))?;
    course_json(conn, &course)
}

fn courses_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = get_optional_str(params, "period")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id FROM courses
             WHERE (?1 IS NULL OR period = ?1) AND (?2 IS NULL OR teacher_id = ?2)
             ORDER BY period, code",
        )
        .map_err(HandlerErr::query)?;
    let ids = stmt
        .query_map((period, teacher_id), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut courses = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(course) = rollup::load_course(conn, &id).map_err(HandlerErr::query)? {
            courses.push(course_json(conn, &course)?);
        }
    }
    Ok(json!({ "courses": courses }))
}

fn enrollments_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_ids = get_string_array(params, "studentIds")?;
    if !exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id)? {
        return Err(HandlerErr::not_found("course"));
    }
    for sid in &student_ids {
        if !exists(conn, "SELECT 1 FROM students WHERE id = ?", sid)? {
            return Err(HandlerErr::not_found("student")
                .with_details(json!({ "studentId": sid })));
        }
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let mut added = 0usize;
    {
        let mut stmt = tx
            .prepare(
                "INSERT OR IGNORE INTO enrollments(student_id, course_id, enrolled_at)
                 VALUES(?, ?, ?)",
            )
            .map_err(HandlerErr::query)?;
        let ts = now_timestamp();
        for sid in &student_ids {
            added += stmt
                .execute((sid, &course_id, &ts))
                .map_err(|e| HandlerErr::insert(e, "enrollments"))?;
        }
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "courseId": course_id,
        "added": added,
        "alreadyEnrolled": student_ids.len() - added
    }))
}

fn students_enrolled_courses(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let period = get_required_str(params, "period")?;
    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::not_found("student"));
    }
    let courses = rollup::enrolled_courses(conn, &student_id, &period).map_err(HandlerErr::query)?;
    Ok(json!({ "studentId": student_id, "period": period, "courses": courses }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(with_db(state, req, courses_create)),
        "courses.list" => Some(with_db(state, req, courses_list)),
        "enrollments.set" => Some(with_db(state, req, enrollments_set)),
        "students.enrolledCourses" => Some(with_db(state, req, students_enrolled_courses)),
        _ => None,
    }
}
