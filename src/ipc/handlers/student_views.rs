use crate::calc::{self, AttendanceStatus, StatusCounts};
use crate::config::ReportPolicy;
use crate::ipc::helpers::{
    aggregate_json, evaluation_json, format_timestamp, get_optional_i64, get_optional_str,
    get_period_or_default, get_required_str, justification_deadline, load_attendance_policy,
    load_report_policy, now, parse_date, percent, require_student, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, CourseRollup};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const RECENT_MARKS: i64 = 5;

fn rollups_for(conn: &Connection, student_id: &str, period: &str) -> Result<Vec<CourseRollup>, HandlerErr> {
    rollup::student_course_rollups(conn, student_id, period)
        .map_err(|e| HandlerErr::query(format!("{:#}", e)))
}

fn course_card(policy: &ReportPolicy, r: &CourseRollup) -> serde_json::Value {
    json!({
        "courseId": r.course.course_id,
        "code": r.course.code,
        "name": r.course.name,
        "credits": r.course.credits,
        "teacherName": r.course.teacher_name,
        "attendance": evaluation_json(policy, &r.counters, &r.evaluation)
    })
}

fn summary_json(policy: &ReportPolicy, rollups: &[CourseRollup]) -> Result<serde_json::Value, HandlerErr> {
    let overall = rollup::combine(rollups).map_err(|e| HandlerErr::query(format!("{:#}", e)))?;
    let total_classes =
        calc::checked_sum("totalClasses", rollups.iter().map(|r| r.counters.total_classes))?;
    let mut counts = StatusCounts::default();
    for r in rollups {
        counts.record(r.evaluation.status);
    }
    let alert_message = match (counts.critico, counts.alerta) {
        (0, 0) => None,
        (0, n) => Some(format!(
            "Tienes {} curso(s) en estado de alerta. Mantente atento a tu asistencia.",
            n
        )),
        (n, _) => Some(format!(
            "Tienes {} curso(s) en estado crítico. Revisa tus asistencias para evitar la desaprobación.",
            n
        )),
    };
    Ok(json!({
        "totalCourses": rollups.len(),
        "generalAttendance": aggregate_json(policy, total_classes, &overall),
        "overallStatus": overall.status,
        "overallStatusLabel": overall.status.label(),
        "statusCounts": counts,
        "isCriticalAlert": counts.critico > 0,
        "alertMessage": alert_message
    }))
}

fn recent_marks(conn: &Connection, student_id: &str, period: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.code, cs.class_date, ar.status
             FROM attendance_records ar
             JOIN class_sessions cs ON cs.id = ar.session_id
             JOIN courses c ON c.id = cs.course_id
             WHERE ar.student_id = ? AND c.period = ?
             ORDER BY cs.class_date DESC, cs.class_time DESC
             LIMIT ?",
        )
        .map_err(HandlerErr::query)?;
    let marks = stmt
        .query_map((student_id, period, RECENT_MARKS), |r| {
            Ok(json!({
                "courseCode": r.get::<_, String>(0)?,
                "classDate": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(marks)
}

fn pending_justifications(conn: &Connection, student_id: &str, period: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT j.id, c.code, cs.class_date, j.reason, j.batch_id
             FROM justifications j
             JOIN attendance_records ar ON ar.id = j.attendance_id
             JOIN class_sessions cs ON cs.id = ar.session_id
             JOIN courses c ON c.id = cs.course_id
             WHERE j.student_id = ? AND c.period = ? AND j.status = 'pending'
             ORDER BY cs.class_date DESC",
        )
        .map_err(HandlerErr::query)?;
    let pending = stmt
        .query_map((student_id, period), |r| {
            Ok(json!({
                "justificationId": r.get::<_, String>(0)?,
                "courseCode": r.get::<_, String>(1)?,
                "classDate": r.get::<_, String>(2)?,
                "reason": r.get::<_, String>(3)?,
                "batchId": r.get::<_, Option<String>>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(pending)
}

fn student_dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = require_student(conn, &student_id)?;
    let period = get_period_or_default(conn, params)?;
    let policy = load_report_policy(conn)?;
    let rollups = rollups_for(conn, &student_id, &period)?;

    let courses: Vec<serde_json::Value> = rollups.iter().map(|r| course_card(&policy, r)).collect();
    Ok(json!({
        "student": student,
        "period": period,
        "courses": courses,
        "summary": summary_json(&policy, &rollups)?,
        "recentAttendance": recent_marks(conn, &student_id, &period)?,
        "pendingJustifications": pending_justifications(conn, &student_id, &period)?
    }))
}

fn next_class(conn: &Connection, course_id: &str, from_date: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT class_date, class_time, topic FROM class_sessions
         WHERE course_id = ? AND class_date >= ?
         ORDER BY class_date, class_time
         LIMIT 1",
        (course_id, from_date),
        |r| {
            Ok(json!({
                "classDate": r.get::<_, String>(0)?,
                "classTime": r.get::<_, Option<String>>(1)?,
                "topic": r.get::<_, Option<String>>(2)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn student_courses_dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = require_student(conn, &student_id)?;
    let period = get_period_or_default(conn, params)?;
    let as_of = match get_optional_str(params, "asOf")? {
        None => now().date(),
        Some(raw) => parse_date(&raw).ok_or_else(|| HandlerErr::bad_params("asOf must be YYYY-MM-DD"))?,
    };
    let as_of = as_of.format("%Y-%m-%d").to_string();
    let policy = load_report_policy(conn)?;
    let rollups = rollups_for(conn, &student_id, &period)?;

    let mut cards = Vec::with_capacity(rollups.len());
    for r in &rollups {
        let mut card = course_card(&policy, r);
        card["teacherId"] = json!(r.course.teacher_id);
        card["room"] = json!(r.course.room);
        card["schedule"] = json!(r.course.schedule);
        card["nextClass"] = json!(next_class(conn, &r.course.course_id, &as_of)?);
        cards.push(card);
    }

    let overall = rollup::combine(&rollups).map_err(|e| HandlerErr::query(format!("{:#}", e)))?;
    let critical = rollups
        .iter()
        .filter(|r| r.evaluation.status == AttendanceStatus::Critico)
        .count();
    Ok(json!({
        "student": student,
        "period": period,
        "asOf": as_of,
        "metrics": {
            "totalCourses": rollups.len(),
            "totalCredits": rollups.iter().map(|r| r.course.credits).sum::<i64>(),
            "averageAttendance": percent(&policy, overall.percentage),
            "averageStatus": overall.status,
            "criticalCourses": critical
        },
        "courses": cards
    }))
}

fn alert_item(policy: &ReportPolicy, r: &CourseRollup) -> serde_json::Value {
    json!({
        "courseId": r.course.course_id,
        "code": r.course.code,
        "name": r.course.name,
        "message": r.evaluation.status.alert_message(),
        "absencePercentage": percent(policy, r.evaluation.absence_percentage()),
        "percentage": percent(policy, r.evaluation.percentage),
        "totalClasses": r.counters.total_classes,
        "absent": r.counters.absent,
        "present": r.counters.present,
        "late": r.counters.late,
        "justified": r.counters.justified,
        "effectiveAttendance": r.evaluation.effective_attendance,
        "status": r.evaluation.status,
        "statusLabel": r.evaluation.status.label()
    })
}

fn student_alerts(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = require_student(conn, &student_id)?;
    let period = get_period_or_default(conn, params)?;
    let policy = load_report_policy(conn)?;
    let rollups = rollups_for(conn, &student_id, &period)?;

    let critical: Vec<serde_json::Value> = rollups
        .iter()
        .filter(|r| r.evaluation.status == AttendanceStatus::Critico)
        .map(|r| alert_item(&policy, r))
        .collect();
    let warning: Vec<serde_json::Value> = rollups
        .iter()
        .filter(|r| r.evaluation.status == AttendanceStatus::Alerta)
        .map(|r| alert_item(&policy, r))
        .collect();
    let optimal = rollups
        .iter()
        .filter(|r| r.evaluation.status == AttendanceStatus::Optimo)
        .count();

    Ok(json!({
        "student": student,
        "period": period,
        "metrics": {
            "critical": critical.len(),
            "warning": warning.len(),
            "optimal": optimal,
            "notifications": critical.len() + warning.len()
        },
        "criticalAlerts": critical,
        "warningAlerts": warning,
        "generatedAt": format_timestamp(now())
    }))
}

fn student_attendance_history(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let period = get_period_or_default(conn, params)?;
    let year = match get_optional_i64(params, "year")? {
        None => None,
        Some(y) => Some(
            i32::try_from(y).map_err(|_| HandlerErr::bad_params("year is out of range"))?,
        ),
    };
    let policy = load_report_policy(conn)?;
    let months = rollup::monthly_history(conn, &student_id, &period, year)
        .map_err(|e| HandlerErr::query(format!("{:#}", e)))?;

    let out: Vec<serde_json::Value> = months
        .iter()
        .map(|m| {
            let courses: Vec<serde_json::Value> = m
                .courses
                .iter()
                .map(|r| {
                    json!({
                        "courseId": r.course.course_id,
                        "code": r.course.code,
                        "name": r.course.name,
                        "attendance": evaluation_json(&policy, &r.counters, &r.evaluation)
                    })
                })
                .collect();
            json!({
                "month": m.key(),
                "year": m.year,
                "monthNumber": m.month_number,
                "monthName": rollup::month_name(m.month_number),
                "totals": m.total,
                "summary": aggregate_json(&policy, m.total.total_classes, &m.evaluation),
                "courses": courses
            })
        })
        .collect();
    Ok(json!({ "studentId": student_id, "period": period, "months": out }))
}

fn student_unjustified_absences(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let period = get_optional_str(params, "period")?;
    let policy = load_attendance_policy(conn)?;

    let mut stmt = conn
        .prepare(
            "SELECT ar.id, cs.id, c.id, c.code, c.name, cs.class_date, cs.class_time
             FROM attendance_records ar
             JOIN class_sessions cs ON cs.id = ar.session_id
             JOIN courses c ON c.id = cs.course_id
             WHERE ar.student_id = ?1
               AND ar.status = 'absent'
               AND (?2 IS NULL OR c.period = ?2)
               AND NOT EXISTS (
                 SELECT 1 FROM justifications j
                 WHERE j.attendance_id = ar.id AND j.status IN ('pending', 'approved')
               )
             ORDER BY cs.class_date DESC, c.code",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((&student_id, &period), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let current = now();
    let mut absences = Vec::with_capacity(rows.len());
    for (attendance_id, session_id, course_id, code, name, class_date, class_time) in rows {
        let deadline = justification_deadline(&policy, &class_date, class_time.as_deref())?;
        absences.push(json!({
            "attendanceId": attendance_id,
            "sessionId": session_id,
            "courseId": course_id,
            "courseCode": code,
            "courseName": name,
            "classDate": class_date,
            "classTime": class_time,
            "deadline": format_timestamp(deadline),
            "withinDeadline": current <= deadline
        }));
    }
    Ok(json!({ "studentId": student_id, "absences": absences }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "student.dashboard" => Some(with_db(state, req, student_dashboard)),
        "student.coursesDashboard" => Some(with_db(state, req, student_courses_dashboard)),
        "student.alerts" => Some(with_db(state, req, student_alerts)),
        "student.attendanceHistory" => Some(with_db(state, req, student_attendance_history)),
        "student.unjustifiedAbsences" => Some(with_db(state, req, student_unjustified_absences)),
        _ => None,
    }
}
