use crate::calc::{self, AttendanceEvaluation, CourseAttendanceCounters};
use crate::config::{AttendancePolicy, ReportPolicy};
use crate::ipc::error::ok;
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, StudentInfo};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub use crate::ipc::error::HandlerErr;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Runs `f` against the open workspace database and wraps the outcome in the
/// response envelope.
pub fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return HandlerErr::no_workspace().response(&req.id);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

/// Absent, null and blank strings all read as `None`.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", key)))?;
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_string_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(raw) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for v in raw {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params(format!(
                "{} must contain only strings",
                key
            )));
        };
        let t = s.trim();
        if t.is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "{} must not contain empty ids",
                key
            )));
        }
        if !out.iter().any(|x| x == t) {
            out.push(t.to_string());
        }
    }
    Ok(out)
}

/// Filter value where absent, blank or `Todos` (the UI's "all" option) means no filter.
pub fn get_filter_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    Ok(get_optional_str(params, key)?
        .filter(|s| !s.eq_ignore_ascii_case("todos") && !s.eq_ignore_ascii_case("all"))
        .map(|s| s.to_ascii_lowercase()))
}

pub fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

pub fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(now())
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let t = raw.trim();
    NaiveDateTime::parse_from_str(t, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M"))
        .ok()
        .or_else(|| chrono::DateTime::parse_from_rfc3339(t).ok().map(|d| d.naive_utc()))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .ok()
}

/// Start of a class; sessions without a time start at midnight.
pub fn class_start(class_date: &str, class_time: Option<&str>) -> Option<NaiveDateTime> {
    let date = parse_date(class_date)?;
    match class_time.and_then(parse_time) {
        Some(t) => Some(date.and_time(t)),
        None => date.and_hms_opt(0, 0, 0),
    }
}

/// Optional timestamp param; absent means now.
pub fn get_timestamp_or_now(params: &serde_json::Value, key: &str) -> Result<NaiveDateTime, HandlerErr> {
    match get_optional_str(params, key)? {
        None => Ok(now()),
        Some(raw) => parse_timestamp(&raw)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be YYYY-MM-DDTHH:MM:SS", key))),
    }
}

pub fn percent(policy: &ReportPolicy, x: f64) -> f64 {
    calc::round_to(x, policy.percentage_decimals)
}

/// Counters plus their evaluation in the shape every view uses.
pub fn evaluation_json(
    policy: &ReportPolicy,
    counters: &CourseAttendanceCounters,
    ev: &AttendanceEvaluation,
) -> serde_json::Value {
    let display = if policy.clamp_display_percentage {
        ev.display_percentage()
    } else {
        ev.percentage
    };
    json!({
        "totalClasses": counters.total_classes,
        "present": counters.present,
        "absent": counters.absent,
        "late": counters.late,
        "justified": counters.justified,
        "lateCredits": counters.late_credits(),
        "justifiedCredits": counters.justified_credits(),
        "effectiveAttendance": ev.effective_attendance,
        "percentage": percent(policy, ev.percentage),
        "displayPercentage": percent(policy, display),
        "absencePercentage": percent(policy, ev.absence_percentage()),
        "status": ev.status,
        "statusLabel": ev.status.label()
    })
}

pub fn aggregate_json(
    policy: &ReportPolicy,
    total_classes: i64,
    ev: &AttendanceEvaluation,
) -> serde_json::Value {
    let display = if policy.clamp_display_percentage {
        ev.display_percentage()
    } else {
        ev.percentage
    };
    json!({
        "totalClasses": total_classes,
        "effectiveAttendance": ev.effective_attendance,
        "percentage": percent(policy, ev.percentage),
        "displayPercentage": percent(policy, display),
        "status": ev.status,
        "statusLabel": ev.status.label()
    })
}

pub fn load_report_policy(conn: &Connection) -> Result<ReportPolicy, HandlerErr> {
    ReportPolicy::load(conn).map_err(HandlerErr::query)
}

pub fn load_attendance_policy(conn: &Connection) -> Result<AttendancePolicy, HandlerErr> {
    AttendancePolicy::load(conn).map_err(HandlerErr::query)
}

/// `period` param, falling back to the configured default period.
pub fn get_period_or_default(conn: &Connection, params: &serde_json::Value) -> Result<String, HandlerErr> {
    match get_optional_str(params, "period")? {
        Some(p) => Ok(p),
        None => Ok(load_attendance_policy(conn)?.default_period),
    }
}

pub fn require_student(conn: &Connection, student_id: &str) -> Result<StudentInfo, HandlerErr> {
    rollup::load_student(conn, student_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("student"))
}

/// Deadline for justifying an absence: class start plus the configured window.
pub fn justification_deadline(
    policy: &AttendancePolicy,
    class_date: &str,
    class_time: Option<&str>,
) -> Result<NaiveDateTime, HandlerErr> {
    let start = class_start(class_date, class_time).ok_or_else(|| {
        HandlerErr::new("bad_state", "session has an invalid class date")
            .with_details(json!({ "classDate": class_date }))
    })?;
    Ok(start + chrono::Duration::hours(policy.justification_deadline_hours))
}
