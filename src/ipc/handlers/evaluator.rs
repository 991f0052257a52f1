use crate::calc::{self, AttendanceEvaluation, CourseAttendanceCounters};
use crate::ipc::error::ok;
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn required_count(obj: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    match obj.get(key) {
        None | Some(serde_json::Value::Null) => Err(HandlerErr::bad_params(format!("missing {}", key))),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

fn parse_counters(obj: &serde_json::Value) -> Result<CourseAttendanceCounters, HandlerErr> {
    Ok(CourseAttendanceCounters {
        total_classes: required_count(obj, "totalClasses")?,
        present: required_count(obj, "present")?,
        absent: required_count(obj, "absent")?,
        late: required_count(obj, "late")?,
        justified: required_count(obj, "justified")?,
    })
}

fn evaluation_result(ev: &AttendanceEvaluation) -> serde_json::Value {
    json!({
        "effectiveAttendance": ev.effective_attendance,
        "percentage": ev.percentage,
        "status": ev.status,
        "statusLabel": ev.status.label(),
        "displayPercentage": ev.display_percentage(),
        "absencePercentage": ev.absence_percentage(),
        "alertMessage": ev.status.alert_message()
    })
}

fn attendance_evaluate(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let counters = parse_counters(params)?;
    let ev = calc::evaluate(&counters)?;
    let mut out = evaluation_result(&ev);
    out["lateCredits"] = json!(counters.late_credits());
    out["justifiedCredits"] = json!(counters.justified_credits());
    Ok(out)
}

/// Only `effectiveAttendance` feeds the roll-up. A client-sent `percentage` or
/// `status` is ignored, since both are re-derived from the sums.
fn parse_evaluation(obj: &serde_json::Value) -> Result<AttendanceEvaluation, HandlerErr> {
    Ok(AttendanceEvaluation {
        effective_attendance: required_count(obj, "effectiveAttendance")?,
        ..AttendanceEvaluation::NO_DATA
    })
}

fn attendance_aggregate(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut evaluations: Vec<AttendanceEvaluation> = Vec::new();
    let mut weights: Vec<i64> = Vec::new();

    if let Some(items) = params.get("items").and_then(|v| v.as_array()) {
        for item in items {
            evaluations.push(parse_evaluation(item)?);
            weights.push(required_count(item, "totalClasses")?);
        }
    } else if let Some(items) = params.get("counters").and_then(|v| v.as_array()) {
        for item in items {
            let counters = parse_counters(item)?;
            evaluations.push(calc::evaluate(&counters)?);
            weights.push(counters.total_classes);
        }
    } else {
        let Some(raw_evals) = params.get("evaluations").and_then(|v| v.as_array()) else {
            return Err(HandlerErr::bad_params("missing evaluations or counters"));
        };
        let Some(raw_weights) = params.get("weights").and_then(|v| v.as_array()) else {
            return Err(HandlerErr::bad_params("missing weights"));
        };
        for e in raw_evals {
            evaluations.push(parse_evaluation(e)?);
        }
        for w in raw_weights {
            weights.push(
                w.as_i64()
                    .ok_or_else(|| HandlerErr::bad_params("weights must be integers"))?,
            );
        }
    }

    let ev = calc::aggregate(&evaluations, &weights)?;
    let mut out = evaluation_result(&ev);
    out["totalClasses"] = json!(calc::checked_sum("totalClasses", weights.iter().copied())?);
    out["courseCount"] = json!(evaluations.len());
    Ok(out)
}

fn respond(
    req: &Request,
    f: fn(&serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    match f(&req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.evaluate" => Some(respond(req, attendance_evaluate)),
        "attendance.aggregate" => Some(respond(req, attendance_aggregate)),
        _ => None,
    }
}
