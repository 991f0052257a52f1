use crate::calc;
use crate::ipc::helpers::{
    format_timestamp, get_filter_str, get_optional_str, get_required_str, get_timestamp_or_now,
    justification_deadline, load_attendance_policy, now_timestamp, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn parse(raw: &str) -> Result<Self, HandlerErr> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(HandlerErr::bad_params("status must be one of: approved, rejected")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

pub struct Review<'a> {
    pub decision: ReviewDecision,
    pub reviewed_by: Option<&'a str>,
    pub comments: Option<&'a str>,
    pub review_date: &'a str,
}

/// Records the decision on one pending justification. Approval turns the
/// underlying attendance mark into `justified` and needs that mark to still be
/// an absence.
pub fn apply_review(conn: &Connection, justification_id: &str, review: &Review<'_>) -> Result<(), HandlerErr> {
    if review.decision == ReviewDecision::Approved {
        let mark: Option<String> = conn
            .query_row(
                "SELECT ar.status FROM justifications j
                 JOIN attendance_records ar ON ar.id = j.attendance_id
                 WHERE j.id = ?",
                [justification_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if let Some(mark) = mark.filter(|m| m != "absent") {
            return Err(HandlerErr::new("bad_state", "attendance mark is no longer an absence")
                .with_details(json!({ "justificationId": justification_id, "status": mark })));
        }
    }
    let changed = conn
        .execute(
            "UPDATE justifications
             SET status = ?, reviewed_by = ?, review_date = ?, review_comments = ?
             WHERE id = ? AND status = 'pending'",
            (
                review.decision.as_str(),
                review.reviewed_by,
                review.review_date,
                review.comments,
                justification_id,
            ),
        )
        .map_err(|e| HandlerErr::update(e, "justifications"))?;
    if changed == 0 {
        return Err(HandlerErr::new("bad_state", "justification is not pending")
            .with_details(json!({ "justificationId": justification_id })));
    }
    if review.decision == ReviewDecision::Approved {
        conn.execute(
            "UPDATE attendance_records SET status = 'justified', recorded_at = ?
             WHERE id = (SELECT attendance_id FROM justifications WHERE id = ?)
               AND status = 'absent'",
            (review.review_date, justification_id),
        )
        .map_err(|e| HandlerErr::update(e, "attendance_records"))?;
    }
    Ok(())
}

/// Share of reviewed requests that were approved, in percent.
pub fn approval_rate(approved: i64, rejected: i64) -> f64 {
    let reviewed = approved + rejected;
    if reviewed <= 0 {
        return 0.0;
    }
    calc::round_to(approved as f64 * 100.0 / reviewed as f64, 2)
}

pub const JUSTIFICATION_SELECT: &str = "SELECT j.id, j.attendance_id, j.student_id,
        s.first_name || ' ' || s.last_name, c.id, c.code, c.name, cs.class_date, cs.class_time,
        j.batch_id, j.reason, j.description, j.attachment_file, j.status, j.request_date,
        j.out_of_deadline, j.reviewed_by, j.review_date, j.review_comments
    FROM justifications j
    JOIN students s ON s.id = j.student_id
    JOIN attendance_records ar ON ar.id = j.attendance_id
    JOIN class_sessions cs ON cs.id = ar.session_id
    JOIN courses c ON c.id = cs.course_id";

pub fn justification_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "justificationId": r.get::<_, String>(0)?,
        "attendanceId": r.get::<_, String>(1)?,
        "studentId": r.get::<_, String>(2)?,
        "studentName": r.get::<_, String>(3)?,
        "courseId": r.get::<_, String>(4)?,
        "courseCode": r.get::<_, String>(5)?,
        "courseName": r.get::<_, String>(6)?,
        "classDate": r.get::<_, String>(7)?,
        "classTime": r.get::<_, Option<String>>(8)?,
        "batchId": r.get::<_, Option<String>>(9)?,
        "reason": r.get::<_, String>(10)?,
        "description": r.get::<_, Option<String>>(11)?,
        "attachmentFile": r.get::<_, Option<String>>(12)?,
        "status": r.get::<_, String>(13)?,
        "requestDate": r.get::<_, String>(14)?,
        "outOfDeadline": r.get::<_, bool>(15)?,
        "reviewedBy": r.get::<_, Option<String>>(16)?,
        "reviewDate": r.get::<_, Option<String>>(17)?,
        "reviewComments": r.get::<_, Option<String>>(18)?
    }))
}

fn load_justification(conn: &Connection, justification_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE j.id = ?", JUSTIFICATION_SELECT),
        [justification_id],
        justification_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("justification"))
}

fn parse_status_filter(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    match get_filter_str(params, "status")? {
        None => Ok(None),
        Some(s) if ["pending", "approved", "rejected", "cancelled"].contains(&s.as_str()) => Ok(Some(s)),
        Some(_) => Err(HandlerErr::bad_params(
            "status must be one of: pending, approved, rejected, cancelled",
        )),
    }
}

pub struct AbsenceRecord {
    pub attendance_id: String,
    pub student_id: String,
    pub status: String,
    pub class_date: String,
    pub class_time: Option<String>,
}

pub fn load_absence_record(conn: &Connection, attendance_id: &str) -> Result<AbsenceRecord, HandlerErr> {
    conn.query_row(
        "SELECT ar.id, ar.student_id, ar.status, cs.class_date, cs.class_time
         FROM attendance_records ar
         JOIN class_sessions cs ON cs.id = ar.session_id
         WHERE ar.id = ?",
        [attendance_id],
        |r| {
            Ok(AbsenceRecord {
                attendance_id: r.get(0)?,
                student_id: r.get(1)?,
                status: r.get(2)?,
                class_date: r.get(3)?,
                class_time: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| {
        HandlerErr::not_found("attendance record").with_details(json!({ "attendanceId": attendance_id }))
    })
}

/// An absence can be justified when it is still `absent` and has no pending
/// or approved justification.
pub fn ensure_justifiable(conn: &Connection, record: &AbsenceRecord) -> Result<(), HandlerErr> {
    if record.status != "absent" {
        return Err(HandlerErr::new("bad_state", "only absences can be justified")
            .with_details(json!({ "attendanceId": record.attendance_id, "status": record.status })));
    }
    let open: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM justifications
             WHERE attendance_id = ? AND status IN ('pending', 'approved')",
            [&record.attendance_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if open > 0 {
        return Err(HandlerErr::new("conflict", "absence already has an open justification")
            .with_details(json!({ "attendanceId": record.attendance_id })));
    }
    Ok(())
}

fn justifications_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    let reason = get_required_str(params, "reason")?;
    let description = get_optional_str(params, "description")?;
    let attachment_file = get_optional_str(params, "attachmentFile")?;
    let request_date = get_timestamp_or_now(params, "requestDate")?;
    let policy = load_attendance_policy(conn)?;

    let record = load_absence_record(conn, &attendance_id)?;
    ensure_justifiable(conn, &record)?;
    let deadline = justification_deadline(&policy, &record.class_date, record.class_time.as_deref())?;
    let out_of_deadline = request_date > deadline;
    if out_of_deadline && policy.reject_out_of_deadline {
        return Err(HandlerErr::new("bad_state", "justification deadline has passed")
            .with_details(json!({ "deadline": format_timestamp(deadline) })));
    }

    let justification_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO justifications(id, attendance_id, student_id, batch_id, reason, description,
            attachment_file, status, request_date, out_of_deadline)
         VALUES(?, ?, ?, NULL, ?, ?, ?, 'pending', ?, ?)",
        (
            &justification_id,
            &record.attendance_id,
            &record.student_id,
            &reason,
            &description,
            &attachment_file,
            format_timestamp(request_date),
            out_of_deadline,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "justifications"))?;
    log::info!(
        "justification {} submitted for attendance {}",
        justification_id,
        record.attendance_id
    );
    load_justification(conn, &justification_id)
}

fn justifications_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    let status = parse_status_filter(params)?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE (?1 IS NULL OR j.student_id = ?1)
                AND (?2 IS NULL OR j.status = ?2)
                AND (?3 IS NULL OR c.teacher_id = ?3)
             ORDER BY j.request_date DESC",
            JUSTIFICATION_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let items = stmt
        .query_map((student_id, status, teacher_id), justification_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "justifications": items }))
}

fn justifications_review(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let justification_id = get_required_str(params, "justificationId")?;
    let decision = ReviewDecision::parse(&get_required_str(params, "status")?)?;
    let reviewed_by = get_optional_str(params, "reviewedBy")?;
    let comments = get_optional_str(params, "comments")?;

    let (status, batch_id): (String, Option<String>) = conn
        .query_row(
            "SELECT status, batch_id FROM justifications WHERE id = ?",
            [&justification_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("justification"))?;
    if let Some(batch_id) = batch_id {
        return Err(HandlerErr::new("bad_state", "justification belongs to a batch; review the batch")
            .with_details(json!({ "batchId": batch_id })));
    }
    if status != "pending" {
        return Err(HandlerErr::new("bad_state", "justification is not pending")
            .with_details(json!({ "status": status })));
    }

    let review_date = now_timestamp();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    apply_review(
        &tx,
        &justification_id,
        &Review {
            decision,
            reviewed_by: reviewed_by.as_deref(),
            comments: comments.as_deref(),
            review_date: &review_date,
        },
    )?;
    tx.commit().map_err(HandlerErr::commit)?;
    log::info!("justification {} {}", justification_id, decision.as_str());
    load_justification(conn, &justification_id)
}

fn justifications_stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId")?;
    let (total, pending, approved, rejected, out_of_deadline): (i64, i64, i64, i64, i64) = conn
        .query_row(
            "SELECT
               COUNT(*),
               COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'approved' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN out_of_deadline THEN 1 ELSE 0 END), 0)
             FROM justifications
             WHERE (?1 IS NULL OR student_id = ?1)",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .map_err(HandlerErr::query)?;
    Ok(json!({
        "total": total,
        "pending": pending,
        "approved": approved,
        "rejected": rejected,
        "outOfDeadline": out_of_deadline,
        "approvalRate": approval_rate(approved, rejected)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "justifications.create" => Some(with_db(state, req, justifications_create)),
        "justifications.list" => Some(with_db(state, req, justifications_list)),
        "justifications.review" => Some(with_db(state, req, justifications_review)),
        "justifications.stats" => Some(with_db(state, req, justifications_stats)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_rate_counts_reviewed_only() {
        assert_eq!(approval_rate(0, 0), 0.0);
        assert_eq!(approval_rate(3, 1), 75.0);
        assert_eq!(approval_rate(1, 2), 33.33);
    }

    #[test]
    fn decision_accepts_only_final_states() {
        assert_eq!(ReviewDecision::parse("Approved").ok(), Some(ReviewDecision::Approved));
        assert!(ReviewDecision::parse("pending").is_err());
    }
}
