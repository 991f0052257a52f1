use super::justifications::{
    apply_review, ensure_justifiable, justification_from_row, load_absence_record, Review,
    ReviewDecision, JUSTIFICATION_SELECT,
};
use crate::calc;
use crate::ipc::helpers::{
    format_timestamp, get_optional_str, get_required_str, get_string_array, get_timestamp_or_now,
    justification_deadline, load_attendance_policy, now_timestamp, require_student, with_db,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const CATEGORIES: [(&str, &str); 5] = [
    ("medical", "Médica"),
    ("personal", "Personal"),
    ("family", "Familiar"),
    ("academic", "Académica"),
    ("emergency", "Emergencia"),
];

fn category_label(category: &str) -> Option<&'static str> {
    CATEGORIES
        .iter()
        .find(|(k, _)| *k == category)
        .map(|(_, label)| *label)
}

fn status_label(status: &str) -> &'static str {
    match status {
        "pending" => "Pendiente",
        "approved" => "Aprobado",
        "partial" => "Parcial",
        "rejected" => "Rechazado",
        "cancelled" => "Cancelado",
        _ => "",
    }
}

/// Final batch status from the per-item decisions.
fn batch_outcome(decisions: &[ReviewDecision]) -> &'static str {
    let approved = decisions
        .iter()
        .filter(|d| **d == ReviewDecision::Approved)
        .count();
    if approved == decisions.len() {
        "approved"
    } else if approved == 0 {
        "rejected"
    } else {
        "partial"
    }
}

const BATCH_SELECT: &str = "SELECT b.id, b.student_id, s.first_name || ' ' || s.last_name, s.student_code,
        b.reason_category, b.general_description, b.document_type, b.attachment_path,
        b.total_absences, b.approval_status, b.within_deadline, b.submission_date,
        b.reviewed_by, b.reviewer_email, b.review_date, b.review_comments
    FROM justification_batches b
    JOIN students s ON s.id = b.student_id";

fn batch_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let category: String = r.get(4)?;
    let status: String = r.get(9)?;
    Ok(json!({
        "batchId": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "studentCode": r.get::<_, String>(3)?,
        "reasonCategory": category,
        "categoryLabel": category_label(&category),
        "generalDescription": r.get::<_, String>(5)?,
        "documentType": r.get::<_, Option<String>>(6)?,
        "attachmentPath": r.get::<_, Option<String>>(7)?,
        "totalAbsences": r.get::<_, i64>(8)?,
        "approvalStatus": status,
        "statusLabel": status_label(&status),
        "withinDeadline": r.get::<_, bool>(10)?,
        "submissionDate": r.get::<_, String>(11)?,
        "reviewedBy": r.get::<_, Option<String>>(12)?,
        "reviewerEmail": r.get::<_, Option<String>>(13)?,
        "reviewDate": r.get::<_, Option<String>>(14)?,
        "reviewComments": r.get::<_, Option<String>>(15)?
    }))
}

fn query_batches(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!("{} {}", BATCH_SELECT, filter))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(params, batch_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn batch_items(conn: &Connection, batch_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE j.batch_id = ? ORDER BY cs.class_date, c.code",
            JUSTIFICATION_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([batch_id], justification_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn load_batch(conn: &Connection, batch_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let mut batch = conn
        .query_row(
            &format!("{} WHERE b.id = ?", BATCH_SELECT),
            [batch_id],
            batch_from_row,
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("batch"))?;
    batch["items"] = json!(batch_items(conn, batch_id)?);
    Ok(batch)
}

fn batch_status(conn: &Connection, batch_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT approval_status FROM justification_batches WHERE id = ?",
        [batch_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("batch"))
}

fn batches_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let category = get_required_str(params, "reasonCategory")?.to_ascii_lowercase();
    let description = get_required_str(params, "generalDescription")?;
    let attendance_ids = get_string_array(params, "attendanceIds")?;
    let document_type = get_optional_str(params, "documentType")?;
    let attachment_path = get_optional_str(params, "attachmentPath")?;
    let submission_date = get_timestamp_or_now(params, "submissionDate")?;
    let policy = load_attendance_policy(conn)?;

    if category_label(&category).is_none() {
        return Err(HandlerErr::bad_params(
            "reasonCategory must be one of: medical, personal, family, academic, emergency",
        ));
    }
    if description.chars().count() < policy.min_batch_description_chars {
        return Err(HandlerErr::bad_params(format!(
            "generalDescription must be at least {} characters",
            policy.min_batch_description_chars
        )));
    }
    if attendance_ids.is_empty() || attendance_ids.len() > policy.max_batch_absences {
        return Err(HandlerErr::bad_params(format!(
            "attendanceIds must contain 1..={} absences",
            policy.max_batch_absences
        ))
        .with_details(json!({ "count": attendance_ids.len() })));
    }
    require_student(conn, &student_id)?;

    let mut items = Vec::with_capacity(attendance_ids.len());
    for attendance_id in &attendance_ids {
        let record = load_absence_record(conn, attendance_id)?;
        if record.student_id != student_id {
            return Err(HandlerErr::new("bad_state", "absence belongs to another student")
                .with_details(json!({ "attendanceId": attendance_id })));
        }
        ensure_justifiable(conn, &record)?;
        let deadline =
            justification_deadline(&policy, &record.class_date, record.class_time.as_deref())?;
        items.push((record, submission_date > deadline));
    }
    let within_deadline = items.iter().all(|(_, late)| !late);
    if !within_deadline && policy.reject_out_of_deadline {
        return Err(HandlerErr::new("bad_state", "justification deadline has passed"));
    }

    let batch_id = Uuid::new_v4().to_string();
    let submitted = format_timestamp(submission_date);
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "INSERT INTO justification_batches(id, student_id, reason_category, general_description,
            document_type, attachment_path, total_absences, approval_status, within_deadline,
            submission_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        (
            &batch_id,
            &student_id,
            &category,
            &description,
            &document_type,
            &attachment_path,
            items.len() as i64,
            within_deadline,
            &submitted,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "justification_batches"))?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO justifications(id, attendance_id, student_id, batch_id, reason,
                    description, attachment_file, status, request_date, out_of_deadline)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
            )
            .map_err(HandlerErr::query)?;
        for (record, out_of_deadline) in &items {
            stmt.execute((
                Uuid::new_v4().to_string(),
                &record.attendance_id,
                &student_id,
                &batch_id,
                &category,
                &description,
                &attachment_path,
                &submitted,
                *out_of_deadline,
            ))
            .map_err(|e| HandlerErr::insert(e, "justifications"))?;
        }
    }
    tx.commit().map_err(HandlerErr::commit)?;
    log::info!(
        "batch {} submitted by {} with {} absences",
        batch_id,
        student_id,
        items.len()
    );
    load_batch(conn, &batch_id)
}

fn batches_list_by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    require_student(conn, &student_id)?;
    let batches = query_batches(
        conn,
        "WHERE b.student_id = ? ORDER BY b.submission_date DESC",
        [&student_id],
    )?;
    Ok(json!({ "batches": batches }))
}

fn batches_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    load_batch(conn, &batch_id)
}

fn batches_pending(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batches = query_batches(
        conn,
        "WHERE b.approval_status = 'pending' ORDER BY b.submission_date",
        [],
    )?;
    Ok(json!({ "batches": batches }))
}

fn parse_decisions(
    params: &serde_json::Value,
    pending: &[String],
) -> Result<Vec<(String, ReviewDecision)>, HandlerErr> {
    if let Some(raw) = params.get("decisions").filter(|v| !v.is_null()) {
        let Some(list) = raw.as_array() else {
            return Err(HandlerErr::bad_params("decisions must be an array"));
        };
        let mut by_id: HashMap<String, ReviewDecision> = HashMap::new();
        for d in list {
            let id = get_required_str(d, "justificationId")?;
            if !pending.contains(&id) {
                return Err(HandlerErr::bad_params("decision for a justification outside the batch")
                    .with_details(json!({ "justificationId": id })));
            }
            let decision = ReviewDecision::parse(&get_required_str(d, "status")?)?;
            by_id.insert(id, decision);
        }
        let mut out = Vec::with_capacity(pending.len());
        for id in pending {
            let Some(decision) = by_id.get(id) else {
                return Err(HandlerErr::bad_params("every justification in the batch needs a decision")
                    .with_details(json!({ "justificationId": id })));
            };
            out.push((id.clone(), *decision));
        }
        return Ok(out);
    }
    let decision = ReviewDecision::parse(&get_required_str(params, "status")?)?;
    Ok(pending.iter().map(|id| (id.clone(), decision)).collect())
}

fn batches_review(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let reviewed_by = get_optional_str(params, "reviewedBy")?;
    let reviewer_email = get_optional_str(params, "reviewerEmail")?;
    let comments = get_optional_str(params, "comments")?;

    let status = batch_status(conn, &batch_id)?;
    if status != "pending" {
        return Err(HandlerErr::new("bad_state", "batch is not pending")
            .with_details(json!({ "approvalStatus": status })));
    }
    let pending: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM justifications WHERE batch_id = ? AND status = 'pending' ORDER BY id")
            .map_err(HandlerErr::query)?;
        let ids = stmt
            .query_map([&batch_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        ids
    };
    if pending.is_empty() {
        return Err(HandlerErr::new("bad_state", "batch has no pending justifications"));
    }
    let decisions = parse_decisions(params, &pending)?;
    let outcome = batch_outcome(&decisions.iter().map(|(_, d)| *d).collect::<Vec<_>>());

    let review_date = now_timestamp();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for (justification_id, decision) in &decisions {
        apply_review(
            &tx,
            justification_id,
            &Review {
                decision: *decision,
                reviewed_by: reviewed_by.as_deref(),
                comments: comments.as_deref(),
                review_date: &review_date,
            },
        )?;
    }
    tx.execute(
        "UPDATE justification_batches
         SET approval_status = ?, reviewed_by = ?, reviewer_email = ?, review_date = ?,
             review_comments = ?
         WHERE id = ?",
        (
            outcome,
            &reviewed_by,
            &reviewer_email,
            &review_date,
            &comments,
            &batch_id,
        ),
    )
    .map_err(|e| HandlerErr::update(e, "justification_batches"))?;
    tx.commit().map_err(HandlerErr::commit)?;
    log::info!("batch {} reviewed: {}", batch_id, outcome);
    load_batch(conn, &batch_id)
}

fn batches_cancel(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let status = batch_status(conn, &batch_id)?;
    if status != "pending" {
        return Err(HandlerErr::new("bad_state", "only pending batches can be cancelled")
            .with_details(json!({ "approvalStatus": status })));
    }
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "UPDATE justifications SET status = 'cancelled' WHERE batch_id = ? AND status = 'pending'",
        [&batch_id],
    )
    .map_err(|e| HandlerErr::update(e, "justifications"))?;
    tx.execute(
        "UPDATE justification_batches SET approval_status = 'cancelled' WHERE id = ?",
        [&batch_id],
    )
    .map_err(|e| HandlerErr::update(e, "justification_batches"))?;
    tx.commit().map_err(HandlerErr::commit)?;
    load_batch(conn, &batch_id)
}

fn batches_stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period = get_optional_str(params, "period")?;
    let (total, pending, approved, partial, rejected, cancelled, within, absences): (
        i64,
        i64,
        i64,
        i64,
        i64,
        i64,
        i64,
        i64,
    ) = conn
        .query_row(
            "SELECT
               COUNT(*),
               COALESCE(SUM(CASE WHEN b.approval_status = 'pending' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN b.approval_status = 'approved' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN b.approval_status = 'partial' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN b.approval_status = 'rejected' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN b.approval_status = 'cancelled' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN b.within_deadline THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(b.total_absences), 0)
             FROM justification_batches b
             WHERE ?1 IS NULL OR EXISTS (
               SELECT 1 FROM justifications j
               JOIN attendance_records ar ON ar.id = j.attendance_id
               JOIN class_sessions cs ON cs.id = ar.session_id
               JOIN courses c ON c.id = cs.course_id
               WHERE j.batch_id = b.id AND c.period = ?1
             )",
            [period],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                ))
            },
        )
        .map_err(HandlerErr::query)?;

    let ratio = |n: i64, d: i64, decimals: u32| {
        if d > 0 {
            calc::round_to(n as f64 / d as f64, decimals)
        } else {
            0.0
        }
    };
    Ok(json!({
        "total": total,
        "pending": pending,
        "approved": approved,
        "partial": partial,
        "rejected": rejected,
        "cancelled": cancelled,
        "withinDeadline": within,
        "outOfDeadline": total - within,
        "approvalRate": ratio(approved * 100, total, 1),
        "averageAbsencesPerBatch": ratio(absences, total, 1)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "batches.create" => Some(with_db(state, req, batches_create)),
        "batches.listByStudent" => Some(with_db(state, req, batches_list_by_student)),
        "batches.get" => Some(with_db(state, req, batches_get)),
        "batches.pending" => Some(with_db(state, req, batches_pending)),
        "batches.review" => Some(with_db(state, req, batches_review)),
        "batches.cancel" => Some(with_db(state, req, batches_cancel)),
        "batches.stats" => Some(with_db(state, req, batches_stats)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reflects_mixed_decisions() {
        use ReviewDecision::*;
        assert_eq!(batch_outcome(&[Approved, Approved]), "approved");
        assert_eq!(batch_outcome(&[Rejected, Rejected]), "rejected");
        assert_eq!(batch_outcome(&[Approved, Rejected, Approved]), "partial");
    }

    #[test]
    fn categories_have_spanish_labels() {
        assert_eq!(category_label("family"), Some("Familiar"));
        assert_eq!(category_label("holiday"), None);
        assert_eq!(status_label("partial"), "Parcial");
    }
}
