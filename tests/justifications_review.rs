mod test_support;

use serde_json::json;
use test_support::{
    attendance_id, create_course, create_sessions, create_student, create_teacher, enroll, f64_at,
    i64_at, mark, str_at, Sidecar, PERIOD,
};

struct Fixture {
    sc: Sidecar,
    workspace: std::path::PathBuf,
    teacher: String,
    student: String,
    sessions: Vec<String>,
}

fn fixture(prefix: &str) -> Fixture {
    let (mut sc, workspace) = Sidecar::with_workspace(prefix);
    let teacher = create_teacher(&mut sc, "D-010");
    let course = create_course(&mut sc, "PRG201", Some(&teacher));
    let student = create_student(&mut sc, "U100", "Carla", "Mendoza");
    enroll(&mut sc, &course, &[&student]);
    let sessions = create_sessions(&mut sc, &course, &["2025-03-03", "2025-03-05", "2025-03-07"]);
    for s in &sessions {
        mark(&mut sc, s, &student, "absent");
    }
    Fixture {
        sc,
        workspace,
        teacher,
        student,
        sessions,
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.workspace);
    }
}

#[test]
fn approval_turns_the_absence_into_a_justified_mark() {
    let mut f = fixture("asistencia-justify-approve");
    let absence = attendance_id(&mut f.sc, &f.sessions[0], &f.student);

    let created = f.sc.ok(
        "justifications.create",
        json!({
            "attendanceId": absence,
            "reason": "Cita médica",
            "description": "Control en el hospital",
            "requestDate": "2025-03-04T09:30:00"
        }),
    );
    assert_eq!(str_at(&created, "/status"), "pending");
    assert_eq!(created.get("outOfDeadline").and_then(|v| v.as_bool()), Some(false));
    let justification = str_at(&created, "/justificationId");

    let pending = f.sc.ok("student.dashboard", json!({ "studentId": f.student, "period": PERIOD }));
    let listed = pending
        .get("pendingJustifications")
        .and_then(|v| v.as_array())
        .map(|a| a.len());
    assert_eq!(listed, Some(1));

    let reviewed = f.sc.ok(
        "justifications.review",
        json!({
            "justificationId": justification,
            "status": "approved",
            "reviewedBy": "Rosa Quispe",
            "comments": "Documento válido"
        }),
    );
    assert_eq!(str_at(&reviewed, "/status"), "approved");
    assert_eq!(str_at(&reviewed, "/reviewedBy"), "Rosa Quispe");

    let open = f.sc.ok("attendance.sessionOpen", json!({ "sessionId": f.sessions[0] }));
    assert_eq!(str_at(&open, "/students/0/status"), "justified");

    let dash = f.sc.ok("student.dashboard", json!({ "studentId": f.student }));
    assert_eq!(i64_at(&dash, "/courses/0/attendance/justified"), 1);
    assert_eq!(i64_at(&dash, "/courses/0/attendance/absent"), 2);
    // One justified absence is below the 3:1 credit ratio.
    assert_eq!(i64_at(&dash, "/courses/0/attendance/effectiveAttendance"), 0);

    // Reviewed requests are final.
    assert_eq!(
        f.sc.err_code(
            "justifications.review",
            json!({ "justificationId": justification, "status": "rejected" })
        ),
        "bad_state"
    );
}

#[test]
fn open_requests_block_duplicates_and_rejection_reopens_the_absence() {
    let mut f = fixture("asistencia-justify-reject");
    let absence = attendance_id(&mut f.sc, &f.sessions[1], &f.student);

    let created = f.sc.ok(
        "justifications.create",
        json!({ "attendanceId": absence, "reason": "Viaje familiar" }),
    );
    let justification = str_at(&created, "/justificationId");
    assert_eq!(
        f.sc.err_code(
            "justifications.create",
            json!({ "attendanceId": absence, "reason": "Otra vez" })
        ),
        "conflict"
    );

    let unjustified = f.sc.ok("student.unjustifiedAbsences", json!({ "studentId": f.student }));
    let ids: Vec<String> = unjustified
        .get("absences")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|a| str_at(a, "/attendanceId"))
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&absence));

    f.sc.ok(
        "justifications.review",
        json!({ "justificationId": justification, "status": "rejected" }),
    );
    let open = f.sc.ok("attendance.sessionOpen", json!({ "sessionId": f.sessions[1] }));
    assert_eq!(str_at(&open, "/students/0/status"), "absent");

    // A rejected request no longer blocks a new one.
    f.sc.ok(
        "justifications.create",
        json!({ "attendanceId": absence, "reason": "Nuevo sustento" }),
    );

    let stats = f.sc.ok("justifications.stats", json!({ "studentId": f.student }));
    assert_eq!(i64_at(&stats, "/total"), 2);
    assert_eq!(i64_at(&stats, "/pending"), 1);
    assert_eq!(i64_at(&stats, "/rejected"), 1);
    assert_eq!(f64_at(&stats, "/approvalRate"), 0.0);

    let by_teacher = f.sc.ok(
        "justifications.list",
        json!({ "teacherId": f.teacher, "status": "pending" }),
    );
    assert_eq!(
        by_teacher.get("justifications").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn late_requests_are_flagged_or_refused_by_policy() {
    let mut f = fixture("asistencia-justify-deadline");
    let first = attendance_id(&mut f.sc, &f.sessions[0], &f.student);
    let second = attendance_id(&mut f.sc, &f.sessions[1], &f.student);

    // Class at 2025-03-03 08:00 plus 48 hours.
    let late = f.sc.ok(
        "justifications.create",
        json!({ "attendanceId": first, "reason": "Salud", "requestDate": "2025-03-05T08:00:01" }),
    );
    assert_eq!(late.get("outOfDeadline").and_then(|v| v.as_bool()), Some(true));

    f.sc.ok(
        "setup.update",
        json!({ "section": "attendance", "patch": { "rejectOutOfDeadline": true } }),
    );
    assert_eq!(
        f.sc.err_code(
            "justifications.create",
            json!({ "attendanceId": second, "reason": "Salud", "requestDate": "2025-04-01T00:00:00" })
        ),
        "bad_state"
    );
}

#[test]
fn only_absences_can_be_justified() {
    let mut f = fixture("asistencia-justify-present");
    let session = f.sessions[2].clone();
    let student = f.student.clone();
    mark(&mut f.sc, &session, &student, "present");
    let present = attendance_id(&mut f.sc, &session, &student);

    assert_eq!(
        f.sc.err_code(
            "justifications.create",
            json!({ "attendanceId": present, "reason": "No aplica" })
        ),
        "bad_state"
    );
    assert_eq!(
        f.sc.err_code(
            "justifications.create",
            json!({ "attendanceId": "missing", "reason": "No aplica" })
        ),
        "not_found"
    );
    assert_eq!(
        f.sc.err_code("justifications.list", json!({ "status": "archived" })),
        "bad_params"
    );
}

fn request_justification(f: &mut Fixture, attendance: &str) -> String {
    let created = f.sc.ok(
        "justifications.create",
        json!({
            "attendanceId": attendance,
            "reason": "Trámite familiar",
            "requestDate": "2025-03-04T10:00:00"
        }),
    );
    str_at(&created, "/justificationId")
}

fn justification_status(f: &mut Fixture, justification: &str) -> String {
    let list = f.sc.ok("justifications.list", json!({ "studentId": f.student }));
    list.get("justifications")
        .and_then(|v| v.as_array())
        .and_then(|items| {
            items
                .iter()
                .find(|j| j.get("justificationId").and_then(|v| v.as_str()) == Some(justification))
        })
        .map(|j| str_at(j, "/status"))
        .unwrap_or_default()
}

#[test]
fn corrected_mark_is_not_overwritten_by_a_later_approval() {
    let mut f = fixture("asistencia-justify-corrected");
    let absence = attendance_id(&mut f.sc, &f.sessions[0], &f.student);
    let justification = request_justification(&mut f, &absence);

    f.sc.ok(
        "attendance.take",
        json!({
            "sessionId": f.sessions[0],
            "marks": [{ "studentId": f.student, "status": "present" }]
        }),
    );
    assert_eq!(justification_status(&mut f, &justification), "cancelled");

    assert_eq!(
        f.sc.err_code(
            "justifications.review",
            json!({ "justificationId": justification, "status": "approved" })
        ),
        "bad_state"
    );
    let open = f.sc.ok("attendance.sessionOpen", json!({ "sessionId": f.sessions[0] }));
    assert_eq!(str_at(&open, "/students/0/status"), "present");

    let dash = f.sc.ok("student.dashboard", json!({ "studentId": f.student, "period": PERIOD }));
    assert_eq!(i64_at(&dash, "/courses/0/attendance/present"), 1);
    assert_eq!(i64_at(&dash, "/courses/0/attendance/justified"), 0);
}

#[test]
fn remarking_an_approved_absence_allows_a_new_request() {
    let mut f = fixture("asistencia-justify-remark");
    let absence = attendance_id(&mut f.sc, &f.sessions[1], &f.student);
    let first = request_justification(&mut f, &absence);
    f.sc.ok(
        "justifications.review",
        json!({ "justificationId": first, "status": "approved" }),
    );

    f.sc.ok(
        "attendance.setMark",
        json!({ "sessionId": f.sessions[1], "studentId": f.student, "status": "absent" }),
    );
    assert_eq!(justification_status(&mut f, &first), "cancelled");

    let second = request_justification(&mut f, &absence);
    assert_ne!(second, first);
    assert_eq!(justification_status(&mut f, &second), "pending");
}
