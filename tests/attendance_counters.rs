mod test_support;

use serde_json::json;
use test_support::{
    attendance_id, create_course, create_sessions, create_student, create_teacher, enroll, f64_at,
    i64_at, mark, str_at, Sidecar, PERIOD,
};

fn roster_status(open: &serde_json::Value, student_id: &str) -> Option<String> {
    open.get("students")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        })
        .and_then(|row| row.get("status"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[test]
fn taking_attendance_feeds_course_counters() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-counters");
    let teacher = create_teacher(&mut sc, "D-001");
    let course = create_course(&mut sc, "MAT101", Some(&teacher));
    let ana = create_student(&mut sc, "U001", "Ana", "Torres");
    let luis = create_student(&mut sc, "U002", "Luis", "Alva");
    enroll(&mut sc, &course, &[&ana, &luis]);
    let sessions = create_sessions(
        &mut sc,
        &course,
        &["2025-03-03", "2025-03-10", "2025-03-17", "2025-03-24"],
    );

    sc.ok(
        "attendance.take",
        json!({
            "sessionId": sessions[0],
            "marks": [
                { "studentId": ana, "status": "present" },
                { "studentId": luis, "status": "present" }
            ]
        }),
    );
    mark(&mut sc, &sessions[1], &ana, "late");
    mark(&mut sc, &sessions[2], &ana, "absent");
    // Session 4 stays unmarked for Ana but still counts as a planned class.

    let open = sc.ok("attendance.sessionOpen", json!({ "sessionId": sessions[0] }));
    let students = open.get("students").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert_eq!(students.len(), 2);
    // Roster is sorted by last name.
    assert_eq!(str_at(&students[0], "/displayName"), "Alva, Luis");
    assert_eq!(roster_status(&open, &ana).as_deref(), Some("present"));

    let listed = sc.ok("sessions.list", json!({ "courseId": course }));
    assert_eq!(i64_at(&listed, "/sessions/0/markedCount"), 2);
    assert_eq!(i64_at(&listed, "/sessions/3/markedCount"), 0);

    let dash = sc.ok("student.dashboard", json!({ "studentId": ana, "period": PERIOD }));
    assert_eq!(i64_at(&dash, "/courses/0/attendance/totalClasses"), 4);
    assert_eq!(i64_at(&dash, "/courses/0/attendance/present"), 1);
    assert_eq!(i64_at(&dash, "/courses/0/attendance/late"), 1);
    assert_eq!(i64_at(&dash, "/courses/0/attendance/absent"), 1);
    assert_eq!(i64_at(&dash, "/courses/0/attendance/effectiveAttendance"), 1);
    assert!((f64_at(&dash, "/courses/0/attendance/percentage") - 25.0).abs() < 1e-9);
    assert_eq!(str_at(&dash, "/courses/0/attendance/status"), "CRITICO");

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn marks_can_be_overwritten_and_cleared() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-setmark");
    let course = create_course(&mut sc, "FIS101", None);
    let ana = create_student(&mut sc, "U001", "Ana", "Torres");
    enroll(&mut sc, &course, &[&ana]);
    let sessions = create_sessions(&mut sc, &course, &["2025-04-01"]);

    mark(&mut sc, &sessions[0], &ana, "absent");
    let first_id = attendance_id(&mut sc, &sessions[0], &ana);

    let r = sc.ok(
        "attendance.setMark",
        json!({ "sessionId": sessions[0], "studentId": ana, "status": "late" }),
    );
    assert_eq!(str_at(&r, "/status"), "late");
    // Upserts keep the record identity.
    assert_eq!(attendance_id(&mut sc, &sessions[0], &ana), first_id);

    sc.ok(
        "attendance.setMark",
        json!({ "sessionId": sessions[0], "studentId": ana, "status": null }),
    );
    let open = sc.ok("attendance.sessionOpen", json!({ "sessionId": sessions[0] }));
    assert_eq!(roster_status(&open, &ana), None);

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_marks_leave_the_session_untouched() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-take-errors");
    let course = create_course(&mut sc, "QUI101", None);
    let ana = create_student(&mut sc, "U001", "Ana", "Torres");
    let outsider = create_student(&mut sc, "U009", "Eva", "Rios");
    enroll(&mut sc, &course, &[&ana]);
    let sessions = create_sessions(&mut sc, &course, &["2025-04-01"]);

    assert_eq!(
        sc.err_code(
            "attendance.take",
            json!({
                "sessionId": sessions[0],
                "marks": [
                    { "studentId": ana, "status": "present" },
                    { "studentId": outsider, "status": "present" }
                ]
            })
        ),
        "bad_state"
    );
    assert_eq!(
        sc.err_code(
            "attendance.take",
            json!({
                "sessionId": sessions[0],
                "marks": [
                    { "studentId": ana, "status": "present" },
                    { "studentId": ana, "status": "late" }
                ]
            })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "attendance.take",
            json!({ "sessionId": sessions[0], "marks": [{ "studentId": ana, "status": "excused" }] })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "sessions.create",
            json!({ "courseId": course, "classDate": "2025-02-30" })
        ),
        "bad_params"
    );

    let listed = sc.ok("sessions.list", json!({ "courseId": course }));
    assert_eq!(i64_at(&listed, "/sessions/0/markedCount"), 0);

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn course_without_sessions_reports_no_data() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-no-sessions");
    let course = create_course(&mut sc, "HIS101", None);
    let ana = create_student(&mut sc, "U001", "Ana", "Torres");
    enroll(&mut sc, &course, &[&ana]);

    let dash = sc.ok("student.dashboard", json!({ "studentId": ana }));
    assert_eq!(str_at(&dash, "/period"), PERIOD);
    assert_eq!(str_at(&dash, "/courses/0/attendance/status"), "SIN_DATOS");
    assert_eq!(str_at(&dash, "/summary/overallStatus"), "SIN_DATOS");
    assert_eq!(dash.pointer("/summary/isCriticalAlert").and_then(|v| v.as_bool()), Some(false));

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}
