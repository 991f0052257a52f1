mod test_support;

use serde_json::json;
use test_support::{
    create_course, create_sessions, create_student, enroll, f64_at, i64_at, mark, str_at, Sidecar,
};

#[test]
fn setup_returns_defaults_for_every_section() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-setup-defaults");
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(i64_at(&setup, "/attendance/justificationDeadlineHours"), 48);
    assert_eq!(i64_at(&setup, "/attendance/maxBatchAbsences"), 10);
    assert_eq!(i64_at(&setup, "/attendance/minBatchDescriptionChars"), 10);
    assert_eq!(str_at(&setup, "/attendance/defaultPeriod"), "2025-I");
    assert_eq!(i64_at(&setup, "/reports/percentageDecimals"), 2);
    assert_eq!(
        setup.pointer("/reports/clampDisplayPercentage").and_then(|v| v.as_bool()),
        Some(true)
    );
    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_patches_are_rejected_without_saving() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-setup-invalid");

    assert_eq!(
        sc.err_code("setup.update", json!({ "section": "grading", "patch": {} })),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "setup.update",
            json!({ "section": "attendance", "patch": { "justificationDeadlineHours": 0 } })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "setup.update",
            json!({ "section": "reports", "patch": { "percentageDecimals": 2, "theme": "dark" } })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code("setup.update", json!({ "section": "reports", "patch": [] })),
        "bad_params"
    );

    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(i64_at(&setup, "/attendance/justificationDeadlineHours"), 48);
    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn policy_changes_persist_and_shape_views() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-setup-policy");
    let course = create_course(&mut sc, "ART101", None);
    let student = create_student(&mut sc, "U800", "Sara", "León");
    enroll(&mut sc, &course, &[&student]);
    let sessions = create_sessions(&mut sc, &course, &["2025-03-03", "2025-03-04", "2025-03-05"]);
    mark(&mut sc, &sessions[0], &student, "present");
    mark(&mut sc, &sessions[1], &student, "present");
    mark(&mut sc, &sessions[2], &student, "absent");

    let dash = sc.ok("student.dashboard", json!({ "studentId": student }));
    assert!((f64_at(&dash, "/courses/0/attendance/percentage") - 66.67).abs() < 1e-9);

    let updated = sc.ok(
        "setup.update",
        json!({ "section": "reports", "patch": { "percentageDecimals": 0 } }),
    );
    assert_eq!(str_at(&updated, "/section"), "reports");
    assert_eq!(i64_at(&updated, "/value/percentageDecimals"), 0);
    sc.ok(
        "setup.update",
        json!({ "section": "attendance", "patch": { "justificationDeadlineHours": 72 } }),
    );

    // Reselecting the workspace reloads the stored settings.
    sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(i64_at(&setup, "/reports/percentageDecimals"), 0);
    assert_eq!(i64_at(&setup, "/attendance/justificationDeadlineHours"), 72);
    // Untouched keys keep their defaults.
    assert_eq!(i64_at(&setup, "/attendance/maxBatchAbsences"), 10);

    let dash = sc.ok("student.dashboard", json!({ "studentId": student }));
    assert_eq!(f64_at(&dash, "/courses/0/attendance/percentage"), 67.0);

    let absences = sc.ok("student.unjustifiedAbsences", json!({ "studentId": student }));
    assert_eq!(str_at(&absences, "/absences/0/deadline"), "2025-03-08T08:00:00");

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}
