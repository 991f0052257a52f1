mod test_support;

use serde_json::json;
use test_support::{
    create_course, create_sessions, create_student, create_teacher, enroll, f64_at, i64_at, mark,
    str_at, Sidecar, PERIOD,
};

#[test]
fn course_report_lists_every_enrolled_student() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-report-course");
    let teacher = create_teacher(&mut sc, "D-300");
    let course = create_course(&mut sc, "EST201", Some(&teacher));
    let ana = create_student(&mut sc, "U900", "Ana", "Zegarra");
    let beto = create_student(&mut sc, "U901", "Beto", "Alarcón");
    let caro = create_student(&mut sc, "U902", "Carolina", "Mejía");
    enroll(&mut sc, &course, &[&ana, &beto, &caro]);
    let sessions = create_sessions(
        &mut sc,
        &course,
        &["2025-03-03", "2025-03-10", "2025-03-17", "2025-03-24", "2025-03-31"],
    );
    for s in &sessions {
        mark(&mut sc, s, &ana, "present");
    }
    // Beto: 3 present and 2 late; two tardies earn no credit.
    for (i, s) in sessions.iter().enumerate() {
        mark(&mut sc, s, &beto, if i < 3 { "present" } else { "late" });
    }
    mark(&mut sc, &sessions[0], &caro, "present");

    let report = sc.ok("reports.courseAttendance", json!({ "courseId": course }));
    assert_eq!(str_at(&report, "/course/code"), "EST201");
    assert_eq!(i64_at(&report, "/sessionCount"), 5);
    let students = report
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 3);
    assert_eq!(str_at(&students[0], "/displayName"), "Alarcón, Beto");
    assert_eq!(str_at(&students[0], "/attendance/status"), "CRITICO");
    assert_eq!(i64_at(&students[0], "/attendance/lateCredits"), 0);
    assert_eq!(str_at(&students[1], "/displayName"), "Mejía, Carolina");
    assert_eq!(str_at(&students[2], "/attendance/status"), "OPTIMO");

    assert_eq!(i64_at(&report, "/statusCounts/optimo"), 1);
    assert_eq!(i64_at(&report, "/statusCounts/critico"), 2);
    // 11 recorded marks: 9 present and 2 late.
    assert_eq!(i64_at(&report, "/markDistribution/recorded"), 11);
    assert!((f64_at(&report, "/markDistribution/present") - 81.82).abs() < 1e-9);
    assert!((f64_at(&report, "/markDistribution/late") - 18.18).abs() < 1e-9);
    assert_eq!(f64_at(&report, "/markDistribution/absent"), 0.0);
    // (5 + 3 + 1) of 15 planned classes.
    assert_eq!(i64_at(&report, "/courseAttendance/effectiveAttendance"), 9);
    assert_eq!(i64_at(&report, "/courseAttendance/totalClasses"), 15);
    assert!((f64_at(&report, "/courseAttendance/percentage") - 60.0).abs() < 1e-9);

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_overview_aggregates_across_courses() {
    let (mut sc, workspace) = Sidecar::with_workspace("asistencia-report-teacher");
    let teacher = create_teacher(&mut sc, "D-301");
    let small = create_course(&mut sc, "SEM401", Some(&teacher));
    let large = create_course(&mut sc, "SEM402", Some(&teacher));
    let ana = create_student(&mut sc, "U910", "Ana", "Ríos");

    enroll(&mut sc, &small, &[&ana]);
    let small_sessions = create_sessions(&mut sc, &small, &["2025-04-01", "2025-04-02"]);
    for s in &small_sessions {
        mark(&mut sc, s, &ana, "present");
    }
    enroll(&mut sc, &large, &[&ana]);
    let large_sessions = create_sessions(
        &mut sc,
        &large,
        &["2025-04-03", "2025-04-04", "2025-04-07", "2025-04-08", "2025-04-09", "2025-04-10"],
    );
    mark(&mut sc, &large_sessions[0], &ana, "present");

    let overview = sc.ok(
        "reports.teacherOverview",
        json!({ "teacherId": teacher, "period": PERIOD }),
    );
    assert_eq!(i64_at(&overview, "/studentCount"), 2);
    assert_eq!(
        overview.get("courses").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );
    assert_eq!(str_at(&overview, "/courses/0/courseAttendance/status"), "OPTIMO");
    assert_eq!(i64_at(&overview, "/markDistribution/recorded"), 3);
    assert_eq!(f64_at(&overview, "/markDistribution/present"), 100.0);
    assert_eq!(i64_at(&overview, "/courses/1/markDistribution/recorded"), 1);
    // 3 of 8, where the mean of 100% and 16.67% would be 58.33%.
    assert_eq!(i64_at(&overview, "/overallAttendance/effectiveAttendance"), 3);
    assert!((f64_at(&overview, "/overallAttendance/percentage") - 37.5).abs() < 1e-9);

    let other = sc.ok(
        "reports.teacherOverview",
        json!({ "teacherId": teacher, "period": "2024-II" }),
    );
    assert_eq!(str_at(&other, "/overallAttendance/status"), "SIN_DATOS");

    drop(sc);
    let _ = std::fs::remove_dir_all(workspace);
}
