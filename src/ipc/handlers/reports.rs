use crate::calc::{self, AttendanceEvaluation, CourseAttendanceCounters, StatusCounts};
use crate::config::ReportPolicy;
use crate::ipc::helpers::{
    aggregate_json, evaluation_json, exists, get_optional_str, get_required_str,
    load_report_policy, percent, with_db, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, CourseInfo};
use rusqlite::Connection;
use serde_json::json;

struct StudentLine {
    student_id: String,
    student_code: String,
    name: String,
    counters: CourseAttendanceCounters,
    evaluation: AttendanceEvaluation,
}

struct CourseReport {
    lines: Vec<StudentLine>,
    counts: StatusCounts,
    overall: AttendanceEvaluation,
    total_classes: i64,
    marks: CourseAttendanceCounters,
}

/// Share of recorded marks per kind, in percent. Unmarked sessions are not
/// part of the base.
fn mark_distribution(
    policy: &ReportPolicy,
    marks: &CourseAttendanceCounters,
) -> Result<serde_json::Value, HandlerErr> {
    let recorded = calc::checked_sum(
        "recorded",
        [marks.present, marks.late, marks.absent, marks.justified],
    )?;
    let share = |n: i64| {
        if recorded == 0 {
            0.0
        } else {
            percent(policy, n as f64 * 100.0 / recorded as f64)
        }
    };
    Ok(json!({
        "recorded": recorded,
        "present": share(marks.present),
        "late": share(marks.late),
        "absent": share(marks.absent),
        "justified": share(marks.justified)
    }))
}

fn build_course_report(conn: &Connection, course_id: &str) -> Result<CourseReport, HandlerErr> {
    let roster = {
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.student_code, s.last_name || ', ' || s.first_name
                 FROM enrollments e
                 JOIN students s ON s.id = e.student_id
                 WHERE e.course_id = ?
                 ORDER BY s.last_name, s.first_name, s.student_code",
            )
            .map_err(HandlerErr::query)?;
        let rows = stmt
            .query_map([course_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        rows
    };

    let mut lines = Vec::with_capacity(roster.len());
    let mut counts = StatusCounts::default();
    let mut marks = CourseAttendanceCounters::default();
    for (student_id, student_code, name) in roster {
        let counters = rollup::load_counters(conn, &student_id, course_id, None)
            .map_err(HandlerErr::query)?;
        let evaluation = calc::evaluate(&counters)?;
        counts.record(evaluation.status);
        marks.add(&counters)?;
        lines.push(StudentLine {
            student_id,
            student_code,
            name,
            counters,
            evaluation,
        });
    }

    let evaluations: Vec<AttendanceEvaluation> = lines.iter().map(|l| l.evaluation).collect();
    let weights: Vec<i64> = lines.iter().map(|l| l.counters.total_classes).collect();
    let overall = calc::aggregate(&evaluations, &weights)?;
    Ok(CourseReport {
        lines,
        counts,
        overall,
        total_classes: calc::checked_sum("totalClasses", weights)?,
        marks,
    })
}

fn require_course(conn: &Connection, course_id: &str) -> Result<CourseInfo, HandlerErr> {
    rollup::load_course(conn, course_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("course"))
}

fn line_json(policy: &ReportPolicy, line: &StudentLine) -> serde_json::Value {
    json!({
        "studentId": line.student_id,
        "studentCode": line.student_code,
        "displayName": line.name,
        "attendance": evaluation_json(policy, &line.counters, &line.evaluation)
    })
}

fn reports_course_attendance(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let course = require_course(conn, &course_id)?;
    let policy = load_report_policy(conn)?;
    let report = build_course_report(conn, &course_id)?;
    let session_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM class_sessions WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let students: Vec<serde_json::Value> =
        report.lines.iter().map(|l| line_json(&policy, l)).collect();
    Ok(json!({
        "course": course,
        "sessionCount": session_count,
        "students": students,
        "statusCounts": report.counts,
        "markDistribution": mark_distribution(&policy, &report.marks)?,
        "courseAttendance": aggregate_json(&policy, report.total_classes, &report.overall)
    }))
}

fn reports_teacher_overview(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let period = get_optional_str(params, "period")?;
    if !exists(conn, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("teacher"));
    }
    let policy = load_report_policy(conn)?;
    let courses = rollup::teacher_courses(conn, &teacher_id, period.as_deref())
        .map_err(HandlerErr::query)?;

    let mut out = Vec::with_capacity(courses.len());
    let mut all_evaluations: Vec<AttendanceEvaluation> = Vec::new();
    let mut all_weights: Vec<i64> = Vec::new();
    let mut counts = StatusCounts::default();
    let mut marks = CourseAttendanceCounters::default();
    let mut student_count = 0usize;
    for course in courses {
        let report = build_course_report(conn, &course.course_id)?;
        for line in &report.lines {
            all_evaluations.push(line.evaluation);
            all_weights.push(line.counters.total_classes);
            counts.record(line.evaluation.status);
        }
        student_count += report.lines.len();
        marks.add(&report.marks)?;
        out.push(json!({
            "course": course,
            "studentCount": report.lines.len(),
            "statusCounts": report.counts,
            "markDistribution": mark_distribution(&policy, &report.marks)?,
            "courseAttendance": aggregate_json(&policy, report.total_classes, &report.overall)
        }));
    }
    let overall = calc::aggregate(&all_evaluations, &all_weights)?;
    let total_classes = calc::checked_sum("totalClasses", all_weights)?;
    Ok(json!({
        "teacherId": teacher_id,
        "period": period,
        "courses": out,
        "studentCount": student_count,
        "statusCounts": counts,
        "markDistribution": mark_distribution(&policy, &marks)?,
        "overallAttendance": aggregate_json(&policy, total_classes, &overall)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.courseAttendance" => Some(with_db(state, req, reports_course_attendance)),
        "reports.teacherOverview" => Some(with_db(state, req, reports_teacher_overview)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReportPolicy {
        ReportPolicy {
            percentage_decimals: 1,
            clamp_display_percentage: true,
        }
    }

    #[test]
    fn distribution_is_relative_to_recorded_marks() {
        let marks = CourseAttendanceCounters {
            total_classes: 20,
            present: 6,
            absent: 1,
            late: 2,
            justified: 0,
        };
        let d = mark_distribution(&policy(), &marks).expect("distribution");
        assert_eq!(d["recorded"], 9);
        assert_eq!(d["present"], 66.7);
        assert_eq!(d["late"], 22.2);
        assert_eq!(d["absent"], 11.1);
        assert_eq!(d["justified"], 0.0);
    }

    #[test]
    fn no_marks_gives_zero_shares() {
        let d = mark_distribution(&policy(), &CourseAttendanceCounters::default())
            .expect("distribution");
        assert_eq!(d["recorded"], 0);
        assert_eq!(d["present"], 0.0);
    }
}
