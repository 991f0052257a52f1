//! Counter loading and per-student rollups over the attendance tables.
//!
//! `totalClasses` for a course is the number of sessions scheduled for it
//! (optionally within one `YYYY-MM` month); each mark counter is the number of
//! the student's records with that status. Unmarked sessions count towards the
//! total only, so `present+absent+late+justified <= totalClasses` holds for
//! anything loaded here.

use crate::calc::{self, AttendanceEvaluation, CourseAttendanceCounters};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttendanceMark {
    Present,
    Absent,
    Late,
    Justified,
}

impl AttendanceMark {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "late" => Some(Self::Late),
            "justified" => Some(Self::Justified),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Justified => "justified",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub student_id: String,
    pub student_code: String,
    pub name: String,
    pub career: Option<String>,
    pub current_semester: Option<i64>,
    pub academic_status: String,
}

pub fn load_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentInfo>> {
    conn.query_row(
        "SELECT s.id, s.student_code, s.first_name, s.last_name, c.name, s.semester, s.academic_status
         FROM students s
         LEFT JOIN careers c ON c.id = s.career_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(StudentInfo {
                student_id: r.get(0)?,
                student_code: r.get(1)?,
                name: format!("{} {}", first, last),
                career: r.get(4)?,
                current_semester: r.get(5)?,
                academic_status: r.get(6)?,
            })
        },
    )
    .optional()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseInfo {
    pub course_id: String,
    pub code: String,
    pub name: String,
    pub period: String,
    pub credits: i64,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub room: Option<String>,
    pub schedule: Option<String>,
}

const COURSE_COLUMNS: &str = "c.id, c.code, c.name, c.period, c.credits, c.teacher_id,
    CASE WHEN t.id IS NULL THEN NULL ELSE t.first_name || ' ' || t.last_name END,
    c.room, c.schedule";

fn course_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CourseInfo> {
    Ok(CourseInfo {
        course_id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        period: r.get(3)?,
        credits: r.get(4)?,
        teacher_id: r.get(5)?,
        teacher_name: r.get(6)?,
        room: r.get(7)?,
        schedule: r.get(8)?,
    })
}

pub fn load_course(conn: &Connection, course_id: &str) -> rusqlite::Result<Option<CourseInfo>> {
    let sql = format!(
        "SELECT {}
         FROM courses c
         LEFT JOIN teachers t ON t.id = c.teacher_id
         WHERE c.id = ?",
        COURSE_COLUMNS
    );
    conn.query_row(&sql, [course_id], course_from_row).optional()
}

pub fn enrolled_courses(
    conn: &Connection,
    student_id: &str,
    period: &str,
) -> rusqlite::Result<Vec<CourseInfo>> {
    let sql = format!(
        "SELECT {}
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         LEFT JOIN teachers t ON t.id = c.teacher_id
         WHERE e.student_id = ? AND c.period = ?
         ORDER BY c.code",
        COURSE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((student_id, period), course_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn teacher_courses(
    conn: &Connection,
    teacher_id: &str,
    period: Option<&str>,
) -> rusqlite::Result<Vec<CourseInfo>> {
    let sql = format!(
        "SELECT {}
         FROM courses c
         LEFT JOIN teachers t ON t.id = c.teacher_id
         WHERE c.teacher_id = ?1 AND (?2 IS NULL OR c.period = ?2)
         ORDER BY c.period, c.code",
        COURSE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((teacher_id, period), course_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counters for one student in one course. `month` is `YYYY-MM` or `None` for the
/// whole period.
pub fn load_counters(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    month: Option<&str>,
) -> rusqlite::Result<CourseAttendanceCounters> {
    let total_classes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM class_sessions
         WHERE course_id = ?1 AND (?2 IS NULL OR substr(class_date, 1, 7) = ?2)",
        (course_id, month),
        |r| r.get(0),
    )?;

    let mut counters = CourseAttendanceCounters {
        total_classes,
        ..Default::default()
    };
    let mut stmt = conn.prepare(
        "SELECT ar.status, COUNT(*)
         FROM attendance_records ar
         JOIN class_sessions cs ON cs.id = ar.session_id
         WHERE cs.course_id = ?1
           AND ar.student_id = ?2
           AND (?3 IS NULL OR substr(cs.class_date, 1, 7) = ?3)
         GROUP BY ar.status",
    )?;
    let rows = stmt
        .query_map((course_id, student_id, month), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (status, n) in rows {
        match AttendanceMark::parse(&status) {
            Some(AttendanceMark::Present) => counters.present += n,
            Some(AttendanceMark::Absent) => counters.absent += n,
            Some(AttendanceMark::Late) => counters.late += n,
            Some(AttendanceMark::Justified) => counters.justified += n,
            None => log::warn!("ignoring unknown attendance status {:?}", status),
        }
    }
    Ok(counters)
}

#[derive(Debug, Clone)]
pub struct CourseRollup {
    pub course: CourseInfo,
    pub counters: CourseAttendanceCounters,
    pub evaluation: AttendanceEvaluation,
}

fn evaluate_loaded(counters: &CourseAttendanceCounters) -> anyhow::Result<AttendanceEvaluation> {
    calc::evaluate(counters).context("stored attendance counters are inconsistent")
}

pub fn student_course_rollups(
    conn: &Connection,
    student_id: &str,
    period: &str,
) -> anyhow::Result<Vec<CourseRollup>> {
    let courses = enrolled_courses(conn, student_id, period)?;
    let mut out = Vec::with_capacity(courses.len());
    for course in courses {
        let counters = load_counters(conn, student_id, &course.course_id, None)?;
        let evaluation = evaluate_loaded(&counters)?;
        out.push(CourseRollup {
            course,
            counters,
            evaluation,
        });
    }
    Ok(out)
}

/// Semester-level figure: effective attendance and classes summed across courses.
pub fn combine(rollups: &[CourseRollup]) -> anyhow::Result<AttendanceEvaluation> {
    let evaluations: Vec<AttendanceEvaluation> = rollups.iter().map(|r| r.evaluation).collect();
    let weights: Vec<i64> = rollups.iter().map(|r| r.counters.total_classes).collect();
    Ok(calc::aggregate(&evaluations, &weights)?)
}

#[derive(Debug, Clone)]
pub struct MonthRollup {
    pub year: i32,
    pub month_number: u32,
    pub courses: Vec<CourseRollup>,
    pub total: CourseAttendanceCounters,
    pub evaluation: AttendanceEvaluation,
}

impl MonthRollup {
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month_number)
    }
}

const MONTH_NAMES: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

pub fn month_name(month_number: u32) -> &'static str {
    MONTH_NAMES
        .get(month_number.saturating_sub(1) as usize)
        .copied()
        .unwrap_or("")
}

fn parse_month_key(key: &str) -> Option<(i32, u32)> {
    let (y, m) = key.split_once('-')?;
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year, month))
}

/// Month-by-month history for the student's courses in `period`, oldest first.
/// Only courses with sessions in a month appear in that month.
pub fn monthly_history(
    conn: &Connection,
    student_id: &str,
    period: &str,
    year: Option<i32>,
) -> anyhow::Result<Vec<MonthRollup>> {
    let courses = enrolled_courses(conn, student_id, period)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT substr(class_date, 1, 7)
         FROM class_sessions
         WHERE course_id = ?
         ORDER BY 1",
    )?;

    let mut months: Vec<String> = Vec::new();
    let mut course_months: Vec<(CourseInfo, Vec<String>)> = Vec::new();
    for course in courses {
        let keys = stmt
            .query_map([&course.course_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for k in &keys {
            if !months.contains(k) {
                months.push(k.clone());
            }
        }
        course_months.push((course, keys));
    }
    months.sort();

    let mut out = Vec::new();
    for key in months {
        let Some((y, m)) = parse_month_key(&key) else {
            log::warn!("skipping session month with unexpected format {:?}", key);
            continue;
        };
        if year.is_some_and(|want| want != y) {
            continue;
        }
        let mut rollups = Vec::new();
        let mut total = CourseAttendanceCounters::default();
        for (course, keys) in &course_months {
            if !keys.contains(&key) {
                continue;
            }
            let counters = load_counters(conn, student_id, &course.course_id, Some(&key))?;
            let evaluation = evaluate_loaded(&counters)?;
            total.add(&counters)?;
            rollups.push(CourseRollup {
                course: course.clone(),
                counters,
                evaluation,
            });
        }
        let evaluation = combine(&rollups)?;
        out.push(MonthRollup {
            year: y,
            month_number: m,
            courses: rollups,
            total,
            evaluation,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_parse_round_trips_known_values() {
        for m in [
            AttendanceMark::Present,
            AttendanceMark::Absent,
            AttendanceMark::Late,
            AttendanceMark::Justified,
        ] {
            assert_eq!(AttendanceMark::parse(m.as_str()), Some(m));
        }
        assert_eq!(AttendanceMark::parse(" LATE "), Some(AttendanceMark::Late));
        assert_eq!(AttendanceMark::parse("excused"), None);
    }

    #[test]
    fn month_names_are_one_based() {
        assert_eq!(month_name(1), "Enero");
        assert_eq!(month_name(12), "Diciembre");
        assert_eq!(month_name(0), "");
        assert_eq!(parse_month_key("2025-03"), Some((2025, 3)));
        assert_eq!(parse_month_key("2025-13"), None);
    }
}
