#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_asistenciad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("ASISTENCIAD_WORKSPACE")
        .spawn()
        .expect("spawn asistenciad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn write_line(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, raw: &str) -> serde_json::Value {
    writeln!(stdin, "{}", raw).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", raw);
    serde_json::from_str(line.trim()).expect("parse response json")
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    let value = write_line(stdin, reader, &payload.to_string());
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// A running sidecar with auto-numbered request ids.
pub struct Sidecar {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        Self {
            child,
            stdin: Some(stdin),
            reader,
            next_id: 0,
        }
    }

    /// Spawns a sidecar with a fresh workspace already selected.
    pub fn with_workspace(prefix: &str) -> (Self, PathBuf) {
        let workspace = temp_dir(prefix);
        let mut sc = Self::spawn();
        sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        (sc, workspace)
    }

    pub fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let stdin = self.stdin.as_mut().expect("sidecar stdin open");
        request(stdin, &mut self.reader, &id, method, params)
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.call(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Calls `method` expecting an error response; returns the error code.
    pub fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn raw(&mut self, line: &str) -> serde_json::Value {
        let stdin = self.stdin.as_mut().expect("sidecar stdin open");
        write_line(stdin, &mut self.reader, line)
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

pub fn str_at(v: &serde_json::Value, pointer: &str) -> String {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, v))
        .to_string()
}

pub fn i64_at(v: &serde_json::Value, pointer: &str) -> i64 {
    v.pointer(pointer)
        .and_then(|x| x.as_i64())
        .unwrap_or_else(|| panic!("missing integer at {} in {}", pointer, v))
}

pub fn f64_at(v: &serde_json::Value, pointer: &str) -> f64 {
    v.pointer(pointer)
        .and_then(|x| x.as_f64())
        .unwrap_or_else(|| panic!("missing number at {} in {}", pointer, v))
}

pub const PERIOD: &str = "2025-I";

pub fn create_teacher(sc: &mut Sidecar, code: &str) -> String {
    let t = sc.ok(
        "teachers.create",
        json!({ "teacherCode": code, "firstName": "Rosa", "lastName": "Quispe" }),
    );
    str_at(&t, "/teacherId")
}

pub fn create_student(sc: &mut Sidecar, code: &str, first: &str, last: &str) -> String {
    let s = sc.ok(
        "students.create",
        json!({ "studentCode": code, "firstName": first, "lastName": last, "semester": 5 }),
    );
    str_at(&s, "/studentId")
}

pub fn create_course(sc: &mut Sidecar, code: &str, teacher_id: Option<&str>) -> String {
    let c = sc.ok(
        "courses.create",
        json!({
            "code": code,
            "name": format!("Curso {}", code),
            "period": PERIOD,
            "credits": 3,
            "teacherId": teacher_id,
            "room": "A-101",
            "schedule": "Lun 08:00-10:00"
        }),
    );
    str_at(&c, "/courseId")
}

pub fn enroll(sc: &mut Sidecar, course_id: &str, student_ids: &[&str]) {
    sc.ok(
        "enrollments.set",
        json!({ "courseId": course_id, "studentIds": student_ids }),
    );
}

pub fn create_sessions(sc: &mut Sidecar, course_id: &str, dates: &[&str]) -> Vec<String> {
    dates
        .iter()
        .map(|d| {
            let s = sc.ok(
                "sessions.create",
                json!({ "courseId": course_id, "classDate": d, "classTime": "08:00" }),
            );
            str_at(&s, "/sessionId")
        })
        .collect()
}

pub fn mark(sc: &mut Sidecar, session_id: &str, student_id: &str, status: &str) {
    sc.ok(
        "attendance.take",
        json!({ "sessionId": session_id, "marks": [{ "studentId": student_id, "status": status }] }),
    );
}

/// Attendance record id of one student's mark in a session.
pub fn attendance_id(sc: &mut Sidecar, session_id: &str, student_id: &str) -> String {
    let open = sc.ok("attendance.sessionOpen", json!({ "sessionId": session_id }));
    let students = open
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let row = students
        .iter()
        .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        .unwrap_or_else(|| panic!("student {} not on roster", student_id));
    str_at(row, "/attendanceId")
}
