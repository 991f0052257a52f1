use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

pub const LOG_ENV: &str = "ASISTENCIAD_LOG";
pub const WORKSPACE_ENV: &str = "ASISTENCIAD_WORKSPACE";

/// Process-level settings read once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let log_filter = std::env::var(LOG_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        let workspace = std::env::var_os(WORKSPACE_ENV)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Self {
            log_filter,
            workspace,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Attendance,
    Reports,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Attendance, SetupSection::Reports];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::Reports => "reports",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "justificationDeadlineHours": 48,
            "maxBatchAbsences": 10,
            "minBatchDescriptionChars": 10,
            "rejectOutOfDeadline": false,
            "defaultPeriod": "2025-I"
        }),
        SetupSection::Reports => json!({
            "percentageDecimals": 2,
            "clampDisplayPercentage": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "justificationDeadlineHours" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 720)?));
                }
                "maxBatchAbsences" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
                }
                "minBatchDescriptionChars" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 500)?));
                }
                "rejectOutOfDeadline" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "defaultPeriod" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 16)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "percentageDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                "clampDisplayPercentage" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Stored values that no longer validate fall back to defaults.
            if let Err(e) = merge_section_patch(section, &mut current, saved_obj) {
                log::warn!("ignoring stored {} settings: {}", section.name(), e);
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendancePolicy {
    pub justification_deadline_hours: i64,
    pub max_batch_absences: usize,
    pub min_batch_description_chars: usize,
    pub reject_out_of_deadline: bool,
    pub default_period: String,
}

impl AttendancePolicy {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let v = load_section(conn, SetupSection::Attendance)?;
        Ok(Self {
            justification_deadline_hours: v
                .get("justificationDeadlineHours")
                .and_then(|x| x.as_i64())
                .unwrap_or(48),
            max_batch_absences: v
                .get("maxBatchAbsences")
                .and_then(|x| x.as_u64())
                .unwrap_or(10) as usize,
            min_batch_description_chars: v
                .get("minBatchDescriptionChars")
                .and_then(|x| x.as_u64())
                .unwrap_or(10) as usize,
            reject_out_of_deadline: v
                .get("rejectOutOfDeadline")
                .and_then(|x| x.as_bool())
                .unwrap_or(false),
            default_period: v
                .get("defaultPeriod")
                .and_then(|x| x.as_str())
                .unwrap_or("2025-I")
                .to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportPolicy {
    pub percentage_decimals: u32,
    pub clamp_display_percentage: bool,
}

impl ReportPolicy {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let v = load_section(conn, SetupSection::Reports)?;
        Ok(Self {
            percentage_decimals: v
                .get("percentageDecimals")
                .and_then(|x| x.as_u64())
                .unwrap_or(2) as u32,
            clamp_display_percentage: v
                .get("clampDisplayPercentage")
                .and_then(|x| x.as_bool())
                .unwrap_or(true),
        })
    }
}
