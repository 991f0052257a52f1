use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every this many tardies or justified absences count as one attendance.
pub const CREDIT_RATIO: i64 = 3;

pub const OPTIMO_MIN_PERCENT: f64 = 85.0;
pub const ALERTA_MIN_PERCENT: f64 = 70.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInputError {
    #[error("{field} must be >= 0 (got {value})")]
    NegativeCount { field: &'static str, value: i64 },
    #[error("got {evaluations} evaluations but {weights} weights")]
    LengthMismatch { evaluations: usize, weights: usize },
    #[error("{field} is too large")]
    Overflow { field: &'static str },
}

impl InvalidInputError {
    pub fn code(&self) -> &'static str {
        "invalid_input"
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            InvalidInputError::NegativeCount { field, value } => {
                serde_json::json!({ "field": field, "value": value })
            }
            InvalidInputError::LengthMismatch {
                evaluations,
                weights,
            } => serde_json::json!({ "evaluations": evaluations, "weights": weights }),
            InvalidInputError::Overflow { field } => serde_json::json!({ "field": field }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[serde(rename = "OPTIMO")]
    Optimo,
    #[serde(rename = "ALERTA")]
    Alerta,
    #[serde(rename = "CRITICO")]
    Critico,
    #[serde(rename = "SIN_DATOS")]
    SinDatos,
}

impl AttendanceStatus {
    /// Tier for a percentage of a period that has classes.
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= OPTIMO_MIN_PERCENT {
            AttendanceStatus::Optimo
        } else if percentage >= ALERTA_MIN_PERCENT {
            AttendanceStatus::Alerta
        } else {
            AttendanceStatus::Critico
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Optimo => "OPTIMO",
            AttendanceStatus::Alerta => "ALERTA",
            AttendanceStatus::Critico => "CRITICO",
            AttendanceStatus::SinDatos => "SIN_DATOS",
        }
    }

    /// Accented label shown to users. Display only; never parsed back into a tier
    /// except through `parse`, which accepts every spelling.
    pub fn label(self) -> &'static str {
        match self {
            AttendanceStatus::Optimo => "ÓPTIMO",
            AttendanceStatus::Alerta => "ALERTA",
            AttendanceStatus::Critico => "CRÍTICO",
            AttendanceStatus::SinDatos => "SIN DATOS",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let folded: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                'Ó' | 'ó' => 'O',
                'Í' | 'í' => 'I',
                ' ' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match folded.as_str() {
            "OPTIMO" => Some(AttendanceStatus::Optimo),
            "ALERTA" => Some(AttendanceStatus::Alerta),
            "CRITICO" => Some(AttendanceStatus::Critico),
            "SIN_DATOS" => Some(AttendanceStatus::SinDatos),
            _ => None,
        }
    }

    pub fn alert_message(self) -> Option<&'static str> {
        match self {
            AttendanceStatus::Critico => Some(
                "Has superado el 30% de inasistencias. Estás en riesgo de desaprobar el curso por faltas.",
            ),
            AttendanceStatus::Alerta => Some(
                "Tienes entre 15% y 29.99% de inasistencias. Mantente atento a tu asistencia.",
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseAttendanceCounters {
    pub total_classes: i64,
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub justified: i64,
}

impl CourseAttendanceCounters {
    pub fn validate(&self) -> Result<(), InvalidInputError> {
        for (field, value) in [
            ("totalClasses", self.total_classes),
            ("present", self.present),
            ("absent", self.absent),
            ("late", self.late),
            ("justified", self.justified),
        ] {
            if value < 0 {
                return Err(InvalidInputError::NegativeCount { field, value });
            }
        }
        Ok(())
    }

    pub fn late_credits(&self) -> i64 {
        self.late / CREDIT_RATIO
    }

    pub fn justified_credits(&self) -> i64 {
        self.justified / CREDIT_RATIO
    }

    /// Adds `other` field by field; `self` is left unchanged on overflow.
    pub fn add(&mut self, other: &CourseAttendanceCounters) -> Result<(), InvalidInputError> {
        *self = CourseAttendanceCounters {
            total_classes: checked_sum("totalClasses", [self.total_classes, other.total_classes])?,
            present: checked_sum("present", [self.present, other.present])?,
            absent: checked_sum("absent", [self.absent, other.absent])?,
            late: checked_sum("late", [self.late, other.late])?,
            justified: checked_sum("justified", [self.justified, other.justified])?,
        };
        Ok(())
    }
}

/// Sum of counts, or `Overflow` naming `field` when it leaves the `i64` range.
pub fn checked_sum(
    field: &'static str,
    values: impl IntoIterator<Item = i64>,
) -> Result<i64, InvalidInputError> {
    values.into_iter().try_fold(0i64, |acc, v| {
        acc.checked_add(v).ok_or(InvalidInputError::Overflow { field })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvaluation {
    pub effective_attendance: i64,
    pub percentage: f64,
    pub status: AttendanceStatus,
}

impl AttendanceEvaluation {
    pub const NO_DATA: AttendanceEvaluation = AttendanceEvaluation {
        effective_attendance: 0,
        percentage: 0.0,
        status: AttendanceStatus::SinDatos,
    };

    /// Share of the period not covered by effective attendance, floored at 0.
    pub fn absence_percentage(&self) -> f64 {
        if self.status == AttendanceStatus::SinDatos {
            return 0.0;
        }
        (100.0 - self.percentage).max(0.0)
    }

    /// Percentage clamped to 0..=100 for progress bars. The raw value stays in
    /// `percentage`.
    pub fn display_percentage(&self) -> f64 {
        self.percentage.clamp(0.0, 100.0)
    }
}

/// Percentage and tier for `effective_attendance` out of `total_classes`.
fn classify(effective_attendance: i64, total_classes: i64) -> AttendanceEvaluation {
    if total_classes <= 0 {
        return AttendanceEvaluation::NO_DATA;
    }
    // Multiply before dividing so exact tier boundaries (e.g. 17/20) land on 85.0.
    let percentage = (effective_attendance as f64 * 100.0) / total_classes as f64;
    AttendanceEvaluation {
        effective_attendance,
        percentage,
        status: AttendanceStatus::from_percentage(percentage),
    }
}

pub fn evaluate(
    counters: &CourseAttendanceCounters,
) -> Result<AttendanceEvaluation, InvalidInputError> {
    counters.validate()?;
    if counters.total_classes == 0 {
        return Ok(AttendanceEvaluation::NO_DATA);
    }
    let effective = checked_sum(
        "effectiveAttendance",
        [
            counters.present,
            counters.late_credits(),
            counters.justified_credits(),
        ],
    )?;
    Ok(classify(effective, counters.total_classes))
}

/// Rolls several courses into one figure by summing effective attendance and
/// planned classes. `weights[i]` is the `totalClasses` behind `evaluations[i]`.
pub fn aggregate(
    evaluations: &[AttendanceEvaluation],
    weights: &[i64],
) -> Result<AttendanceEvaluation, InvalidInputError> {
    if evaluations.len() != weights.len() {
        return Err(InvalidInputError::LengthMismatch {
            evaluations: evaluations.len(),
            weights: weights.len(),
        });
    }
    for (ev, w) in evaluations.iter().zip(weights) {
        if *w < 0 {
            return Err(InvalidInputError::NegativeCount {
                field: "totalClasses",
                value: *w,
            });
        }
        if ev.effective_attendance < 0 {
            return Err(InvalidInputError::NegativeCount {
                field: "effectiveAttendance",
                value: ev.effective_attendance,
            });
        }
    }
    let total_effective = checked_sum(
        "effectiveAttendance",
        evaluations.iter().map(|ev| ev.effective_attendance),
    )?;
    let total_planned = checked_sum("totalClasses", weights.iter().copied())?;
    Ok(classify(total_effective, total_planned))
}

/// Rounds half away from zero to `decimals` places for report output.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    (x * f).round() / f
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub optimo: usize,
    pub alerta: usize,
    pub critico: usize,
    pub sin_datos: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Optimo => self.optimo += 1,
            AttendanceStatus::Alerta => self.alerta += 1,
            AttendanceStatus::Critico => self.critico += 1,
            AttendanceStatus::SinDatos => self.sin_datos += 1,
        }
    }
}
