use crate::grading::round_off_2_decimals;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Sick,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Sick => "sick",
            AttendanceStatus::Excused => "excused",
        }
    }

    pub fn parse(s: &str) -> Option<AttendanceStatus> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            "sick" => Some(AttendanceStatus::Sick),
            "excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total_days: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub sick: usize,
    pub excused: usize,
    pub percentage: f64,
}

pub fn attendance_percentage(present_days: usize, total_days: usize) -> f64 {
    if total_days == 0 {
        return 0.0;
    }
    round_off_2_decimals(present_days as f64 / total_days as f64 * 100.0)
}

/// Only `present` days count toward the percentage; `late` does not.
pub fn attendance_summary<I>(statuses: I) -> AttendanceSummary
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut s = AttendanceSummary::default();
    for status in statuses {
        s.total_days += 1;
        match status {
            AttendanceStatus::Present => s.present += 1,
            AttendanceStatus::Absent => s.absent += 1,
            AttendanceStatus::Late => s.late += 1,
            AttendanceStatus::Sick => s.sick += 1,
            AttendanceStatus::Excused => s.excused += 1,
        }
    }
    s.percentage = attendance_percentage(s.present, s.total_days);
    s
}
