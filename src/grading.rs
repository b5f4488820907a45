use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum fraction of `max_marks` a subject needs to be marked passed.
pub const PASS_FRACTION: f64 = 0.33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    F,
    D,
    C,
    #[serde(rename = "C+")]
    CPlus,
    B,
    #[serde(rename = "B+")]
    BPlus,
    A,
    #[serde(rename = "A+")]
    APlus,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive lower bounds, highest first. Anything below the last row is `F`.
pub const GRADE_TABLE: [(f64, Grade); 7] = [
    (90.0, Grade::APlus),
    (80.0, Grade::A),
    (70.0, Grade::BPlus),
    (60.0, Grade::B),
    (50.0, Grade::CPlus),
    (40.0, Grade::C),
    (33.0, Grade::D),
];

pub fn grade_for(percentage: f64) -> Grade {
    GRADE_TABLE
        .iter()
        .find(|(min, _)| percentage >= *min)
        .map(|(_, g)| *g)
        .unwrap_or(Grade::F)
}

/// `round(x * 100) / 100`, halves rounded up.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

pub fn is_pass(marks_obtained: f64, max_marks: f64) -> bool {
    marks_obtained >= max_marks * PASS_FRACTION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    pub subject_id: String,
    pub marks_obtained: f64,
    pub max_marks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGrade {
    pub subject_id: String,
    pub marks_obtained: f64,
    pub max_marks: f64,
    pub percentage: f64,
    pub grade: Grade,
    pub is_pass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedResult {
    pub total_marks: f64,
    pub max_total_marks: f64,
    pub percentage: f64,
    pub overall_grade: Grade,
    pub subjects: Vec<SubjectGrade>,
}

impl GradedResult {
    /// A result passes only when every subject does.
    pub fn is_pass(&self) -> bool {
        self.subjects.iter().all(|s| s.is_pass)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidScoreError {
    #[error("at least one subject score is required")]
    Empty,
    #[error("subject {index}: marks must be finite numbers")]
    NotFinite { index: usize },
    #[error("subject {index}: maxMarks must be at least 1 (got {max_marks})")]
    MaxMarksBelowOne { index: usize, max_marks: f64 },
    #[error("subject {index}: marksObtained must not be negative (got {marks_obtained})")]
    NegativeMarks { index: usize, marks_obtained: f64 },
    #[error("subject {index}: marksObtained {marks_obtained} exceeds maxMarks {max_marks}")]
    MarksAboveMax {
        index: usize,
        marks_obtained: f64,
        max_marks: f64,
    },
}

impl InvalidScoreError {
    pub fn index(&self) -> Option<usize> {
        match self {
            InvalidScoreError::Empty => None,
            InvalidScoreError::NotFinite { index }
            | InvalidScoreError::MaxMarksBelowOne { index, .. }
            | InvalidScoreError::NegativeMarks { index, .. }
            | InvalidScoreError::MarksAboveMax { index, .. } => Some(*index),
        }
    }
}

pub fn validate_scores(scores: &[SubjectScore]) -> Result<(), InvalidScoreError> {
    if scores.is_empty() {
        return Err(InvalidScoreError::Empty);
    }
    for (index, s) in scores.iter().enumerate() {
        if !s.marks_obtained.is_finite() || !s.max_marks.is_finite() {
            return Err(InvalidScoreError::NotFinite { index });
        }
        if s.max_marks < 1.0 {
            return Err(InvalidScoreError::MaxMarksBelowOne {
                index,
                max_marks: s.max_marks,
            });
        }
        if s.marks_obtained < 0.0 {
            return Err(InvalidScoreError::NegativeMarks {
                index,
                marks_obtained: s.marks_obtained,
            });
        }
        if s.marks_obtained > s.max_marks {
            return Err(InvalidScoreError::MarksAboveMax {
                index,
                marks_obtained: s.marks_obtained,
                max_marks: s.max_marks,
            });
        }
    }
    Ok(())
}

pub fn grade_result(scores: &[SubjectScore]) -> Result<GradedResult, InvalidScoreError> {
    validate_scores(scores)?;

    let total_marks: f64 = scores.iter().map(|s| s.marks_obtained).sum();
    let max_total_marks: f64 = scores.iter().map(|s| s.max_marks).sum();
    let percentage = round_off_2_decimals(total_marks / max_total_marks * 100.0);

    let subjects = scores
        .iter()
        .map(|s| {
            // Subject grades use the unrounded percentage.
            let pct = s.marks_obtained / s.max_marks * 100.0;
            SubjectGrade {
                subject_id: s.subject_id.clone(),
                marks_obtained: s.marks_obtained,
                max_marks: s.max_marks,
                percentage: pct,
                grade: grade_for(pct),
                is_pass: is_pass(s.marks_obtained, s.max_marks),
            }
        })
        .collect();

    Ok(GradedResult {
        total_marks,
        max_total_marks,
        percentage,
        overall_grade: grade_for(percentage),
        subjects,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TiePolicy {
    /// Rank is the sorted position; equal percentages get consecutive ranks.
    #[default]
    Sequential,
    /// Equal percentages share a rank and the following rank skips (1, 1, 3).
    Competition,
    /// Equal percentages share a rank without gaps (1, 1, 2).
    Dense,
}

impl TiePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            TiePolicy::Sequential => "sequential",
            TiePolicy::Competition => "competition",
            TiePolicy::Dense => "dense",
        }
    }

    pub fn parse(s: &str) -> Option<TiePolicy> {
        match s {
            "sequential" => Some(TiePolicy::Sequential),
            "competition" => Some(TiePolicy::Competition),
            "dense" => Some(TiePolicy::Dense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ranked<T> {
    pub rank: usize,
    pub total_students: usize,
    pub item: T,
}

/// Orders a cohort by percentage, highest first, and assigns ranks.
///
/// The sort is stable, so members with equal percentages stay in input order.
/// Under [`TiePolicy::Sequential`] they still receive different ranks.
pub fn rank_cohort<T, F>(items: Vec<T>, percentage_of: F, policy: TiePolicy) -> Vec<Ranked<T>>
where
    F: Fn(&T) -> f64,
{
    let total_students = items.len();
    let mut keyed: Vec<(f64, T)> = items.into_iter().map(|it| (percentage_of(&it), it)).collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut out = Vec::with_capacity(total_students);
    let mut prev: Option<(f64, usize)> = None;
    let mut dense_rank = 0usize;
    for (pos, (pct, item)) in keyed.into_iter().enumerate() {
        let tied = prev.map(|(p, _)| p == pct).unwrap_or(false);
        if !tied {
            dense_rank += 1;
        }
        let rank = match policy {
            TiePolicy::Sequential => pos + 1,
            TiePolicy::Competition => match prev {
                Some((_, r)) if tied => r,
                _ => pos + 1,
            },
            TiePolicy::Dense => dense_rank,
        };
        prev = Some((pct, rank));
        out.push(Ranked {
            rank,
            total_students,
            item,
        });
    }
    out
}
