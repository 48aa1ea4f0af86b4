use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Grade {
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
}

impl Grade {
    pub const ALL: [Grade; 6] = [
        Grade::One,
        Grade::Two,
        Grade::Three,
        Grade::Four,
        Grade::Five,
        Grade::Six,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::One => "1",
            Grade::Two => "2",
            Grade::Three => "3",
            Grade::Four => "4",
            Grade::Five => "5",
            Grade::Six => "6",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "1" => Ok(Grade::One),
            "2" => Ok(Grade::Two),
            "3" => Ok(Grade::Three),
            "4" => Ok(Grade::Four),
            "5" => Ok(Grade::Five),
            "6" => Ok(Grade::Six),
            other => Err(format!("unknown grade '{other}', expected 1-6")),
        }
    }
}

impl TryFrom<String> for Grade {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Grade> for String {
    fn from(grade: Grade) -> Self {
        grade.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Gender {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Gender::Male,
            "female" | "f" => Gender::Female,
            _ => Gender::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    /// School-issued identifier, distinct from the store id.
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub grade: Grade,
    pub section: String,
    pub gender: Gender,
    pub birth_date: Option<NaiveDate>,
}

impl Student {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn age_on(&self, today: NaiveDate) -> Option<i32> {
        self.birth_date
            .and_then(|birth_date| metrics::age_on(birth_date, today))
    }

    pub fn age(&self) -> Option<i32> {
        metrics::calculate_age(self.birth_date)
    }
}

/// Registration details for a student, with an optional first measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStudent {
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub grade: Grade,
    pub section: String,
    pub gender: Gender,
    pub birth_date: Option<NaiveDate>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
}

/// A single height/weight measurement. Height and weight are optional because
/// documents coming back from the store are not guaranteed to carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub date: DateTime<Utc>,
    pub notes: Option<String>,
}

impl HealthRecord {
    pub fn new(student_id: Uuid, height_cm: f64, weight_kg: f64, date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            height_cm: Some(height_cm),
            weight_kg: Some(weight_kg),
            date,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn bmi(&self) -> Option<f64> {
        match (self.weight_kg, self.height_cm) {
            (Some(weight), Some(height)) => metrics::calculate_bmi(weight, height),
            _ => None,
        }
    }

    pub fn bmi_status(&self) -> BmiStatus {
        metrics::classify_bmi_status(self.bmi())
    }

    /// Height, or 0 when the record has no usable value.
    pub fn height_or_zero(&self) -> f64 {
        usable(self.height_cm)
    }

    pub fn weight_or_zero(&self) -> f64 {
        usable(self.weight_kg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub record: HealthRecord,
    /// Set when the measurement is outside the usual range for the student's age.
    pub warning: Option<String>,
}

fn usable(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BmiStatus {
    SeverelyUnderweight,
    Underweight,
    Normal,
    Overweight,
    ObeseClassI,
    ObeseClassII,
    ObeseClassIII,
    Invalid,
}

impl BmiStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BmiStatus::SeverelyUnderweight => "Severely Underweight",
            BmiStatus::Underweight => "Underweight",
            BmiStatus::Normal => "Normal",
            BmiStatus::Overweight => "Overweight",
            BmiStatus::ObeseClassI => "Obese Class I",
            BmiStatus::ObeseClassII => "Obese Class II",
            BmiStatus::ObeseClassIII => "Obese Class III",
            BmiStatus::Invalid => "Enter valid height/weight",
        }
    }

    /// Coarse grouping used by the student list filter.
    pub fn nutrition_group(&self) -> Option<NutritionGroup> {
        match self {
            BmiStatus::SeverelyUnderweight | BmiStatus::Underweight => {
                Some(NutritionGroup::Underweight)
            }
            BmiStatus::Normal => Some(NutritionGroup::Normal),
            BmiStatus::Overweight
            | BmiStatus::ObeseClassI
            | BmiStatus::ObeseClassII
            | BmiStatus::ObeseClassIII => Some(NutritionGroup::Overweight),
            BmiStatus::Invalid => None,
        }
    }
}

impl fmt::Display for BmiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NutritionGroup {
    Normal,
    Underweight,
    Overweight,
}

/// A health record joined with the owning student's section and name, as
/// needed by the grade dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub record: HealthRecord,
    pub section: Option<String>,
    pub student_name: String,
    pub gender: Gender,
}

impl GradeRecord {
    pub fn for_student(student: &Student, record: HealthRecord) -> Self {
        let section = Some(student.section.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            record,
            section,
            student_name: student.full_name(),
            gender: student.gender,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub height_change: f64,
    pub weight_change: f64,
    pub bmi_change: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BmiTrend {
    pub change: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionCounts {
    pub normal: usize,
    pub underweight: usize,
    pub overweight: usize,
}

impl NutritionCounts {
    pub fn total(&self) -> usize {
        self.normal + self.underweight + self.overweight
    }

    pub fn record(&mut self, group: NutritionGroup) {
        match group {
            NutritionGroup::Normal => self.normal += 1,
            NutritionGroup::Underweight => self.underweight += 1,
            NutritionGroup::Overweight => self.overweight += 1,
        }
    }
}

/// Whole-number percentages for each nutrition group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutritionPercentages {
    pub normal: u32,
    pub underweight: u32,
    pub overweight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NutritionCategories {
    pub counts: NutritionCounts,
    pub percentages: NutritionPercentages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyPoint {
    pub year: i32,
    pub month: u32,
    pub label: String,
    pub average_height: f64,
    pub average_weight: f64,
    pub average_bmi: f64,
    pub record_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallAverages {
    pub average_height: f64,
    pub average_weight: f64,
    pub average_bmi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSummary {
    pub name: String,
    pub count: usize,
    pub normal: usize,
    pub underweight: usize,
    pub overweight: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDashboard {
    pub monthly_series: Vec<MonthlyPoint>,
    pub overall_averages: OverallAverages,
    pub nutrition_categories: NutritionCategories,
    pub sections: Vec<SectionSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassAverages {
    pub average_height: f64,
    pub average_weight: f64,
    pub average_bmi: f64,
}

/// A record as it appears in a printed report, with its BMI fixed at the
/// time the report was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub record: HealthRecord,
    pub bmi: Option<f64>,
    pub status: BmiStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentReport {
    pub student: Student,
    pub records: Vec<ReportRecord>,
    pub trends: TrendSummary,
    pub generated_at: DateTime<Utc>,
}

impl StudentReport {
    pub fn latest(&self) -> Option<&ReportRecord> {
        self.records.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    pub grade: Grade,
    pub student_count: usize,
    pub class_averages: ClassAverages,
    pub students: Vec<StudentReport>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentMetrics {
    pub latest_record: Option<HealthRecord>,
    pub bmi: Option<f64>,
    pub status: BmiStatus,
    pub percentile: String,
    pub bmi_trend: Option<BmiTrend>,
}

/// One day's food intake as logged by the student. Missing amounts are 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionLog {
    pub id: Uuid,
    pub student_id: Uuid,
    pub date: DateTime<Utc>,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

impl NutritionLog {
    pub fn new(
        student_id: Uuid,
        date: DateTime<Utc>,
        calories: f64,
        protein: f64,
        carbs: f64,
        fat: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            date,
            calories,
            protein,
            carbs,
            fat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseLog {
    pub id: Uuid,
    pub student_id: Uuid,
    pub date: DateTime<Utc>,
    pub minutes: f64,
    pub calories_burned: f64,
    pub activity_type: String,
}

impl ExerciseLog {
    pub const UNSPECIFIED_ACTIVITY: &'static str = "Not specified";

    pub fn new(
        student_id: Uuid,
        date: DateTime<Utc>,
        minutes: f64,
        calories_burned: f64,
        activity_type: &str,
    ) -> Self {
        let activity_type = match activity_type.trim() {
            "" => Self::UNSPECIFIED_ACTIVITY.to_string(),
            other => other.to_string(),
        };
        Self {
            id: Uuid::new_v4(),
            student_id,
            date,
            minutes,
            calories_burned,
            activity_type,
        }
    }
}

/// Recent nutrition and exercise logs, oldest first, with their daily
/// averages and the combined goal progress percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub nutrition_logs: Vec<NutritionLog>,
    pub exercise_logs: Vec<ExerciseLog>,
    pub average_calories: i64,
    pub average_exercise_minutes: i64,
    pub goal_progress: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub name: String,
    pub payload: Option<serde_json::Value>,
}

impl SyncEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload),
        }
    }
}
