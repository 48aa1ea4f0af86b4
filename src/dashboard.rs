//! Month-over-month dashboard aggregation for a grade.
//!
//! Unlike the printable class report, this view averages every record that
//! falls in a calendar month, and the overall figures average the non-empty
//! months rather than the records themselves.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};

use crate::metrics::{self, round_to};
use crate::models::{
    ClassDashboard, GradeRecord, HealthRecord, MonthlyPoint, NutritionCategories, NutritionCounts,
    NutritionGroup, NutritionPercentages, OverallAverages, SectionSummary, Student,
};

pub const SERIES_MONTHS: u32 = 6;

pub fn build_dashboard(records: &[GradeRecord], today: NaiveDate) -> ClassDashboard {
    let mut buckets = month_buckets(today);
    let index: HashMap<(i32, u32), usize> = buckets
        .iter()
        .enumerate()
        .map(|(i, bucket)| ((bucket.year, bucket.month), i))
        .collect();

    for grade_record in records {
        let date = grade_record.record.date.date_naive();
        if let Some(&slot) = index.get(&(date.year(), date.month())) {
            buckets[slot].records.push(&grade_record.record);
        }
    }

    let monthly_series: Vec<MonthlyPoint> = buckets.iter().map(MonthBucket::summarize).collect();
    let overall_averages = overall_averages(&monthly_series);
    let nutrition_categories =
        nutrition_categories(records.iter().map(|grade_record| &grade_record.record));
    let sections = summarize_sections(records);

    log::debug!(
        "Dashboard built from {} records across {} sections",
        records.len(),
        sections.len()
    );

    ClassDashboard {
        monthly_series,
        overall_averages,
        nutrition_categories,
        sections,
    }
}

struct MonthBucket<'a> {
    year: i32,
    month: u32,
    label: String,
    records: Vec<&'a HealthRecord>,
}

impl MonthBucket<'_> {
    fn summarize(&self) -> MonthlyPoint {
        let count = self.records.len();
        let (average_height, average_weight, average_bmi) = if count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let n = count as f64;
            let height: f64 = self.records.iter().map(|r| r.height_or_zero()).sum();
            let weight: f64 = self.records.iter().map(|r| r.weight_or_zero()).sum();
            let bmi: f64 = self.records.iter().filter_map(|r| record_raw_bmi(r)).sum();
            (
                round_to(height / n, 1),
                round_to(weight / n, 1),
                round_to(bmi / n, 1),
            )
        };

        MonthlyPoint {
            year: self.year,
            month: self.month,
            label: self.label.clone(),
            average_height,
            average_weight,
            average_bmi,
            record_count: count,
        }
    }
}

/// The six most recent calendar months, oldest first, ending with the month
/// containing `today`.
fn month_buckets<'a>(today: NaiveDate) -> Vec<MonthBucket<'a>> {
    let first_of_month = today.with_day(1).unwrap_or(today);
    (0..SERIES_MONTHS)
        .rev()
        .filter_map(|back| first_of_month.checked_sub_months(Months::new(back)))
        .map(|start| MonthBucket {
            year: start.year(),
            month: start.month(),
            label: start.format("%b").to_string(),
            records: Vec::new(),
        })
        .collect()
}

fn overall_averages(series: &[MonthlyPoint]) -> OverallAverages {
    OverallAverages {
        average_height: mean_of_non_zero(series.iter().map(|p| p.average_height)),
        average_weight: mean_of_non_zero(series.iter().map(|p| p.average_weight)),
        average_bmi: mean_of_non_zero(series.iter().map(|p| p.average_bmi)),
    }
}

fn mean_of_non_zero(values: impl Iterator<Item = f64>) -> f64 {
    let non_zero: Vec<f64> = values.filter(|v| *v > 0.0).collect();
    if non_zero.is_empty() {
        return 0.0;
    }
    round_to(non_zero.iter().sum::<f64>() / non_zero.len() as f64, 1)
}

fn record_raw_bmi(record: &HealthRecord) -> Option<f64> {
    metrics::raw_bmi(record.weight_or_zero(), record.height_or_zero())
}

/// Dashboard grouping on the unrounded BMI: below 18.5 is underweight,
/// 18.5 through 24.9 inclusive is normal, anything above is overweight.
pub fn dashboard_group(bmi: f64) -> NutritionGroup {
    if bmi < 18.5 {
        NutritionGroup::Underweight
    } else if bmi <= 24.9 {
        NutritionGroup::Normal
    } else {
        NutritionGroup::Overweight
    }
}

pub fn nutrition_categories<'a>(
    records: impl IntoIterator<Item = &'a HealthRecord>,
) -> NutritionCategories {
    let mut counts = NutritionCounts::default();
    for record in records {
        if let Some(bmi) = record_raw_bmi(record) {
            counts.record(dashboard_group(bmi));
        }
    }

    let total = counts.total().max(1) as f64;
    let percent = |count: usize| (count as f64 / total * 100.0).round() as u32;
    let percentages = NutritionPercentages {
        normal: percent(counts.normal),
        underweight: percent(counts.underweight),
        overweight: percent(counts.overweight),
    };

    NutritionCategories {
        counts,
        percentages,
    }
}

/// Per-section record totals and status counts, in order of first appearance.
pub fn summarize_sections(records: &[GradeRecord]) -> Vec<SectionSummary> {
    let mut sections: Vec<SectionSummary> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for grade_record in records {
        let Some(name) = grade_record.section.as_deref() else {
            continue;
        };

        let slot = *positions.entry(name.to_string()).or_insert_with(|| {
            sections.push(SectionSummary {
                name: name.to_string(),
                count: 0,
                normal: 0,
                underweight: 0,
                overweight: 0,
            });
            sections.len() - 1
        });

        let section = &mut sections[slot];
        section.count += 1;
        if let Some(bmi) = record_raw_bmi(&grade_record.record) {
            match dashboard_group(bmi) {
                NutritionGroup::Normal => section.normal += 1,
                NutritionGroup::Underweight => section.underweight += 1,
                NutritionGroup::Overweight => section.overweight += 1,
            }
        }
    }

    sections
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Normal,
    Underweight,
    Overweight,
}

impl StatusFilter {
    fn group(&self) -> Option<NutritionGroup> {
        match self {
            StatusFilter::All => None,
            StatusFilter::Normal => Some(NutritionGroup::Normal),
            StatusFilter::Underweight => Some(NutritionGroup::Underweight),
            StatusFilter::Overweight => Some(NutritionGroup::Overweight),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(StatusFilter::All),
            "normal" => Ok(StatusFilter::Normal),
            "underweight" => Ok(StatusFilter::Underweight),
            "overweight" => Ok(StatusFilter::Overweight),
            other => Err(format!(
                "unknown filter '{other}', expected all, normal, underweight or overweight"
            )),
        }
    }
}

/// Students whose latest record falls in the filter's nutrition group,
/// optionally restricted to one section. `All` keeps every student in the
/// section, including those without records.
pub fn filter_students<'a>(
    students: &'a [Student],
    records: &[HealthRecord],
    filter: StatusFilter,
    section: Option<&str>,
) -> Vec<&'a Student> {
    students
        .iter()
        .filter(|student| section.map_or(true, |wanted| student.section == wanted))
        .filter(|student| {
            let Some(wanted) = filter.group() else {
                return true;
            };

            records
                .iter()
                .filter(|record| record.student_id == student.id)
                .max_by_key(|record| record.date)
                .and_then(|latest| latest.bmi_status().nutrition_group())
                == Some(wanted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gender, Grade};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn grade_record(section: &str, y: i32, m: u32, height: f64, weight: f64) -> GradeRecord {
        let date = Utc.with_ymd_and_hms(y, m, 5, 10, 0, 0).unwrap();
        GradeRecord {
            record: HealthRecord::new(Uuid::new_v4(), height, weight, date),
            section: Some(section.to_string()),
            student_name: "Test Student".to_string(),
            gender: Gender::Unknown,
        }
    }

    fn student(section: &str) -> Student {
        Student {
            id: Uuid::new_v4(),
            student_number: "S-1".to_string(),
            first_name: "Mina".to_string(),
            last_name: "Santos".to_string(),
            grade: Grade::Four,
            section: section.to_string(),
            gender: Gender::Female,
            birth_date: None,
        }
    }

    #[test]
    fn empty_records_yield_six_zero_months() {
        let dashboard = build_dashboard(&[], today());
        assert_eq!(dashboard.monthly_series.len(), 6);
        assert!(dashboard
            .monthly_series
            .iter()
            .all(|p| p.average_height == 0.0 && p.average_weight == 0.0 && p.average_bmi == 0.0));
        assert_eq!(dashboard.nutrition_categories, NutritionCategories::default());
        assert_eq!(dashboard.overall_averages, OverallAverages::default());
        assert!(dashboard.sections.is_empty());
    }

    #[test]
    fn months_run_oldest_to_newest() {
        let dashboard = build_dashboard(&[], today());
        let labels: Vec<&str> = dashboard
            .monthly_series
            .iter()
            .map(|p| p.label.as_str())
            .collect();
        assert_eq!(labels, ["May", "Jun", "Jul", "Aug", "Sep", "Oct"]);
    }

    #[test]
    fn buckets_cross_year_boundary() {
        let jan = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        let dashboard = build_dashboard(&[], jan);
        let first = &dashboard.monthly_series[0];
        assert_eq!((first.year, first.month), (2025, 8));
    }

    #[test]
    fn monthly_means_and_overall_average_of_months() {
        let records = vec![
            grade_record("A", 2026, 10, 100.0, 20.0),
            grade_record("A", 2026, 10, 100.0, 30.0),
            grade_record("B", 2026, 8, 100.0, 16.0),
            // outside the six month window
            grade_record("B", 2025, 1, 100.0, 90.0),
        ];
        let dashboard = build_dashboard(&records, today());

        let october = &dashboard.monthly_series[5];
        assert_eq!(october.record_count, 2);
        assert_eq!(october.average_bmi, 25.0);
        assert_eq!(october.average_weight, 25.0);

        let august = &dashboard.monthly_series[3];
        assert_eq!(august.average_bmi, 16.0);

        // mean of the two non-empty months, not of the three records
        assert_eq!(dashboard.overall_averages.average_bmi, 20.5);
        assert_eq!(dashboard.overall_averages.average_height, 100.0);
    }

    #[test]
    fn missing_measurements_count_as_zero_in_month_means() {
        let mut incomplete = grade_record("A", 2026, 10, 100.0, 20.0);
        incomplete.record.weight_kg = None;
        let records = vec![grade_record("A", 2026, 10, 100.0, 20.0), incomplete];
        let dashboard = build_dashboard(&records, today());
        let october = &dashboard.monthly_series[5];
        assert_eq!(october.average_weight, 10.0);
        assert_eq!(october.average_bmi, 10.0);
        assert_eq!(october.average_height, 100.0);
    }

    #[test]
    fn nutrition_categories_use_dashboard_boundaries() {
        let records = vec![
            grade_record("A", 2026, 10, 100.0, 18.4),
            grade_record("A", 2026, 10, 100.0, 18.5),
            grade_record("A", 2026, 10, 100.0, 24.9),
            grade_record("A", 2026, 10, 100.0, 24.95),
        ];
        let dashboard = build_dashboard(&records, today());
        let categories = dashboard.nutrition_categories;
        assert_eq!(categories.counts.underweight, 1);
        assert_eq!(categories.counts.normal, 2);
        assert_eq!(categories.counts.overweight, 1);
        assert_eq!(categories.percentages.normal, 50);
        assert_eq!(categories.percentages.underweight, 25);
    }

    #[test]
    fn nutrition_categories_cover_every_record_not_only_recent_months() {
        let records = vec![
            grade_record("A", 2020, 1, 100.0, 30.0),
            grade_record("A", 2026, 10, 100.0, 20.0),
            grade_record("A", 2026, 10, 100.0, 21.0),
        ];
        let categories = build_dashboard(&records, today()).nutrition_categories;
        assert_eq!(categories.counts.total(), 3);
        assert_eq!(categories.percentages.normal, 67);
        assert_eq!(categories.percentages.overweight, 33);
    }

    #[test]
    fn sections_keep_first_appearance_order() {
        let mut no_weight = grade_record("A", 2026, 10, 100.0, 20.0);
        no_weight.record.weight_kg = None;
        let mut no_section = grade_record("C", 2026, 10, 100.0, 20.0);
        no_section.section = None;
        let records = vec![
            grade_record("B", 2026, 10, 100.0, 17.0),
            grade_record("A", 2026, 10, 100.0, 20.0),
            no_weight,
            no_section,
            grade_record("B", 2026, 9, 100.0, 28.0),
        ];
        let sections = summarize_sections(&records);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "B");
        assert_eq!(sections[0].count, 2);
        assert_eq!(sections[0].underweight, 1);
        assert_eq!(sections[0].overweight, 1);
        assert_eq!(sections[1].name, "A");
        assert_eq!(sections[1].count, 2);
        assert_eq!(sections[1].normal, 1);
    }

    #[test]
    fn filter_uses_latest_record_and_section() {
        let lean = student("A");
        let heavy = student("A");
        let other_section = student("B");
        let unmeasured = student("A");
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
        let records = vec![
            HealthRecord::new(lean.id, 100.0, 30.0, old),
            HealthRecord::new(lean.id, 100.0, 17.0, new),
            HealthRecord::new(heavy.id, 100.0, 36.0, new),
            HealthRecord::new(other_section.id, 100.0, 16.5, new),
        ];
        let students = vec![lean.clone(), heavy.clone(), other_section, unmeasured];

        let under = filter_students(&students, &records, StatusFilter::Underweight, Some("A"));
        assert_eq!(under.len(), 1);
        assert_eq!(under[0].id, lean.id);

        let over = filter_students(&students, &records, StatusFilter::Overweight, None);
        assert_eq!(over.len(), 1);
        assert_eq!(over[0].id, heavy.id);

        let all_a = filter_students(&students, &records, StatusFilter::All, Some("A"));
        assert_eq!(all_a.len(), 3);
    }

    #[test]
    fn status_filter_parses_case_insensitively() {
        assert_eq!("Overweight".parse::<StatusFilter>(), Ok(StatusFilter::Overweight));
        assert!("obese".parse::<StatusFilter>().is_err());
    }
}
