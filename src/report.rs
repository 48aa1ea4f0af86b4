use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::metrics::round_to;
use crate::models::{
    ClassAverages, ClassReport, Grade, HealthRecord, ReportRecord, Student, StudentReport,
};
use crate::trend;

pub fn build_student_report(
    student: Student,
    mut records: Vec<HealthRecord>,
    generated_at: DateTime<Utc>,
) -> StudentReport {
    records.sort_by_key(|record| record.date);
    let trends = trend::compute_trend(&records);

    let records = records
        .into_iter()
        .map(|record| {
            let bmi = record.bmi().map(|bmi| round_to(bmi, 2));
            let status = record.bmi_status();
            ReportRecord {
                record,
                bmi,
                status,
            }
        })
        .collect();

    StudentReport {
        student,
        records,
        trends,
        generated_at,
    }
}

/// Averages each student's most recent record across the class. Older
/// records do not contribute, and a student whose latest record has no valid
/// BMI is not counted.
pub fn class_averages(reports: &[StudentReport]) -> Option<(usize, ClassAverages)> {
    let mut total_height = 0.0;
    let mut total_weight = 0.0;
    let mut total_bmi = 0.0;
    let mut count = 0usize;

    for report in reports {
        let Some(latest) = report.latest() else {
            continue;
        };
        let (Some(height), Some(weight), Some(bmi)) =
            (latest.record.height_cm, latest.record.weight_kg, latest.bmi)
        else {
            continue;
        };

        total_height += height;
        total_weight += weight;
        total_bmi += bmi;
        count += 1;
    }

    if count == 0 {
        return None;
    }

    let n = count as f64;
    Some((
        count,
        ClassAverages {
            average_height: round_to(total_height / n, 2),
            average_weight: round_to(total_weight / n, 2),
            average_bmi: round_to(total_bmi / n, 2),
        },
    ))
}

pub fn build_class_report(
    grade: Grade,
    students: Vec<StudentReport>,
    generated_at: DateTime<Utc>,
) -> Result<ClassReport> {
    if students.is_empty() {
        return Err(Error::NoData(format!(
            "No students found in grade {grade}. Please add students before generating a report."
        )));
    }

    let Some((student_count, class_averages)) = class_averages(&students) else {
        return Err(Error::NoData(format!(
            "Unable to generate report. No valid health records found for students in grade {grade}."
        )));
    };

    Ok(ClassReport {
        grade,
        student_count,
        class_averages,
        students,
        generated_at,
    })
}

fn format_optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value:.1}{unit}"),
        None => "N/A".to_string(),
    }
}

pub fn render_class_report(report: &ClassReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Grade {} Health Report", report.grade);
    let _ = writeln!(
        output,
        "Generated {} for {} students with measurements",
        report.generated_at.format("%Y-%m-%d %H:%M UTC"),
        report.student_count
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Class Averages");
    let _ = writeln!(
        output,
        "- Height: {:.2} cm",
        report.class_averages.average_height
    );
    let _ = writeln!(
        output,
        "- Weight: {:.2} kg",
        report.class_averages.average_weight
    );
    let _ = writeln!(output, "- BMI: {:.2}", report.class_averages.average_bmi);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students");

    let mut students: Vec<&StudentReport> = report.students.iter().collect();
    students.sort_by(|a, b| {
        a.student
            .last_name
            .to_lowercase()
            .cmp(&b.student.last_name.to_lowercase())
    });

    for student in students {
        match student.latest() {
            Some(latest) => {
                let _ = writeln!(
                    output,
                    "- {} (section {}): {}, {}, BMI {} ({})",
                    student.student.full_name(),
                    student.student.section,
                    format_optional(latest.record.height_cm, " cm"),
                    format_optional(latest.record.weight_kg, " kg"),
                    format_optional(latest.bmi, ""),
                    latest.status
                );
            }
            None => {
                let _ = writeln!(
                    output,
                    "- {} (section {}): no measurements recorded",
                    student.student.full_name(),
                    student.student.section
                );
            }
        }
    }

    output
}

pub fn render_student_report(report: &StudentReport) -> String {
    let mut output = String::new();
    let student = &report.student;

    let _ = writeln!(output, "# Health Report: {}", student.full_name());
    let _ = writeln!(
        output,
        "Grade {}, section {} (generated {})",
        student.grade,
        student.section,
        report.generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Progress");

    if report.records.len() < 2 {
        let _ = writeln!(output, "Not enough measurements to show a trend.");
    } else {
        let _ = writeln!(
            output,
            "- Height change: {:+.2} cm",
            report.trends.height_change
        );
        let _ = writeln!(
            output,
            "- Weight change: {:+.2} kg",
            report.trends.weight_change
        );
        let _ = writeln!(output, "- BMI change: {:+.2}", report.trends.bmi_change);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Measurements");

    if report.records.is_empty() {
        let _ = writeln!(output, "No measurements recorded.");
    } else {
        for entry in report.records.iter().rev() {
            let _ = write!(
                output,
                "- {}: {}, {}, BMI {} ({})",
                entry.record.date.format("%Y-%m-%d"),
                format_optional(entry.record.height_cm, " cm"),
                format_optional(entry.record.weight_kg, " kg"),
                format_optional(entry.bmi, ""),
                entry.status
            );
            match entry.record.notes.as_deref() {
                Some(notes) if !notes.trim().is_empty() => {
                    let _ = writeln!(output, " - {}", notes.trim());
                }
                _ => {
                    let _ = writeln!(output);
                }
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Gender;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn student(last_name: &str) -> Student {
        Student {
            id: Uuid::new_v4(),
            student_number: format!("S-{last_name}"),
            first_name: "Sam".to_string(),
            last_name: last_name.to_string(),
            grade: Grade::Three,
            section: "A".to_string(),
            gender: Gender::Unknown,
            birth_date: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    /// History whose latest record has BMI `latest` at height 100 cm,
    /// preceded by `older` records with a very different BMI.
    fn report_with_latest(latest: f64, older: usize) -> StudentReport {
        let student = student("Reyes");
        let mut records: Vec<HealthRecord> = (0..older)
            .map(|i| {
                HealthRecord::new(student.id, 100.0, 35.0, now() - Duration::days(60 + i as i64))
            })
            .collect();
        records.push(HealthRecord::new(student.id, 100.0, latest, now() - Duration::days(1)));
        build_student_report(student, records, now())
    }

    #[test]
    fn student_report_sorts_ascending_with_trends() {
        let student = student("Cruz");
        let records = vec![
            HealthRecord::new(student.id, 152.0, 42.0, now() - Duration::days(1)),
            HealthRecord::new(student.id, 150.0, 40.0, now() - Duration::days(90)),
        ];
        let report = build_student_report(student, records, now());
        assert!(report.records[0].record.date < report.records[1].record.date);
        assert_eq!(report.trends.height_change, 2.0);
        assert_eq!(report.trends.weight_change, 2.0);
        assert_eq!(report.records[0].bmi, Some(17.8));
    }

    #[test]
    fn class_average_uses_only_latest_records() {
        let reports = vec![
            report_with_latest(20.0, 3),
            report_with_latest(22.0, 0),
            report_with_latest(24.0, 7),
        ];
        let report = build_class_report(Grade::Three, reports, now()).unwrap();
        assert_eq!(report.student_count, 3);
        assert_eq!(report.class_averages.average_bmi, 22.0);
        assert_eq!(report.class_averages.average_weight, 22.0);
        assert_eq!(report.class_averages.average_height, 100.0);
    }

    #[test]
    fn students_without_records_are_not_counted() {
        let reports = vec![
            report_with_latest(20.0, 0),
            build_student_report(student("Lim"), Vec::new(), now()),
        ];
        let report = build_class_report(Grade::Three, reports, now()).unwrap();
        assert_eq!(report.student_count, 1);
        assert_eq!(report.students.len(), 2);
        assert_eq!(report.class_averages.average_bmi, 20.0);
    }

    #[test]
    fn empty_grade_is_no_data() {
        let err = build_class_report(Grade::Five, Vec::new(), now()).unwrap_err();
        assert!(matches!(err, Error::NoData(ref msg) if msg.contains("grade 5")));
    }

    #[test]
    fn grade_without_valid_records_is_no_data() {
        let reports = vec![build_student_report(student("Lim"), Vec::new(), now())];
        let err = build_class_report(Grade::Five, reports, now()).unwrap_err();
        assert!(matches!(err, Error::NoData(_)));
    }

    #[test]
    fn renders_markdown_sections() {
        let report = build_class_report(Grade::Three, vec![report_with_latest(20.0, 1)], now())
            .unwrap();
        let markdown = render_class_report(&report);
        assert!(markdown.starts_with("# Grade 3 Health Report"));
        assert!(markdown.contains("- BMI: 20.00"));
        assert!(markdown.contains("Sam Reyes (section A)"));

        let student = render_student_report(&report.students[0]);
        assert!(student.contains("## Progress"));
        assert!(student.contains("- Weight change: -15.00 kg"));
    }

    #[test]
    fn renders_notes_and_missing_values() {
        let student = student("Ono");
        let mut record = HealthRecord::new(student.id, 130.0, 28.0, now()).with_notes("after lunch");
        record.weight_kg = None;
        let report = build_student_report(student, vec![record], now());
        let markdown = render_student_report(&report);
        assert!(markdown.contains("N/A"));
        assert!(markdown.contains(" - after lunch"));
        assert!(markdown.contains("Not enough measurements"));
    }
}
