use crate::metrics::round_to;
use crate::models::HealthRecord;

/// Share of the cohort (in percent, two decimals) whose BMI is at or below
/// `target`. Records without a usable BMI are left out of the cohort; an
/// empty cohort ranks at 0.
pub fn bmi_percentile(target: f64, cohort: &[HealthRecord]) -> f64 {
    let bmis: Vec<f64> = cohort.iter().filter_map(HealthRecord::bmi).collect();
    if bmis.is_empty() {
        return 0.0;
    }

    let below = bmis.iter().filter(|bmi| **bmi <= target).count();
    round_to(below as f64 / bmis.len() as f64 * 100.0, 2)
}

/// Display form of a student's percentile as shown next to their BMI.
pub fn percentile_label(target: Option<f64>, cohort: &[HealthRecord]) -> String {
    let Some(target) = target else {
        return "0.00".to_string();
    };

    if !cohort.iter().any(|record| record.bmi().is_some()) {
        return "0".to_string();
    }

    format!("{:.2}", bmi_percentile(target, cohort))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn cohort(weights: &[f64]) -> Vec<HealthRecord> {
        let student_id = Uuid::new_v4();
        weights
            .iter()
            .map(|weight| HealthRecord::new(student_id, 100.0, *weight, Utc::now()))
            .collect()
    }

    #[test]
    fn ranks_inclusive_of_target() {
        let records = cohort(&[18.0, 20.0, 22.0]);
        assert!((bmi_percentile(20.0, &records) - 66.67).abs() < 1e-9);
        assert_eq!(bmi_percentile(22.0, &records), 100.0);
        assert_eq!(bmi_percentile(10.0, &records), 0.0);
    }

    #[test]
    fn skips_records_without_measurements() {
        let mut records = cohort(&[18.0, 20.0, 22.0, 24.0]);
        records[3].height_cm = None;
        assert_eq!(bmi_percentile(22.0, &records), 100.0);
    }

    #[test]
    fn empty_cohort_is_zero() {
        assert_eq!(bmi_percentile(20.0, &[]), 0.0);
        assert_eq!(percentile_label(Some(20.0), &[]), "0");
    }

    #[test]
    fn label_formats_two_decimals() {
        let records = cohort(&[18.0, 20.0, 22.0]);
        assert_eq!(percentile_label(Some(20.0), &records), "66.67");
        assert_eq!(percentile_label(Some(22.0), &records), "100.00");
        assert_eq!(percentile_label(None, &records), "0.00");
    }
}
