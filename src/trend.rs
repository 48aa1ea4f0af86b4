use crate::metrics::round_to;
use crate::models::{BmiTrend, Direction, HealthRecord, TrendSummary};

/// Latest-minus-earliest deltas over a history sorted ascending by date.
///
/// Fewer than two records yields all-zero deltas. A delta whose endpoint is
/// missing a measurement is reported as zero.
pub fn compute_trend(records: &[HealthRecord]) -> TrendSummary {
    let (first, last) = match (records.first(), records.last()) {
        (Some(first), Some(last)) if records.len() >= 2 => (first, last),
        _ => return TrendSummary::default(),
    };

    TrendSummary {
        height_change: delta(first.height_cm, last.height_cm),
        weight_change: delta(first.weight_kg, last.weight_kg),
        bmi_change: delta(first.bmi(), last.bmi()),
    }
}

fn delta(first: Option<f64>, last: Option<f64>) -> f64 {
    match (first, last) {
        (Some(first), Some(last)) if first.is_finite() && last.is_finite() => {
            round_to(last - first, 2)
        }
        _ => 0.0,
    }
}

/// Direction of BMI between the first and latest valid measurement.
pub fn bmi_direction(records: &[HealthRecord]) -> Option<BmiTrend> {
    let bmis: Vec<f64> = records.iter().filter_map(HealthRecord::bmi).collect();
    if bmis.len() < 2 {
        return None;
    }

    let first = bmis[0];
    let latest = bmis[bmis.len() - 1];
    let change = round_to(latest - first, 1);
    let direction = if change > 0.0 {
        Direction::Up
    } else if change < 0.0 {
        Direction::Down
    } else {
        Direction::Stable
    };

    Some(BmiTrend { change, direction })
}
