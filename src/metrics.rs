use chrono::{Datelike, NaiveDate, Utc};

use crate::models::BmiStatus;

/// BMI from weight (kg) and height (cm), rounded to one decimal.
///
/// Returns `None` for zero, negative or non-finite inputs.
pub fn calculate_bmi(weight_kg: f64, height_cm: f64) -> Option<f64> {
    if !is_positive(weight_kg) || !is_positive(height_cm) {
        return None;
    }

    let height_m = height_cm / 100.0;
    Some(round_to(weight_kg / (height_m * height_m), 1))
}

/// BMI without the one-decimal rounding, used where the dashboard buckets
/// records by raw value.
pub fn raw_bmi(weight_kg: f64, height_cm: f64) -> Option<f64> {
    if !is_positive(weight_kg) || !is_positive(height_cm) {
        return None;
    }

    let height_m = height_cm / 100.0;
    Some(weight_kg / (height_m * height_m))
}

pub fn calculate_age(birth_date: Option<NaiveDate>) -> Option<i32> {
    birth_date.and_then(|birth_date| age_on(birth_date, Utc::now().date_naive()))
}

/// Whole years between `birth_date` and `today`. A person only turns N on or
/// after the anniversary of their birth date.
pub fn age_on(birth_date: NaiveDate, today: NaiveDate) -> Option<i32> {
    if birth_date > today {
        return None;
    }

    let mut age = today.year() - birth_date.year();
    if (today.month(), today.day()) < (birth_date.month(), birth_date.day()) {
        age -= 1;
    }
    Some(age)
}

pub fn classify_bmi_status(bmi: Option<f64>) -> BmiStatus {
    let bmi = match bmi {
        Some(value) if value.is_finite() && value > 0.0 => value,
        _ => return BmiStatus::Invalid,
    };

    if bmi < 16.0 {
        BmiStatus::SeverelyUnderweight
    } else if bmi < 18.5 {
        BmiStatus::Underweight
    } else if bmi < 25.0 {
        BmiStatus::Normal
    } else if bmi < 30.0 {
        BmiStatus::Overweight
    } else if bmi < 35.0 {
        BmiStatus::ObeseClassI
    } else if bmi < 40.0 {
        BmiStatus::ObeseClassII
    } else {
        BmiStatus::ObeseClassIII
    }
}

struct AgeBand {
    min_age: i32,
    max_age: i32,
    height: (f64, f64),
    weight: (f64, f64),
    qualifier: &'static str,
}

const AGE_BANDS: [AgeBand; 3] = [
    AgeBand {
        min_age: 2,
        max_age: 9,
        height: (80.0, 150.0),
        weight: (10.0, 50.0),
        qualifier: " for this age",
    },
    AgeBand {
        min_age: 10,
        max_age: 12,
        height: (120.0, 170.0),
        weight: (25.0, 80.0),
        qualifier: " for this age",
    },
    AgeBand {
        min_age: 13,
        max_age: 19,
        height: (140.0, 200.0),
        weight: (35.0, 120.0),
        qualifier: " for this age",
    },
];

const ADULT_BAND: AgeBand = AgeBand {
    min_age: 20,
    max_age: i32::MAX,
    height: (140.0, 250.0),
    weight: (35.0, 150.0),
    qualifier: "",
};

fn band_for(age: Option<i32>) -> &'static AgeBand {
    age.and_then(|age| {
        AGE_BANDS
            .iter()
            .find(|band| age >= band.min_age && age <= band.max_age)
    })
    .unwrap_or(&ADULT_BAND)
}

/// Plausibility check for a measurement against the age band it falls in.
/// Returns a message describing the expected range, or `None` when both
/// height and weight are plausible.
pub fn measurement_warning(weight_kg: f64, height_cm: f64, age: Option<i32>) -> Option<String> {
    let band = band_for(age);
    let (min_h, max_h) = band.height;
    let (min_w, max_w) = band.weight;

    if age.is_none() || !is_positive(height_cm) || height_cm < min_h || height_cm > max_h {
        return Some(format!(
            "Height should be between {min_h}-{max_h} cm{}",
            band.qualifier
        ));
    }

    if !is_positive(weight_kg) || weight_kg < min_w || weight_kg > max_w {
        return Some(format!(
            "Weight should be between {min_w}-{max_w} kg{}",
            band.qualifier
        ));
    }

    None
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
