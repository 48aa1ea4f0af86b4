//! Daily nutrition and exercise summaries for a student.

use crate::models::{ActivitySummary, ExerciseLog, NutritionLog};

pub const CALORIE_GOAL: f64 = 2000.0;

pub const EXERCISE_GOAL_MINUTES: f64 = 30.0;

/// Number of most recent logs of each kind a summary covers.
pub const DEFAULT_LOG_DAYS: usize = 7;

/// Whole-calorie mean over the logs; 0 when there are none.
pub fn average_calories(logs: &[NutritionLog]) -> i64 {
    rounded_mean(logs.iter().map(|log| log.calories))
}

pub fn average_exercise_minutes(logs: &[ExerciseLog]) -> i64 {
    rounded_mean(logs.iter().map(|log| log.minutes))
}

/// Mean of two percentages: how close the calorie average is to
/// [`CALORIE_GOAL`] (100 at the goal, falling by the relative distance in
/// either direction) and how much of [`EXERCISE_GOAL_MINUTES`] is reached,
/// capped at 100.
pub fn goal_progress(average_calories: i64, average_exercise_minutes: i64) -> i64 {
    let calorie_gap = (average_calories as f64 - CALORIE_GOAL) / CALORIE_GOAL * 100.0;
    let calorie_progress = (100.0 - calorie_gap.abs()).clamp(0.0, 100.0);
    let exercise_progress =
        (average_exercise_minutes as f64 / EXERCISE_GOAL_MINUTES * 100.0).min(100.0);

    ((calorie_progress + exercise_progress) / 2.0).round() as i64
}

pub fn summarize(nutrition_logs: Vec<NutritionLog>, exercise_logs: Vec<ExerciseLog>) -> ActivitySummary {
    let average_calories = average_calories(&nutrition_logs);
    let average_exercise_minutes = average_exercise_minutes(&exercise_logs);

    ActivitySummary {
        goal_progress: goal_progress(average_calories, average_exercise_minutes),
        nutrition_logs,
        exercise_logs,
        average_calories,
        average_exercise_minutes,
    }
}

fn rounded_mean(values: impl Iterator<Item = f64>) -> i64 {
    let (sum, count) = values
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return 0;
    }
    (sum / count as f64).round() as i64
}
