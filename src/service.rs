//! Screen-facing entry points.
//!
//! Every read goes through the cache first and recomputes from the store on a
//! miss. Every successful mutation publishes `SYNC_DATA`; the service's own
//! subscription marks all of its cache entries stale, and recomputation
//! happens on the next read.

use std::sync::Arc;

use uuid::Uuid;

use crate::activity;
use crate::cache::{CacheKey, CacheLayer, Clock, SystemClock, TtlPolicy};
use crate::config::Config;
use crate::dashboard::{self, StatusFilter};
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{
    ActivitySummary, ClassDashboard, ClassReport, ExerciseLog, Grade, GradeRecord, HealthRecord,
    NewStudent, NutritionLog, RecordOutcome, Student, StudentMetrics, StudentReport, SyncEvent,
};
use crate::percentile;
use crate::report;
use crate::store::{self, HealthStore, StoreError};
use crate::sync::{Subscription, SyncEventBus, SYNC_DATA};
use crate::trend;

#[derive(Debug, Clone)]
enum CachedView {
    History(Arc<Vec<HealthRecord>>),
    Dashboard(Arc<ClassDashboard>),
    ClassReport(Arc<ClassReport>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub ttl: TtlPolicy,
    pub batch_size: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            batch_size: store::DEFAULT_BATCH_SIZE,
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            ttl: config.ttl_policy(),
            batch_size: config.batch_size(),
        }
    }
}

/// Result of registering a student. The student exists once this is
/// returned; the initial measurement may still have been rejected by the
/// store, in which case `record_error` says why.
#[derive(Debug, Clone, PartialEq)]
pub struct AddedStudent {
    pub student: Student,
    pub initial_record: Option<RecordOutcome>,
    pub record_error: Option<StoreError>,
}

pub struct HealthService {
    store: Arc<dyn HealthStore>,
    cache: Arc<CacheLayer<CachedView>>,
    bus: Arc<SyncEventBus>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    subscription: Subscription,
}

impl HealthService {
    pub fn new(store: Arc<dyn HealthStore>, bus: Arc<SyncEventBus>, settings: ServiceSettings) -> Self {
        Self::with_clock(store, bus, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn HealthStore>,
        bus: Arc<SyncEventBus>,
        settings: ServiceSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(CacheLayer::new(settings.ttl, Arc::clone(&clock)));

        let cache_for_sync = Arc::clone(&cache);
        let subscription = bus.subscribe(SYNC_DATA, move |_event| {
            cache_for_sync.invalidate_all();
        });

        Self {
            store,
            cache,
            bus,
            clock,
            batch_size: settings.batch_size.max(1),
            subscription,
        }
    }

    pub fn bus(&self) -> &Arc<SyncEventBus> {
        &self.bus
    }

    /// Registers `handler` for `SYNC_DATA`. Pass the returned subscription to
    /// [`SyncEventBus::unsubscribe`] when the consumer goes away.
    pub fn on_data_changed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(SYNC_DATA, handler)
    }

    pub async fn get_student_metrics(&self, student_id: Uuid) -> Result<StudentMetrics> {
        self.require_student(student_id).await?;
        let history = self.student_history(student_id).await?;
        let latest_record = history.last().cloned();
        let bmi = latest_record.as_ref().and_then(HealthRecord::bmi);

        Ok(StudentMetrics {
            status: metrics::classify_bmi_status(bmi),
            percentile: percentile::percentile_label(bmi, &history),
            bmi_trend: trend::bmi_direction(&history),
            latest_record,
            bmi,
        })
    }

    pub async fn get_student_report(&self, student_id: Uuid) -> Result<StudentReport> {
        let student = self.require_student(student_id).await?;
        let history = self.student_history(student_id).await?;
        Ok(report::build_student_report(
            student,
            history.to_vec(),
            self.clock.now(),
        ))
    }

    pub async fn get_class_dashboard(&self, grade: Grade) -> Result<Arc<ClassDashboard>> {
        let key = CacheKey::Dashboard(grade);
        if let Some(CachedView::Dashboard(dashboard)) = self.cache.get(&key) {
            return Ok(dashboard);
        }

        let students = store::fetch_students_by_grade(self.store.as_ref(), grade).await?;
        let histories =
            store::fetch_histories_in_batches(self.store.as_ref(), &students, self.batch_size)
                .await;

        let records: Vec<GradeRecord> = histories
            .into_iter()
            .flat_map(|(student, records)| {
                records
                    .into_iter()
                    .map(move |record| GradeRecord::for_student(student, record))
            })
            .collect();
        log::info!(
            "Recomputed grade {} dashboard from {} records of {} students",
            grade,
            records.len(),
            students.len()
        );

        let dashboard = Arc::new(dashboard::build_dashboard(
            &records,
            self.clock.now().date_naive(),
        ));
        self.cache
            .set(key, CachedView::Dashboard(Arc::clone(&dashboard)));
        Ok(dashboard)
    }

    /// Report built from each student's latest record. A grade with no
    /// students, or none with a valid record, is [`Error::NoData`].
    pub async fn get_class_report(&self, grade: Grade) -> Result<Arc<ClassReport>> {
        let key = CacheKey::ClassReport(grade);
        if let Some(CachedView::ClassReport(report)) = self.cache.get(&key) {
            return Ok(report);
        }

        let students = store::fetch_students_by_grade(self.store.as_ref(), grade).await?;
        let now = self.clock.now();
        let reports: Vec<StudentReport> =
            store::fetch_histories_in_batches(self.store.as_ref(), &students, self.batch_size)
                .await
                .into_iter()
                .map(|(student, records)| report::build_student_report(student.clone(), records, now))
                .collect();

        let report = Arc::new(report::build_class_report(grade, reports, now)?);
        log::info!(
            "Recomputed grade {} report for {} students",
            grade,
            report.student_count
        );
        self.cache
            .set(key, CachedView::ClassReport(Arc::clone(&report)));
        Ok(report)
    }

    pub async fn list_students(
        &self,
        grade: Grade,
        filter: StatusFilter,
        section: Option<&str>,
    ) -> Result<Vec<Student>> {
        let students = store::fetch_students_by_grade(self.store.as_ref(), grade).await?;
        if filter == StatusFilter::All {
            return Ok(dashboard::filter_students(&students, &[], filter, section)
                .into_iter()
                .cloned()
                .collect());
        }

        let records: Vec<HealthRecord> =
            store::fetch_histories_in_batches(self.store.as_ref(), &students, self.batch_size)
                .await
                .into_iter()
                .flat_map(|(_, records)| records)
                .collect();

        Ok(dashboard::filter_students(&students, &records, filter, section)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn find_student_by_number(&self, student_number: &str) -> Result<Option<Student>> {
        let wanted = student_number.trim();
        Ok(store::fetch_all_students(self.store.as_ref())
            .await?
            .into_iter()
            .find(|student| student.student_number == wanted))
    }

    /// Registers a student and, when both values are given, records their
    /// first measurement. `SYNC_DATA` is published as soon as the student is
    /// stored, even if the measurement then fails.
    pub async fn add_student(&self, new_student: NewStudent) -> Result<AddedStudent> {
        if let (Some(height), Some(weight)) = (new_student.height_cm, new_student.weight_kg) {
            validate_measurement(height, weight)?;
        }

        let student = Student {
            id: Uuid::new_v4(),
            student_number: new_student.student_number.trim().to_string(),
            first_name: new_student.first_name.trim().to_string(),
            last_name: new_student.last_name.trim().to_string(),
            grade: new_student.grade,
            section: new_student.section.trim().to_string(),
            gender: new_student.gender,
            birth_date: new_student.birth_date,
        };
        self.store.insert_student(&student).await?;

        let mut added = AddedStudent {
            student,
            initial_record: None,
            record_error: None,
        };
        if let (Some(height), Some(weight)) = (new_student.height_cm, new_student.weight_kg) {
            match self
                .insert_measurement(&added.student, height, weight, None)
                .await
            {
                Ok(outcome) => added.initial_record = Some(outcome),
                Err(err) => {
                    log::warn!(
                        "Student {} added but initial measurement failed: {}",
                        added.student.id,
                        err
                    );
                    added.record_error = Some(err);
                }
            }
        }
        log::info!("Added student {}", added.student.id);

        self.notify_changed();
        Ok(added)
    }

    pub async fn update_student(&self, student: &Student) -> Result<()> {
        if !self.store.update_student(student).await? {
            return Err(Error::StudentNotFound(student.id));
        }
        self.notify_changed();
        Ok(())
    }

    pub async fn delete_student(&self, student_id: Uuid) -> Result<()> {
        if !self.store.delete_student(student_id).await? {
            return Err(Error::StudentNotFound(student_id));
        }
        log::info!("Deleted student {student_id} and their health records");
        self.notify_changed();
        Ok(())
    }

    /// Records a measurement taken now. The BMI and status are derived from
    /// height and weight, which must both be positive. An implausible
    /// measurement for the student's age is still stored but comes back with
    /// a warning.
    pub async fn add_health_record(
        &self,
        student_id: Uuid,
        height_cm: f64,
        weight_kg: f64,
        notes: Option<String>,
    ) -> Result<RecordOutcome> {
        validate_measurement(height_cm, weight_kg)?;
        let student = self.require_student(student_id).await?;
        let outcome = self
            .insert_measurement(&student, height_cm, weight_kg, notes)
            .await?;

        self.notify_changed();
        Ok(outcome)
    }

    /// Returns false when no record had that id; nothing is published then.
    pub async fn delete_health_record(&self, record_id: Uuid) -> Result<bool> {
        let removed = self.store.delete_record(record_id).await?;
        if removed {
            self.notify_changed();
        }
        Ok(removed)
    }

    /// The student's last week of nutrition and exercise logs with their
    /// averages and goal progress.
    pub async fn get_activity_summary(&self, student_id: Uuid) -> Result<ActivitySummary> {
        self.require_student(student_id).await?;
        let nutrition =
            store::fetch_nutrition_logs(self.store.as_ref(), student_id, activity::DEFAULT_LOG_DAYS)
                .await?;
        let exercise =
            store::fetch_exercise_logs(self.store.as_ref(), student_id, activity::DEFAULT_LOG_DAYS)
                .await?;
        Ok(activity::summarize(nutrition, exercise))
    }

    pub async fn add_nutrition_log(&self, entry: NutritionLog) -> Result<()> {
        if ![entry.calories, entry.protein, entry.carbs, entry.fat]
            .iter()
            .all(|value| value.is_finite() && *value >= 0.0)
        {
            return Err(Error::InvalidMeasurement(
                "nutrition amounts must be zero or more".to_string(),
            ));
        }
        self.require_student(entry.student_id).await?;
        self.store.insert_nutrition_log(&entry).await?;
        log::info!("Logged {} kcal for student {}", entry.calories, entry.student_id);

        self.notify_changed();
        Ok(())
    }

    pub async fn add_exercise_log(&self, entry: ExerciseLog) -> Result<()> {
        if !(entry.minutes.is_finite() && entry.minutes >= 0.0)
            || !(entry.calories_burned.is_finite() && entry.calories_burned >= 0.0)
        {
            return Err(Error::InvalidMeasurement(
                "exercise minutes and calories must be zero or more".to_string(),
            ));
        }
        self.require_student(entry.student_id).await?;
        self.store.insert_exercise_log(&entry).await?;
        log::info!(
            "Logged {} minutes of {} for student {}",
            entry.minutes,
            entry.activity_type,
            entry.student_id
        );

        self.notify_changed();
        Ok(())
    }

    async fn insert_measurement(
        &self,
        student: &Student,
        height_cm: f64,
        weight_kg: f64,
        notes: Option<String>,
    ) -> std::result::Result<RecordOutcome, StoreError> {
        let now = self.clock.now();
        let age = student.age_on(now.date_naive());
        let warning = metrics::measurement_warning(weight_kg, height_cm, age);
        if let Some(message) = &warning {
            log::warn!("Measurement for student {}: {}", student.id, message);
        }

        let mut record = HealthRecord::new(student.id, height_cm, weight_kg, now);
        record.notes = notes.filter(|notes| !notes.trim().is_empty());
        self.store.insert_record(&record).await?;
        log::info!(
            "Recorded measurement for student {} (BMI {:?}, {})",
            student.id,
            record.bmi(),
            record.bmi_status()
        );

        Ok(RecordOutcome { record, warning })
    }

    async fn student_history(&self, student_id: Uuid) -> Result<Arc<Vec<HealthRecord>>> {
        let key = CacheKey::StudentHistory(student_id);
        if let Some(CachedView::History(history)) = self.cache.get(&key) {
            return Ok(history);
        }

        let history = Arc::new(store::fetch_student_records(self.store.as_ref(), student_id).await?);
        self.cache.set(key, CachedView::History(Arc::clone(&history)));
        Ok(history)
    }

    async fn require_student(&self, student_id: Uuid) -> Result<Student> {
        self.store
            .get_student(student_id)
            .await?
            .ok_or(Error::StudentNotFound(student_id))
    }

    fn notify_changed(&self) {
        self.bus.publish(SYNC_DATA, None);
    }
}

fn validate_measurement(height_cm: f64, weight_kg: f64) -> Result<()> {
    if !metrics::is_positive(height_cm) || !metrics::is_positive(weight_kg) {
        return Err(Error::InvalidMeasurement(format!(
            "height {height_cm} cm and weight {weight_kg} kg must both be positive"
        )));
    }
    Ok(())
}

impl Drop for HealthService {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::models::Gender;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        service: HealthService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
        ));
        let service = HealthService::with_clock(
            store.clone(),
            Arc::new(SyncEventBus::default()),
            ServiceSettings::default(),
            clock.clone(),
        );
        Fixture {
            store,
            clock,
            service,
        }
    }

    fn new_student(number: &str, last_name: &str) -> NewStudent {
        NewStudent {
            student_number: number.to_string(),
            first_name: "Kai".to_string(),
            last_name: last_name.to_string(),
            grade: Grade::Four,
            section: "A".to_string(),
            gender: Gender::Male,
            birth_date: chrono::NaiveDate::from_ymd_opt(2016, 6, 1),
            height_cm: Some(130.0),
            weight_kg: Some(28.0),
        }
    }

    #[tokio::test]
    async fn student_metrics_use_latest_record() {
        let f = fixture();
        let student = f.service.add_student(new_student("1", "Tan")).await.unwrap().student;
        f.clock.advance(Duration::days(30));
        f.service
            .add_health_record(student.id, 132.0, 30.0, None)
            .await
            .unwrap();

        let metrics = f.service.get_student_metrics(student.id).await.unwrap();
        assert_eq!(metrics.bmi, Some(17.2));
        assert_eq!(metrics.status, crate::models::BmiStatus::Underweight);
        assert_eq!(metrics.percentile, "100.00");
        assert_eq!(
            metrics.bmi_trend.map(|t| t.direction),
            Some(crate::models::Direction::Up)
        );
    }

    #[tokio::test]
    async fn student_without_records_has_invalid_status() {
        let f = fixture();
        let mut registration = new_student("2", "Go");
        registration.height_cm = None;
        let student = f.service.add_student(registration).await.unwrap().student;

        let metrics = f.service.get_student_metrics(student.id).await.unwrap();
        assert!(metrics.latest_record.is_none());
        assert_eq!(metrics.status, crate::models::BmiStatus::Invalid);
        assert_eq!(metrics.percentile, "0.00");
    }

    #[tokio::test]
    async fn history_is_cached_until_sync() {
        let f = fixture();
        let student = f.service.add_student(new_student("3", "Li")).await.unwrap().student;

        f.service.get_student_metrics(student.id).await.unwrap();
        f.service.get_student_metrics(student.id).await.unwrap();
        assert_eq!(f.store.record_query_count(), 1);

        f.service.bus().publish(SYNC_DATA, None);
        f.service.get_student_metrics(student.id).await.unwrap();
        assert_eq!(f.store.record_query_count(), 2);
    }

    #[tokio::test]
    async fn dashboard_expires_after_short_ttl() {
        let f = fixture();
        f.service.add_student(new_student("4", "Sy")).await.unwrap();

        f.service.get_class_dashboard(Grade::Four).await.unwrap();
        f.clock.advance(Duration::seconds(30));
        f.service.get_class_dashboard(Grade::Four).await.unwrap();
        assert_eq!(f.store.student_query_count(), 1);

        f.clock.advance(Duration::seconds(31));
        f.service.get_class_dashboard(Grade::Four).await.unwrap();
        assert_eq!(f.store.student_query_count(), 2);
    }

    #[tokio::test]
    async fn mutations_publish_sync_events() {
        let f = fixture();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_for_handler = Arc::clone(&seen);
        let subscription = f.service.on_data_changed(move |event| {
            assert_eq!(event.name, SYNC_DATA);
            seen_for_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let student = f.service.add_student(new_student("5", "Ng")).await.unwrap().student;
        let outcome = f
            .service
            .add_health_record(student.id, 131.0, 29.0, Some("  ".to_string()))
            .await
            .unwrap();
        assert!(outcome.record.notes.is_none());
        assert!(f.service.delete_health_record(outcome.record.id).await.unwrap());
        assert!(!f.service.delete_health_record(outcome.record.id).await.unwrap());
        f.service.delete_student(student.id).await.unwrap();

        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert!(f.service.bus().unsubscribe(&subscription));
    }

    #[tokio::test]
    async fn implausible_measurement_is_stored_with_warning() {
        let f = fixture();
        let student = f.service.add_student(new_student("6", "Ko")).await.unwrap().student;
        let outcome = f
            .service
            .add_health_record(student.id, 190.0, 28.0, None)
            .await
            .unwrap();
        assert_eq!(
            outcome.warning.as_deref(),
            Some("Height should be between 120-170 cm for this age")
        );
    }

    #[tokio::test]
    async fn unknown_student_is_reported() {
        let f = fixture();
        let missing = Uuid::new_v4();
        assert!(matches!(
            f.service.get_student_report(missing).await,
            Err(Error::StudentNotFound(id)) if id == missing
        ));
        assert!(matches!(
            f.service.get_student_metrics(missing).await,
            Err(Error::StudentNotFound(id)) if id == missing
        ));
        assert!(matches!(
            f.service.add_health_record(missing, 130.0, 30.0, None).await,
            Err(Error::StudentNotFound(_))
        ));
        assert!(matches!(
            f.service.get_activity_summary(missing).await,
            Err(Error::StudentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn student_is_announced_even_if_first_measurement_fails() {
        let f = fixture();
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_for_handler = Arc::clone(&seen);
        f.service.on_data_changed(move |_| {
            seen_for_handler.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        f.service.get_class_dashboard(Grade::Four).await.unwrap();
        f.store.set_reject_record_inserts(true);
        let added = f.service.add_student(new_student("7", "Ruiz")).await.unwrap();

        assert!(added.initial_record.is_none());
        assert!(matches!(added.record_error, Some(StoreError::Unavailable(_))));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);

        let listed = f
            .service
            .list_students(Grade::Four, StatusFilter::All, None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(f.store.student_query_count(), 2);
    }

    #[tokio::test]
    async fn non_positive_measurements_are_rejected() {
        let f = fixture();
        let student = f.service.add_student(new_student("8", "Sato")).await.unwrap().student;

        for (height, weight) in [(-120.0, 30.0), (130.0, 0.0), (f64::NAN, 30.0)] {
            assert!(matches!(
                f.service.add_health_record(student.id, height, weight, None).await,
                Err(Error::InvalidMeasurement(_))
            ));
        }

        let mut registration = new_student("9", "Tran");
        registration.weight_kg = Some(-3.0);
        assert!(matches!(
            f.service.add_student(registration).await,
            Err(Error::InvalidMeasurement(_))
        ));

        let report = f.service.get_student_report(student.id).await.unwrap();
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn activity_summary_covers_the_last_week() {
        let f = fixture();
        let student = f.service.add_student(new_student("10", "Uy")).await.unwrap().student;
        let start = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
        for day in 0..9i64 {
            let date = start + Duration::days(day);
            let calories = if day < 2 { 500.0 } else { 2050.0 };
            f.service
                .add_nutrition_log(NutritionLog::new(student.id, date, calories, 60.0, 250.0, 70.0))
                .await
                .unwrap();
        }
        f.service
            .add_exercise_log(ExerciseLog::new(student.id, start, 45.0, 200.0, "Swimming"))
            .await
            .unwrap();

        let summary = f.service.get_activity_summary(student.id).await.unwrap();
        assert_eq!(summary.nutrition_logs.len(), activity::DEFAULT_LOG_DAYS);
        assert_eq!(summary.average_calories, 2050);
        assert_eq!(summary.average_exercise_minutes, 45);
        assert_eq!(summary.goal_progress, 99);

        assert!(matches!(
            f.service
                .add_nutrition_log(NutritionLog::new(student.id, start, -1.0, 0.0, 0.0, 0.0))
                .await,
            Err(Error::InvalidMeasurement(_))
        ));
    }

    #[tokio::test]
    async fn dropping_service_releases_its_subscription() {
        let bus = Arc::new(SyncEventBus::default());
        let service = HealthService::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&bus),
            ServiceSettings::default(),
        );
        assert_eq!(bus.subscriber_count(SYNC_DATA), 1);
        drop(service);
        assert_eq!(bus.subscriber_count(SYNC_DATA), 0);
    }
}
