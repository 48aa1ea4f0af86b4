//! Boundary with the document store that holds students and health records.
//!
//! The core never persists anything itself; it only reads through
//! [`HealthStore`] and forwards mutations. Ordered queries may be rejected
//! with [`StoreError::MissingIndex`], in which case the helpers here retry
//! unordered and sort on the client.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ExerciseLog, Gender, Grade, HealthRecord, NutritionLog, Student};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    PermissionDenied(String),
    /// The ordered form of a query needs an index the store does not have.
    MissingIndex(String),
    Unavailable(String),
    /// A stored document could not be read into a typed record.
    Malformed(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            StoreError::MissingIndex(msg) => write!(f, "missing index: {}", msg),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::Malformed(msg) => write!(f, "malformed document: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    /// Store-side ordering (records newest first, students by last name).
    Indexed,
    Unordered,
}

#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn query_records_by_student(
        &self,
        student_id: Uuid,
        order: QueryOrder,
    ) -> StoreResult<Vec<HealthRecord>>;

    async fn query_students_by_grade(
        &self,
        grade: Grade,
        order: QueryOrder,
    ) -> StoreResult<Vec<Student>>;

    async fn query_all_students(&self, order: QueryOrder) -> StoreResult<Vec<Student>>;

    async fn get_student(&self, student_id: Uuid) -> StoreResult<Option<Student>>;

    async fn insert_student(&self, student: &Student) -> StoreResult<()>;

    async fn update_student(&self, student: &Student) -> StoreResult<bool>;

    /// Removes the student together with all of their health records.
    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool>;

    async fn insert_record(&self, record: &HealthRecord) -> StoreResult<()>;

    async fn delete_record(&self, record_id: Uuid) -> StoreResult<bool>;

    /// `limit` bounds the indexed (newest first) form only; the unordered
    /// form returns every log of the student.
    async fn query_nutrition_logs(
        &self,
        student_id: Uuid,
        order: QueryOrder,
        limit: usize,
    ) -> StoreResult<Vec<NutritionLog>>;

    async fn query_exercise_logs(
        &self,
        student_id: Uuid,
        order: QueryOrder,
        limit: usize,
    ) -> StoreResult<Vec<ExerciseLog>>;

    async fn insert_nutrition_log(&self, log: &NutritionLog) -> StoreResult<()>;

    async fn insert_exercise_log(&self, log: &ExerciseLog) -> StoreResult<()>;
}

async fn with_index_fallback<T, F, Fut>(what: &str, query: F) -> Result<Vec<T>>
where
    F: Fn(QueryOrder) -> Fut,
    Fut: Future<Output = StoreResult<Vec<T>>>,
{
    match query(QueryOrder::Indexed).await {
        Ok(rows) => Ok(rows),
        Err(StoreError::MissingIndex(detail)) => {
            log::warn!("Missing index for {what} ({detail}), using unordered fallback");
            query(QueryOrder::Unordered)
                .await
                .map_err(Error::FallbackExhausted)
        }
        Err(err) => Err(Error::StoreUnavailable(err)),
    }
}

/// A student's records, oldest first.
pub async fn fetch_student_records(
    store: &dyn HealthStore,
    student_id: Uuid,
) -> Result<Vec<HealthRecord>> {
    let mut records = with_index_fallback(&format!("records of student {student_id}"), |order| {
        store.query_records_by_student(student_id, order)
    })
    .await?;
    records.sort_by_key(|record| record.date);
    Ok(records)
}

/// The student's `days` most recent nutrition logs, oldest first.
pub async fn fetch_nutrition_logs(
    store: &dyn HealthStore,
    student_id: Uuid,
    days: usize,
) -> Result<Vec<NutritionLog>> {
    let mut logs = with_index_fallback(&format!("nutrition logs of student {student_id}"), |order| {
        store.query_nutrition_logs(student_id, order, days)
    })
    .await?;
    logs.sort_by(|a, b| b.date.cmp(&a.date));
    logs.truncate(days);
    logs.reverse();
    Ok(logs)
}

/// The student's `days` most recent exercise logs, oldest first.
pub async fn fetch_exercise_logs(
    store: &dyn HealthStore,
    student_id: Uuid,
    days: usize,
) -> Result<Vec<ExerciseLog>> {
    let mut logs = with_index_fallback(&format!("exercise logs of student {student_id}"), |order| {
        store.query_exercise_logs(student_id, order, days)
    })
    .await?;
    logs.sort_by(|a, b| b.date.cmp(&a.date));
    logs.truncate(days);
    logs.reverse();
    Ok(logs)
}

pub async fn fetch_students_by_grade(store: &dyn HealthStore, grade: Grade) -> Result<Vec<Student>> {
    let mut students = with_index_fallback(&format!("students in grade {grade}"), |order| {
        store.query_students_by_grade(grade, order)
    })
    .await?;
    sort_by_last_name(&mut students);
    Ok(students)
}

pub async fn fetch_all_students(store: &dyn HealthStore) -> Result<Vec<Student>> {
    let mut students =
        with_index_fallback("all students", |order| store.query_all_students(order)).await?;
    sort_by_last_name(&mut students);
    Ok(students)
}

fn sort_by_last_name(students: &mut [Student]) {
    students.sort_by_key(|student| student.last_name.to_lowercase());
}

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Fetches every student's history, `batch_size` students at a time. A
/// student whose fetch fails contributes no records instead of failing the
/// whole batch.
pub async fn fetch_histories_in_batches<'a>(
    store: &dyn HealthStore,
    students: &'a [Student],
    batch_size: usize,
) -> Vec<(&'a Student, Vec<HealthRecord>)> {
    let mut histories = Vec::with_capacity(students.len());

    for batch in students.chunks(batch_size.max(1)) {
        let fetches = batch.iter().map(|student| async move {
            match fetch_student_records(store, student.id).await {
                Ok(records) => records,
                Err(err) => {
                    log::warn!(
                        "Error fetching health records for student {}: {}",
                        student.id,
                        err
                    );
                    Vec::new()
                }
            }
        });
        let results = futures::future::join_all(fetches).await;
        histories.extend(batch.iter().zip(results));
    }

    histories
}

/// One line of a measurement export: the student's identity and a single
/// measurement.
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementRow {
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub grade: Grade,
    pub section: String,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub measured_at: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,
}

impl MeasurementRow {
    pub fn to_student(&self, id: Uuid) -> Student {
        Student {
            id,
            student_number: self.student_number.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            grade: self.grade,
            section: self.section.trim().to_string(),
            gender: self
                .gender
                .as_deref()
                .map(Gender::parse_lenient)
                .unwrap_or_default(),
            birth_date: self.birth_date,
        }
    }

    pub fn to_record(&self, student_id: Uuid) -> HealthRecord {
        HealthRecord {
            id: Uuid::new_v4(),
            student_id,
            height_cm: self.height_cm,
            weight_kg: self.weight_kg,
            date: self.measured_at.and_time(NaiveTime::MIN).and_utc(),
            notes: self.notes.clone().filter(|notes| !notes.trim().is_empty()),
        }
    }
}

pub fn read_measurements_csv(path: &Path) -> Result<Vec<MeasurementRow>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| Error::Config(format!("cannot open {}: {}", path.display(), err)))?;

    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<MeasurementRow>().enumerate() {
        let row = result.map_err(|err| {
            Error::Config(format!("{} row {}: {}", path.display(), line + 1, err))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Default)]
struct MemoryState {
    students: Vec<Student>,
    records: Vec<HealthRecord>,
    nutrition_logs: Vec<NutritionLog>,
    exercise_logs: Vec<ExerciseLog>,
}

/// Store kept entirely in memory. Used for offline runs from a CSV export and
/// for tests, where it can be told to reject ordered queries or to fail for
/// particular students.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    require_index: AtomicBool,
    deny_access: AtomicBool,
    failing_students: Mutex<HashSet<Uuid>>,
    reject_record_inserts: AtomicBool,
    record_queries: AtomicUsize,
    student_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: &[MeasurementRow]) -> Self {
        let store = Self::new();
        store.import_rows(rows);
        store
    }

    /// Adds the students and records in `rows`, matching students by their
    /// school number. Returns the number of records added.
    pub fn import_rows(&self, rows: &[MeasurementRow]) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut inserted = 0usize;

        for row in rows {
            let number = row.student_number.trim();
            let student_id = match state
                .students
                .iter()
                .find(|student| student.student_number == number)
            {
                Some(student) => student.id,
                None => {
                    let student = row.to_student(Uuid::new_v4());
                    let id = student.id;
                    state.students.push(student);
                    id
                }
            };

            state.records.push(row.to_record(student_id));
            inserted += 1;
        }

        inserted
    }

    /// Makes ordered queries fail with `MissingIndex`.
    pub fn set_require_index(&self, value: bool) {
        self.require_index.store(value, Ordering::SeqCst);
    }

    /// Makes every query fail with `PermissionDenied`.
    pub fn set_deny_access(&self, value: bool) {
        self.deny_access.store(value, Ordering::SeqCst);
    }

    pub fn fail_records_for(&self, student_id: Uuid) {
        self.failing_students
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(student_id);
    }

    /// Makes `insert_record` fail with `Unavailable` while other writes succeed.
    pub fn set_reject_record_inserts(&self, value: bool) {
        self.reject_record_inserts.store(value, Ordering::SeqCst);
    }

    pub fn record_query_count(&self) -> usize {
        self.record_queries.load(Ordering::SeqCst)
    }

    pub fn student_query_count(&self) -> usize {
        self.student_queries.load(Ordering::SeqCst)
    }

    fn check_access(&self, order: QueryOrder, what: &str) -> StoreResult<()> {
        if self.deny_access.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(format!("cannot read {what}")));
        }
        if order == QueryOrder::Indexed && self.require_index.load(Ordering::SeqCst) {
            return Err(StoreError::MissingIndex(format!(
                "ordered query on {what} requires a composite index"
            )));
        }
        Ok(())
    }

    fn students_matching(
        &self,
        order: QueryOrder,
        predicate: impl Fn(&Student) -> bool,
    ) -> Vec<Student> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut students: Vec<Student> = state
            .students
            .iter()
            .filter(|student| predicate(student))
            .cloned()
            .collect();
        if order == QueryOrder::Indexed {
            students.sort_by(|a, b| a.last_name.cmp(&b.last_name));
        }
        students
    }
}

#[async_trait]
impl HealthStore for MemoryStore {
    async fn query_records_by_student(
        &self,
        student_id: Uuid,
        order: QueryOrder,
    ) -> StoreResult<Vec<HealthRecord>> {
        self.record_queries.fetch_add(1, Ordering::SeqCst);
        self.check_access(order, "healthRecords")?;

        let failing = self
            .failing_students
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&student_id);
        if failing {
            return Err(StoreError::Unavailable(format!(
                "records of student {student_id} could not be fetched"
            )));
        }

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<HealthRecord> = state
            .records
            .iter()
            .filter(|record| record.student_id == student_id)
            .cloned()
            .collect();
        if order == QueryOrder::Indexed {
            records.sort_by(|a, b| b.date.cmp(&a.date));
        }
        Ok(records)
    }

    async fn query_students_by_grade(
        &self,
        grade: Grade,
        order: QueryOrder,
    ) -> StoreResult<Vec<Student>> {
        self.student_queries.fetch_add(1, Ordering::SeqCst);
        self.check_access(order, "students")?;
        Ok(self.students_matching(order, |student| student.grade == grade))
    }

    async fn query_all_students(&self, order: QueryOrder) -> StoreResult<Vec<Student>> {
        self.student_queries.fetch_add(1, Ordering::SeqCst);
        self.check_access(order, "students")?;
        Ok(self.students_matching(order, |_| true))
    }

    async fn get_student(&self, student_id: Uuid) -> StoreResult<Option<Student>> {
        self.check_access(QueryOrder::Unordered, "students")?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .students
            .iter()
            .find(|student| student.id == student_id)
            .cloned())
    }

    async fn insert_student(&self, student: &Student) -> StoreResult<()> {
        self.check_access(QueryOrder::Unordered, "students")?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.students.push(student.clone());
        Ok(())
    }

    async fn update_student(&self, student: &Student) -> StoreResult<bool> {
        self.check_access(QueryOrder::Unordered, "students")?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.students.iter_mut().find(|s| s.id == student.id) {
            Some(existing) => {
                *existing = student.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool> {
        self.check_access(QueryOrder::Unordered, "students")?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.students.len();
        state.students.retain(|student| student.id != student_id);
        state.records.retain(|record| record.student_id != student_id);
        state.nutrition_logs.retain(|log| log.student_id != student_id);
        state.exercise_logs.retain(|log| log.student_id != student_id);
        Ok(state.students.len() != before)
    }

    async fn insert_record(&self, record: &HealthRecord) -> StoreResult<()> {
        self.check_access(QueryOrder::Unordered, "healthRecords")?;
        if self.reject_record_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "record {} could not be written",
                record.id
            )));
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.records.push(record.clone());
        Ok(())
    }

    async fn delete_record(&self, record_id: Uuid) -> StoreResult<bool> {
        self.check_access(QueryOrder::Unordered, "healthRecords")?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.records.len();
        state.records.retain(|record| record.id != record_id);
        Ok(state.records.len() != before)
    }

    async fn query_nutrition_logs(
        &self,
        student_id: Uuid,
        order: QueryOrder,
        limit: usize,
    ) -> StoreResult<Vec<NutritionLog>> {
        self.check_access(order, "nutritionLogs")?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut logs: Vec<NutritionLog> = state
            .nutrition_logs
            .iter()
            .filter(|log| log.student_id == student_id)
            .cloned()
            .collect();
        if order == QueryOrder::Indexed {
            logs.sort_by(|a, b| b.date.cmp(&a.date));
            logs.truncate(limit);
        }
        Ok(logs)
    }

    async fn query_exercise_logs(
        &self,
        student_id: Uuid,
        order: QueryOrder,
        limit: usize,
    ) -> StoreResult<Vec<ExerciseLog>> {
        self.check_access(order, "exerciseLogs")?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut logs: Vec<ExerciseLog> = state
            .exercise_logs
            .iter()
            .filter(|log| log.student_id == student_id)
            .cloned()
            .collect();
        if order == QueryOrder::Indexed {
            logs.sort_by(|a, b| b.date.cmp(&a.date));
            logs.truncate(limit);
        }
        Ok(logs)
    }

    async fn insert_nutrition_log(&self, log: &NutritionLog) -> StoreResult<()> {
        self.check_access(QueryOrder::Unordered, "nutritionLogs")?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.nutrition_logs.push(log.clone());
        Ok(())
    }

    async fn insert_exercise_log(&self, log: &ExerciseLog) -> StoreResult<()> {
        self.check_access(QueryOrder::Unordered, "exerciseLogs")?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.exercise_logs.push(log.clone());
        Ok(())
    }
}
