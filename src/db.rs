use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::metrics;
use crate::models::{ExerciseLog, Gender, Grade, HealthRecord, NutritionLog, Student};
use crate::store::{read_measurements_csv, HealthStore, QueryOrder, StoreError, StoreResult};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "2026-0001",
            "Avery",
            "Lee",
            "4",
            "A",
            "female",
            NaiveDate::from_ymd_opt(2016, 3, 14).context("invalid date")?,
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "2026-0002",
            "Jules",
            "Moreno",
            "4",
            "B",
            "male",
            NaiveDate::from_ymd_opt(2016, 9, 2).context("invalid date")?,
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "2026-0003",
            "Kiara",
            "Patel",
            "5",
            "A",
            "female",
            NaiveDate::from_ymd_opt(2015, 1, 28).context("invalid date")?,
        ),
    ];

    for (id, number, first, last, grade, section, gender, birth_date) in students {
        sqlx::query(
            r#"
            INSERT INTO school_health.students
            (id, student_number, first_name, last_name, grade, section, gender, birth_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (student_number) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name,
                grade = EXCLUDED.grade, section = EXCLUDED.section
            "#,
        )
        .bind(id)
        .bind(number)
        .bind(first)
        .bind(last)
        .bind(grade)
        .bind(section)
        .bind(gender)
        .bind(birth_date)
        .execute(pool)
        .await?;
    }

    let measurements = vec![
        ("seed-001", "2026-0001", 131.0, 27.5, NaiveDate::from_ymd_opt(2026, 6, 2)),
        ("seed-002", "2026-0001", 132.5, 28.9, NaiveDate::from_ymd_opt(2026, 9, 1)),
        ("seed-003", "2026-0002", 128.0, 33.0, NaiveDate::from_ymd_opt(2026, 8, 30)),
        ("seed-004", "2026-0003", 140.0, 31.2, NaiveDate::from_ymd_opt(2026, 7, 15)),
        ("seed-005", "2026-0003", 141.5, 32.0, NaiveDate::from_ymd_opt(2026, 10, 1)),
    ];

    for (source_key, number, height, weight, measured_on) in measurements {
        let measured_at = measured_on
            .context("invalid date")?
            .and_time(NaiveTime::MIN)
            .and_utc();
        let student_id: Uuid =
            sqlx::query("SELECT id FROM school_health.students WHERE student_number = $1")
                .bind(number)
                .fetch_one(pool)
                .await?
                .get("id");

        let record = HealthRecord::new(student_id, height, weight, measured_at);
        insert_record_row(pool, &record, Some(source_key)).await?;
    }

    Ok(())
}

/// Loads a measurement CSV, upserting students by school number. Rows with a
/// `source_key` that was already imported are skipped.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let rows = read_measurements_csv(csv_path)?;
    let mut inserted = 0usize;

    for row in rows {
        let student = row.to_student(Uuid::new_v4());
        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO school_health.students
            (id, student_number, first_name, last_name, grade, section, gender, birth_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (student_number) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name,
                grade = EXCLUDED.grade, section = EXCLUDED.section
            RETURNING id
            "#,
        )
        .bind(student.id)
        .bind(&student.student_number)
        .bind(&student.first_name)
        .bind(&student.last_name)
        .bind(student.grade.as_str())
        .bind(&student.section)
        .bind(student.gender.as_str())
        .bind(student.birth_date)
        .fetch_one(pool)
        .await?
        .get("id");

        let source_key = row
            .source_key
            .clone()
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        let record = row.to_record(student_id);

        if insert_record_row(pool, &record, Some(&source_key)).await? > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Stores the derived BMI and status alongside the measurement so that other
/// readers of the table see the same values; this crate always re-derives them.
async fn insert_record_row(
    pool: &PgPool,
    record: &HealthRecord,
    source_key: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO school_health.health_records
        (id, student_id, height_cm, weight_kg, bmi, bmi_status, measured_at, notes, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(record.id)
    .bind(record.student_id)
    .bind(record.height_cm)
    .bind(record.weight_kg)
    .bind(record.bmi())
    .bind(metrics::classify_bmi_status(record.bmi()).label())
    .bind(record.date)
    .bind(&record.notes)
    .bind(source_key)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

fn store_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("42501") {
            return StoreError::PermissionDenied(db_err.message().to_string());
        }
    }
    StoreError::Unavailable(err.to_string())
}

fn student_from_row(row: &PgRow) -> StoreResult<Student> {
    let grade: String = row.try_get("grade").map_err(store_error)?;
    let section: Option<String> = row.try_get("section").map_err(store_error)?;
    let gender: Option<String> = row.try_get("gender").map_err(store_error)?;

    Ok(Student {
        id: row.try_get("id").map_err(store_error)?,
        student_number: row.try_get("student_number").map_err(store_error)?,
        first_name: row.try_get("first_name").map_err(store_error)?,
        last_name: row.try_get("last_name").map_err(store_error)?,
        grade: grade.parse::<Grade>().map_err(StoreError::Malformed)?,
        section: section.unwrap_or_default(),
        gender: gender
            .as_deref()
            .map(Gender::parse_lenient)
            .unwrap_or_default(),
        birth_date: row.try_get("birth_date").map_err(store_error)?,
    })
}

fn record_from_row(row: &PgRow) -> StoreResult<HealthRecord> {
    Ok(HealthRecord {
        id: row.try_get("id").map_err(store_error)?,
        student_id: row.try_get("student_id").map_err(store_error)?,
        height_cm: row.try_get("height_cm").map_err(store_error)?,
        weight_kg: row.try_get("weight_kg").map_err(store_error)?,
        date: row.try_get("measured_at").map_err(store_error)?,
        notes: row.try_get("notes").map_err(store_error)?,
    })
}

fn nutrition_log_from_row(row: &PgRow) -> StoreResult<NutritionLog> {
    Ok(NutritionLog {
        id: row.try_get("id").map_err(store_error)?,
        student_id: row.try_get("student_id").map_err(store_error)?,
        date: row.try_get("logged_at").map_err(store_error)?,
        calories: row.try_get("calories").map_err(store_error)?,
        protein: row.try_get("protein").map_err(store_error)?,
        carbs: row.try_get("carbs").map_err(store_error)?,
        fat: row.try_get("fat").map_err(store_error)?,
    })
}

fn exercise_log_from_row(row: &PgRow) -> StoreResult<ExerciseLog> {
    Ok(ExerciseLog {
        id: row.try_get("id").map_err(store_error)?,
        student_id: row.try_get("student_id").map_err(store_error)?,
        date: row.try_get("logged_at").map_err(store_error)?,
        minutes: row.try_get("minutes").map_err(store_error)?,
        calories_burned: row.try_get("calories_burned").map_err(store_error)?,
        activity_type: row.try_get("activity_type").map_err(store_error)?,
    })
}

/// Appends the newest-first ordering and row limit used by indexed log queries.
fn log_query(base: String, order: QueryOrder) -> String {
    match order {
        QueryOrder::Indexed => format!("{base} ORDER BY logged_at DESC, id DESC LIMIT $2"),
        QueryOrder::Unordered => base,
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

const STUDENT_COLUMNS: &str =
    "id, student_number, first_name, last_name, grade, section, gender, birth_date";

const RECORD_COLUMNS: &str = "id, student_id, height_cm, weight_kg, measured_at, notes";

/// [`HealthStore`] backed by the `school_health` schema in PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_students(&self, query: &str, grade: Option<Grade>) -> StoreResult<Vec<Student>> {
        let mut rows = sqlx::query(query);
        if let Some(grade) = grade {
            rows = rows.bind(grade.as_str());
        }

        rows.fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .iter()
            .map(student_from_row)
            .collect()
    }
}

#[async_trait]
impl HealthStore for PgStore {
    async fn query_records_by_student(
        &self,
        student_id: Uuid,
        order: QueryOrder,
    ) -> StoreResult<Vec<HealthRecord>> {
        let mut query = format!(
            "SELECT {RECORD_COLUMNS} FROM school_health.health_records WHERE student_id = $1"
        );
        if order == QueryOrder::Indexed {
            query.push_str(" ORDER BY measured_at DESC");
        }

        sqlx::query(&query)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .iter()
            .map(record_from_row)
            .collect()
    }

    async fn query_students_by_grade(
        &self,
        grade: Grade,
        order: QueryOrder,
    ) -> StoreResult<Vec<Student>> {
        let mut query =
            format!("SELECT {STUDENT_COLUMNS} FROM school_health.students WHERE grade = $1");
        if order == QueryOrder::Indexed {
            query.push_str(" ORDER BY last_name");
        }
        self.fetch_students(&query, Some(grade)).await
    }

    async fn query_all_students(&self, order: QueryOrder) -> StoreResult<Vec<Student>> {
        let mut query = format!("SELECT {STUDENT_COLUMNS} FROM school_health.students");
        if order == QueryOrder::Indexed {
            query.push_str(" ORDER BY last_name");
        }
        self.fetch_students(&query, None).await
    }

    async fn get_student(&self, student_id: Uuid) -> StoreResult<Option<Student>> {
        let query = format!("SELECT {STUDENT_COLUMNS} FROM school_health.students WHERE id = $1");
        sqlx::query(&query)
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .as_ref()
            .map(student_from_row)
            .transpose()
    }

    async fn insert_student(&self, student: &Student) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO school_health.students
            (id, student_number, first_name, last_name, grade, section, gender, birth_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(student.id)
        .bind(&student.student_number)
        .bind(&student.first_name)
        .bind(&student.last_name)
        .bind(student.grade.as_str())
        .bind(&student.section)
        .bind(student.gender.as_str())
        .bind(student.birth_date)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn update_student(&self, student: &Student) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE school_health.students
            SET student_number = $2, first_name = $3, last_name = $4, grade = $5,
                section = $6, gender = $7, birth_date = $8
            WHERE id = $1
            "#,
        )
        .bind(student.id)
        .bind(&student.student_number)
        .bind(&student.first_name)
        .bind(&student.last_name)
        .bind(student.grade.as_str())
        .bind(&student.section)
        .bind(student.gender.as_str())
        .bind(student.birth_date)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_student(&self, student_id: Uuid) -> StoreResult<bool> {
        // health_records cascade on the foreign key
        let result = sqlx::query("DELETE FROM school_health.students WHERE id = $1")
            .bind(student_id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_record(&self, record: &HealthRecord) -> StoreResult<()> {
        insert_record_row(&self.pool, record, None)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn delete_record(&self, record_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM school_health.health_records WHERE id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }
    async fn query_nutrition_logs(
        &self,
        student_id: Uuid,
        order: QueryOrder,
        limit: usize,
    ) -> StoreResult<Vec<NutritionLog>> {
        let query = log_query(
            "SELECT id, student_id, logged_at, calories, protein, carbs, fat \
             FROM school_health.nutrition_logs WHERE student_id = $1"
                .to_string(),
            order,
        );
        let mut rows = sqlx::query(&query).bind(student_id);
        if order == QueryOrder::Indexed {
            rows = rows.bind(limit_param(limit));
        }

        rows.fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .iter()
            .map(nutrition_log_from_row)
            .collect()
    }

    async fn query_exercise_logs(
        &self,
        student_id: Uuid,
        order: QueryOrder,
        limit: usize,
    ) -> StoreResult<Vec<ExerciseLog>> {
        let query = log_query(
            "SELECT id, student_id, logged_at, minutes, calories_burned, activity_type \
             FROM school_health.exercise_logs WHERE student_id = $1"
                .to_string(),
            order,
        );
        let mut rows = sqlx::query(&query).bind(student_id);
        if order == QueryOrder::Indexed {
            rows = rows.bind(limit_param(limit));
        }

        rows.fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .iter()
            .map(exercise_log_from_row)
            .collect()
    }

    async fn insert_nutrition_log(&self, log: &NutritionLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO school_health.nutrition_logs
            (id, student_id, logged_at, calories, protein, carbs, fat)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(log.student_id)
        .bind(log.date)
        .bind(log.calories)
        .bind(log.protein)
        .bind(log.carbs)
        .bind(log.fat)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn insert_exercise_log(&self, log: &ExerciseLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO school_health.exercise_logs
            (id, student_id, logged_at, minutes, calories_burned, activity_type)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(log.id)
        .bind(log.student_id)
        .bind(log.date)
        .bind(log.minutes)
        .bind(log.calories_burned)
        .bind(&log.activity_type)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }
}
