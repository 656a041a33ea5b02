//! Meal entry store: CRUD, filtered listing, summaries and goals.

use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::Result;
use crate::models::{AdminOverview, GoalsResponse, MealEntry, SummaryResponse};
use crate::users;

pub const DEFAULT_LIST_LIMIT: i64 = 30;
pub const MAX_LIST_LIMIT: i64 = 200;
pub const DEFAULT_SUMMARY_DAYS: i64 = 7;
pub const MAX_SUMMARY_DAYS: i64 = 90;

const DEFAULT_GOAL_CALORIES: f64 = 2000.0;
const DEFAULT_GOAL_PROTEIN: f64 = 100.0;
const DEFAULT_GOAL_FIBER: f64 = 30.0;

/// Optional filters applied to listing and counting.
#[derive(Debug, Default, Clone)]
pub struct MealFilter {
    /// Case-insensitive dish substring
    pub q: Option<String>,
    pub source: Option<String>,
    pub meal_type: Option<String>,
}

/// Fields of a new entry; timestamps are assigned at insert.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub source: String,
    pub dish: String,
    pub meal_type: String,
    pub calories_kcal: Option<f64>,
    pub protein_g: Option<f64>,
    pub fiber_g: Option<f64>,
    pub confidence_score: Option<f64>,
    pub nutrients: Vec<String>,
    pub chemicals: Vec<String>,
    pub notes: Option<String>,
}

#[derive(sqlx::FromRow)]
struct MealRow {
    id: i64,
    user_id: i64,
    source: String,
    dish: String,
    meal_type: String,
    calories_kcal: Option<f64>,
    protein_g: Option<f64>,
    fiber_g: Option<f64>,
    confidence_score: Option<f64>,
    nutrients_json: String,
    chemicals_json: String,
    notes: Option<String>,
    eaten_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<MealRow> for MealEntry {
    fn from(row: MealRow) -> Self {
        MealEntry {
            id: row.id,
            user_id: row.user_id,
            source: row.source,
            dish: row.dish,
            meal_type: row.meal_type,
            calories_kcal: row.calories_kcal,
            protein_g: row.protein_g,
            fiber_g: row.fiber_g,
            confidence_score: row.confidence_score,
            nutrients: serde_json::from_str(&row.nutrients_json).unwrap_or_default(),
            chemicals: serde_json::from_str(&row.chemicals_json).unwrap_or_default(),
            notes: row.notes,
            eaten_at: row.eaten_at,
            created_at: row.created_at,
        }
    }
}

pub async fn create_entry(pool: &SqlitePool, user_id: i64, new: &NewEntry) -> Result<MealEntry> {
    let now = Utc::now();
    let nutrients_json = serde_json::to_string(&new.nutrients).unwrap_or_else(|_| "[]".into());
    let chemicals_json = serde_json::to_string(&new.chemicals).unwrap_or_else(|_| "[]".into());

    let done = sqlx::query(
        "INSERT INTO meal_entries (
            user_id, source, dish, meal_type, calories_kcal, protein_g, fiber_g,
            confidence_score, nutrients_json, chemicals_json, notes, eaten_at, created_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&new.source)
    .bind(&new.dish)
    .bind(&new.meal_type)
    .bind(new.calories_kcal)
    .bind(new.protein_g)
    .bind(new.fiber_g)
    .bind(new.confidence_score)
    .bind(&nutrients_json)
    .bind(&chemicals_json)
    .bind(&new.notes)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(MealEntry {
        id: done.last_insert_rowid(),
        user_id,
        source: new.source.clone(),
        dish: new.dish.clone(),
        meal_type: new.meal_type.clone(),
        calories_kcal: new.calories_kcal,
        protein_g: new.protein_g,
        fiber_g: new.fiber_g,
        confidence_score: new.confidence_score,
        nutrients: new.nutrients.clone(),
        chemicals: new.chemicals.clone(),
        notes: new.notes.clone(),
        eaten_at: now,
        created_at: now,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MealFilter) {
    if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
        qb.push(" AND dish LIKE ");
        qb.push_bind(format!("%{}%", q.trim()));
    }
    if let Some(source) = filter.source.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND source = ");
        qb.push_bind(source.to_string());
    }
    if let Some(meal_type) = filter.meal_type.as_deref().filter(|m| !m.is_empty()) {
        qb.push(" AND meal_type = ");
        qb.push_bind(meal_type.to_string());
    }
}

/// Newest-first page of a user's entries.
pub async fn list_entries(
    pool: &SqlitePool,
    user_id: i64,
    limit: i64,
    offset: i64,
    filter: &MealFilter,
) -> Result<Vec<MealEntry>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT id, user_id, source, dish, meal_type, calories_kcal, protein_g, fiber_g,
                confidence_score, nutrients_json, chemicals_json, notes, eaten_at, created_at
         FROM meal_entries WHERE user_id = ",
    );
    qb.push_bind(user_id);
    push_filters(&mut qb, filter);
    qb.push(" ORDER BY eaten_at DESC, id DESC LIMIT ");
    qb.push_bind(limit.clamp(1, MAX_LIST_LIMIT));
    qb.push(" OFFSET ");
    qb.push_bind(offset.max(0));

    let rows: Vec<MealRow> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(MealEntry::from).collect())
}

pub async fn count_entries(pool: &SqlitePool, user_id: i64, filter: &MealFilter) -> Result<i64> {
    let mut qb =
        QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM meal_entries WHERE user_id = ");
    qb.push_bind(user_id);
    push_filters(&mut qb, filter);

    let (total,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
    Ok(total)
}

/// Deletes an entry if it belongs to `user_id`; another user's entry id
/// behaves exactly like a missing one.
pub async fn delete_entry(pool: &SqlitePool, user_id: i64, entry_id: i64) -> Result<bool> {
    let done = sqlx::query("DELETE FROM meal_entries WHERE id = ? AND user_id = ?")
        .bind(entry_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Totals over the trailing `days` days (clamped to 1..=90).
pub async fn summary_for_user(pool: &SqlitePool, user_id: i64, days: i64) -> Result<SummaryResponse> {
    let safe_days = days.clamp(1, MAX_SUMMARY_DAYS);
    let cutoff = Utc::now() - Duration::days(safe_days);

    #[derive(sqlx::FromRow)]
    struct Row {
        entries: i64,
        calories_kcal: f64,
        protein_g: f64,
        fiber_g: f64,
    }

    let row = sqlx::query_as::<_, Row>(
        "SELECT
            COUNT(id) AS entries,
            COALESCE(SUM(calories_kcal), 0.0) AS calories_kcal,
            COALESCE(SUM(protein_g), 0.0) AS protein_g,
            COALESCE(SUM(fiber_g), 0.0) AS fiber_g
         FROM meal_entries
         WHERE user_id = ? AND eaten_at >= ?",
    )
    .bind(user_id)
    .bind(cutoff)
    .fetch_one(pool)
    .await?;

    Ok(SummaryResponse {
        days: safe_days,
        entries: row.entries,
        calories_kcal: row.calories_kcal,
        protein_g: row.protein_g,
        fiber_g: row.fiber_g,
    })
}

/// A user's nutrition goals, falling back to documented defaults until
/// they set their own.
pub async fn get_goals(pool: &SqlitePool, user_id: i64) -> Result<GoalsResponse> {
    #[derive(sqlx::FromRow)]
    struct Row {
        calories_kcal: f64,
        protein_g: f64,
        fiber_g: f64,
        updated_at: DateTime<Utc>,
    }

    let row = sqlx::query_as::<_, Row>(
        "SELECT calories_kcal, protein_g, fiber_g, updated_at FROM user_goals WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(row) => GoalsResponse {
            calories_kcal: row.calories_kcal,
            protein_g: row.protein_g,
            fiber_g: row.fiber_g,
            updated_at: Some(row.updated_at),
        },
        None => GoalsResponse {
            calories_kcal: DEFAULT_GOAL_CALORIES,
            protein_g: DEFAULT_GOAL_PROTEIN,
            fiber_g: DEFAULT_GOAL_FIBER,
            updated_at: None,
        },
    })
}

pub async fn upsert_goals(
    pool: &SqlitePool,
    user_id: i64,
    calories_kcal: f64,
    protein_g: f64,
    fiber_g: f64,
) -> Result<GoalsResponse> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO user_goals (user_id, calories_kcal, protein_g, fiber_g, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
            calories_kcal = excluded.calories_kcal,
            protein_g = excluded.protein_g,
            fiber_g = excluded.fiber_g,
            updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(calories_kcal)
    .bind(protein_g)
    .bind(fiber_g)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(GoalsResponse {
        calories_kcal,
        protein_g,
        fiber_g,
        updated_at: Some(now),
    })
}

/// Instance-wide totals for the admin dashboard.
pub async fn admin_overview(pool: &SqlitePool) -> Result<AdminOverview> {
    #[derive(sqlx::FromRow)]
    struct Row {
        entries: i64,
        calories_kcal: f64,
    }

    let users = users::count_users(pool).await?;
    let row = sqlx::query_as::<_, Row>(
        "SELECT COUNT(*) AS entries, COALESCE(SUM(calories_kcal), 0.0) AS calories_kcal
         FROM meal_entries",
    )
    .fetch_one(pool)
    .await?;

    Ok(AdminOverview {
        users,
        entries: row.entries,
        calories_kcal: row.calories_kcal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::users::create_user;

    async fn seeded_pool() -> (SqlitePool, i64, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        let issued = create_user(&pool, "p", "Ada").await.unwrap();
        (pool, issued.user.id, dir)
    }

    fn entry(dish: &str, source: &str, meal_type: &str, kcal: Option<f64>) -> NewEntry {
        NewEntry {
            source: source.to_string(),
            dish: dish.to_string(),
            meal_type: meal_type.to_string(),
            calories_kcal: kcal,
            protein_g: Some(10.0),
            fiber_g: None,
            confidence_score: None,
            nutrients: vec!["iron".to_string()],
            chemicals: vec![],
            notes: None,
        }
    }

    #[tokio::test]
    async fn create_list_and_delete() {
        let (pool, user_id, _dir) = seeded_pool().await;

        let created = create_entry(&pool, user_id, &entry("Ramen", "manual", "lunch", Some(550.0)))
            .await
            .unwrap();
        assert_eq!(created.nutrients, vec!["iron".to_string()]);

        let listed = list_entries(&pool, user_id, 30, 0, &MealFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].dish, "Ramen");

        assert!(delete_entry(&pool, user_id, created.id).await.unwrap());
        assert!(!delete_entry(&pool, user_id, created.id).await.unwrap());
    }

    #[tokio::test]
    async fn other_users_entries_are_invisible() {
        let (pool, user_id, _dir) = seeded_pool().await;
        let other = create_user(&pool, "p", "Eve").await.unwrap();

        let created = create_entry(&pool, user_id, &entry("Salad", "manual", "dinner", None))
            .await
            .unwrap();

        assert!(list_entries(&pool, other.user.id, 30, 0, &MealFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert!(!delete_entry(&pool, other.user.id, created.id).await.unwrap());
    }

    #[tokio::test]
    async fn filters_narrow_listing_and_count() {
        let (pool, user_id, _dir) = seeded_pool().await;
        create_entry(&pool, user_id, &entry("Chicken ramen", "perplexity", "lunch", Some(600.0)))
            .await
            .unwrap();
        create_entry(&pool, user_id, &entry("Greek salad", "manual", "dinner", Some(300.0)))
            .await
            .unwrap();

        let by_q = MealFilter {
            q: Some("ramen".to_string()),
            ..Default::default()
        };
        assert_eq!(count_entries(&pool, user_id, &by_q).await.unwrap(), 1);

        let by_source = MealFilter {
            source: Some("manual".to_string()),
            ..Default::default()
        };
        let listed = list_entries(&pool, user_id, 30, 0, &by_source).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].dish, "Greek salad");

        let by_type = MealFilter {
            meal_type: Some("lunch".to_string()),
            ..Default::default()
        };
        assert_eq!(count_entries(&pool, user_id, &by_type).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn summary_counts_recent_entries() {
        let (pool, user_id, _dir) = seeded_pool().await;
        create_entry(&pool, user_id, &entry("Toast", "manual", "breakfast", Some(200.0)))
            .await
            .unwrap();

        let summary = summary_for_user(&pool, user_id, 7).await.unwrap();
        assert_eq!(summary.days, 7);
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.calories_kcal, 200.0);

        // Out-of-range day counts clamp instead of failing.
        assert_eq!(summary_for_user(&pool, user_id, 500).await.unwrap().days, 90);
        assert_eq!(summary_for_user(&pool, user_id, 0).await.unwrap().days, 1);
    }

    #[tokio::test]
    async fn goals_default_then_upsert() {
        let (pool, user_id, _dir) = seeded_pool().await;

        let defaults = get_goals(&pool, user_id).await.unwrap();
        assert_eq!(defaults.calories_kcal, 2000.0);
        assert!(defaults.updated_at.is_none());

        upsert_goals(&pool, user_id, 1800.0, 120.0, 25.0).await.unwrap();
        let goals = get_goals(&pool, user_id).await.unwrap();
        assert_eq!(goals.calories_kcal, 1800.0);
        assert!(goals.updated_at.is_some());

        upsert_goals(&pool, user_id, 2200.0, 110.0, 28.0).await.unwrap();
        assert_eq!(get_goals(&pool, user_id).await.unwrap().calories_kcal, 2200.0);
    }

    #[tokio::test]
    async fn overview_aggregates_all_users() {
        let (pool, user_id, _dir) = seeded_pool().await;
        create_entry(&pool, user_id, &entry("Pizza", "manual", "dinner", Some(800.0)))
            .await
            .unwrap();

        let overview = admin_overview(&pool).await.unwrap();
        assert_eq!(overview.users, 1);
        assert_eq!(overview.entries, 1);
        assert_eq!(overview.calories_kcal, 800.0);
    }
}
