//! User store: registration, access-code auth, code reset, admin listing.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::access_code::{code_hint, generate_access_code, hash_code};
use crate::error::{ApiError, Result};
use crate::models::{AdminUser, UserSummary};

/// Upper bound on the issuance retry loop. Collisions over a 32^16 code
/// space are astronomically unlikely; exhausting this bound means the RNG
/// is broken, not that the user was unlucky.
const CODE_ISSUE_ATTEMPTS: usize = 20;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub code_hint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            code_hint: self.code_hint.clone(),
            created_at: self.created_at,
        }
    }
}

/// A user together with the plaintext code issued for them. The code
/// leaves the process exactly once, in the response body.
#[derive(Debug)]
pub struct IssuedUser {
    pub user: UserRecord,
    pub code: String,
}

/// Trims, collapses inner whitespace and truncates to 80 characters.
pub fn normalize_name(name: &str) -> Result<String> {
    let cleaned = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return Err(ApiError::Validation("Name is required".to_string()));
    }
    Ok(cleaned.chars().take(80).collect())
}

/// Registers a user, generating an access code and retrying on the
/// (practically impossible) unique-hash collision.
pub async fn create_user(pool: &SqlitePool, pepper: &str, name: &str) -> Result<IssuedUser> {
    create_user_with_attempts(pool, pepper, name, CODE_ISSUE_ATTEMPTS).await
}

async fn create_user_with_attempts(
    pool: &SqlitePool,
    pepper: &str,
    name: &str,
    attempts: usize,
) -> Result<IssuedUser> {
    let clean_name = normalize_name(name)?;
    let now = Utc::now();

    for _ in 0..attempts {
        let code = generate_access_code();
        let result = sqlx::query(
            "INSERT INTO users (name, code_hash, code_hint, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&clean_name)
        .bind(hash_code(pepper, &code))
        .bind(code_hint(&code))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await;

        match result {
            Ok(done) => {
                return Ok(IssuedUser {
                    user: UserRecord {
                        id: done.last_insert_rowid(),
                        name: clean_name,
                        code_hint: code_hint(&code),
                        created_at: now,
                        updated_at: now,
                    },
                    code,
                });
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Err(ApiError::CodeAllocation)
}

/// Looks a user up by presented access code (any casing or separator
/// format). A miss is `None`, not an error.
pub async fn find_by_code(
    pool: &SqlitePool,
    pepper: &str,
    code: &str,
) -> Result<Option<UserRecord>> {
    let user = sqlx::query_as::<_, UserRecord>(
        "SELECT id, name, code_hint, created_at, updated_at FROM users WHERE code_hash = ?",
    )
    .bind(hash_code(pepper, code))
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_by_id(pool: &SqlitePool, user_id: i64) -> Result<Option<UserRecord>> {
    let user = sqlx::query_as::<_, UserRecord>(
        "SELECT id, name, code_hint, created_at, updated_at FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Replaces a user's access code. The old hash is overwritten, which
/// invalidates the previous code immediately.
pub async fn reset_code(
    pool: &SqlitePool,
    pepper: &str,
    user_id: i64,
) -> Result<Option<IssuedUser>> {
    reset_code_with_attempts(pool, pepper, user_id, CODE_ISSUE_ATTEMPTS).await
}

async fn reset_code_with_attempts(
    pool: &SqlitePool,
    pepper: &str,
    user_id: i64,
    attempts: usize,
) -> Result<Option<IssuedUser>> {
    let Some(user) = find_by_id(pool, user_id).await? else {
        return Ok(None);
    };
    let now = Utc::now();

    for _ in 0..attempts {
        let code = generate_access_code();
        let result = sqlx::query(
            "UPDATE users SET code_hash = ?, code_hint = ?, updated_at = ? WHERE id = ?",
        )
        .bind(hash_code(pepper, &code))
        .bind(code_hint(&code))
        .bind(now)
        .bind(user_id)
        .execute(pool)
        .await;

        match result {
            Ok(_) => {
                return Ok(Some(IssuedUser {
                    user: UserRecord {
                        code_hint: code_hint(&code),
                        updated_at: now,
                        ..user
                    },
                    code,
                }));
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Err(ApiError::CodeAllocation)
}

/// Deletes a user; meal entries and goals cascade.
pub async fn delete_user(pool: &SqlitePool, user_id: i64) -> Result<bool> {
    let done = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn list_admin_users(pool: &SqlitePool) -> Result<Vec<AdminUser>> {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: i64,
        name: String,
        code_hint: String,
        created_at: DateTime<Utc>,
        entries: i64,
        calories_kcal: f64,
    }

    let rows = sqlx::query_as::<_, Row>(
        "SELECT
            u.id,
            u.name,
            u.code_hint,
            u.created_at,
            COUNT(m.id) AS entries,
            COALESCE(SUM(m.calories_kcal), 0) AS calories_kcal
         FROM users u
         LEFT JOIN meal_entries m ON m.user_id = u.id
         GROUP BY u.id
         ORDER BY u.created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| AdminUser {
            id: r.id,
            name: r.name,
            code_hint: r.code_hint,
            created_at: r.created_at,
            entries: r.entries,
            calories_kcal: r.calories_kcal,
        })
        .collect())
}

pub async fn count_users(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("test.db")).await.unwrap();
        (pool, dir)
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("  Ada   Lovelace ").unwrap(), "Ada Lovelace");
        assert!(normalize_name("   ").is_err());
        let long = "x".repeat(120);
        assert_eq!(normalize_name(&long).unwrap().chars().count(), 80);
    }

    #[tokio::test]
    async fn issued_code_round_trips_through_lookup() {
        let (pool, _dir) = test_pool().await;
        let issued = create_user(&pool, "test-pepper", "Ada").await.unwrap();

        // Any casing/spacing variant of the raw code authenticates.
        let sloppy = issued.code.to_lowercase().replace('-', " ");
        let found = find_by_code(&pool, "test-pepper", &sloppy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, issued.user.id);
        assert_eq!(found.code_hint, issued.user.code_hint);

        let miss = find_by_code(&pool, "test-pepper", "AAAA-BBBB-CCCC-DDDD")
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn reset_invalidates_previous_code() {
        let (pool, _dir) = test_pool().await;
        let issued = create_user(&pool, "p", "Ada").await.unwrap();

        let reset = reset_code(&pool, "p", issued.user.id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(reset.code, issued.code);

        assert!(find_by_code(&pool, "p", &issued.code).await.unwrap().is_none());
        let found = find_by_code(&pool, "p", &reset.code).await.unwrap().unwrap();
        assert_eq!(found.id, issued.user.id);
    }

    #[tokio::test]
    async fn reset_of_missing_user_is_none() {
        let (pool, _dir) = test_pool().await;
        assert!(reset_code(&pool, "p", 9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades_and_reports_missing() {
        let (pool, _dir) = test_pool().await;
        let issued = create_user(&pool, "p", "Ada").await.unwrap();

        assert!(delete_user(&pool, issued.user.id).await.unwrap());
        assert!(!delete_user(&pool, issued.user.id).await.unwrap());
        assert_eq!(count_users(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_attempts_surfaces_allocation_failure() {
        let (pool, _dir) = test_pool().await;
        let err = create_user_with_attempts(&pool, "p", "Ada", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::CodeAllocation));
    }
}
