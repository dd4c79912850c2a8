use std::collections::HashMap;
use std::sync::Mutex;

use axum::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{NewUser, User};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-index violation on user_name or email.
    #[error("duplicate user_name or email")]
    Duplicate,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Credential store consumed by the session manager. Uniqueness of
/// user_name and email is enforced here; callers may pre-check but must
/// still handle `StoreError::Duplicate` from `create`.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Matches either identifier; `None` arguments do not match anything.
    async fn find_by_username_or_email(
        &self,
        user_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn create(&self, new: NewUser) -> Result<User, StoreError>;

    /// Overwrites the stored refresh token; `None` revokes it.
    async fn update_refresh_token(
        &self,
        id: Uuid,
        token: Option<&str>,
    ) -> Result<(), StoreError>;
}

const USER_COLUMNS: &str = "id, user_name, email, full_name, password_hash, refresh_token, \
     avatar_url, cover_image_url, watch_history, created_at, updated_at";

pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.into())
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username_or_email(
        &self,
        user_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE ($1::text IS NOT NULL AND user_name = $1) \
                OR ($2::text IS NOT NULL AND email = $2) \
             LIMIT 1"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(user_name)
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .map_err(backend)?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(backend)?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let sql = format!(
            "INSERT INTO users \
                 (user_name, email, full_name, password_hash, avatar_url, cover_image_url) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(&new.user_name)
            .bind(&new.email)
            .bind(&new.full_name)
            .bind(&new.password_hash)
            .bind(&new.avatar_url)
            .bind(&new.cover_image_url)
            .fetch_one(&self.db)
            .await
            .map_err(|e| match e.as_database_error().and_then(|d| d.code()) {
                Some(code) if code == "23505" => StoreError::Duplicate,
                _ => backend(e),
            })?;
        Ok(user)
    }

    async fn update_refresh_token(
        &self,
        id: Uuid,
        token: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

/// HashMap-backed store used by `AppState::fake()` and the unit tests.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username_or_email(
        &self,
        user_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().expect("store lock");
        Ok(users
            .values()
            .find(|u| {
                user_name.is_some_and(|n| u.user_name == n)
                    || email.is_some_and(|m| u.email == m)
            })
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().expect("store lock");
        Ok(users.get(&id).cloned())
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.lock().expect("store lock");
        if users
            .values()
            .any(|u| u.user_name == new.user_name || u.email == new.email)
        {
            return Err(StoreError::Duplicate);
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            user_name: new.user_name,
            email: new.email,
            full_name: new.full_name,
            password_hash: new.password_hash,
            refresh_token: None,
            avatar_url: new.avatar_url,
            cover_image_url: new.cover_image_url,
            watch_history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_refresh_token(
        &self,
        id: Uuid,
        token: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut users = self.users.lock().expect("store lock");
        if let Some(user) = users.get_mut(&id) {
            user.refresh_token = token.map(str::to_owned);
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}
