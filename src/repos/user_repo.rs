use crate::models::User;
use crate::repos::RepoError;
use crate::uow::Db;

#[derive(Clone)]
pub struct UserRepo {
    db: Db,
}

impl UserRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(&self, username: &str, password_hash: &str) -> Result<User, RepoError> {
        let query = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            RETURNING id, username, password_hash, created_at, updated_at
            "#,
        )
        .bind(username)
        .bind(password_hash);

        self.db.fetch_one(query).await
    }

    /// Takes a row lock on the user for the rest of the enclosing
    /// transaction, serializing balance-changing transactions per user.
    pub async fn lock(&self, user_id: i64) -> Result<(), RepoError> {
        let query = sqlx::query_as::<_, (i64,)>(
            r#"
            SELECT id
            FROM users
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id);

        self.db
            .fetch_optional(query)
            .await?
            .map(|_| ())
            .ok_or(RepoError::NotFound)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<User, RepoError> {
        let query = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, password_hash, created_at, updated_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username);

        self.db
            .fetch_optional(query)
            .await?
            .ok_or(RepoError::NotFound)
    }
}
