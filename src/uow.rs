//! Unit of Work: scopes a named set of repository handles to either the
//! connection pool (autocommit) or one open transaction.
//!
//! Factories are registered once at startup and the registry is read-only
//! afterwards. Within [`UnitOfWork::transact`] every repository built via
//! [`TxScope::get`] shares the same transaction; the transaction object is
//! serialized behind a mutex because it is not safe to use concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::{Query, QueryAs};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::repos::RepoError;

pub type RepoName = &'static str;

type BoxedRepo = Box<dyn Any + Send + Sync>;
pub type RepoFactory = Arc<dyn Fn(Db) -> BoxedRepo + Send + Sync>;

/// Wraps a plain constructor into a [`RepoFactory`].
pub fn factory<R, F>(constructor: F) -> RepoFactory
where
    R: Send + Sync + 'static,
    F: Fn(Db) -> R + Send + Sync + 'static,
{
    Arc::new(move |db| Box::new(constructor(db)))
}

type SharedTx = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

#[derive(Debug, Error)]
pub enum UowError {
    #[error("repository `{0}` is not registered")]
    NotRegistered(RepoName),

    #[error("repository `{0}` is already registered")]
    AlreadyRegistered(RepoName),

    #[error("repository `{0}` has an unexpected type")]
    InvalidRepoType(RepoName),

    #[error("begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("transaction already completed")]
    Completed,
}

/// Database handle a repository is built over. Cloning is cheap; the `Tx`
/// variant shares one live transaction between all repositories of a scope.
#[derive(Clone, Debug)]
pub enum Db {
    Pool(PgPool),
    Tx(SharedTx),
}

impl Db {
    pub async fn execute(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<PgQueryResult, RepoError> {
        match self {
            Db::Pool(pool) => query.execute(pool).await.map_err(RepoError::from_sqlx),
            Db::Tx(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(RepoError::Closed)?;
                query.execute(&mut **tx).await.map_err(RepoError::from_sqlx)
            }
        }
    }

    pub async fn fetch_one<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<T, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        match self {
            Db::Pool(pool) => query.fetch_one(pool).await.map_err(RepoError::from_sqlx),
            Db::Tx(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(RepoError::Closed)?;
                query
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::from_sqlx)
            }
        }
    }

    pub async fn fetch_optional<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Option<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        match self {
            Db::Pool(pool) => query
                .fetch_optional(pool)
                .await
                .map_err(RepoError::from_sqlx),
            Db::Tx(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(RepoError::Closed)?;
                query
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(RepoError::from_sqlx)
            }
        }
    }

    pub async fn fetch_all<T>(
        &self,
        query: QueryAs<'_, Postgres, T, PgArguments>,
    ) -> Result<Vec<T>, RepoError>
    where
        T: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        match self {
            Db::Pool(pool) => query.fetch_all(pool).await.map_err(RepoError::from_sqlx),
            Db::Tx(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or(RepoError::Closed)?;
                query
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(RepoError::from_sqlx)
            }
        }
    }
}

pub struct UnitOfWork {
    pool: PgPool,
    factories: HashMap<RepoName, RepoFactory>,
}

impl UnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            factories: HashMap::new(),
        }
    }

    /// Registers a repository factory. Registering the same name twice is
    /// rejected rather than silently replaced.
    pub fn register(&mut self, name: RepoName, factory: RepoFactory) -> Result<(), UowError> {
        if self.factories.contains_key(name) {
            return Err(UowError::AlreadyRegistered(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Builds a pool-scoped (autocommit) repository.
    pub fn repository<R: 'static>(&self, name: RepoName) -> Result<R, UowError> {
        let factory = self
            .factories
            .get(name)
            .ok_or(UowError::NotRegistered(name))?;
        downcast_repo(factory(Db::Pool(self.pool.clone())), name)
    }

    /// Runs `f` inside one database transaction. Commits when `f` returns
    /// `Ok`, rolls back otherwise. A rollback failure is logged but never
    /// masks the primary error; a commit failure after a successful closure
    /// is surfaced.
    pub async fn transact<R, E, F, Fut>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<UowError>,
    {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| E::from(UowError::Begin(e)))?;
        let shared: SharedTx = Arc::new(Mutex::new(Some(tx)));
        let scope = TxScope {
            db: Db::Tx(shared.clone()),
            factories: self.factories.clone(),
        };

        match f(scope).await {
            Ok(value) => {
                let tx = shared
                    .lock()
                    .await
                    .take()
                    .ok_or_else(|| E::from(UowError::Completed))?;
                tx.commit().await.map_err(|e| E::from(UowError::Commit(e)))?;
                Ok(value)
            }
            Err(err) => {
                if let Some(tx) = shared.lock().await.take() {
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::error!(error = %rollback_err, "transaction rollback failed");
                    }
                }
                Err(err)
            }
        }
    }
}

/// Repository lookup bound to one open transaction. Handed to the closure
/// passed to [`UnitOfWork::transact`].
#[derive(Clone)]
pub struct TxScope {
    db: Db,
    factories: HashMap<RepoName, RepoFactory>,
}

impl TxScope {
    /// Builds a repository over the scope's transaction. The same factory
    /// that produced the autocommit handle is reused, so repositories must
    /// be stateless aside from the handle they capture.
    pub fn get<R: 'static>(&self, name: RepoName) -> Result<R, UowError> {
        let factory = self
            .factories
            .get(name)
            .ok_or(UowError::NotRegistered(name))?;
        downcast_repo(factory(self.db.clone()), name)
    }
}

fn downcast_repo<R: 'static>(boxed: BoxedRepo, name: RepoName) -> Result<R, UowError> {
    boxed
        .downcast::<R>()
        .map(|repo| *repo)
        .map_err(|_| UowError::InvalidRepoType(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[derive(Clone, Debug)]
    struct FakeRepo {
        #[allow(dead_code)]
        db: Db,
    }

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://localhost/uow_test")
            .expect("lazy pool")
    }

    fn fake_factory() -> RepoFactory {
        factory(|db| FakeRepo { db })
    }

    #[tokio::test]
    async fn register_rejects_duplicate_name() {
        let mut uow = UnitOfWork::new(lazy_pool());
        uow.register("fake", fake_factory()).unwrap();

        let err = uow.register("fake", fake_factory()).unwrap_err();
        assert!(matches!(err, UowError::AlreadyRegistered("fake")));
    }

    #[tokio::test]
    async fn repository_requires_registration() {
        let uow = UnitOfWork::new(lazy_pool());

        let err = uow.repository::<FakeRepo>("missing").unwrap_err();
        assert!(matches!(err, UowError::NotRegistered("missing")));
    }

    #[tokio::test]
    async fn repository_rejects_wrong_type() {
        let mut uow = UnitOfWork::new(lazy_pool());
        uow.register("fake", fake_factory()).unwrap();

        let err = uow.repository::<String>("fake").unwrap_err();
        assert!(matches!(err, UowError::InvalidRepoType("fake")));
    }

    #[tokio::test]
    async fn repository_returns_registered_type() {
        let mut uow = UnitOfWork::new(lazy_pool());
        uow.register("fake", fake_factory()).unwrap();

        assert!(uow.repository::<FakeRepo>("fake").is_ok());
    }
}
