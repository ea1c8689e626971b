//! Registration and login, issuing bearer tokens on both.

use thiserror::Error;

use crate::auth::jwt::{JwtKeys, TokenError};
use crate::auth::password::{hash_password, verify_password};
use crate::models::User;
use crate::repos::{RepoError, UserRepo, USER_REPO};
use crate::uow::{UnitOfWork, UowError};

#[derive(Debug, Error)]
pub enum UserServiceError {
    #[error("user with this login already exists")]
    DuplicateUsername,

    /// Unknown login and wrong password collapse into one kind on purpose.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("password hash: {0}")]
    PasswordHash(String),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Uow(#[from] UowError),

    #[error(transparent)]
    Repo(RepoError),
}

pub struct UserService {
    users: UserRepo,
    jwt: JwtKeys,
}

impl UserService {
    pub fn new(uow: &UnitOfWork, jwt: JwtKeys) -> Result<Self, UowError> {
        let users: UserRepo = uow.repository(USER_REPO)?;
        Ok(Self { users, jwt })
    }

    /// Creates the user and signs a bearer token for it.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(User, String), UserServiceError> {
        let password_hash = hash_password(password).map_err(UserServiceError::PasswordHash)?;

        let user = self
            .users
            .create(username, &password_hash)
            .await
            .map_err(|err| match err {
                RepoError::DuplicateKey => UserServiceError::DuplicateUsername,
                other => UserServiceError::Repo(other),
            })?;

        let token = self.jwt.sign_user_token(user.id)?;
        Ok((user, token))
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(User, String), UserServiceError> {
        let user = self
            .users
            .find_by_username(username)
            .await
            .map_err(|err| match err {
                RepoError::NotFound => UserServiceError::InvalidCredentials,
                other => UserServiceError::Repo(other),
            })?;

        let matches = verify_password(password, &user.password_hash)
            .map_err(UserServiceError::PasswordHash)?;
        if !matches {
            return Err(UserServiceError::InvalidCredentials);
        }

        let token = self.jwt.sign_user_token(user.id)?;
        Ok((user, token))
    }
}
