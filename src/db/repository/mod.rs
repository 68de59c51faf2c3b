//! Repository Module
//!
//! 窄接口仓储：每个实体只暴露核心路径需要的操作 —
//! 按 id 查询、CAS 更新、插入、唯一对存在性检查。

pub mod order;
pub mod voucher;

use thiserror::Error;

/// Repository error types
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepoError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepoError::Duplicate(err.to_string())
            }
            _ => RepoError::Database(err.to_string()),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
