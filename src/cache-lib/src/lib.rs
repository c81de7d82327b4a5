#![allow(unused, dead_code)]

mod elision_cache;
mod hash;
mod hasher;
mod location;
mod single_flight;

pub use elision_cache::*;
pub use hash::*;
pub use hasher::*;
pub use location::*;
pub use single_flight::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid hash format: {0}")]
    InvalidHash(String),
    #[error("content not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("hash verify error: {0}")]
    VerifyError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled(_))
    }
}
