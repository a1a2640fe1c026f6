// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the node identity core

use std::io;

use crate::types::VnodeType;

/// Failure reported by the host's vnode constructor
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructError {
    #[error("host out of vnode resources")]
    ResourceExhausted,
    #[error("constructor rejected request: {0}")]
    Rejected(String),
    #[error("constructor failed with errno {0}")]
    Errno(i32),
}

impl ConstructError {
    pub fn errno(&self) -> i32 {
        match self {
            ConstructError::ResourceExhausted => libc::ENOMEM,
            ConstructError::Rejected(_) => libc::EIO,
            ConstructError::Errno(code) => *code,
        }
    }
}

/// Core error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("vnode construction failed: {0}")]
    Construction(#[from] ConstructError),
    /// The cached identity has a different type than the remote object; retry the lookup.
    #[error("stale node {identifier}: cached as {cached:?}, requested {requested:?}")]
    RetryableConflict {
        identifier: u64,
        cached: VnodeType,
        requested: VnodeType,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl FsError {
    /// errno to hand back across the host boundary
    pub fn errno(&self) -> i32 {
        match self {
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotFound => libc::ENOENT,
            FsError::Construction(err) => err.errno(),
            FsError::RetryableConflict { .. } => libc::EAGAIN,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Config(_) => libc::EINVAL,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::RetryableConflict { .. })
    }
}

pub type FsResult<T> = Result<T, FsError>;
