// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure modes of the dissemination subsystem.
///
/// Fetch-level errors (`IdMismatch`, `NotFound`, `Transport`) are recovered
/// locally by the retry loop; only `Exhausted` and `Cancelled` ever reach
/// fetch waiters. The type is `Clone` because a single fetch result fans out
/// to every waiter registered for the same block id.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TxBlockError {
    #[error("malformed wire bytes: {0}")]
    InvalidWire(String),
    #[error("response bytes do not hash to the requested id")]
    IdMismatch,
    #[error("peer does not have the requested tx block")]
    NotFound,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("exhausted retries")]
    Exhausted,
    #[error("cancelled")]
    Cancelled,
    #[error("verification failed: {0}")]
    VerifyFailed(String),
}
