// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for TPM 1.2 operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Device read/write failed or returned truncated data.
    #[error("TPM device I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Response bytes could not be decoded against the expected shape.
    #[error("malformed TPM data: {0}")]
    Malformed(&'static str),

    /// The TPM returned a non-zero return code. The raw code is preserved so
    /// callers can distinguish e.g. AUTHFAIL from DEFEND_LOCK_RUNNING.
    #[error("TPM error code {0:#06x}")]
    Tpm(u32),

    /// The response HMAC did not match. Distinct from `Tpm(AUTHFAIL)`, which
    /// is the device rejecting our authorization.
    #[error("response HMAC verification failed")]
    AuthFail,

    /// Caller violated a precondition.
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// The host RNG failed while drawing a nonce.
    #[error("system RNG failure")]
    Rand,

    /// A quote signature did not verify.
    #[error("quote signature verification failed")]
    Signature,
}

impl Error {
    /// The raw TPM return code, if this error carries one.
    pub fn tpm_code(&self) -> Option<u32> {
        match self {
            Error::Tpm(code) => Some(*code),
            _ => None,
        }
    }
}
