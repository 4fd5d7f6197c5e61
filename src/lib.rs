// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 1.2 implementation
//!
//! This crate drives a v1.2 TPM through its character device, communicating
//! directly with `/dev/tpm0` without C library dependencies. Its core is the
//! authorized-command protocol: OIAP/OSAP sessions, rolling-nonce HMAC-SHA-1
//! authorization, and EncAuth masking of injected secrets.
//!
//! ## Supported Commands
//!
//! - PCR operations: `PCR_Read`
//! - Random: `GetRandom`
//! - Key operations: `LoadKey2`, `GetPubKey`
//! - Sealing: `Seal`, `Unseal` against PCR state and locality
//! - Attestation: `Quote`, `Quote2`, `MakeIdentity`
//! - Maintenance: `ResetLockValue`
//!
//! Key blobs and sealed blobs are opaque byte strings; sealed data only
//! opens on the TPM that produced it.
//!
//! ## Example
//!
//! ```no_run
//! use tpm12::{TpmContext, WELL_KNOWN_AUTH};
//!
//! let mut ctx = TpmContext::new(None)?; // /dev/tpm0
//! let random_bytes = ctx.get_random(16)?;
//! let pcr17 = ctx.pcr_read(17)?;
//! let sealed = ctx.seal(0, &[17], b"secret", &WELL_KNOWN_AUTH)?;
//! # Ok::<(), tpm12::Error>(())
//! ```
//!
//! The device is a strictly serial resource: one context per device, one
//! command at a time. Callers needing concurrency must serialize externally.

mod commands;
mod constants;
mod device;
mod error;
mod marshal;
mod session;
mod types;
mod verify;

pub use commands::TpmContext;
pub use constants::*;
pub use error::{Error, Result};
pub use types::*;
pub use verify::{privacy_ca_digest, pubkey_from_rsa, unmarshal_rsa_public_key, verify_quote};

// Re-export the lower layers for advanced usage
pub use device::{TpmDevice, TpmRequest, TpmResponse, DEFAULT_DEVICE};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{flush_specific, AuthSession};
