// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 Test CLI
//!
//! A simple CLI tool to exercise TPM 1.2 operations on real hardware.
//!
//! Usage:
//!   tpm12-test [command]
//!
//! Commands:
//!   info        - Show TPM device info
//!   random      - Get random bytes from the TPM
//!   pcr-read    - Read PCR values
//!   seal        - Seal/unseal round-trip bound to PCR 17
//!   quote       - Load ./aikblob and quote PCRs 17+18, then verify
//!   identity    - Make a fresh AIK, load it, quote and verify
//!   reset-lock  - Reset the dictionary-attack lockout (owner auth)
//!   all         - Run all tests
//!
//! All commands assume the well-known 20-zero-byte SRK/owner secrets.

use std::env;

use anyhow::{Context, Result};
use tpm12::{unmarshal_rsa_public_key, verify_quote, TpmContext, WELL_KNOWN_AUTH};

fn main() {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("all");

    println!("=== TPM 1.2 Pure Rust Test Tool ===\n");

    match command {
        "info" => test_info(),
        "random" => test_random(),
        "pcr-read" => test_pcr_read(),
        "seal" => test_seal_unseal(),
        "quote" => test_quote(),
        "identity" => test_identity(),
        "reset-lock" => test_reset_lock(),
        "all" => {
            test_info();
            test_random();
            test_pcr_read();
            test_seal_unseal();
            test_quote();
            test_identity();
            test_reset_lock();
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!(
                "Available commands: info, random, pcr-read, seal, quote, identity, reset-lock, all"
            );
            std::process::exit(1);
        }
    }
}

fn open() -> Option<TpmContext> {
    match TpmContext::new(None) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            println!("✗ Failed to open TPM device: {}", e);
            None
        }
    }
}

fn test_info() {
    println!("--- Test: Device Info ---");

    if let Some(ctx) = open() {
        println!("✓ TPM device opened: {}", ctx.device_path());
    }
    println!();
}

fn test_random() {
    println!("--- Test: Random Number Generation ---");

    let Some(mut ctx) = open() else { return };

    match ctx.get_random(16) {
        Ok(bytes) => {
            println!("✓ Got {} random bytes:", bytes.len());
            println!("  {}", hex::encode(&bytes));
        }
        Err(e) => println!("✗ GetRandom failed: {}", e),
    }

    // Two draws must differ.
    match (ctx.get_random(16), ctx.get_random(16)) {
        (Ok(a), Ok(b)) if a != b => println!("✓ Consecutive draws differ"),
        (Ok(_), Ok(_)) => println!("✗ TPM returned identical random buffers"),
        (Err(e), _) | (_, Err(e)) => println!("✗ GetRandom failed: {}", e),
    }
    println!();
}

fn test_pcr_read() {
    println!("--- Test: PCR Read ---");

    let Some(mut ctx) = open() else { return };

    for pcr in [17u32, 18] {
        match ctx.pcr_read(pcr) {
            Ok(value) => println!("✓ PCR {:2}: {}", pcr, hex::encode(value)),
            Err(e) => println!("✗ Couldn't read PCR {}: {}", pcr, e),
        }
    }
    println!();
}

fn test_seal_unseal() {
    println!("--- Test: Seal/Unseal (PCR 17, locality 0) ---");

    let Some(mut ctx) = open() else { return };

    let mut data = vec![0u8; 64];
    data[0] = 1;
    data[1] = 27;
    data[2] = 52;

    let sealed = match ctx.seal(0, &[17], &data, &WELL_KNOWN_AUTH) {
        Ok(sealed) => {
            println!("✓ Sealed {} bytes into a {}-byte blob", data.len(), sealed.len());
            sealed
        }
        Err(e) => {
            println!("✗ Seal failed: {}", e);
            return;
        }
    };

    match ctx.unseal(&sealed, &WELL_KNOWN_AUTH) {
        Ok(unsealed) if unsealed == data => println!("✓ Unsealed data matches the original"),
        Ok(_) => println!("✗ Unsealed data does not match the original"),
        Err(e) => println!("✗ Unseal failed: {}", e),
    }
    println!();
}

fn load_aik_blob() -> Result<Vec<u8>> {
    std::fs::read("./aikblob").context("no ./aikblob file (create one with `identity`)")
}

fn quote_and_verify(ctx: &mut TpmContext, blob: &[u8], data: &[u8]) -> Result<()> {
    let handle = ctx.load_key2(blob, &WELL_KNOWN_AUTH)?;
    println!("✓ Loaded AIK with handle {:#010x}", handle);

    let pcr_nums = [17u32, 18];
    let (signature, values) = ctx.quote(handle, data, &pcr_nums, &WELL_KNOWN_AUTH)?;
    println!("✓ Got a quote of {} bytes", signature.len());

    let pk = unmarshal_rsa_public_key(blob)?;
    verify_quote(&pk, data, &signature, &pcr_nums, &values)?;
    println!("✓ Quote signature verified");
    Ok(())
}

fn test_quote() {
    println!("--- Test: LoadKey2 + Quote ---");

    let Some(mut ctx) = open() else { return };

    let blob = match load_aik_blob() {
        Ok(blob) => blob,
        Err(e) => {
            println!("- Skipped: {}", e);
            println!();
            return;
        }
    };

    match quote_and_verify(&mut ctx, &blob, b"The OS says this test is good") {
        Ok(()) => {}
        Err(e) => println!("✗ Quote failed: {}", e),
    }
    println!();
}

fn test_identity() {
    println!("--- Test: MakeIdentity (null Privacy CA) ---");

    let Some(mut ctx) = open() else { return };

    let blob = match ctx.make_identity(
        &WELL_KNOWN_AUTH,
        &WELL_KNOWN_AUTH,
        &WELL_KNOWN_AUTH,
        None,
        None,
    ) {
        Ok(blob) => {
            println!("✓ Created a new AIK blob of {} bytes", blob.len());
            blob
        }
        Err(e) => {
            println!("✗ MakeIdentity failed: {}", e);
            return;
        }
    };

    match quote_and_verify(&mut ctx, &blob, b"The OS says this test and new AIK is good") {
        Ok(()) => {}
        Err(e) => println!("✗ Quoting with the fresh AIK failed: {}", e),
    }
    println!();
}

fn test_reset_lock() {
    println!("--- Test: ResetLockValue ---");

    let Some(mut ctx) = open() else { return };

    match ctx.reset_lock_value(&WELL_KNOWN_AUTH) {
        Ok(()) => println!("✓ Dictionary-attack lockout reset"),
        Err(e) => println!("✗ ResetLockValue failed: {}", e),
    }
    println!();
}
