// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 1.2 constants: tags, ordinals, entity types and well-known values

/// TPM 1.2 command ordinals (TPM_ORD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ordinal {
    Oiap = 0x0000000A,
    Osap = 0x0000000B,
    PcrRead = 0x00000015,
    Quote = 0x00000016,
    Seal = 0x00000017,
    Unseal = 0x00000018,
    GetPubKey = 0x00000021,
    Quote2 = 0x0000003E,
    ResetLockValue = 0x00000040,
    LoadKey2 = 0x00000041,
    GetRandom = 0x00000046,
    MakeIdentity = 0x00000079,
    FlushSpecific = 0x000000BA,
}

impl Ordinal {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Request/response framing tags (TPM_TAG)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandTag {
    RquCommand = 0x00C1,
    RquAuth1Command = 0x00C2,
    RquAuth2Command = 0x00C3,
    RspCommand = 0x00C4,
    RspAuth1Command = 0x00C5,
    RspAuth2Command = 0x00C6,
}

impl CommandTag {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C1 => Some(CommandTag::RquCommand),
            0x00C2 => Some(CommandTag::RquAuth1Command),
            0x00C3 => Some(CommandTag::RquAuth2Command),
            0x00C4 => Some(CommandTag::RspCommand),
            0x00C5 => Some(CommandTag::RspAuth1Command),
            0x00C6 => Some(CommandTag::RspAuth2Command),
            _ => None,
        }
    }

    /// Number of trailing auth blocks a response with this tag carries.
    pub fn auth_count(self) -> usize {
        match self {
            CommandTag::RquCommand | CommandTag::RspCommand => 0,
            CommandTag::RquAuth1Command | CommandTag::RspAuth1Command => 1,
            CommandTag::RquAuth2Command | CommandTag::RspAuth2Command => 2,
        }
    }
}

/// Entity types for OSAP (TPM_ET)
pub mod tpm_et {
    pub const KEYHANDLE: u16 = 0x0001;
    pub const OWNER: u16 = 0x0002;
    pub const SRK: u16 = 0x0004;
}

/// Well-known permanent handles (TPM_KH)
pub mod tpm_kh {
    pub const SRK: u32 = 0x40000000;
    pub const OWNER: u32 = 0x40000001;
}

/// Resource types for FlushSpecific (TPM_RT)
pub mod tpm_rt {
    pub const KEY: u32 = 0x00000001;
    pub const AUTH: u32 = 0x00000002;
}

/// Algorithm identifiers (TPM_ALG)
pub mod tpm_alg {
    pub const RSA: u32 = 0x00000001;
    pub const SHA: u32 = 0x00000004;
    pub const HMAC: u32 = 0x00000005;
}

/// Encryption schemes (TPM_ES)
pub mod tpm_es {
    pub const NONE: u16 = 0x0001;
    pub const RSA_ES_PKCSV15: u16 = 0x0002;
    pub const RSA_ES_OAEP_SHA1_MGF1: u16 = 0x0003;
}

/// Signature schemes (TPM_SS)
pub mod tpm_ss {
    pub const NONE: u16 = 0x0001;
    pub const RSA_SA_PKCS1V15_SHA1: u16 = 0x0002;
    pub const RSA_SA_PKCS1V15_DER: u16 = 0x0003;
}

/// Key usage values (TPM_KEY_USAGE)
pub mod tpm_key_usage {
    pub const SIGNING: u16 = 0x0010;
    pub const STORAGE: u16 = 0x0011;
    pub const IDENTITY: u16 = 0x0012;
    pub const BIND: u16 = 0x0014;
    pub const LEGACY: u16 = 0x0015;
}

/// Auth data usage values (TPM_AUTH_DATA_USAGE)
pub mod tpm_auth {
    pub const NEVER: u8 = 0x00;
    pub const ALWAYS: u8 = 0x01;
}

/// TPM 1.2 return codes of interest (TPM_*)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;
    pub const AUTHFAIL: u32 = 0x001;
    pub const BADINDEX: u32 = 0x002;
    pub const BAD_PARAMETER: u32 = 0x003;
    pub const DEACTIVATED: u32 = 0x006;
    pub const DISABLED: u32 = 0x007;
    pub const FAIL: u32 = 0x009;
    pub const BAD_ORDINAL: u32 = 0x00A;
    pub const RESOURCES: u32 = 0x015;
    pub const INVALID_AUTHHANDLE: u32 = 0x01C;
    pub const DEFEND_LOCK_RUNNING: u32 = 0x803;

    /// Short description for known codes, for log and CLI output.
    pub fn describe(code: u32) -> &'static str {
        match code {
            SUCCESS => "success",
            AUTHFAIL => "authentication failed",
            BADINDEX => "bad index",
            BAD_PARAMETER => "bad parameter",
            DEACTIVATED => "TPM deactivated",
            DISABLED => "TPM disabled",
            FAIL => "self-test failure",
            BAD_ORDINAL => "unknown ordinal",
            RESOURCES => "out of resources",
            INVALID_AUTHHANDLE => "invalid auth handle",
            DEFEND_LOCK_RUNNING => "dictionary-attack defense running",
            _ => "unknown error",
        }
    }
}

/// Version field carried by key and stored-data records (TPM_STRUCT_VER 1.1.0.0)
pub const STRUCT_VER: u32 = 0x01010000;

/// Tag on TPM_PCR_INFO_LONG records
pub const TAG_PCR_INFO_LONG: u16 = 0x0006;

/// Fixed marker inside TPM_QUOTE_INFO
pub const QUOTE_FIXED: [u8; 4] = *b"QUOT";

/// The 20-byte well-known secret used when the SRK or Owner was taken with
/// the well-known auth policy.
pub const WELL_KNOWN_AUTH: [u8; 20] = [0u8; 20];

/// Number of PCRs a 1.2 TPM carries; selections are a 3-byte bitmap.
pub const PCR_COUNT: u32 = 24;

/// SHA-1 output, nonce and auth secret size.
pub const DIGEST_SIZE: usize = 20;
