// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 1.2 data types
//!
//! Each record marshals its fields in declaration order, matching the wire
//! layout of the corresponding TPM_* structure.

use sha1::{Digest as _, Sha1};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// TPM handle (keys, sessions, resources)
pub type Handle = u32;

/// 20-byte SHA-1 digest
pub type Digest = [u8; 20];

/// 20-byte session nonce
pub type Nonce = [u8; 20];

/// Trailing auth block on an authorized request
#[derive(Debug, Clone)]
pub struct CommandAuth {
    pub auth_handle: Handle,
    pub nonce_odd: Nonce,
    pub continue_session: u8,
    pub auth: Digest,
}

impl Marshal for CommandAuth {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.auth_handle);
        buf.put_bytes(&self.nonce_odd);
        buf.put_u8(self.continue_session);
        buf.put_bytes(&self.auth);
    }
}

/// Trailing auth block on an authorized response
#[derive(Debug, Clone)]
pub struct ResponseAuth {
    pub nonce_even: Nonce,
    pub continue_session: u8,
    pub auth: Digest,
}

impl Unmarshal for ResponseAuth {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce_even: buf.get_array()?,
            continue_session: buf.get_u8()?,
            auth: buf.get_array()?,
        })
    }
}

/// TPM_PCR_SELECTION: a u16 size (always 3) and a bitmap over 24 PCRs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrSelection {
    pub mask: [u8; 3],
}

impl PcrSelection {
    pub fn new(pcrs: &[u32]) -> Result<Self> {
        let mut mask = [0u8; 3];
        for &pcr in pcrs {
            if pcr >= PCR_COUNT {
                return Err(Error::Usage("PCR index out of range"));
            }
            mask[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Ok(Self { mask })
    }

    /// Number of PCRs selected
    pub fn count(&self) -> usize {
        self.mask.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Selected PCR indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for pcr in 0..PCR_COUNT {
            if self.mask[(pcr / 8) as usize] & (1 << (pcr % 8)) != 0 {
                out.push(pcr);
            }
        }
        out
    }
}

impl Marshal for PcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.mask.len() as u16);
        buf.put_bytes(&self.mask);
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let size = buf.get_u16()? as usize;
        if size != 3 {
            return Err(Error::Malformed("unexpected PCR selection size"));
        }
        Ok(Self {
            mask: buf.get_array()?,
        })
    }
}

/// TPM_PCR_COMPOSITE: a selection plus the concatenated selected PCR values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrComposite {
    pub selection: PcrSelection,
    pub values: Vec<u8>,
}

impl PcrComposite {
    pub fn new(selection: PcrSelection, values: Vec<u8>) -> Result<Self> {
        if values.len() != selection.count() * DIGEST_SIZE {
            return Err(Error::Usage("PCR values do not match selection"));
        }
        Ok(Self { selection, values })
    }

    /// TPM_COMPOSITE_HASH: SHA-1 of the packed composite
    pub fn digest(&self) -> Digest {
        Sha1::digest(self.to_bytes()).into()
    }
}

impl Marshal for PcrComposite {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.selection.marshal(buf);
        buf.put_blob(&self.values);
    }
}

impl Unmarshal for PcrComposite {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            selection: PcrSelection::unmarshal(buf)?,
            values: buf.get_blob()?,
        })
    }
}

/// TPM_PCR_INFO_LONG: binds creation and release PCR state plus locality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrInfoLong {
    pub tag: u16,
    pub locality_at_creation: u8,
    pub locality_at_release: u8,
    pub creation_selection: PcrSelection,
    pub release_selection: PcrSelection,
    pub digest_at_creation: Digest,
    pub digest_at_release: Digest,
}

impl PcrInfoLong {
    /// Build a pcrInfoLong over the current values of the selected PCRs,
    /// with identical creation and release policies.
    pub fn new(locality: u8, selection: PcrSelection, pcr_values: Vec<u8>) -> Result<Self> {
        let composite = PcrComposite::new(selection.clone(), pcr_values)?;
        let digest = composite.digest();
        Ok(Self {
            tag: TAG_PCR_INFO_LONG,
            locality_at_creation: locality,
            locality_at_release: locality,
            creation_selection: selection.clone(),
            release_selection: selection,
            digest_at_creation: digest,
            digest_at_release: digest,
        })
    }
}

impl Marshal for PcrInfoLong {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u8(self.locality_at_creation);
        buf.put_u8(self.locality_at_release);
        self.creation_selection.marshal(buf);
        self.release_selection.marshal(buf);
        buf.put_bytes(&self.digest_at_creation);
        buf.put_bytes(&self.digest_at_release);
    }
}

impl Unmarshal for PcrInfoLong {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            tag: buf.get_u16()?,
            locality_at_creation: buf.get_u8()?,
            locality_at_release: buf.get_u8()?,
            creation_selection: PcrSelection::unmarshal(buf)?,
            release_selection: PcrSelection::unmarshal(buf)?,
            digest_at_creation: buf.get_array()?,
            digest_at_release: buf.get_array()?,
        })
    }
}

/// TPM_PCR_INFO_SHORT, as returned by Quote2
#[derive(Debug, Clone)]
pub struct PcrInfoShort {
    pub selection: PcrSelection,
    pub locality_at_release: u8,
    pub digest_at_release: Digest,
}

impl Unmarshal for PcrInfoShort {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            selection: PcrSelection::unmarshal(buf)?,
            locality_at_release: buf.get_u8()?,
            digest_at_release: buf.get_array()?,
        })
    }
}

/// TPM_RSA_KEY_PARMS. An empty exponent means the default 65537.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKeyParms {
    pub key_length: u32,
    pub num_primes: u32,
    pub exponent: Vec<u8>,
}

impl Marshal for RsaKeyParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.key_length);
        buf.put_u32(self.num_primes);
        buf.put_blob(&self.exponent);
    }
}

impl Unmarshal for RsaKeyParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            key_length: buf.get_u32()?,
            num_primes: buf.get_u32()?,
            exponent: buf.get_blob()?,
        })
    }
}

/// TPM_KEY_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParms {
    pub alg_id: u32,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub parms: Vec<u8>,
}

impl Marshal for KeyParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.alg_id);
        buf.put_u16(self.enc_scheme);
        buf.put_u16(self.sig_scheme);
        buf.put_blob(&self.parms);
    }
}

impl Unmarshal for KeyParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            alg_id: buf.get_u32()?,
            enc_scheme: buf.get_u16()?,
            sig_scheme: buf.get_u16()?,
            parms: buf.get_blob()?,
        })
    }
}

/// The TPM_KEY/TPM_KEY12 surface used by LoadKey2 and MakeIdentity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmKey {
    pub version: u32,
    pub key_usage: u16,
    pub key_flags: u32,
    pub auth_data_usage: u8,
    pub algorithm_parms: KeyParms,
    pub pcr_info: Vec<u8>,
    pub pub_key: Vec<u8>,
    pub enc_data: Vec<u8>,
}

impl TpmKey {
    /// The AIK template MakeIdentity submits: RSA-2048, two primes, implicit
    /// 65537 exponent, identity usage, auth always, RSASSA-PKCS1-v1.5/SHA-1.
    pub fn identity_template() -> Self {
        let rsa_parms = RsaKeyParms {
            key_length: 2048,
            num_primes: 2,
            exponent: Vec::new(),
        };
        Self {
            version: STRUCT_VER,
            key_usage: tpm_key_usage::IDENTITY,
            key_flags: 0,
            auth_data_usage: tpm_auth::ALWAYS,
            algorithm_parms: KeyParms {
                alg_id: tpm_alg::RSA,
                enc_scheme: tpm_es::NONE,
                sig_scheme: tpm_ss::RSA_SA_PKCS1V15_SHA1,
                parms: rsa_parms.to_bytes(),
            },
            pcr_info: Vec::new(),
            pub_key: Vec::new(),
            enc_data: Vec::new(),
        }
    }

    /// Decode the RSA parameters carried in `algorithm_parms`.
    pub fn rsa_parms(&self) -> Result<RsaKeyParms> {
        if self.algorithm_parms.alg_id != tpm_alg::RSA {
            return Err(Error::Usage("key algorithm is not RSA"));
        }
        RsaKeyParms::from_bytes(&self.algorithm_parms.parms)
    }
}

impl Marshal for TpmKey {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.version);
        buf.put_u16(self.key_usage);
        buf.put_u32(self.key_flags);
        buf.put_u8(self.auth_data_usage);
        self.algorithm_parms.marshal(buf);
        buf.put_blob(&self.pcr_info);
        buf.put_blob(&self.pub_key);
        buf.put_blob(&self.enc_data);
    }
}

impl Unmarshal for TpmKey {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            version: buf.get_u32()?,
            key_usage: buf.get_u16()?,
            key_flags: buf.get_u32()?,
            auth_data_usage: buf.get_u8()?,
            algorithm_parms: KeyParms::unmarshal(buf)?,
            pcr_info: buf.get_blob()?,
            pub_key: buf.get_blob()?,
            enc_data: buf.get_blob()?,
        })
    }
}

/// TPM_PUBKEY: key parameters plus the TPM_STORE_PUBKEY modulus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKey {
    pub algorithm_parms: KeyParms,
    pub key: Vec<u8>,
}

impl Marshal for PubKey {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.algorithm_parms.marshal(buf);
        buf.put_blob(&self.key);
    }
}

impl Unmarshal for PubKey {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            algorithm_parms: KeyParms::unmarshal(buf)?,
            key: buf.get_blob()?,
        })
    }
}

/// TPM_STORED_DATA: the opaque sealed blob Seal returns and Unseal consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmStoredData {
    pub version: u32,
    pub et: u32,
    pub seal_info: Vec<u8>,
    pub enc_data: Vec<u8>,
}

impl Marshal for TpmStoredData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.version);
        buf.put_u32(self.et);
        buf.put_blob(&self.seal_info);
        buf.put_blob(&self.enc_data);
    }
}

impl Unmarshal for TpmStoredData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            version: buf.get_u32()?,
            et: buf.get_u32()?,
            seal_info: buf.get_blob()?,
            enc_data: buf.get_blob()?,
        })
    }
}

/// TPM_QUOTE_INFO: the 48-byte record a Quote signature covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInfo {
    pub version: u32,
    pub fixed: [u8; 4],
    pub composite_digest: Digest,
    pub external_data: Digest,
}

impl QuoteInfo {
    pub fn new(composite_digest: Digest, external_data: Digest) -> Self {
        Self {
            version: STRUCT_VER,
            fixed: QUOTE_FIXED,
            composite_digest,
            external_data,
        }
    }
}

impl Marshal for QuoteInfo {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.version);
        buf.put_bytes(&self.fixed);
        buf.put_bytes(&self.composite_digest);
        buf.put_bytes(&self.external_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_bits() {
        let sel = PcrSelection::new(&[0, 1, 2, 7]).unwrap();
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.mask, [0x87, 0x00, 0x00]);

        let sel = PcrSelection::new(&[17, 18]).unwrap();
        assert_eq!(sel.mask, [0x00, 0x00, 0x06]);
        assert_eq!(sel.count(), 2);
        assert_eq!(sel.indices(), vec![17, 18]);
    }

    #[test]
    fn test_pcr_selection_rejects_out_of_range() {
        assert!(matches!(
            PcrSelection::new(&[24]),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_pcr_selection_wire_form() {
        let sel = PcrSelection::new(&[17]).unwrap();
        assert_eq!(sel.to_bytes(), vec![0x00, 0x03, 0x00, 0x00, 0x02]);
        assert_eq!(PcrSelection::from_bytes(&sel.to_bytes()).unwrap(), sel);
    }

    #[test]
    fn test_composite_validates_value_length() {
        let sel = PcrSelection::new(&[17, 18]).unwrap();
        assert!(matches!(
            PcrComposite::new(sel, vec![0u8; 20]),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_composite_digest() {
        let sel = PcrSelection::new(&[17]).unwrap();
        let composite = PcrComposite::new(sel, vec![0u8; 20]).unwrap();

        // selection (5) + u32 length (4) + values (20)
        let bytes = composite.to_bytes();
        assert_eq!(bytes.len(), 29);
        assert_eq!(PcrComposite::from_bytes(&bytes).unwrap(), composite);

        let expected: Digest = Sha1::digest(&bytes).into();
        assert_eq!(composite.digest(), expected);
    }

    #[test]
    fn test_pcr_info_long_roundtrip() {
        let sel = PcrSelection::new(&[17]).unwrap();
        let info = PcrInfoLong::new(0, sel, vec![0xAB; 20]).unwrap();

        assert_eq!(info.tag, TAG_PCR_INFO_LONG);
        assert_eq!(info.digest_at_creation, info.digest_at_release);

        let bytes = info.to_bytes();
        // tag (2) + localities (2) + two selections (10) + two digests (40)
        assert_eq!(bytes.len(), 54);
        assert_eq!(info.packed_size(), 54);
        assert_eq!(PcrInfoLong::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn test_key_roundtrip() {
        let key = TpmKey::identity_template();
        let bytes = key.to_bytes();
        assert_eq!(TpmKey::from_bytes(&bytes).unwrap(), key);

        // Truncating anywhere must fail cleanly.
        for cut in 0..bytes.len() {
            assert!(TpmKey::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_identity_template_fields() {
        let key = TpmKey::identity_template();
        assert_eq!(key.version, STRUCT_VER);
        assert_eq!(key.key_usage, tpm_key_usage::IDENTITY);
        assert_eq!(key.auth_data_usage, tpm_auth::ALWAYS);
        assert_eq!(key.algorithm_parms.alg_id, tpm_alg::RSA);
        assert_eq!(key.algorithm_parms.enc_scheme, tpm_es::NONE);
        assert_eq!(
            key.algorithm_parms.sig_scheme,
            tpm_ss::RSA_SA_PKCS1V15_SHA1
        );

        let rsa = key.rsa_parms().unwrap();
        assert_eq!(rsa.key_length, 2048);
        assert_eq!(rsa.num_primes, 2);
        assert!(rsa.exponent.is_empty());
    }

    #[test]
    fn test_stored_data_roundtrip() {
        let tsd = TpmStoredData {
            version: STRUCT_VER,
            et: 0x0004,
            seal_info: vec![1, 2, 3],
            enc_data: vec![9; 32],
        };
        let bytes = tsd.to_bytes();
        assert_eq!(TpmStoredData::from_bytes(&bytes).unwrap(), tsd);
    }

    #[test]
    fn test_quote_info_layout() {
        let qi = QuoteInfo::new([1u8; 20], [2u8; 20]);
        let bytes = qi.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[0..4], &[0x01, 0x01, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], b"QUOT");
    }
}
