// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! RSA public-key extraction and quote verification
//!
//! These helpers sit outside the authorized-command core: they let a caller
//! (or a verifier with no TPM at all) turn key blobs into `RsaPublicKey`s
//! and check quote signatures against expected PCR state.

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest as _, Sha1};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::{Marshal, Unmarshal};
use crate::types::{
    Digest, KeyParms, PcrComposite, PcrSelection, PubKey, QuoteInfo, RsaKeyParms, TpmKey,
};

/// The implicit RSA public exponent when a key blob's exponent is empty.
const DEFAULT_EXPONENT: u32 = 65537;

/// Extract the RSA public key from a serialized TPM_KEY/TPM_KEY12 blob.
pub fn unmarshal_rsa_public_key(key_blob: &[u8]) -> Result<RsaPublicKey> {
    let key = TpmKey::from_bytes(key_blob)?;
    let parms = key.rsa_parms()?;
    rsa_from_parts(&parms, &key.pub_key)
}

fn rsa_from_parts(parms: &RsaKeyParms, modulus: &[u8]) -> Result<RsaPublicKey> {
    if modulus.is_empty() {
        return Err(Error::Malformed("key blob carries no modulus"));
    }
    let e = if parms.exponent.is_empty() {
        BigUint::from(DEFAULT_EXPONENT)
    } else {
        BigUint::from_bytes_be(&parms.exponent)
    };
    RsaPublicKey::new(BigUint::from_bytes_be(modulus), e)
        .map_err(|_| Error::Malformed("invalid RSA public key"))
}

/// Verify a quote signature: rebuild the PCR composite from the selection
/// and values, form TPM_QUOTE_INFO with externalData = SHA1(data), and check
/// the RSASSA-PKCS1-v1.5/SHA-1 signature over its digest.
pub fn verify_quote(
    pk: &RsaPublicKey,
    data: &[u8],
    signature: &[u8],
    pcr_nums: &[u32],
    pcr_values: &[u8],
) -> Result<()> {
    let selection = PcrSelection::new(pcr_nums)?;
    let composite = PcrComposite::new(selection, pcr_values.to_vec())?;
    let external: Digest = Sha1::digest(data).into();

    let quote_info = QuoteInfo::new(composite.digest(), external);
    let digest: Digest = Sha1::digest(quote_info.to_bytes()).into();

    pk.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
        .map_err(|_| Error::Signature)
}

/// Pack an RSA public key as a TPM_PUBKEY record, the form a Privacy CA
/// digest covers.
pub fn pubkey_from_rsa(pk: &RsaPublicKey) -> PubKey {
    let parms = RsaKeyParms {
        key_length: pk.n().bits() as u32,
        num_primes: 2,
        exponent: pk.e().to_bytes_be(),
    };
    PubKey {
        algorithm_parms: KeyParms {
            alg_id: tpm_alg::RSA,
            enc_scheme: tpm_es::NONE,
            sig_scheme: tpm_ss::NONE,
            parms: parms.to_bytes(),
        },
        key: pk.n().to_bytes_be(),
    }
}

/// The TPM_CHOSENID_HASH for MakeIdentity: SHA1(label || TPM_PUBKEY), with
/// the label appended raw. All zeros when no Privacy CA is named; naming
/// only one of the pair is a usage error.
pub fn privacy_ca_digest(pk: Option<&RsaPublicKey>, label: Option<&[u8]>) -> Result<Digest> {
    match (pk, label) {
        (None, None) => Ok([0u8; 20]),
        (Some(pk), Some(label)) => {
            let pubkey = pubkey_from_rsa(pk);
            let mut hasher = Sha1::new();
            hasher.update(label);
            hasher.update(pubkey.to_bytes());
            Ok(hasher.finalize().into())
        }
        _ => Err(Error::Usage(
            "privacy CA key and label must be given together",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 1024).unwrap()
    }

    fn key_blob_with(modulus: Vec<u8>, exponent: Vec<u8>) -> Vec<u8> {
        let parms = RsaKeyParms {
            key_length: (modulus.len() * 8) as u32,
            num_primes: 2,
            exponent,
        };
        let mut key = TpmKey::identity_template();
        key.algorithm_parms.parms = parms.to_bytes();
        key.pub_key = modulus;
        key.to_bytes()
    }

    #[test]
    fn test_unmarshal_rsa_public_key_default_exponent() {
        let sk = test_key();
        let modulus = sk.n().to_bytes_be();

        let pk = unmarshal_rsa_public_key(&key_blob_with(modulus, Vec::new())).unwrap();
        assert_eq!(pk.n(), sk.n());
        assert_eq!(*pk.e(), BigUint::from(65537u32));
    }

    #[test]
    fn test_unmarshal_rsa_public_key_explicit_exponent() {
        let sk = test_key();
        let modulus = sk.n().to_bytes_be();
        let exponent = sk.e().to_bytes_be();

        let pk = unmarshal_rsa_public_key(&key_blob_with(modulus, exponent)).unwrap();
        assert_eq!(pk.e(), sk.e());
    }

    #[test]
    fn test_unmarshal_rejects_non_rsa() {
        let mut key = TpmKey::identity_template();
        key.algorithm_parms.alg_id = 0x0000_0006;
        assert!(unmarshal_rsa_public_key(&key.to_bytes()).is_err());
    }

    #[test]
    fn test_quote_roundtrip() {
        let sk = test_key();
        let pk = sk.to_public_key();

        let data = b"The OS says this test is good";
        let pcr_nums = [17u32, 18];
        let pcr_values = vec![0x5Au8; 40];

        // Sign the way the TPM does: SHA1 of the packed quote info.
        let selection = PcrSelection::new(&pcr_nums).unwrap();
        let composite = PcrComposite::new(selection, pcr_values.clone()).unwrap();
        let external: Digest = Sha1::digest(data).into();
        let quote_info = QuoteInfo::new(composite.digest(), external);
        let digest: Digest = Sha1::digest(quote_info.to_bytes()).into();
        let signature = sk.sign(Pkcs1v15Sign::new::<Sha1>(), &digest).unwrap();

        verify_quote(&pk, data, &signature, &pcr_nums, &pcr_values).unwrap();

        // Any deviation in the attested inputs must fail.
        assert!(matches!(
            verify_quote(&pk, b"different data", &signature, &pcr_nums, &pcr_values),
            Err(Error::Signature)
        ));
        let mut wrong_values = pcr_values.clone();
        wrong_values[0] ^= 1;
        assert!(matches!(
            verify_quote(&pk, data, &signature, &pcr_nums, &wrong_values),
            Err(Error::Signature)
        ));
        let mut wrong_sig = signature.clone();
        wrong_sig[0] ^= 1;
        assert!(matches!(
            verify_quote(&pk, data, &wrong_sig, &pcr_nums, &pcr_values),
            Err(Error::Signature)
        ));
    }

    #[test]
    fn test_privacy_ca_digest_null_case() {
        assert_eq!(privacy_ca_digest(None, None).unwrap(), [0u8; 20]);
    }

    #[test]
    fn test_privacy_ca_digest_half_specified() {
        let pk = test_key().to_public_key();
        assert!(matches!(
            privacy_ca_digest(Some(&pk), None),
            Err(Error::Usage(_))
        ));
        assert!(matches!(
            privacy_ca_digest(None, Some(b"label")),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_privacy_ca_digest_formula() {
        let pk = test_key().to_public_key();
        let label = b"example privacy ca";

        let digest = privacy_ca_digest(Some(&pk), Some(label)).unwrap();

        let mut input = label.to_vec();
        input.extend_from_slice(&pubkey_from_rsa(&pk).to_bytes());
        let expected: Digest = Sha1::digest(&input).into();
        assert_eq!(digest, expected);
    }
}
