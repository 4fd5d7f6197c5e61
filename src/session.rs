// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 authorization sessions
//!
//! OIAP and OSAP sessions, the rolling-nonce HMAC protocol over command and
//! response parameters, and EncAuth masking of new auth secrets.
//!
//! The HMAC key is the OSAP shared secret, or the entity's auth secret for
//! OIAP (which derives nothing). Every authorized exchange rolls the even
//! nonce: the response's nonceEven becomes the input to the next command on
//! the same session.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest as _, Sha1};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::constants::*;
use crate::device::{TpmDevice, TpmRequest};
use crate::error::{Error, Result};
use crate::marshal::CommandBuffer;
use crate::types::{CommandAuth, Digest, Handle, Nonce, ResponseAuth};

type HmacSha1 = Hmac<Sha1>;

/// Draw a fresh 20-byte nonce from the host RNG (never from the TPM).
pub(crate) fn fresh_nonce() -> Result<Nonce> {
    let mut nonce = [0u8; 20];
    OsRng.try_fill_bytes(&mut nonce).map_err(|_| Error::Rand)?;
    Ok(nonce)
}

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Digest {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// sharedSecret = HMAC-SHA1(entityAuth, nonceEvenOSAP || nonceOddOSAP)
fn derive_shared_secret(
    entity_auth: &[u8; 20],
    nonce_even_osap: &Nonce,
    nonce_odd_osap: &Nonce,
) -> Zeroizing<[u8; 20]> {
    Zeroizing::new(hmac_sha1(entity_auth, &[nonce_even_osap, nonce_odd_osap]))
}

/// An open OIAP or OSAP authorization session.
///
/// The session must be closed on every path that opened it; `close` issues
/// FlushSpecific unless the device already terminated the session. The HMAC
/// key is zeroized when the session drops.
pub struct AuthSession {
    handle: Handle,
    nonce_even: Nonce,
    key: Zeroizing<[u8; 20]>,
    closed: bool,
}

impl AuthSession {
    /// Start an OIAP session. OIAP carries no entity binding; the given
    /// secret is used directly as the HMAC key.
    pub fn oiap(device: &mut TpmDevice, secret: &[u8; 20]) -> Result<Self> {
        let req = TpmRequest::new(Ordinal::Oiap).finalize();
        let resp = device.execute(&req)?;
        resp.ensure_success()?;

        let mut buf = resp.body();
        let handle = buf.get_u32()?;
        let nonce_even: Nonce = buf.get_array()?;

        debug!(handle, "opened OIAP session");

        Ok(Self {
            handle,
            nonce_even,
            key: Zeroizing::new(*secret),
            closed: false,
        })
    }

    /// Start an OSAP session bound to one entity and derive its shared
    /// secret from the entity's auth secret and the OSAP nonce pair.
    pub fn osap(
        device: &mut TpmDevice,
        entity_type: u16,
        entity_value: Handle,
        entity_auth: &[u8; 20],
    ) -> Result<Self> {
        let nonce_odd_osap = fresh_nonce()?;

        let mut req = TpmRequest::new(Ordinal::Osap);
        req.add(&entity_type);
        req.add_u32(entity_value);
        req.add(&nonce_odd_osap);

        let resp = device.execute(&req.finalize())?;
        resp.ensure_success()?;

        let mut buf = resp.body();
        let handle = buf.get_u32()?;
        let nonce_even: Nonce = buf.get_array()?;
        let nonce_even_osap: Nonce = buf.get_array()?;

        let key = derive_shared_secret(entity_auth, &nonce_even_osap, &nonce_odd_osap);

        debug!(handle, entity_type, "opened OSAP session");

        Ok(Self {
            handle,
            nonce_even,
            key,
            closed: false,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Build the commandAuth block for one authorized command.
    ///
    /// `params` are the request parameters after the ordinal, excluding key
    /// handles and the auth trailer; the digest input is exactly
    /// `ordinal || params`, mirroring what the TPM hashes.
    pub fn authorize(
        &mut self,
        ordinal: Ordinal,
        params: &[u8],
        continue_session: bool,
    ) -> Result<CommandAuth> {
        if self.closed {
            return Err(Error::Usage("authorize on closed session"));
        }

        let mut input = CommandBuffer::with_capacity(4 + params.len());
        input.put_u32(ordinal.to_u32());
        input.put_bytes(params);
        let in_digest: Digest = Sha1::digest(input.as_bytes()).into();

        let nonce_odd = fresh_nonce()?;
        let cont = continue_session as u8;

        // auth = HMAC-SHA1(key, inDigest || nonceEven || nonceOdd || cont)
        let auth = hmac_sha1(
            self.key.as_slice(),
            &[&in_digest, &self.nonce_even, &nonce_odd, &[cont]],
        );

        Ok(CommandAuth {
            auth_handle: self.handle,
            nonce_odd,
            continue_session: cont,
            auth,
        })
    }

    /// Verify the responseAuth block for the command authorized by `ca`,
    /// then adopt the response's even nonce.
    ///
    /// `params` are the response output parameters excluding trailing auth
    /// blocks and any leading output handles.
    pub fn verify(
        &mut self,
        ordinal: Ordinal,
        return_code: u32,
        params: &[u8],
        ca: &CommandAuth,
        ra: &ResponseAuth,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::Usage("verify on closed session"));
        }

        let mut input = CommandBuffer::with_capacity(8 + params.len());
        input.put_u32(return_code);
        input.put_u32(ordinal.to_u32());
        input.put_bytes(params);
        let out_digest: Digest = Sha1::digest(input.as_bytes()).into();

        // expected = HMAC-SHA1(key, outDigest || nonceEven || nonceOdd || cont)
        let mut mac =
            HmacSha1::new_from_slice(self.key.as_slice()).expect("HMAC accepts any key length");
        mac.update(&out_digest);
        mac.update(&ra.nonce_even);
        mac.update(&ca.nonce_odd);
        mac.update(&[ra.continue_session]);
        mac.verify_slice(&ra.auth).map_err(|_| Error::AuthFail)?;

        self.nonce_even = ra.nonce_even;
        if ra.continue_session == 0 {
            // The device terminated the session; no flush is due.
            self.closed = true;
        }

        Ok(())
    }

    /// Mask a new 20-byte auth secret for injection into the device:
    /// encAuth = newAuth XOR SHA1(sharedSecret || lastEvenNonce).
    pub fn encrypt_auth(&self, new_auth: &[u8; 20]) -> Digest {
        let mut hasher = Sha1::new();
        hasher.update(self.key.as_slice());
        hasher.update(self.nonce_even);
        let mask: Zeroizing<[u8; 20]> = Zeroizing::new(hasher.finalize().into());

        let mut enc = [0u8; 20];
        for (i, byte) in enc.iter_mut().enumerate() {
            *byte = new_auth[i] ^ mask[i];
        }
        enc
    }

    /// Mark the session dead without flushing. Used after the device itself
    /// invalidated it (AUTHFAIL on a contained command).
    pub fn abandon(&mut self) {
        self.closed = true;
    }

    /// Terminate the session with FlushSpecific unless the device already
    /// did. Flush failures are logged, not surfaced; teardown must not mask
    /// the command's own error.
    pub fn close(mut self, device: &mut TpmDevice) {
        if self.closed {
            return;
        }
        if let Err(err) = flush_specific(device, self.handle, tpm_rt::AUTH) {
            warn!(handle = self.handle, %err, "failed to flush auth session");
        }
        self.closed = true;
    }
}

/// TPM_FlushSpecific: release a handle of the given resource type.
pub fn flush_specific(device: &mut TpmDevice, handle: Handle, resource_type: u32) -> Result<()> {
    let mut req = TpmRequest::new(Ordinal::FlushSpecific);
    req.add_handle(handle);
    req.add_u32(resource_type);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(key: [u8; 20], nonce_even: Nonce) -> AuthSession {
        AuthSession {
            handle: 0x0200_0001,
            nonce_even,
            key: Zeroizing::new(key),
            closed: false,
        }
    }

    fn response_auth(
        key: &[u8; 20],
        ordinal: Ordinal,
        return_code: u32,
        params: &[u8],
        nonce_even: Nonce,
        nonce_odd: &Nonce,
        continue_session: u8,
    ) -> ResponseAuth {
        let mut input = CommandBuffer::new();
        input.put_u32(return_code);
        input.put_u32(ordinal.to_u32());
        input.put_bytes(params);
        let out_digest: Digest = Sha1::digest(input.as_bytes()).into();

        let auth = hmac_sha1(
            key,
            &[&out_digest, &nonce_even, nonce_odd, &[continue_session]],
        );
        ResponseAuth {
            nonce_even,
            continue_session,
            auth,
        }
    }

    #[test]
    fn test_shared_secret_derivation() {
        let entity_auth = [0u8; 20];
        let even = [0x11u8; 20];
        let odd = [0x22u8; 20];

        let secret = derive_shared_secret(&entity_auth, &even, &odd);

        // Manual HMAC over the concatenated nonce pair.
        let mut concat = Vec::new();
        concat.extend_from_slice(&even);
        concat.extend_from_slice(&odd);
        let mut mac = HmacSha1::new_from_slice(&entity_auth).unwrap();
        mac.update(&concat);
        let expected: [u8; 20] = mac.finalize().into_bytes().into();

        assert_eq!(*secret, expected);
    }

    #[test]
    fn test_command_hmac_formula() {
        let key = [0x5Au8; 20];
        let nonce_even = [0x0Fu8; 20];
        let params = [0xAB, 0xCD, 0xEF];

        let mut s = session(key, nonce_even);
        let ca = s.authorize(Ordinal::Seal, &params, true).unwrap();
        assert_eq!(ca.continue_session, 1);

        // Recompute by hand: HMAC(key, SHA1(ord || params) || even || odd || cont)
        let mut input = Vec::new();
        input.extend_from_slice(&Ordinal::Seal.to_u32().to_be_bytes());
        input.extend_from_slice(&params);
        let digest: Digest = Sha1::digest(&input).into();
        let expected = hmac_sha1(&key, &[&digest, &nonce_even, &ca.nonce_odd, &[1]]);

        assert_eq!(ca.auth, expected);
    }

    #[test]
    fn test_nonce_odd_is_fresh_per_command() {
        let mut s = session([0u8; 20], [0u8; 20]);
        let a = s.authorize(Ordinal::Quote, &[], true).unwrap();
        let b = s.authorize(Ordinal::Quote, &[], true).unwrap();
        assert_ne!(a.nonce_odd, b.nonce_odd);
    }

    #[test]
    fn test_verify_accepts_and_rolls_nonce() {
        let key = [0x77u8; 20];
        let mut s = session(key, [0x01u8; 20]);
        let ca = s.authorize(Ordinal::Unseal, &[1, 2, 3], true).unwrap();

        let new_even = [0x42u8; 20];
        let params = [9u8, 9, 9];
        let ra = response_auth(&key, Ordinal::Unseal, 0, &params, new_even, &ca.nonce_odd, 1);

        s.verify(Ordinal::Unseal, 0, &params, &ca, &ra).unwrap();
        assert_eq!(s.nonce_even, new_even);
        assert!(!s.is_closed());
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let key = [0x77u8; 20];
        let mut s = session(key, [0x01u8; 20]);
        let ca = s.authorize(Ordinal::Unseal, &[], true).unwrap();

        let params = [0x10u8, 0x20, 0x30];
        let ra = response_auth(&key, Ordinal::Unseal, 0, &params, [0u8; 20], &ca.nonce_odd, 1);

        // Flip one bit of the body the digest covers.
        let mut tampered = params;
        tampered[1] ^= 0x01;
        assert!(matches!(
            s.verify(Ordinal::Unseal, 0, &tampered, &ca, &ra),
            Err(Error::AuthFail)
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_mac() {
        let key = [0x77u8; 20];
        let mut s = session(key, [0x01u8; 20]);
        let ca = s.authorize(Ordinal::Seal, &[], true).unwrap();

        let mut ra = response_auth(&key, Ordinal::Seal, 0, &[], [0u8; 20], &ca.nonce_odd, 1);
        ra.auth[19] ^= 0x80;
        assert!(matches!(
            s.verify(Ordinal::Seal, 0, &[], &ca, &ra),
            Err(Error::AuthFail)
        ));
    }

    #[test]
    fn test_device_terminated_session_refuses_reuse() {
        let key = [0x33u8; 20];
        let mut s = session(key, [0x01u8; 20]);
        let ca = s.authorize(Ordinal::Seal, &[], false).unwrap();
        assert_eq!(ca.continue_session, 0);

        let ra = response_auth(&key, Ordinal::Seal, 0, &[], [0x06u8; 20], &ca.nonce_odd, 0);
        s.verify(Ordinal::Seal, 0, &[], &ca, &ra).unwrap();
        assert!(s.is_closed());

        assert!(matches!(
            s.authorize(Ordinal::Seal, &[], true),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_enc_auth_mask() {
        let key = [0x10u8; 20];
        let nonce_even = [0x20u8; 20];
        let s = session(key, nonce_even);

        let new_auth = [0xA5u8; 20];
        let enc = s.encrypt_auth(&new_auth);

        let mut hasher = Sha1::new();
        hasher.update(key);
        hasher.update(nonce_even);
        let mask: [u8; 20] = hasher.finalize().into();

        for i in 0..20 {
            assert_eq!(enc[i] ^ mask[i], new_auth[i]);
        }
    }
}
