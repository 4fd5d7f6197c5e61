// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command implementations
//!
//! This module provides the high-level TPM operations. Each authorized
//! operation opens the session type it needs, digests exactly the parameter
//! bytes the TPM digests (ordinal plus everything after the key handles),
//! verifies the response HMAC and tears the session down on every path.

use sha1::{Digest as _, Sha1};
use tracing::debug;

use crate::constants::*;
use crate::device::{TpmDevice, TpmRequest, DEFAULT_DEVICE};
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::session::AuthSession;
use crate::types::*;
use crate::verify::privacy_ca_digest;

/// Pure Rust TPM 1.2 context
pub struct TpmContext {
    device: TpmDevice,
}

impl TpmContext {
    /// Create a new TPM context with the given device path, or /dev/tpm0
    pub fn new(device_path: Option<&str>) -> Result<Self> {
        let device = TpmDevice::open(device_path.unwrap_or(DEFAULT_DEVICE))?;
        Ok(Self { device })
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    // ==================== PCR and Random ====================

    /// Read one PCR value
    pub fn pcr_read(&mut self, pcr: u32) -> Result<Digest> {
        if pcr >= PCR_COUNT {
            return Err(Error::Usage("PCR index out of range"));
        }

        let mut req = TpmRequest::new(Ordinal::PcrRead);
        req.add_u32(pcr);

        let resp = self.device.execute(&req.finalize())?;
        resp.ensure_success()?;

        let mut buf = resp.body();
        buf.get_array()
    }

    /// Read a sequence of PCRs and concatenate their values
    pub fn fetch_pcr_values(&mut self, pcrs: &[u32]) -> Result<Vec<u8>> {
        let mut values = Vec::with_capacity(pcrs.len() * DIGEST_SIZE);
        for &pcr in pcrs {
            values.extend_from_slice(&self.pcr_read(pcr)?);
        }
        Ok(values)
    }

    /// Get random bytes from the TPM's hardware RNG. The device may return
    /// fewer bytes than requested.
    pub fn get_random(&mut self, size: u32) -> Result<Vec<u8>> {
        let mut req = TpmRequest::new(Ordinal::GetRandom);
        req.add_u32(size);

        let resp = self.device.execute(&req.finalize())?;
        resp.ensure_success()?;

        let mut buf = resp.body();
        buf.get_blob()
    }

    // ==================== Key Operations ====================

    /// Load a key blob (a serialized TPM_KEY or TPM_KEY12) under the SRK and
    /// return a handle for it
    pub fn load_key2(&mut self, key_blob: &[u8], srk_auth: &[u8; 20]) -> Result<Handle> {
        let key = TpmKey::from_bytes(key_blob)?;

        // The private part of a loaded key is wrapped by the SRK, so
        // LoadKey2 authorizes against an SRK OSAP session.
        let mut session =
            AuthSession::osap(&mut self.device, tpm_et::SRK, tpm_kh::SRK, srk_auth)?;
        let result = load_key2_with(&mut self.device, &mut session, &key);
        finish_sessions(&mut self.device, vec![session], &result);
        result
    }

    /// Retrieve the packed TPM_PUBKEY blob for a loaded key
    pub fn get_pub_key(&mut self, key_handle: Handle, key_auth: &[u8; 20]) -> Result<Vec<u8>> {
        let mut session = AuthSession::osap(
            &mut self.device,
            tpm_et::KEYHANDLE,
            key_handle,
            key_auth,
        )?;
        let result = get_pub_key_with(&mut self.device, &mut session, key_handle);
        finish_sessions(&mut self.device, vec![session], &result);
        result
    }

    // ==================== Seal/Unseal ====================

    /// Seal data against the given locality and current PCR values, under
    /// the SRK. The returned blob only opens on this TPM while the bound
    /// PCRs hold their current values.
    pub fn seal(
        &mut self,
        locality: u8,
        pcrs: &[u32],
        data: &[u8],
        srk_auth: &[u8; 20],
    ) -> Result<Vec<u8>> {
        let pcr_info = self.pcr_info_long(locality, pcrs)?;

        let mut session =
            AuthSession::osap(&mut self.device, tpm_et::SRK, tpm_kh::SRK, srk_auth)?;
        let result = seal_with(&mut self.device, &mut session, &pcr_info, data, srk_auth);
        finish_sessions(&mut self.device, vec![session], &result);
        result
    }

    /// Unseal a blob produced by `seal`
    pub fn unseal(&mut self, sealed: &[u8], srk_auth: &[u8; 20]) -> Result<Vec<u8>> {
        let stored = TpmStoredData::from_bytes(sealed)?;

        // Unseal authorizes twice: an SRK OSAP session for the parent key
        // and an OIAP session proving the sealed blob's own auth secret.
        let mut osap =
            AuthSession::osap(&mut self.device, tpm_et::SRK, tpm_kh::SRK, srk_auth)?;
        let mut oiap = match AuthSession::oiap(&mut self.device, srk_auth) {
            Ok(session) => session,
            Err(err) => {
                osap.close(&mut self.device);
                return Err(err);
            }
        };

        let result = unseal_with(&mut self.device, &mut osap, &mut oiap, &stored);
        finish_sessions(&mut self.device, vec![osap, oiap], &result);
        result
    }

    // ==================== Attestation ====================

    /// Quote the given PCRs under a loaded signing key. Returns the
    /// signature and the concatenated PCR values it covers.
    pub fn quote(
        &mut self,
        key_handle: Handle,
        data: &[u8],
        pcrs: &[u32],
        key_auth: &[u8; 20],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let external: Digest = Sha1::digest(data).into();
        let selection = PcrSelection::new(pcrs)?;

        let mut session = AuthSession::osap(
            &mut self.device,
            tpm_et::KEYHANDLE,
            key_handle,
            key_auth,
        )?;
        let result = quote_with(&mut self.device, &mut session, key_handle, &external, &selection);
        finish_sessions(&mut self.device, vec![session], &result);
        result
    }

    /// Quote2: like `quote` but over TPM_PCR_INFO_SHORT, optionally asking
    /// the TPM to include version info in the signed data. Returns the
    /// signature.
    pub fn quote2(
        &mut self,
        key_handle: Handle,
        data: &[u8],
        pcrs: &[u32],
        add_version: bool,
        key_auth: &[u8; 20],
    ) -> Result<Vec<u8>> {
        let external: Digest = Sha1::digest(data).into();
        let selection = PcrSelection::new(pcrs)?;

        let mut session = AuthSession::osap(
            &mut self.device,
            tpm_et::KEYHANDLE,
            key_handle,
            key_auth,
        )?;
        let result = quote2_with(
            &mut self.device,
            &mut session,
            key_handle,
            &external,
            &selection,
            add_version,
        );
        finish_sessions(&mut self.device, vec![session], &result);
        result
    }

    /// Mint a new AIK under the SRK, authorized by the owner. Returns a
    /// loadable key blob for the new AIK.
    ///
    /// `privacy_ca` and `label` identify the Privacy CA that will attest to
    /// the key; both `None` sets the chosen-identity digest to all zeros.
    /// Supplying exactly one of them is an error.
    pub fn make_identity(
        &mut self,
        srk_auth: &[u8; 20],
        owner_auth: &[u8; 20],
        aik_auth: &[u8; 20],
        privacy_ca: Option<&rsa::RsaPublicKey>,
        label: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        // Resolved before any device I/O so a half-specified Privacy CA
        // never allocates sessions.
        let ca_digest = privacy_ca_digest(privacy_ca, label)?;

        let mut srk_session =
            AuthSession::osap(&mut self.device, tpm_et::SRK, tpm_kh::SRK, srk_auth)?;
        let mut owner_session = match AuthSession::osap(
            &mut self.device,
            tpm_et::OWNER,
            tpm_kh::OWNER,
            owner_auth,
        ) {
            Ok(session) => session,
            Err(err) => {
                srk_session.close(&mut self.device);
                return Err(err);
            }
        };

        let result = make_identity_with(
            &mut self.device,
            &mut srk_session,
            &mut owner_session,
            aik_auth,
            &ca_digest,
        );
        finish_sessions(&mut self.device, vec![srk_session, owner_session], &result);
        result
    }

    // ==================== Maintenance ====================

    /// Reset the dictionary-attack lockout. Requires owner authorization.
    pub fn reset_lock_value(&mut self, owner_auth: &[u8; 20]) -> Result<()> {
        let mut session = AuthSession::osap(
            &mut self.device,
            tpm_et::OWNER,
            tpm_kh::OWNER,
            owner_auth,
        )?;
        let result = reset_lock_value_with(&mut self.device, &mut session);
        finish_sessions(&mut self.device, vec![session], &result);
        result
    }

    /// Build a pcrInfoLong over the current values of the selected PCRs
    fn pcr_info_long(&mut self, locality: u8, pcrs: &[u32]) -> Result<PcrInfoLong> {
        let selection = PcrSelection::new(pcrs)?;
        let values = self.fetch_pcr_values(pcrs)?;
        PcrInfoLong::new(locality, selection, values)
    }
}

/// Close sessions after a command, on success and failure alike. A device
/// AUTHFAIL already invalidated the sessions, so no flush is due then.
fn finish_sessions<T>(device: &mut TpmDevice, sessions: Vec<AuthSession>, result: &Result<T>) {
    let auth_failed = matches!(result, Err(Error::Tpm(tpm_rc::AUTHFAIL)));
    for mut session in sessions {
        if auth_failed {
            session.abandon();
        }
        session.close(device);
    }
}

fn load_key2_with(
    device: &mut TpmDevice,
    session: &mut AuthSession,
    key: &TpmKey,
) -> Result<Handle> {
    let params = key.to_bytes();
    let ca = session.authorize(Ordinal::LoadKey2, &params, true)?;

    let mut req = TpmRequest::auth1(Ordinal::LoadKey2);
    req.add_handle(tpm_kh::SRK);
    req.add_bytes(&params);
    req.add(&ca);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(1)?;
    let mut buf = ResponseBuffer::new(body);
    let key_handle = buf.get_u32()?;

    // The returned key handle is not covered by the response HMAC.
    session.verify(Ordinal::LoadKey2, resp.return_code, &body[4..], &ca, &auths[0])?;

    debug!(key_handle, "loaded key");
    Ok(key_handle)
}

fn get_pub_key_with(
    device: &mut TpmDevice,
    session: &mut AuthSession,
    key_handle: Handle,
) -> Result<Vec<u8>> {
    let ca = session.authorize(Ordinal::GetPubKey, &[], true)?;

    let mut req = TpmRequest::auth1(Ordinal::GetPubKey);
    req.add_handle(key_handle);
    req.add(&ca);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(1)?;
    session.verify(Ordinal::GetPubKey, resp.return_code, body, &ca, &auths[0])?;

    // Validate the record shape before handing the blob back.
    let pub_key = PubKey::from_bytes(body)?;
    Ok(pub_key.to_bytes())
}

fn seal_with(
    device: &mut TpmDevice,
    session: &mut AuthSession,
    pcr_info: &PcrInfoLong,
    data: &[u8],
    blob_auth: &[u8; 20],
) -> Result<Vec<u8>> {
    // The sealed blob's auth secret travels XOR-masked under the OSAP
    // shared secret and the session's current even nonce.
    let enc_auth = session.encrypt_auth(blob_auth);
    let params = seal_params(&enc_auth, pcr_info, data);
    let ca = session.authorize(Ordinal::Seal, params.as_bytes(), true)?;

    let mut req = TpmRequest::auth1(Ordinal::Seal);
    req.add_handle(tpm_kh::SRK);
    req.add_bytes(params.as_bytes());
    req.add(&ca);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(1)?;
    session.verify(Ordinal::Seal, resp.return_code, body, &ca, &auths[0])?;

    let sealed = TpmStoredData::from_bytes(body)?;
    debug!(data_len = data.len(), "sealed data");
    Ok(sealed.to_bytes())
}

/// Seal digests the explicit pcrInfo byte count, then the pcrInfo record,
/// then the length-prefixed data, exactly as the TPM hashes the command.
fn seal_params(enc_auth: &Digest, pcr_info: &PcrInfoLong, data: &[u8]) -> CommandBuffer {
    let pcr_bytes = pcr_info.to_bytes();
    let mut params = CommandBuffer::with_capacity(28 + pcr_bytes.len() + data.len());
    params.put_bytes(enc_auth);
    params.put_u32(pcr_bytes.len() as u32);
    params.put_bytes(&pcr_bytes);
    params.put_blob(data);
    params
}

fn unseal_with(
    device: &mut TpmDevice,
    osap: &mut AuthSession,
    oiap: &mut AuthSession,
    stored: &TpmStoredData,
) -> Result<Vec<u8>> {
    // Both sessions authenticate the same input digest.
    let params = stored.to_bytes();
    let ca1 = osap.authorize(Ordinal::Unseal, &params, true)?;
    let ca2 = oiap.authorize(Ordinal::Unseal, &params, true)?;

    let mut req = TpmRequest::auth2(Ordinal::Unseal);
    req.add_handle(tpm_kh::SRK);
    req.add_bytes(&params);
    req.add(&ca1);
    req.add(&ca2);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(2)?;
    osap.verify(Ordinal::Unseal, resp.return_code, body, &ca1, &auths[0])?;
    oiap.verify(Ordinal::Unseal, resp.return_code, body, &ca2, &auths[1])?;

    let mut buf = ResponseBuffer::new(body);
    let unsealed = buf.get_blob()?;
    debug!(data_len = unsealed.len(), "unsealed data");
    Ok(unsealed)
}

fn quote_with(
    device: &mut TpmDevice,
    session: &mut AuthSession,
    key_handle: Handle,
    external: &Digest,
    selection: &PcrSelection,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut params = CommandBuffer::new();
    params.put_bytes(external);
    params.put(selection);
    let ca = session.authorize(Ordinal::Quote, params.as_bytes(), true)?;

    let mut req = TpmRequest::auth1(Ordinal::Quote);
    req.add_handle(key_handle);
    req.add_bytes(params.as_bytes());
    req.add(&ca);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(1)?;
    session.verify(Ordinal::Quote, resp.return_code, body, &ca, &auths[0])?;

    let mut buf = ResponseBuffer::new(body);
    let composite = PcrComposite::unmarshal(&mut buf)?;
    let signature = buf.get_blob()?;

    debug!(sig_len = signature.len(), "generated quote");
    Ok((signature, composite.values))
}

fn quote2_with(
    device: &mut TpmDevice,
    session: &mut AuthSession,
    key_handle: Handle,
    external: &Digest,
    selection: &PcrSelection,
    add_version: bool,
) -> Result<Vec<u8>> {
    let mut params = CommandBuffer::new();
    params.put_bytes(external);
    params.put(selection);
    params.put_u8(add_version as u8);
    let ca = session.authorize(Ordinal::Quote2, params.as_bytes(), true)?;

    let mut req = TpmRequest::auth1(Ordinal::Quote2);
    req.add_handle(key_handle);
    req.add_bytes(params.as_bytes());
    req.add(&ca);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(1)?;
    session.verify(Ordinal::Quote2, resp.return_code, body, &ca, &auths[0])?;

    let mut buf = ResponseBuffer::new(body);
    let _pcr_short = PcrInfoShort::unmarshal(&mut buf)?;
    let _cap_version = buf.get_blob()?; // covered by the HMAC, not exposed
    let signature = buf.get_blob()?;

    debug!(sig_len = signature.len(), "generated quote2");
    Ok(signature)
}

fn make_identity_with(
    device: &mut TpmDevice,
    srk_session: &mut AuthSession,
    owner_session: &mut AuthSession,
    aik_auth: &[u8; 20],
    ca_digest: &Digest,
) -> Result<Vec<u8>> {
    // The new AIK's auth secret is masked against the owner session.
    let enc_auth = owner_session.encrypt_auth(aik_auth);
    let template = TpmKey::identity_template();

    let mut params = CommandBuffer::new();
    params.put_bytes(&enc_auth);
    params.put_bytes(ca_digest);
    params.put(&template);

    let ca1 = srk_session.authorize(Ordinal::MakeIdentity, params.as_bytes(), true)?;
    let ca2 = owner_session.authorize(Ordinal::MakeIdentity, params.as_bytes(), true)?;

    let mut req = TpmRequest::auth2(Ordinal::MakeIdentity);
    req.add_bytes(params.as_bytes());
    req.add(&ca1);
    req.add(&ca2);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(2)?;
    srk_session.verify(Ordinal::MakeIdentity, resp.return_code, body, &ca1, &auths[0])?;
    owner_session.verify(Ordinal::MakeIdentity, resp.return_code, body, &ca2, &auths[1])?;

    let mut buf = ResponseBuffer::new(body);
    let aik = TpmKey::unmarshal(&mut buf)?;
    // The identity binding is the Privacy CA's concern; callers verify it
    // against the EK out-of-band.
    let _identity_binding = buf.get_blob()?;

    debug!("created identity key");
    Ok(aik.to_bytes())
}

fn reset_lock_value_with(device: &mut TpmDevice, session: &mut AuthSession) -> Result<()> {
    let ca = session.authorize(Ordinal::ResetLockValue, &[], true)?;

    let mut req = TpmRequest::auth1(Ordinal::ResetLockValue);
    req.add(&ca);

    let resp = device.execute(&req.finalize())?;
    resp.ensure_success()?;

    let (body, auths) = resp.split_auth(1)?;
    session.verify(Ordinal::ResetLockValue, resp.return_code, body, &ca, &auths[0])
}
