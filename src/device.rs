// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Provides low-level communication with a TPM 1.2 device via /dev/tpm0:
//! one write, one read per command, no retries. Also carries the command
//! envelope: the request builder and the response header parser.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

use tracing::debug;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::ResponseAuth;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Request/response header length: tag (2) + paramSize (4) + ordinal/result (4)
const HEADER_SIZE: usize = 10;

/// Wire size of one trailing responseAuth block
const RESPONSE_AUTH_SIZE: usize = 41;

/// Default device node for a 1.2 TPM under Linux
pub const DEFAULT_DEVICE: &str = "/dev/tpm0";

/// TPM device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Send a framed request to the TPM and read back one response
    pub fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.file.write_all(request)?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self.file.read(&mut response)?;
        response.truncate(n);
        Ok(response)
    }

    /// Execute a TPM request and parse the response header
    pub fn execute(&mut self, request: &[u8]) -> Result<TpmResponse> {
        let response_bytes = self.transact(request)?;
        TpmResponse::parse(&response_bytes)
    }
}

/// TPM request builder
pub struct TpmRequest {
    buf: CommandBuffer,
}

impl TpmRequest {
    /// Create a request with the given tag and ordinal
    pub fn with_tag(tag: CommandTag, ordinal: Ordinal) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + paramSize (4) + ordinal (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // paramSize placeholder
        buf.put_u32(ordinal.to_u32());

        Self { buf }
    }

    /// Create a request without auth blocks
    pub fn new(ordinal: Ordinal) -> Self {
        Self::with_tag(CommandTag::RquCommand, ordinal)
    }

    /// Create a request carrying one trailing auth block
    pub fn auth1(ordinal: Ordinal) -> Self {
        Self::with_tag(CommandTag::RquAuth1Command, ordinal)
    }

    /// Create a request carrying two trailing auth blocks
    pub fn auth2(ordinal: Ordinal) -> Self {
        Self::with_tag(CommandTag::RquAuth2Command, ordinal)
    }

    /// Add a key or resource handle
    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    /// Add raw bytes
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Add a marshallable record
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Finalize the request: patch paramSize and return the frame
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// Parsed TPM response
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: CommandTag,
    pub return_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a response frame
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::Malformed("response shorter than header"));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag =
            CommandTag::from_u16(tag_raw).ok_or(Error::Malformed("unknown response tag"))?;

        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE {
            return Err(Error::Malformed("response paramSize shorter than header"));
        }
        if response.len() < size {
            // The device handed us fewer bytes than the frame declares.
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated TPM response",
            )));
        }

        let return_code = buf.get_u32()?;
        let data = response[HEADER_SIZE..size].to_vec();

        debug!(
            tag = tag_raw,
            return_code,
            body_len = data.len(),
            "parsed TPM response"
        );

        Ok(Self {
            tag,
            return_code,
            data,
        })
    }

    pub fn is_success(&self) -> bool {
        self.return_code == tpm_rc::SUCCESS
    }

    /// Map a non-zero return code to `Error::Tpm`
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Tpm(self.return_code))
        }
    }

    /// Get a response buffer over the body
    pub fn body(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Split the body into the output parameters and `count` trailing auth
    /// blocks. The returned slice is exactly the byte range the response
    /// HMAC covers (together with returnCode and ordinal).
    pub fn split_auth(&self, count: usize) -> Result<(&[u8], Vec<ResponseAuth>)> {
        if self.tag.auth_count() != count {
            return Err(Error::Malformed("response tag/auth block mismatch"));
        }
        let auth_len = count * RESPONSE_AUTH_SIZE;
        if self.data.len() < auth_len {
            return Err(Error::Malformed("response too short for auth blocks"));
        }
        let split = self.data.len() - auth_len;

        let mut buf = ResponseBuffer::new(&self.data[split..]);
        let mut auths = Vec::with_capacity(count);
        for _ in 0..count {
            auths.push(ResponseAuth::unmarshal(&mut buf)?);
        }

        Ok((&self.data[..split], auths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let mut req = TpmRequest::new(Ordinal::PcrRead);
        req.add_u32(18);

        let bytes = req.finalize();

        assert_eq!(&bytes[0..2], &[0x00, 0xC1]); // TAG_RQU_COMMAND
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x00, 0x15]); // TPM_ORD_PcrRead
        assert_eq!(&bytes[10..14], &[0x00, 0x00, 0x00, 0x12]); // pcr = 18

        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_auth_tags() {
        let req = TpmRequest::auth1(Ordinal::Seal).finalize();
        assert_eq!(&req[0..2], &[0x00, 0xC2]);

        let req = TpmRequest::auth2(Ordinal::Unseal).finalize();
        assert_eq!(&req[0..2], &[0x00, 0xC3]);
    }

    #[test]
    fn test_response_parse() {
        let response = vec![
            0x00, 0xC4, // TAG_RSP_COMMAND
            0x00, 0x00, 0x00, 0x0A, // paramSize = 10
            0x00, 0x00, 0x00, 0x00, // success
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_response_error_code_preserved() {
        let response = vec![
            0x00, 0xC4, //
            0x00, 0x00, 0x00, 0x0A, //
            0x00, 0x00, 0x08, 0x03, // DEFEND_LOCK_RUNNING
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        match parsed.ensure_success() {
            Err(Error::Tpm(code)) => assert_eq!(code, tpm_rc::DEFEND_LOCK_RUNNING),
            other => panic!("expected Tpm error, got {other:?}"),
        }
    }

    #[test]
    fn test_short_header_is_malformed() {
        assert!(matches!(
            TpmResponse::parse(&[0x00, 0xC4, 0x00]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_io() {
        // Declares 16 bytes but delivers 12.
        let response = vec![
            0x00, 0xC4, //
            0x00, 0x00, 0x00, 0x10, //
            0x00, 0x00, 0x00, 0x00, //
            0xAA, 0xBB,
        ];
        assert!(matches!(
            TpmResponse::parse(&response),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_split_auth() {
        let mut body = vec![0x11, 0x22, 0x33]; // output params
        body.extend_from_slice(&[0xEE; 20]); // nonceEven
        body.push(1); // continueSession
        body.extend_from_slice(&[0xAA; 20]); // auth

        let mut frame = vec![0x00, 0xC5, 0, 0, 0, 0, 0, 0, 0, 0];
        frame.extend_from_slice(&body);
        let size = frame.len() as u32;
        frame[2..6].copy_from_slice(&size.to_be_bytes());

        let resp = TpmResponse::parse(&frame).unwrap();
        let (params, auths) = resp.split_auth(1).unwrap();
        assert_eq!(params, &[0x11, 0x22, 0x33]);
        assert_eq!(auths.len(), 1);
        assert_eq!(auths[0].nonce_even, [0xEE; 20]);
        assert_eq!(auths[0].continue_session, 1);
        assert_eq!(auths[0].auth, [0xAA; 20]);

        // Asking for a different auth count than the tag carries is an error.
        assert!(matches!(resp.split_auth(2), Err(Error::Malformed(_))));
    }
}
