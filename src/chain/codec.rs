//! Versioned wire codec for call chains and legacy credentials.
//!
//! Both payloads open with a fixed 4-byte context tag followed by a
//! version byte; all variable-length fields are length-prefixed so a
//! decoder can reject unknown versions and truncated payloads outright.
//! Strings are UTF-8 with a `u16` big-endian length prefix, the
//! originator count is `u16`, and the signature carries a `u32` prefix.

use crate::chain::error::ChainCodecError;
use crate::chain::types::{CallChain, Credential, Login};

/// Context tag for chain-carrying side-channel entries.
pub const CHAIN_CONTEXT_TAG: [u8; 4] = *b"BLCC";

/// Context tag for legacy flat-credential entries.
pub const LEGACY_CONTEXT_TAG: [u8; 4] = *b"BLCR";

/// Current chain wire version.
pub const CHAIN_VERSION: u8 = 0x02;

/// Legacy credential wire version.
pub const LEGACY_VERSION: u8 = 0x01;

const TAG_SIZE: usize = 4;

/// Positional reader over an encoded payload.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pub position: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, position: 0 }
    }

    fn read(&mut self, length: usize) -> Result<&'a [u8], ChainCodecError> {
        if self.position + length > self.data.len() {
            return Err(ChainCodecError::Truncated(self.position));
        }
        let result = &self.data[self.position..self.position + length];
        self.position += length;
        Ok(result)
    }

    fn read_u8(&mut self) -> Result<u8, ChainCodecError> {
        Ok(self.read(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ChainCodecError> {
        let bytes = self.read(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ChainCodecError> {
        let bytes = self.read(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, ChainCodecError> {
        let length = self.read_u16()? as usize;
        let bytes = self.read(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ChainCodecError::MalformedField(field))
    }

    fn read_login(&mut self) -> Result<Login, ChainCodecError> {
        let id = self.read_string("login id")?;
        let entity = self.read_string("login entity")?;
        let validity_secs = self.read_u32()?;
        Ok(Login {
            id,
            entity,
            validity_secs,
        })
    }

    fn expect_tag(&mut self, tag: &[u8; 4]) -> Result<(), ChainCodecError> {
        let read = self.read(TAG_SIZE)?;
        if read != tag {
            let mut seen = [0u8; 4];
            seen.copy_from_slice(read);
            return Err(ChainCodecError::UnknownTag(seen));
        }
        Ok(())
    }

    fn finish(self) -> Result<(), ChainCodecError> {
        if self.position != self.data.len() {
            return Err(ChainCodecError::TrailingBytes);
        }
        Ok(())
    }
}

struct BinaryWriter {
    out: Vec<u8>,
}

impl BinaryWriter {
    fn new(tag: &[u8; 4], version: u8) -> Self {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(tag);
        out.push(version);
        BinaryWriter { out }
    }

    fn write_u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_be_bytes());
    }

    fn write_string(&mut self, value: &str) {
        // Oversize strings cannot round-trip through the u16 prefix.
        let bytes = &value.as_bytes()[..value.len().min(u16::MAX as usize)];
        self.write_u16(bytes.len() as u16);
        self.out.extend_from_slice(bytes);
    }

    fn write_login(&mut self, login: &Login) {
        self.write_string(&login.id);
        self.write_string(&login.entity);
        self.write_u32(login.validity_secs);
    }

    fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.out.extend_from_slice(value);
    }
}

/// Encode a chain into its wire form.
pub fn encode_chain(chain: &CallChain) -> Vec<u8> {
    let mut writer = BinaryWriter::new(&CHAIN_CONTEXT_TAG, CHAIN_VERSION);
    writer.write_string(&chain.bus_id);
    writer.write_string(&chain.target);
    let originators = &chain.originators[..chain.originators.len().min(u16::MAX as usize)];
    writer.write_u16(originators.len() as u16);
    for origin in originators {
        writer.write_login(origin);
    }
    writer.write_login(&chain.caller);
    writer.write_bytes(&chain.signature);
    writer.out
}

/// Decode a wire-encoded chain.
///
/// Fails on an unrecognized tag or version, on truncation, and on
/// trailing bytes. The signature is carried through opaquely and never
/// verified here: verification is a remote-side responsibility.
pub fn decode_chain(data: &[u8]) -> Result<CallChain, ChainCodecError> {
    let mut reader = BinaryReader::new(data);
    reader.expect_tag(&CHAIN_CONTEXT_TAG)?;
    let version = reader.read_u8()?;
    if version != CHAIN_VERSION {
        return Err(ChainCodecError::UnknownVersion(version));
    }

    let bus_id = reader.read_string("bus id")?;
    let target = reader.read_string("target")?;
    let originator_count = reader.read_u16()? as usize;
    let mut originators = Vec::with_capacity(originator_count.min(64));
    for _ in 0..originator_count {
        originators.push(reader.read_login()?);
    }
    let caller = reader.read_login()?;
    let signature_len = reader.read_u32()? as usize;
    let signature = reader.read(signature_len)?.to_vec();
    reader.finish()?;

    Ok(CallChain {
        bus_id,
        target,
        originators,
        caller,
        signature,
    })
}

/// Encode a legacy flat credential.
pub fn encode_credential(credential: &Credential) -> Vec<u8> {
    let mut writer = BinaryWriter::new(&LEGACY_CONTEXT_TAG, LEGACY_VERSION);
    writer.write_string(&credential.identifier);
    writer.write_string(&credential.owner);
    writer.write_string(&credential.delegate);
    writer.out
}

/// Decode a legacy flat credential.
pub fn decode_credential(data: &[u8]) -> Result<Credential, ChainCodecError> {
    let mut reader = BinaryReader::new(data);
    reader.expect_tag(&LEGACY_CONTEXT_TAG)?;
    let version = reader.read_u8()?;
    if version != LEGACY_VERSION {
        return Err(ChainCodecError::UnknownVersion(version));
    }

    let identifier = reader.read_string("identifier")?;
    let owner = reader.read_string("owner")?;
    let delegate = reader.read_string("delegate")?;
    reader.finish()?;

    Ok(Credential {
        identifier,
        owner,
        delegate,
    })
}
