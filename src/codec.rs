//! Versioned binary encoding for [`CausalObject`].
//!
//! Binary format (2 bytes overhead):
//! ```text
//! [MAGIC: 0xC0][VERSION: u8][PAYLOAD: postcard]
//! ```
//!
//! Offered to [`ReplicaService`](crate::replica::ReplicaService)
//! implementations that persist objects or ship them between nodes; the
//! in-memory cluster keeps live objects and does not encode. The header lets
//! a reader reject data from a newer format instead of misinterpreting it.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::object::CausalObject;

/// Magic byte identifying an encoded object.
pub const MAGIC_BYTE: u8 = 0xC0;

/// Current object format version.
pub const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 2;

/// Encode an object with the version header.
pub fn to_bytes<V: Serialize>(object: &CausalObject<V>) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![MAGIC_BYTE, FORMAT_VERSION];
    let payload = postcard::to_allocvec(object)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode an object written by [`to_bytes`].
pub fn from_bytes<V: DeserializeOwned>(bytes: &[u8]) -> Result<CausalObject<V>, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    if bytes[1] > FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[1]));
    }
    Ok(postcard::from_bytes(&bytes[HEADER_SIZE..])?)
}
