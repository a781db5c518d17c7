// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Wire codec for the narrow external surface this crate actually consumes:
//! a block's transaction list, encoded as a length-prefixed sequence of
//! UTF-8 strings. Any scheme round-tripping `Vec<String>` is acceptable; this
//! one uses LEB128 varints for lengths, matching `varint-rs`'s usual home in
//! length-prefixed wire formats.

use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// A transaction string had fewer than the required four
    /// comma-separated fields (`hash,blockNumber,sender,receiver`)
    MalformedTransaction {
        /// The offending string
        raw: String,
    },

    /// Bytes were not valid UTF-8
    InvalidUtf8,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "DecodeError::Io({e})"),
            Self::MalformedTransaction { raw } => {
                write!(f, "DecodeError::MalformedTransaction({raw:?})")
            }
            Self::InvalidUtf8 => write!(f, "DecodeError::InvalidUtf8"),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::MalformedTransaction { .. } | Self::InvalidUtf8 => None,
        }
    }
}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// The transactions belonging to a single block, as handed to us by an
/// external block decoder. This crate does not parse block files; it only
/// round-trips this narrow shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionList(pub Vec<String>);

impl Encode for TransactionList {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32_varint(self.0.len() as u32)?;

        for txn in &self.0 {
            let bytes = txn.as_bytes();
            writer.write_u32_varint(bytes.len() as u32)?;
            writer.write_all(bytes)?;
        }

        Ok(())
    }
}

impl Decode for TransactionList {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32_varint()?;
        let mut out = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let len = reader.read_u32_varint()?;
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            out.push(String::from_utf8(buf).map_err(|_| DecodeError::InvalidUtf8)?);
        }

        Ok(Self(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn transaction_list_round_trip() {
        let list = TransactionList(vec![
            "0xabc,1,alice,bob".into(),
            "0xdef,1,carol,dave".into(),
        ]);

        let bytes = list.encode_into_vec();
        let mut cursor = &bytes[..];
        let decoded = TransactionList::decode_from(&mut cursor).expect("should decode");

        assert_eq!(list, decoded);
    }

    #[test]
    fn empty_transaction_list_round_trip() {
        let list = TransactionList::default();
        let bytes = list.encode_into_vec();
        let mut cursor = &bytes[..];
        let decoded = TransactionList::decode_from(&mut cursor).expect("should decode");

        assert_eq!(list, decoded);
    }
}
