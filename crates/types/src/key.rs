use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitXor;
use thiserror::Error;

/// Errors emitted when decoding 32-byte identifiers from hex.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("identifier must be 64 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("identifier must be valid hex: {0}")]
    InvalidHex(String),
}

fn decode_32(value: &str) -> Result<[u8; 32], KeyError> {
    if value.len() != 64 {
        return Err(KeyError::InvalidLength(value.len()));
    }
    let bytes = hex::decode(value).map_err(|err| KeyError::InvalidHex(err.to_string()))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

macro_rules! byte_array_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero value, used as the null sentinel.
            pub const ZERO: $name = $name([0u8; 32]);

            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Render as lowercase hexadecimal.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Value whose last byte is `n`; handy for fixtures.
            pub fn from_low_byte(n: u8) -> Self {
                let mut bytes = [0u8; 32];
                bytes[31] = n;
                $name(bytes)
            }

            /// BLAKE3 digest of `data`.
            pub fn digest(data: &[u8]) -> Self {
                $name(*blake3::hash(data).as_bytes())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_hex()
            }
        }

        impl TryFrom<String> for $name {
            type Error = KeyError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                decode_32(&value).map($name)
            }
        }

        impl std::str::FromStr for $name {
            type Err = KeyError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                decode_32(value).map($name)
            }
        }

        impl BitXor for $name {
            type Output = $name;

            fn bitxor(self, rhs: $name) -> $name {
                let mut out = [0u8; 32];
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte = self.0[i] ^ rhs.0[i];
                }
                $name(out)
            }
        }
    };
}

byte_array_id!(
    /// 32-byte public key of an account, drive or replicator.
    Key
);

byte_array_id!(
    /// 32-byte hash (root hashes, channel ids, modification ids).
    Hash256
);

impl From<Key> for Hash256 {
    fn from(value: Key) -> Self {
        Hash256(value.0)
    }
}

impl From<Hash256> for Key {
    fn from(value: Hash256) -> Self {
        Key(value.0)
    }
}
