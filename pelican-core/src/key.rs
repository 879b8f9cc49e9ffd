// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of client-generated identifiers.
pub const ID_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid identifier length {0}, expected {1} bytes")]
    InvalidLength(usize, usize),

    #[error("invalid hex encoding of identifier")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

fn random_bytes() -> [u8; ID_LEN] {
    let mut bytes = [0u8; ID_LEN];
    rand::thread_rng().fill(&mut bytes);
    bytes
}

macro_rules! hex_id {
    ($name:ident, $expecting:literal) => {
        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(random_bytes())
            }

            /// Create an identifier from its raw bytes representation.
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Bytes of the identifier.
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Convert the identifier to a hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = KeyError;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                let value_len = value.len();
                let checked: [u8; ID_LEN] = value
                    .try_into()
                    .map_err(|_| KeyError::InvalidLength(value_len, ID_LEN))?;
                Ok(Self(checked))
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::try_from(hex::decode(value)?.as_slice())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct HexVisitor;

                impl<'v> Visitor<'v> for HexVisitor {
                    type Value = $name;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        value.parse().map_err(serde::de::Error::custom)
                    }
                }

                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

/// Client-generated token identifying one logical attempt at an action.
///
/// Retries of the same action carry the same key, allowing the server-side
/// ledger to deduplicate them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey([u8; ID_LEN]);

hex_id!(IdempotencyKey, "idempotency key encoded as a hex string");

/// Identifier of an attendance session.
///
/// This is also the value carried by the displayed check-in code; rotation of
/// the visible code does not change the underlying session id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; ID_LEN]);

hex_id!(SessionId, "session id encoded as a hex string");
