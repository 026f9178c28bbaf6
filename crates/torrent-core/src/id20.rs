use std::{cmp::Ordering, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

/// A 20-byte SHA-1 identifier: used both for info hashes and peer ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Id20(pub [u8; 20]);

impl FromStr for Id20 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        if s.len() != 40 {
            anyhow::bail!("expected a hex string of length 40")
        };
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id20(out))
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<")?;
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        write!(f, ">")
    }
}

impl Serialize for Id20 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Id20;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a 20 byte slice or a 40 byte hex string")
            }
            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 40 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; 20];
                match hex::decode_to_slice(v, &mut out) {
                    Ok(_) => Ok(Id20(out)),
                    Err(e) => Err(E::custom(e)),
                }
            }
            fn visit_borrowed_bytes<E>(self, v: &'de [u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(v)
            }
            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 20 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut buf = [0u8; 20];
                buf.copy_from_slice(v);
                Ok(Id20(buf))
            }
        }
        deserializer.deserialize_any(Visitor {})
    }
}

impl Id20 {
    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl Ord for Id20 {
    fn cmp(&self, other: &Id20) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd<Id20> for Id20 {
    fn partial_cmp(&self, other: &Id20) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::Id20;
    use std::str::FromStr;

    #[test]
    fn test_from_str_roundtrip() {
        let id = Id20::from_str("0102030405060708090a0b0c0d0e0f1011121314").unwrap();
        assert_eq!(id.as_string(), "0102030405060708090a0b0c0d0e0f1011121314");
    }
}
