use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::WireflowError;

/// The identity of every element in a flows document: flows, groups,
/// nodes and messages.
///
/// On the wire an id is a 16-hex-char string; the id is stored as those
/// eight raw bytes. Hand-written documents may use shorter hex forms,
/// which parse as if left-padded with zeros.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElementId([u8; 8]);

impl ElementId {
    /// A fresh random id. Never the empty id.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 8];
            rng.fill(&mut bytes[..]);
            if bytes.iter().any(|b| *b != 0) {
                return ElementId(bytes);
            }
        }
    }

    pub fn empty() -> Self {
        ElementId([0u8; 8])
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 8]
    }

    /// An id from a counter value, used for generated sequences such as
    /// link-call ids.
    pub fn with_u64(id: u64) -> Self {
        ElementId(id.to_be_bytes())
    }

    /// Derives the id a scope-owned copy of `member` gets, e.g. a
    /// subflow-interior node cloned for one instance. For a fixed scope
    /// this is a bijection of `member`: distinct members never collide,
    /// and re-deriving is stable.
    pub fn derive_child(scope: &ElementId, member: &ElementId) -> crate::Result<Self> {
        if scope.is_empty() {
            return Err(WireflowError::BadArgument("scope").into());
        }
        if member.is_empty() {
            return Err(WireflowError::BadArgument("member").into());
        }

        let mut bytes = [0u8; 8];
        for (i, slot) in bytes.iter_mut().enumerate() {
            // rotate the member bytes under the scope mask
            *slot = scope.0[i] ^ member.0[(i + 5) % 8];
        }
        if bytes == [0u8; 8] {
            // the member that maps onto the empty id gets the slot the
            // empty id itself never occupies
            bytes[7] = 0x5a;
        }
        Ok(ElementId(bytes))
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for ElementId {
    type Err = WireflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(WireflowError::BadArgument("id"));
        }

        let mut bytes = [0u8; 8];
        for (pos, c) in s.bytes().rev().enumerate() {
            let nibble = match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                b'A'..=b'F' => c - b'A' + 10,
                _ => return Err(WireflowError::BadArgument("id")),
            };
            let slot = 7 - pos / 2;
            if pos % 2 == 0 {
                bytes[slot] |= nibble;
            } else {
                bytes[slot] |= nibble << 4;
            }
        }
        Ok(ElementId(bytes))
    }
}

impl serde::Serialize for ElementId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ElementId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(&s), &"a hex element id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_16_hex_chars() {
        let id = ElementId::with_u64(0xab);
        assert_eq!(id.to_string(), "00000000000000ab");
        assert_eq!(ElementId::empty().to_string(), "0000000000000000");
    }

    #[test]
    fn test_short_forms_parse_left_padded() {
        let short: ElementId = "a".parse().unwrap();
        let long: ElementId = "000000000000000a".parse().unwrap();
        assert_eq!(short, long);

        let mixed: ElementId = "1A2b".parse().unwrap();
        assert_eq!(mixed.to_string(), "0000000000001a2b");
    }

    #[test]
    fn test_round_trip_parse() {
        let id = ElementId::new();
        let parsed: ElementId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert!("".parse::<ElementId>().is_err());
        assert!("xyz".parse::<ElementId>().is_err());
        assert!("0123456789abcdef0".parse::<ElementId>().is_err());
        assert!("12 34".parse::<ElementId>().is_err());
    }

    #[test]
    fn test_new_is_never_empty() {
        for _ in 0..64 {
            assert!(!ElementId::new().is_empty());
        }
    }

    #[test]
    fn test_derive_child_rejects_empty_operands() {
        assert!(ElementId::derive_child(&ElementId::empty(), &ElementId::new()).is_err());
        assert!(ElementId::derive_child(&ElementId::new(), &ElementId::empty()).is_err());
    }

    #[test]
    fn test_derive_child_is_stable_and_collision_free() {
        let scope = ElementId::new();
        let members: Vec<ElementId> = (1u64..=32).map(ElementId::with_u64).collect();

        let mut derived = Vec::new();
        for member in members.iter() {
            let first = ElementId::derive_child(&scope, member).unwrap();
            let again = ElementId::derive_child(&scope, member).unwrap();
            assert_eq!(first, again);
            derived.push(first);
        }

        derived.sort();
        derived.dedup();
        assert_eq!(derived.len(), 32, "derived ids must not collide within a scope");
    }
}
