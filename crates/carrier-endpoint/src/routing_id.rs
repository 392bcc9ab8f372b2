//! 128-bit Routing IDs (spec §3).

use std::fmt;

/// A randomly generated 128-bit identifier that addresses a VIF endpoint
/// independent of network address. Zero means "unknown". The multiplexer
/// uses the Routing ID as the primary dispatch key at the VIF level: two
/// endpoints with the same address but different Routing IDs are distinct
/// destinations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingId([u8; 16]);

impl RoutingId {
    pub const UNKNOWN: RoutingId = RoutingId([0; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        RoutingId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Generate a fresh, non-zero Routing ID.
    pub fn generate() -> Self {
        loop {
            let mut buf = [0u8; 16];
            rand::Rng::fill(&mut rand::thread_rng(), &mut buf);
            let id = RoutingId(buf);
            if !id.is_unknown() {
                return id;
            }
        }
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, chunk) in out.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(RoutingId(out))
    }
}

impl Default for RoutingId {
    fn default() -> Self {
        RoutingId::UNKNOWN
    }
}

impl fmt::Debug for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingId({})", self.to_hex())
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_unknown() {
        assert!(RoutingId::UNKNOWN.is_unknown());
        assert!(RoutingId::default().is_unknown());
    }

    #[test]
    fn generate_is_never_unknown() {
        for _ in 0..100 {
            assert!(!RoutingId::generate().is_unknown());
        }
    }

    #[test]
    fn generate_is_random() {
        assert_ne!(RoutingId::generate(), RoutingId::generate());
    }

    #[test]
    fn hex_round_trips() {
        let id = RoutingId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(RoutingId::from_hex(&hex), Some(id));
    }

    #[test]
    fn from_hex_rejects_bad_length() {
        assert_eq!(RoutingId::from_hex("abcd"), None);
    }
}
