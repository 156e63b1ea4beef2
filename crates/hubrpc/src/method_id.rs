//! # Method Identifiers
//!
//! Hub methods and push events are dispatched by a 32-bit id. The id is computed once
//! from the method's declared signature, so two builds that declare the same method
//! agree on its id without exchanging a table.
//!
//! ## Derivation
//!
//! FNV-1a (64-bit) over `"Service.Method(Param1,Param2)"`, folded to 32 bits by
//! xoring the high and low halves.

use serde::Deserialize;
use serde::Serialize;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Stable numeric identity of a hub method or push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(pub u32);

impl MethodId {
    /// Derives the id for `service.method(params..)`.
    pub fn from_signature(service: &str, method: &str, params: &[&str]) -> Self {
        let mut hash = Fnv::new();
        hash.write(service.as_bytes());
        hash.write(b".");
        hash.write(method.as_bytes());
        hash.write(b"(");
        for (i, param) in params.iter().enumerate() {
            if i > 0 {
                hash.write(b",");
            }
            hash.write(param.as_bytes());
        }
        hash.write(b")");
        Self(hash.finish())
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for MethodId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Fnv(u64);

impl Fnv {
    fn new() -> Self {
        Self(FNV_OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(&self) -> u32 {
        ((self.0 >> 32) ^ self.0) as u32
    }
}
