// src/net/session_id.rs - Session identifier codec
//
// A session id names a connection across threads without exposing where it
// lives in memory. Layout of the 64-bit value:
//
//   [generation: 32 bits][slot: 16 bits][loop_index: 16 bits]
//
// Encoding and decoding never fail. Whether an id still refers to a live
// connection is decided by the owning loop's SessionDirectory at use time.

use std::fmt;

/// Maximum number of worker loops a service can run.
pub const MAX_LOOPS: usize = 1 << 16;

/// Maximum number of concurrent sessions in a single loop.
pub const MAX_SESSIONS_PER_LOOP: usize = 1 << 16;

const LOOP_SHIFT: u32 = 0;
const SLOT_SHIFT: u32 = 16;
const GENERATION_SHIFT: u32 = 32;

/// Opaque identifier of a session: (loop index, slot index, generation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(loop_index: u16, slot: u16, generation: u32) -> Self {
        Self(
            ((loop_index as u64) << LOOP_SHIFT)
                | ((slot as u64) << SLOT_SHIFT)
                | ((generation as u64) << GENERATION_SHIFT),
        )
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Index of the owning loop in the worker pool.
    pub const fn loop_index(self) -> u16 {
        (self.0 >> LOOP_SHIFT) as u16
    }

    /// Index of the session in its loop's directory.
    pub const fn slot(self) -> u16 {
        (self.0 >> SLOT_SHIFT) as u16
    }

    pub const fn generation(self) -> u32 {
        (self.0 >> GENERATION_SHIFT) as u32
    }

    pub const fn decode(self) -> (u16, u16, u32) {
        (self.loop_index(), self.slot(), self.generation())
    }
}

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<SessionId> for u64 {
    fn from(id: SessionId) -> Self {
        id.as_raw()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}",
            self.loop_index(),
            self.slot(),
            self.generation()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_returns_encoded_fields() {
        let samples = [
            (0u16, 0u16, 1u32),
            (1, 2, 3),
            (u16::MAX, u16::MAX, u32::MAX),
            (7, 0, u32::MAX),
            (0, 513, 0x8000_0001),
        ];
        for (l, s, g) in samples {
            let id = SessionId::new(l, s, g);
            assert_eq!(id.decode(), (l, s, g));
            assert_eq!(SessionId::from_raw(id.as_raw()), id);
        }
    }

    #[test]
    fn test_bit_layout() {
        let id = SessionId::new(0x0102, 0x0304, 0x0506_0708);
        assert_eq!(id.as_raw(), 0x0506_0708_0304_0102);
        assert_eq!(u64::from(id), 0x0506_0708_0304_0102);
        assert_eq!(SessionId::from(0x0506_0708_0304_0102u64), id);
    }

    #[test]
    fn test_generation_distinguishes_reused_slot() {
        let old = SessionId::new(3, 9, 1);
        let new = SessionId::new(3, 9, 2);
        assert_ne!(old, new);
        assert_eq!(old.slot(), new.slot());
        assert_eq!(old.loop_index(), new.loop_index());
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionId::new(1, 42, 7).to_string(), "1:42#7");
    }
}
