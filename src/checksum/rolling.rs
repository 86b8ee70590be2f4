//! Rolling checksum over a fixed-size window (Adler-like, two 16-bit halves)

/// Rolling checksum state for O(1) window updates.
///
/// A block of `B` bytes is summarized by two 16-bit halves:
/// `a = Σ x_k` and `b = Σ (B−k)·x_k`, both mod 2^16. Sliding the window by
/// one byte removes the outgoing byte's contribution and adds the incoming
/// one without rescanning the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingSum {
    a: u16,
    b: u16,
}

impl RollingSum {
    /// Compute the sum of a full window from scratch
    pub fn from_block(data: &[u8]) -> Self {
        let mut a: u16 = 0;
        let mut b: u16 = 0;

        for &byte in data {
            a = a.wrapping_add(byte as u16);
            b = b.wrapping_add(a);
        }

        Self { a, b }
    }

    /// Roll the window by one byte: remove `old`, append `new`
    pub fn roll(&mut self, block_size: usize, old: u8, new: u8) {
        let old = old as u16;
        let new = new as u16;

        self.a = self.a.wrapping_sub(old).wrapping_add(new);
        // b loses block_size * old and gains the updated a
        self.b = self
            .b
            .wrapping_sub((block_size as u16).wrapping_mul(old))
            .wrapping_add(self.a);
    }

    /// The full 32-bit word `a ∥ b`
    pub fn value(&self) -> u32 {
        ((self.a as u32) << 16) | (self.b as u32)
    }

    /// The sum truncated to `rsum_bytes` low-order bytes, as a comparable key
    pub fn truncated(&self, rsum_bytes: u8) -> u32 {
        truncate_rsum(self.value(), rsum_bytes)
    }
}

/// Mask a 32-bit rolling sum down to its stored low-order `rsum_bytes`.
///
/// The wire format keeps the low `rsum_bytes` bytes of `a ∥ b`: with 2 bytes
/// only `b` survives, with 3 the low byte of `a` is kept as well, with 4 the
/// full word.
pub fn truncate_rsum(value: u32, rsum_bytes: u8) -> u32 {
    let a_mask: u32 = match rsum_bytes {
        0..=2 => 0,
        3 => 0xff,
        _ => 0xffff,
    };
    value & ((a_mask << 16) | 0xffff)
}
