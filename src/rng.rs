//! The linear congruential generator used by the original word2vec tool.
//!
//! Kept local rather than pulled from an external crate: the single-worker
//! determinism contract pins the exact update sequence, and this generator is
//! part of that contract.

use crate::real;

#[derive(Clone)]
pub struct Rng(pub u64);

impl Rng {
    pub fn rand_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(25214903917).wrapping_add(11);
        self.0
    }

    /// Uniform in `[0, 1)` with 16 bits of precision, as in the original.
    pub fn rand_real(&mut self) -> real {
        (self.rand_u64() & 0xFFFF) as real / 65536.0
    }
}
