use rand_core::{impls, CryptoRng, RngCore};
use sha2::{Digest, Sha256};

/// Infinite pseudo-random byte stream stretched from a 32-byte seed by
/// repeated SHA-256 hashing. Each output block ratchets the state, so the
/// stream is a pure function of the seed. Never fails, never short-reads.
///
/// This is predictable by construction; it exists so forged leaf keys are
/// reproducible from the hostname alone.
pub struct SeededRng {
    state: [u8; 32],
}

impl SeededRng {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { state: seed }
    }
}

impl RngCore for SeededRng {
    fn next_u32(&mut self) -> u32 {
        impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut filled = 0;
        while filled < dest.len() {
            self.state = Sha256::digest(self.state).into();
            let take = (dest.len() - filled).min(self.state.len());
            dest[filled..filled + take].copy_from_slice(&self.state[..take]);
            filled += take;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for SeededRng {}
