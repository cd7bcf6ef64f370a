//! Shared deterministic random sequence
//!
//! Every peer owns one [`RandomSequence`]. As long as all peers start from the
//! same seed and draw the same number of values, they see the same stream.
//! The generator is xoshiro256++ seeded through SplitMix64; it does no
//! floating-point work in the core step so the output is identical on every
//! platform.

use rand::{Error, RngCore, SeedableRng};

/// Seeds drawn by [`RandomSequence::draw_seed`] fall in `[0, SEED_RANGE)`
pub const SEED_RANGE: u32 = 65535;

#[derive(Clone, Debug)]
pub struct RandomSequence {
    seed: i32,
    state: [u64; 4],
}

impl RandomSequence {
    pub fn new(seed: i32) -> Self {
        Self {
            seed,
            state: expand_seed(seed),
        }
    }

    /// Seed the sequence was last (re)started from
    pub fn seed(&self) -> i32 {
        self.seed
    }

    /// Restarts the sequence from `seed`
    pub fn set_seed(&mut self, seed: i32) {
        self.seed = seed;
        self.state = expand_seed(seed);
    }

    /// Draws a new seed from the current stream
    pub fn draw_seed(&mut self) -> i32 {
        self.get_long(SEED_RANGE) as i32
    }

    /// Draws a new seed and restarts from it; returns the seed
    pub fn reseed(&mut self) -> i32 {
        let seed = self.draw_seed();
        self.set_seed(seed);
        seed
    }

    /// Uniform integer in `[0, max)`; `0` when `max` is `0`
    pub fn get_long(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        let range = u64::from(max);
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.step();
            if r >= threshold {
                return (r % range) as u32;
            }
        }
    }

    pub fn get_bool(&mut self) -> bool {
        self.step() >> 63 == 1
    }

    /// Uniform `f64` in `[0, 1)`
    pub fn get_double(&mut self) -> f64 {
        (self.step() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn step(&mut self) -> u64 {
        let s = &mut self.state;
        let result = s[0].wrapping_add(s[3]).rotate_left(23).wrapping_add(s[0]);
        let t = s[1] << 17;

        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];

        s[2] ^= t;
        s[3] = s[3].rotate_left(45);

        result
    }
}

impl Default for RandomSequence {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RngCore for RandomSequence {
    fn next_u32(&mut self) -> u32 {
        (self.step() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.step()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.step().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for RandomSequence {
    type Seed = [u8; 4];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(i32::from_le_bytes(seed))
    }
}

fn expand_seed(seed: i32) -> [u64; 4] {
    let mut sm = u64::from(seed as u32);
    [
        splitmix64(&mut sm),
        splitmix64(&mut sm),
        splitmix64(&mut sm),
        splitmix64(&mut sm),
    ]
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
