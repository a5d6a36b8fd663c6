//! The kernel entropy pool.
//!
//! A small xoshiro256** generator behind a lock, seeded at boot and
//! reseedable by userspace through `cprng_add_entropy`. It hands out the
//! per-process handle secrets and services `cprng_draw`.
//!
//! The arch layer is expected to feed hardware entropy in through
//! [add_entropy] early; the host seed in [seed_from_host] only ensures
//! the pool never starts from a fixed state.

use crate::sync::SpinLock;

/// Generator state. All-zero is the one forbidden xoshiro state, the
/// seeding paths make sure we never end up there.
struct Pool {
    s: [u64; 4],
}

lazy_static! {
    /// The global pool.
    static ref POOL: SpinLock<Pool> = SpinLock::new(Pool {
        // Arbitrary nonzero bootstrap constants, immediately displaced by
        // seeding.
        s: [
            0x9e37_79b9_7f4a_7c15,
            0xf39c_c060_5ced_c834,
            0x1082_276b_f3a2_7251,
            0xb29b_2e82_4a59_5524,
        ],
    });
}

impl Pool {
    fn rotl(x: u64, k: u32) -> u64 {
        x.rotate_left(k)
    }

    /// One xoshiro256** step.
    fn next_u64(&mut self) -> u64 {
        let result = Pool::rotl(self.s[1].wrapping_mul(5), 7).wrapping_mul(9);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = Pool::rotl(self.s[3], 45);
        result
    }

    /// Folds caller bytes into the state.
    fn mix(&mut self, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let word = &mut self.s[(i / 8) % 4];
            *word = word.rotate_left(8) ^ u64::from(b) ^ 0x6a09_e667_f3bc_c908;
        }
        // Scramble so adjacent mixes with related inputs diverge.
        for _ in 0..4 {
            self.next_u64();
        }
        if self.s == [0; 4] {
            self.s[0] = 0x9e37_79b9_7f4a_7c15;
        }
    }
}

/// Seeds the pool from whatever cheap host entropy is around. Called from
/// [crate::init].
pub fn seed_from_host() {
    use std::time::{SystemTime, UNIX_EPOCH};

    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().wrapping_mul(1_000_000_000).wrapping_add(u64::from(d.subsec_nanos())))
        .unwrap_or(0x5eed);
    let stack_probe = 0u8;
    let aslr = &stack_probe as *const u8 as usize as u64;

    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&wall.to_le_bytes());
    seed[8..].copy_from_slice(&aslr.to_le_bytes());
    add_entropy(&seed);
}

/// Fills `buf` with bytes from the pool.
pub fn draw(buf: &mut [u8]) {
    let mut pool = POOL.lock();
    for chunk in buf.chunks_mut(8) {
        let word = pool.next_u64().to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

/// Draws a u32 from the pool.
pub fn draw_u32() -> u32 {
    let mut buf = [0u8; 4];
    draw(&mut buf);
    u32::from_le_bytes(buf)
}

/// Draws a u64 from the pool.
pub fn draw_u64() -> u64 {
    POOL.lock().next_u64()
}

/// Folds caller-supplied bytes into the pool.
pub fn add_entropy(bytes: &[u8]) {
    POOL.lock().mix(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_fills_odd_sizes() {
        let mut buf = [0u8; 13];
        draw(&mut buf);
        // 13 identical bytes out of a working generator is not happening.
        assert!(buf.iter().any(|&b| b != buf[0]) || buf[0] != 0);
    }

    #[test]
    fn draws_differ() {
        assert_ne!(draw_u64(), draw_u64());
    }

    #[test]
    fn entropy_does_not_wedge_pool() {
        add_entropy(&[0; 64]);
        add_entropy(b"borealis");
        assert_ne!(draw_u64(), draw_u64());
    }
}
