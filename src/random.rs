//! Random number generation.
//!
//! RC4-based pseudo-random number generator. Used to stamp the serial
//! number of freshly created environments and by the randomized tests.

use std::sync::Mutex;

/// Pseudo-random number generator state (RC4-based).
pub struct Prng {
    s: [u8; 256],
    i: u8,
    j: u8,
    is_init: bool,
}

impl Default for Prng {
    fn default() -> Self {
        Self::new()
    }
}

impl Prng {
    /// Create a new uninitialized PRNG.
    pub const fn new() -> Self {
        Self {
            s: [0; 256],
            i: 0,
            j: 0,
            is_init: false,
        }
    }

    /// Seed the PRNG using the RC4 key scheduling algorithm.
    pub fn seed(&mut self, seed: &[u8]) {
        if seed.is_empty() {
            self.auto_seed();
            return;
        }

        for i in 0..256 {
            self.s[i] = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(self.s[i]).wrapping_add(seed[i % seed.len()]);
            self.s.swap(i, j as usize);
        }

        self.i = 0;
        self.j = 0;
        self.is_init = true;

        // Discard the first 256 bytes; the initial RC4 stream is biased.
        let mut discard = [0u8; 256];
        self.fill(&mut discard);
    }

    /// Seed from system entropy, falling back to the process id and a
    /// fixed pattern when no entropy source is available.
    pub fn auto_seed(&mut self) {
        let mut seed = [0u8; 256];

        #[cfg(unix)]
        {
            if let Ok(mut file) = std::fs::File::open("/dev/urandom") {
                use std::io::Read;
                let _ = file.read_exact(&mut seed);
            }
        }

        let pid = std::process::id().to_le_bytes();
        for (i, b) in seed.iter_mut().enumerate() {
            *b ^= pid[i % pid.len()].wrapping_add(i as u8);
        }

        let copy = seed;
        self.seed(&copy);
    }

    /// Next byte of the stream.
    pub fn next_u8(&mut self) -> u8 {
        if !self.is_init {
            self.auto_seed();
        }
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.s[self.i as usize]);
        self.s.swap(self.i as usize, self.j as usize);
        let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
        self.s[idx as usize]
    }

    /// Fill a buffer with random bytes.
    pub fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.next_u8();
        }
    }

    /// Next 32-bit value.
    pub fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_le_bytes(buf)
    }

    /// Next 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill(&mut buf);
        u64::from_le_bytes(buf)
    }
}

// Process-wide generator for serial numbers.
static GLOBAL_PRNG: Mutex<Prng> = Mutex::new(Prng::new());

/// Draw a 32-bit value from the process-wide generator.
pub fn random_u32() -> u32 {
    GLOBAL_PRNG.lock().unwrap().next_u32()
}

// ============================================================================
// Tests
// ============================================================================
