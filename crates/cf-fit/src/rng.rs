use rand::RngCore;

/// Size of the shuffle table.
const SHUFFLE: usize = 256;
/// Multiplicative-congruential constants of the core stream.
const MULT: u64 = 25173;
const INCR: u64 = 13849;
const MODULUS: u64 = 65536;
/// Warm-up draws consumed from the table stream at construction.
const WARMUP: usize = 1000;

/// Reproducible shuffled random stream in `[0, 1)`.
///
/// Two multiplicative-congruential streams feed a 256-entry shuffle table:
/// the first seed fills (and warms up) the table, the second drives the
/// ongoing pick-and-replace draws. Identical seed pairs produce identical
/// sequences across runs and platforms; the core stream has 16-bit
/// resolution, which is what the swarm's reproducibility contract needs,
/// not cryptographic quality.
#[derive(Debug, Clone)]
pub struct ShuffleRng {
    seed: u64,
    table: [f64; SHUFFLE],
}

#[inline]
fn step(seed: &mut u64) -> f64 {
    *seed = (MULT * *seed + INCR) % MODULUS;
    *seed as f64 / MODULUS as f64
}

impl ShuffleRng {
    /// Build the stream from the two user seeds.
    pub fn new(table_seed: u32, stream_seed: u32) -> Self {
        let mut init = table_seed as u64;
        let mut table = [0.0f64; SHUFFLE];
        for slot in table.iter_mut() {
            *slot = step(&mut init);
        }

        let mut rng = ShuffleRng {
            seed: stream_seed as u64,
            table,
        };

        // Warm up through the table stream, then hand over to the draw
        // stream.
        let mut warm = ShuffleRng {
            seed: init,
            table: rng.table,
        };
        for _ in 0..WARMUP {
            warm.next_f64();
        }
        rng.table = warm.table;
        rng
    }

    /// Next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        let pick = (step(&mut self.seed) * SHUFFLE as f64) as usize % SHUFFLE;
        let out = self.table[pick];
        self.table[pick] = step(&mut self.seed);
        out
    }

    /// Uniform draw in `[low, high)`.
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + self.next_f64() * (high - low)
    }
}

impl RngCore for ShuffleRng {
    fn next_u32(&mut self) -> u32 {
        (self.next_f64() * (u32::MAX as f64 + 1.0)) as u32
    }

    fn next_u64(&mut self) -> u64 {
        ((self.next_u32() as u64) << 32) | self.next_u32() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
