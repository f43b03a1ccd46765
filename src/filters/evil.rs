//! Evil filter: deterministic bit corruption for fault injection.
//!
//! Corrupts data on the read path to simulate hardware faults.  Three
//! modes: `cosmic-rays` flips random bits differently on every read;
//! `stuck-bits` pins bits at positions fixed relative to the backing disk;
//! `stuck-wires` pins bits at positions fixed relative to each request.
//!
//! Rather than keeping a bitmap of the whole disk, corrupt positions are
//! derived from a seeded generator: within each power-of-two block the
//! distance to the next corrupt bit is drawn uniformly from
//! `[0, 2/P)`, which lands the expected number of corruptions per block.
//! Each loop iteration draws exactly two random values whether or not the
//! second is used, so a fixed seed corrupts the same bits across runs.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::api::{CmdFlags, OpResult, ThreadModel};
use crate::backend::{ConfigStatus, Filter, Handle, NextCtx};
use crate::config::{
    log_2_bits, next_power_of_2, parse_probability, parse_unsigned, ConfigError, ConfigResult,
};

/// Probabilities below this are treated as zero, avoiding divide-by-zero
/// and exploding interval calculations.
const EPSILON: f64 = 1e-12;

/// Probabilities above this are treated as 100%: the interval algorithm
/// corrupts at most one bit per byte and stops making progress beyond it.
const MAXP: f64 = 1.0 / 8.0;

/// Corruption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvilMode {
    /// Flip random bits, differently on every read.
    CosmicRays,
    /// Pin bits at positions fixed relative to the backing disk.
    StuckBits,
    /// Pin bits at positions fixed relative to each request.
    StuckWires,
}

impl EvilMode {
    fn as_str(self) -> &'static str {
        match self {
            EvilMode::CosmicRays => "cosmic-rays",
            EvilMode::StuckBits => "stuck-bits",
            EvilMode::StuckWires => "stuck-wires",
        }
    }
}

enum CorruptionType {
    Flip,
    Stuck,
}

/// The evil filter.
pub struct EvilFilter {
    mode: EvilMode,
    /// Negative means "default for the mode", resolved at config-complete.
    probability: f64,
    stuck_probability: f64,
    seed: u32,
    seed_set: bool,
    /// Power of two, chosen at get-ready so each block expects ~100
    /// corrupt bits.
    block_size: u64,
    /// Shared generator, used only by cosmic-rays.
    state: Mutex<SmallRng>,
}

impl Default for EvilFilter {
    fn default() -> Self {
        EvilFilter::new(EvilMode::StuckBits)
    }
}

impl EvilFilter {
    /// A filter in the given mode with default probabilities.
    pub fn new(mode: EvilMode) -> EvilFilter {
        EvilFilter {
            mode,
            probability: -1.0,
            stuck_probability: 1.0,
            seed: 0,
            seed_set: false,
            block_size: 1024 * 1024,
            state: Mutex::new(SmallRng::seed_from_u64(0)),
        }
    }

    /// Fix the seed (otherwise load time picks one from the clock).
    pub fn with_seed(mut self, seed: u32) -> EvilFilter {
        self.seed = seed;
        self.seed_set = true;
        self
    }

    /// Set the corruption probability directly.
    pub fn with_probability(mut self, p: f64) -> EvilFilter {
        self.probability = p;
        self
    }

    fn corrupt_one_bit(&self, byte: u8, bit: u32, randnum: u64, ct: &CorruptionType) -> u8 {
        let mask = 1u8 << bit;
        match ct {
            CorruptionType::Flip => byte ^ mask,
            CorruptionType::Stuck => {
                let randnum = randnum & 0xffff_ffff;
                if self.stuck_probability * 4294967296.0 > randnum as f64 {
                    if randnum & 1 != 0 {
                        byte | mask // stuck high
                    } else {
                        byte & !mask // stuck low
                    }
                } else {
                    byte
                }
            }
        }
    }

    fn corrupt_all_bits(&self, buf: &mut [u8], rng: &mut SmallRng, ct: &CorruptionType) {
        // Used when MAXP < P: treat as 100% and visit every bit.
        for b in buf.iter_mut() {
            let mut v = *b;
            for bit in 0..8 {
                let randnum = rng.next_u64();
                v = self.corrupt_one_bit(v, bit, randnum, ct);
            }
            *b = v;
        }
    }

    /// Corrupt `buf`, which sits at `offset_in_block` bytes into the
    /// current block.  The generator must have been seeded for the block.
    fn corrupt_buffer(
        &self,
        buf: &mut [u8],
        offset_in_block: u64,
        rng: &mut SmallRng,
        ct: &CorruptionType,
    ) {
        if self.probability < EPSILON {
            return;
        }
        if self.probability > MAXP {
            self.corrupt_all_bits(buf, rng, ct);
            return;
        }

        let count = buf.len() as u64;
        let invp2 = (2.0 / self.probability) as u64;

        debug_assert_eq!(offset_in_block & !(self.block_size - 1), 0);

        // Walk the whole block from its start; only corrupt positions that
        // land inside the buffer.
        let mut offs: u64 = 0;
        while offs < offset_in_block + count {
            // Distance in bits to the next corrupt bit.
            let intvl = rng.next_u64() % invp2;

            // Always consume a second random state whether or not it is
            // used, to keep the output predictable for a fixed seed.
            let randnum = rng.next_u64();

            offs += intvl / 8;
            if offs >= offset_in_block + count {
                break;
            }
            if offs >= offset_in_block {
                let i = (offs - offset_in_block) as usize;
                buf[i] = self.corrupt_one_bit(buf[i], (intvl & 7) as u32, randnum, ct);
            }
        }
    }
}

impl Filter for EvilFilter {
    fn name(&self) -> &str {
        "evil"
    }

    fn longname(&self) -> &str {
        "bit corruption filter"
    }

    fn config_help(&self) -> &str {
        "evil=cosmic-rays|stuck-bits|stuck-wires\n\
         \u{20}                              Set the mode (default: stuck-bits).\n\
         evil-probability=PROB          Probability of flipped or stuck bit.\n\
         evil-seed=SEED                 Random number seed.\n\
         evil-stuck-probability=PROB    Probability of stuck bit being stuck."
    }

    fn load(&mut self) {
        if !self.seed_set {
            self.seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0);
        }
    }

    fn config(&mut self, key: &str, value: &str) -> ConfigResult<ConfigStatus> {
        match key {
            "evil" | "evil-mode" => {
                self.mode = match value {
                    "cosmic-rays" | "cosmic" => EvilMode::CosmicRays,
                    "stuck-bits" | "stuck-bit" | "stuck" => EvilMode::StuckBits,
                    "stuck-wires" | "stuck-wire" => EvilMode::StuckWires,
                    _ => {
                        return Err(ConfigError::invalid(format!(
                            "evil: unknown mode: {}",
                            value
                        )))
                    }
                };
                Ok(ConfigStatus::Handled)
            }
            "evil-probability" => {
                let p = parse_probability("evil-probability", value)?;
                if p > 1.0 {
                    return Err(ConfigError::invalid(
                        "evil-probability out of range, should be [0..1]",
                    ));
                }
                self.probability = p;
                Ok(ConfigStatus::Handled)
            }
            "evil-stuck-probability" => {
                let p = parse_probability("evil-stuck-probability", value)?;
                if p > 1.0 {
                    return Err(ConfigError::invalid(
                        "evil-stuck-probability out of range, should be [0..1]",
                    ));
                }
                self.stuck_probability = p;
                Ok(ConfigStatus::Handled)
            }
            "evil-seed" => {
                self.seed = parse_unsigned("evil-seed", value)?;
                self.seed_set = true;
                Ok(ConfigStatus::Handled)
            }
            _ => Ok(ConfigStatus::Unhandled),
        }
    }

    fn config_complete(&mut self) -> ConfigResult<()> {
        if self.probability < 0.0 {
            self.probability = match self.mode {
                EvilMode::CosmicRays | EvilMode::StuckBits => 1e-8,
                EvilMode::StuckWires => 1e-6,
            };
        }
        Ok(())
    }

    /// Cosmic-rays draws from shared generator state, so requests must be
    /// serialized; the stuck modes reseed per block or per request.
    fn thread_model(&self) -> ThreadModel {
        match self.mode {
            EvilMode::CosmicRays => ThreadModel::SerializeRequests,
            EvilMode::StuckBits | EvilMode::StuckWires => ThreadModel::Parallel,
        }
    }

    fn get_ready(&mut self, _final_model: ThreadModel) -> ConfigResult<()> {
        if self.mode == EvilMode::CosmicRays {
            self.state = Mutex::new(SmallRng::seed_from_u64(u64::from(self.seed)));
        }

        // Size blocks so that about 100 bits are expected to be corrupted
        // in each; must be a power of 2.
        self.block_size = if self.probability < EPSILON || self.probability > MAXP {
            1024 * 1024 // unused, any value works
        } else {
            next_power_of_2(((100.0 / self.probability) as i64) / 8)
        };

        log::debug!(
            "evil: mode: {}, P: {}, seed: {}",
            self.mode.as_str(),
            self.probability,
            self.seed
        );
        log::debug!(
            "evil: block_size: {} (2**{})",
            self.block_size,
            log_2_bits(self.block_size)
        );
        log::debug!(
            "evil: expected bits per block: {}",
            8.0 * self.block_size as f64 * self.probability
        );
        Ok(())
    }

    fn pread(
        &self,
        next: &NextCtx<'_>,
        _handle: &Handle,
        buf: &mut [u8],
        offset: u64,
        flags: CmdFlags,
    ) -> OpResult<()> {
        next.pread(buf, offset, flags)?;

        match self.mode {
            EvilMode::CosmicRays => {
                // Shared generator: bits flip at random on every read.
                let mut rng = self.state.lock();
                self.corrupt_buffer(buf, 0, &mut rng, &CorruptionType::Flip);
            }
            EvilMode::StuckBits => {
                // Split the request along block boundaries; each block is
                // corrupted with a seed fixed by its disk offset.
                let mut offset = offset;
                let mut pos = 0usize;
                let mut bstart = offset & !(self.block_size - 1);
                while pos < buf.len() {
                    let seed = u64::from(self.seed).wrapping_add(bstart);
                    let mut rng = SmallRng::seed_from_u64(seed);
                    let len = (buf.len() - pos).min((bstart + self.block_size - offset) as usize);
                    self.corrupt_buffer(
                        &mut buf[pos..pos + len],
                        offset - bstart,
                        &mut rng,
                        &CorruptionType::Stuck,
                    );
                    bstart += self.block_size;
                    offset += len as u64;
                    pos += len;
                }
            }
            EvilMode::StuckWires => {
                // Same bits corrupt in every request, regardless of offset.
                let mut rng = SmallRng::seed_from_u64(u64::from(self.seed));
                self.corrupt_buffer(buf, 0, &mut rng, &CorruptionType::Stuck);
            }
        }
        Ok(())
    }
}
