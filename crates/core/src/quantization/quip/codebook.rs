//! E8P12 lattice codebook.
//!
//! Every 16-bit code decodes to 8 weights. The high byte indexes a 256-entry
//! grid of non-negative magnitude vectors drawn from the shifted lattice
//! `(Z + 1/2)^8`; the low byte carries seven explicit signs and one shift
//! bit:
//!
//! ```text
//!  15            8 7              1  0
//! +---------------+----------------+---+
//! |  grid index   |  signs c0..c6  | s |
//! +---------------+----------------+---+
//! ```
//!
//! The eighth sign is implied: the number of negated coordinates is always
//! even. The shift bit adds `+1/4` (set) or `-1/4` (clear) to every
//! coordinate after signs are applied.

/// Weights per code.
pub const E8P12_PACK: usize = 8;

/// Entries of the magnitude grid.
pub const ABS_GRID_SIZE: usize = 256;

/// Name carried by checkpoints quantized with this codebook.
pub const E8P12_NAME: &str = "E8P12";

/// Decoder for E8P12 codes.
#[derive(Debug, Clone)]
pub struct E8P12Codebook {
    abs_grid: Vec<[f32; E8P12_PACK]>,
}

impl E8P12Codebook {
    pub fn new() -> Self {
        Self {
            abs_grid: build_abs_grid(),
        }
    }

    pub fn abs_grid(&self) -> &[[f32; E8P12_PACK]] {
        &self.abs_grid
    }

    /// Decode one code into its 8 weights.
    #[inline]
    pub fn decode(&self, code: u16) -> [f32; E8P12_PACK] {
        let abs = &self.abs_grid[usize::from(code >> 8)];
        let signs = (code >> 1) & 0x7f;
        let shift = if code & 1 == 1 { 0.25 } else { -0.25 };

        let mut out = [0f32; E8P12_PACK];
        let mut negatives = 0;
        for i in 0..E8P12_PACK - 1 {
            let negative = (signs >> i) & 1 == 1;
            negatives += usize::from(negative);
            out[i] = if negative { -abs[i] } else { abs[i] };
        }
        let last = E8P12_PACK - 1;
        out[last] = if negatives % 2 == 1 { -abs[last] } else { abs[last] };

        for v in &mut out {
            *v += shift;
        }
        out
    }
}

impl Default for E8P12Codebook {
    fn default() -> Self {
        Self::new()
    }
}

/// Magnitude grid: every vector with coordinates in `{1/2, 3/2, 5/2, 7/2}`
/// and squared norm at most 10, in lexicographic order, followed by the
/// first vectors of squared norm 12 until 256 entries are filled.
fn build_abs_grid() -> Vec<[f32; E8P12_PACK]> {
    let mut inner = Vec::new();
    let mut shell = Vec::new();

    for n in 0..4usize.pow(E8P12_PACK as u32) {
        let mut twice = [0usize; E8P12_PACK];
        let mut rest = n;
        for slot in twice.iter_mut().rev() {
            *slot = 2 * (rest % 4) + 1;
            rest /= 4;
        }
        // (2c)^2 summed; 40 is |c|^2 = 10, 48 is |c|^2 = 12.
        let norm4: usize = twice.iter().map(|t| t * t).sum();
        let v = twice.map(|t| t as f32 / 2.0);
        if norm4 <= 40 {
            inner.push(v);
        } else if norm4 == 48 {
            shell.push(v);
        }
    }

    let missing = ABS_GRID_SIZE.saturating_sub(inner.len());
    inner.extend(shell.into_iter().take(missing));
    inner
}
