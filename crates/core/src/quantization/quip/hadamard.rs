//! Randomized-Hadamard incoherence rotation.
//!
//! A rotation of size `n` is applied to `padded >= n` columns, where
//! `padded = K * 2^m`. The transform is `H = A ⊗ W / sqrt(padded)` with `W`
//! the `2^m` Walsh–Hadamard matrix (applied as an in-place butterfly) and `A`
//! a `K x K` Paley-construction Hadamard block, absent when `K = 1`.
//!
//! Rows are treated as row vectors: [`HadamardRotation::forward`] computes
//! `x · H` (the input-side `Hᵀx` of column-vector notation) and
//! [`HadamardRotation::backward`] computes `x · Hᵀ`. `H` is orthogonal, so
//! one undoes the other on the padded width.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Orders of the Paley blocks mixed with the power-of-two stage.
pub const PALEY_BLOCKS: [usize; 2] = [12, 20];

/// Chosen factorization of a padded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationBlock {
    pub size: usize,
    /// Order of the Paley block, 1 for pure Walsh–Hadamard.
    pub block: usize,
    pub padded: usize,
}

/// Pick the smallest `K * 2^m >= size` that is a multiple of `align`.
///
/// Ties prefer the pure power of two.
pub fn select_rotation_block(size: usize, align: usize) -> Result<RotationBlock> {
    if size == 0 {
        return Err(Error::shape("rotation size must be positive"));
    }
    if align == 0 || !align.is_power_of_two() {
        return Err(Error::config(format!(
            "rotation alignment {align} must be a power of two"
        )));
    }

    let mut best = RotationBlock {
        size,
        block: 1,
        padded: size.next_power_of_two().max(align),
    };
    for k in PALEY_BLOCKS {
        let mut padded = k;
        while padded < size || padded % align != 0 {
            padded *= 2;
        }
        if padded < best.padded {
            best = RotationBlock {
                size,
                block: k,
                padded,
            };
        }
    }
    Ok(best)
}

/// Paley construction I for `order = q + 1`, `q` prime with `q ≡ 3 (mod 4)`.
///
/// Returns the row-major `±1` matrix `I + S`, where `S` is the skew bordered
/// Jacobsthal matrix.
pub fn paley_matrix(order: usize) -> Result<Vec<f32>> {
    let q = order.wrapping_sub(1);
    if order < 4 || q % 4 != 3 || !is_prime(q) {
        return Err(Error::config(format!(
            "no Paley-I Hadamard matrix of order {order}"
        )));
    }

    let mut residue = vec![false; q];
    for x in 1..q {
        residue[(x * x) % q] = true;
    }
    let chi = |a: usize| -> f32 {
        match a % q {
            0 => 0.0,
            r if residue[r] => 1.0,
            _ => -1.0,
        }
    };

    let mut h = vec![0f32; order * order];
    for i in 0..order {
        for j in 0..order {
            let s = match (i, j) {
                (0, 0) => 0.0,
                (0, _) => 1.0,
                (_, 0) => -1.0,
                _ => chi(j + q - i),
            };
            h[i * order + j] = s + if i == j { 1.0 } else { 0.0 };
        }
    }
    Ok(h)
}

fn is_prime(n: usize) -> bool {
    n >= 2 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

/// In-place Walsh–Hadamard butterfly over the last dimension of `[rows, m]`,
/// unnormalized.
pub fn walsh_hadamard(x: &Tensor) -> Result<Tensor> {
    let (rows, m) = x.dims2()?;
    if !m.is_power_of_two() {
        return Err(Error::shape(format!(
            "Walsh-Hadamard width {m} is not a power of two"
        )));
    }

    let mut xs = x.contiguous()?;
    let mut h = 1;
    while h < m {
        let pairs = xs.reshape((rows, m / (2 * h), 2, h))?;
        let a = pairs.narrow(2, 0, 1)?;
        let b = pairs.narrow(2, 1, 1)?;
        xs = Tensor::cat(&[(&a + &b)?, (&a - &b)?], 2)?.reshape((rows, m))?;
        h *= 2;
    }
    Ok(xs)
}

/// Rotation bound to one layer dimension.
#[derive(Debug, Clone)]
pub struct HadamardRotation {
    block: RotationBlock,
    /// `K x K` Paley block in F32, `None` when `K = 1`.
    matrix: Option<Tensor>,
}

impl HadamardRotation {
    pub fn new(size: usize, align: usize, device: &Device) -> Result<Self> {
        let block = select_rotation_block(size, align)?;
        let matrix = if block.block > 1 {
            let k = block.block;
            Some(Tensor::from_vec(paley_matrix(k)?, (k, k), device)?)
        } else {
            None
        };
        Ok(Self { block, matrix })
    }

    pub fn size(&self) -> usize {
        self.block.size
    }

    pub fn padded(&self) -> usize {
        self.block.padded
    }

    pub fn block_size(&self) -> usize {
        self.block.block
    }

    pub fn matrix(&self) -> Option<&Tensor> {
        self.matrix.as_ref()
    }

    /// `[rows, cols <= padded]` → `[rows, padded]`, zero-padding first.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.transform(x, true)
    }

    /// Inverse of [`forward`](Self::forward) on the padded width.
    pub fn backward(&self, x: &Tensor) -> Result<Tensor> {
        self.transform(x, false)
    }

    fn transform(&self, x: &Tensor, transpose_block: bool) -> Result<Tensor> {
        let (rows, cols) = x.dims2()?;
        let padded = self.block.padded;
        if cols > padded {
            return Err(Error::shape(format!(
                "rotation of width {padded} got {cols} columns"
            )));
        }

        let dtype = x.dtype();
        let mut xs = x.to_dtype(DType::F32)?;
        if cols < padded {
            xs = xs.pad_with_zeros(1, 0, padded - cols)?;
        }

        let k = self.block.block;
        let m = padded / k;
        let xs = walsh_hadamard(&xs.reshape((rows * k, m))?)?;
        let mut xs = xs.reshape((rows, k, m))?;

        // x · (A ⊗ W) viewed as [K, M] blocks is Aᵀ X W; x · (A ⊗ W)ᵀ is A X Wᵀ.
        if let Some(a) = &self.matrix {
            let a = if transpose_block { a.t()? } else { a.clone() };
            let a = a.contiguous()?.unsqueeze(0)?.broadcast_as((rows, k, k))?.contiguous()?;
            xs = a.matmul(&xs)?;
        }

        let scale = 1.0 / (padded as f64).sqrt();
        Ok(xs.reshape((rows, padded))?.affine(scale, 0.0)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eye(n: usize) -> Tensor {
        let data: Vec<f32> = (0..n * n)
            .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(data, (n, n), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn block_selection() {
        let sel = |n| select_rotation_block(n, 8).unwrap();
        assert_eq!(sel(100).padded, 128);
        assert_eq!(sel(100).block, 1);
        assert_eq!(sel(64).padded, 64);
        assert_eq!((sel(96).block, sel(96).padded), (12, 96));
        assert_eq!((sel(80).block, sel(80).padded), (20, 80));
        // Aligned Paley padding for 12 is 24, the power of two 16 is smaller.
        assert_eq!((sel(12).block, sel(12).padded), (1, 16));
        assert_eq!((sel(24).block, sel(24).padded), (12, 24));
        assert_eq!((sel(90).block, sel(90).padded), (12, 96));
        assert_eq!(sel(3).padded, 8);
        assert_eq!(select_rotation_block(12, 1).unwrap().padded, 12);
        assert!(select_rotation_block(0, 8).is_err());
    }

    #[test]
    fn paley_blocks_are_hadamard() {
        for order in PALEY_BLOCKS {
            let h = Tensor::from_vec(paley_matrix(order).unwrap(), (order, order), &Device::Cpu)
                .unwrap();
            assert!(h.to_vec2::<f32>().unwrap().iter().flatten().all(|v| v.abs() == 1.0));
            let hht = h.matmul(&h.t().unwrap()).unwrap();
            let scaled = eye(order).affine(order as f64, 0.0).unwrap();
            assert_eq!(max_abs_diff(&hht, &scaled), 0.0);
        }
        assert!(paley_matrix(16).is_err());
    }

    #[test]
    fn walsh_hadamard_matches_sylvester() {
        let h = walsh_hadamard(&eye(4)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(
            h,
            vec![
                vec![1.0, 1.0, 1.0, 1.0],
                vec![1.0, -1.0, 1.0, -1.0],
                vec![1.0, 1.0, -1.0, -1.0],
                vec![1.0, -1.0, -1.0, 1.0],
            ]
        );
    }

    fn round_trip(size: usize) {
        let rot = HadamardRotation::new(size, 8, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, size), &Device::Cpu).unwrap();
        let y = rot.forward(&x).unwrap();
        assert_eq!(y.dims(), &[3, rot.padded()]);
        let back = rot.backward(&y).unwrap().narrow(1, 0, size).unwrap();
        assert!(max_abs_diff(&back, &x) < 1e-4, "size {size}");
    }

    #[test]
    fn rotation_round_trips() {
        round_trip(100);
        round_trip(64);
        round_trip(96);
        round_trip(80);
    }

    #[test]
    fn rotation_preserves_norm() {
        let rot = HadamardRotation::new(96, 8, &Device::Cpu).unwrap();
        assert!(rot.matrix().is_some());
        let x = Tensor::randn(0f32, 1.0, (2, 96), &Device::Cpu).unwrap();
        let y = rot.forward(&x).unwrap();
        let nx = x.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let ny = y.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((nx - ny).abs() / nx < 1e-4);
    }

    #[test]
    fn rotation_rejects_wide_input() {
        let rot = HadamardRotation::new(16, 8, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 17), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(rot.forward(&x), Err(Error::Shape(_))));
    }
}
