//! Codebook kernels over packed E8P12 indices.
//!
//! Both kernels read `Qidxs` of shape `[rows, cols]`, one 16-bit code per
//! element (stored widened to I64 or U32), and are numerically equivalent up
//! to accumulation order. These are host reference implementations: tensors
//! on other devices are copied to the host, processed, and the result is
//! placed back on the input's device.

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

use super::codebook::{E8P12Codebook, E8P12_PACK};

/// Codes of a packed index tensor in row-major order.
fn packed_codes(packed: &Tensor) -> Result<(usize, usize, Vec<u16>)> {
    let (rows, cols) = packed.dims2()?;
    let flat = packed.flatten_all()?;
    // Only the low 16 bits are meaningful: checkpoints store int16 codes that
    // show up sign-extended after widening.
    let codes = match packed.dtype() {
        DType::I64 => flat.to_vec1::<i64>()?.into_iter().map(|v| v as u16).collect(),
        DType::U32 => flat.to_vec1::<u32>()?.into_iter().map(|v| v as u16).collect(),
        other => {
            return Err(Error::shape(format!(
                "packed codebook indices must be I64 or U32, got {other:?}"
            )))
        }
    };
    Ok((rows, cols, codes))
}

/// `y = x · Wᵀ` without materializing `W`: each code is decoded once and its
/// 8 weights are accumulated into every row.
///
/// `x` is `[n, cols * 8]`, result `[n, rows]` in F32.
pub fn codebook_gemv(x: &Tensor, packed: &Tensor, codebook: &E8P12Codebook) -> Result<Tensor> {
    let (rows, cols, codes) = packed_codes(packed)?;
    let (n, width) = x.dims2()?;
    if width != cols * E8P12_PACK {
        return Err(Error::shape(format!(
            "input width {width} does not match {cols} packed columns"
        )));
    }

    let xs = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let mut ys = vec![0f32; n * rows];
    for out in 0..rows {
        for col in 0..cols {
            let w = codebook.decode(codes[out * cols + col]);
            let base = col * E8P12_PACK;
            for r in 0..n {
                let xr = &xs[r * width + base..r * width + base + E8P12_PACK];
                let dot: f32 = w.iter().zip(xr).map(|(a, b)| a * b).sum();
                ys[r * rows + out] += dot;
            }
        }
    }
    Ok(Tensor::from_vec(ys, (n, rows), x.device())?)
}

/// Expand packed indices to the dense `[rows, cols * 8]` F32 matrix.
pub fn codebook_dequantize(packed: &Tensor, codebook: &E8P12Codebook) -> Result<Tensor> {
    let (rows, cols, codes) = packed_codes(packed)?;
    let mut dense = Vec::with_capacity(rows * cols * E8P12_PACK);
    for code in codes {
        dense.extend_from_slice(&codebook.decode(code));
    }
    Ok(Tensor::from_vec(
        dense,
        (rows, cols * E8P12_PACK),
        packed.device(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn dequantize_lays_codes_out_row_major() {
        let cb = E8P12Codebook::new();
        let packed = Tensor::new(&[[0i64, 1], [3, 0x0102]], &Device::Cpu).unwrap();
        let w = codebook_dequantize(&packed, &cb).unwrap();
        assert_eq!(w.dims(), &[2, 16]);
        let w = w.to_vec2::<f32>().unwrap();
        assert_eq!(&w[0][..8], &cb.decode(0));
        assert_eq!(&w[0][8..], &cb.decode(1));
        assert_eq!(&w[1][..8], &cb.decode(3));
        assert_eq!(&w[1][8..], &cb.decode(0x0102));
    }

    #[test]
    fn sign_extended_codes_use_low_bits() {
        let cb = E8P12Codebook::new();
        // int16 -1 widened to i64 is 0xffff as a code.
        let packed = Tensor::new(&[[-1i64]], &Device::Cpu).unwrap();
        let w = codebook_dequantize(&packed, &cb).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(w[0], cb.decode(0xffff).to_vec());
    }

    #[test]
    fn gemv_matches_dense_matmul() {
        let cb = E8P12Codebook::new();
        let packed = Tensor::new(&[[7i64, 0x3f21, 513], [40000, 2, 65535]], &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 24), &Device::Cpu).unwrap();

        let fused = codebook_gemv(&x, &packed, &cb).unwrap();
        let dense = codebook_dequantize(&packed, &cb).unwrap();
        let reference = x.matmul(&dense.t().unwrap()).unwrap();

        let diff = (fused - reference)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn gemv_rejects_width_mismatch() {
        let cb = E8P12Codebook::new();
        let packed = Tensor::zeros((2, 2), DType::I64, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(codebook_gemv(&x, &packed, &cb), Err(Error::Shape(_))));
        let bad = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(codebook_dequantize(&bad, &cb), Err(Error::Shape(_))));
    }
}
