//! Per-layer QuIP# weight store.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::loader::{Parameter, ParameterLoader};

use super::codebook::E8P12_PACK;
use super::hadamard::HadamardRotation;

/// Packed indices, per-channel sign/scale vectors and the two rotations of
/// one quantized linear layer.
///
/// Cells are allocated zero-filled and written once by the checkpoint loader.
#[derive(Debug)]
pub struct QuipWeightStore {
    input_size: usize,
    output_size: usize,
    /// `[padded_out, padded_in / 8]`, one code per element.
    qidxs: Arc<Parameter>,
    su: Arc<Parameter>,
    sv: Arc<Parameter>,
    left: HadamardRotation,
    right: HadamardRotation,
}

impl QuipWeightStore {
    pub fn new(input_size: usize, output_size: usize, dtype: DType, device: &Device) -> Result<Self> {
        // Input padding must split evenly into codes.
        let left = HadamardRotation::new(input_size, E8P12_PACK, device)?;
        let right = HadamardRotation::new(output_size, 1, device)?;

        let qidxs = Parameter::whole(
            (right.padded(), left.padded() / E8P12_PACK),
            DType::I64,
            device,
        )?;
        let su = Parameter::whole(input_size, dtype, device)?;
        let sv = Parameter::whole(output_size, dtype, device)?;

        Ok(Self {
            input_size,
            output_size,
            qidxs,
            su,
            sv,
            left,
            right,
        })
    }

    /// Build a store and fill it from tensors already in memory.
    pub fn from_tensors(qidxs: &Tensor, su: &Tensor, sv: &Tensor) -> Result<Self> {
        let store = Self::new(su.elem_count(), sv.elem_count(), su.dtype(), su.device())?;
        store.qidxs.load(qidxs, None, None)?;
        store.su.load(&su.flatten_all()?, None, None)?;
        store.sv.load(&sv.flatten_all()?, None, None)?;
        Ok(store)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn padded_in(&self) -> usize {
        self.left.padded()
    }

    pub fn padded_out(&self) -> usize {
        self.right.padded()
    }

    pub fn qidxs(&self) -> Tensor {
        self.qidxs.tensor()
    }

    pub fn su(&self) -> Tensor {
        self.su.tensor()
    }

    pub fn sv(&self) -> Tensor {
        self.sv.tensor()
    }

    pub fn left(&self) -> &HadamardRotation {
        &self.left
    }

    pub fn right(&self) -> &HadamardRotation {
        &self.right
    }

    /// Check the packed geometry against the declared feature counts.
    pub fn validate(&self) -> Result<()> {
        let (rows, cols) = self.qidxs.tensor().dims2()?;
        if rows != self.padded_out() || cols * E8P12_PACK != self.padded_in() {
            return Err(Error::shape(format!(
                "Qidxs [{rows}, {cols}] inconsistent with padded sizes out={} in={}",
                self.padded_out(),
                self.padded_in()
            )));
        }
        let su = self.su.tensor().elem_count();
        let sv = self.sv.tensor().elem_count();
        if su != self.input_size || sv != self.output_size {
            return Err(Error::shape(format!(
                "SU/SV lengths {su}/{sv} do not match sizes {}/{}",
                self.input_size, self.output_size
            )));
        }
        Ok(())
    }

    /// Load destinations under their checkpoint names.
    pub fn parameters(&self) -> Vec<(&'static str, Arc<Parameter>)> {
        vec![
            ("Qidxs", Arc::clone(&self.qidxs)),
            ("SU", Arc::clone(&self.su)),
            ("SV", Arc::clone(&self.sv)),
        ]
    }
}
