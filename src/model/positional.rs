//! Absolute positional encodings.
//!
//! - [`sinusoids`]: `[sin | cos]` halves, added to encoder features
//! - [`PositionalEncoding`]: interleaved sin/cos with `√dims` input scaling
//! - [`LearnedSinusoids`]: trainable table seeded from interleaved sinusoids

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::{Error, Result};

/// Sinusoid table `[ctx, dims]` laid out as `cat[sin, cos]`.
///
/// Timescales are `exp(-ln(max_tscale) / (dims/2 - 1) · i)` for
/// `i in 0..dims/2`.
pub fn sinusoids(ctx: usize, dims: usize, max_tscale: f64, device: &Device) -> Result<Tensor> {
    if dims % 2 != 0 || dims < 4 {
        return Err(Error::Config(format!(
            "sinusoids need an even dims of at least 4, got {dims}"
        )));
    }
    let half = dims / 2;
    let log_increment = max_tscale.ln() / (half - 1) as f64;
    let mut table = vec![0f32; ctx * dims];
    for t in 0..ctx {
        for i in 0..half {
            let scaled = t as f64 * (-log_increment * i as f64).exp();
            table[t * dims + i] = scaled.sin() as f32;
            table[t * dims + half + i] = scaled.cos() as f32;
        }
    }
    Tensor::from_vec(table, (ctx, dims), device).map_err(Into::into)
}

/// Interleaved table: even columns `sin(pos·div)`, odd columns `cos(pos·div)`,
/// `div = exp(-2i · ln(max_tscale) / dims)`.
pub fn interleaved_sinusoids(
    ctx: usize,
    dims: usize,
    max_tscale: f64,
    device: &Device,
) -> Result<Tensor> {
    if dims % 2 != 0 {
        return Err(Error::Config(format!("interleaved sinusoids need even dims, got {dims}")));
    }
    let mut table = vec![0f32; ctx * dims];
    for pos in 0..ctx {
        for i in (0..dims).step_by(2) {
            let div = (i as f64 * -(max_tscale.ln() / dims as f64)).exp();
            let angle = pos as f64 * div;
            table[pos * dims + i] = angle.sin() as f32;
            table[pos * dims + i + 1] = angle.cos() as f32;
        }
    }
    Tensor::from_vec(table, (ctx, dims), device).map_err(Into::into)
}

/// Classic transformer positional encoding: `x·√dims + pe[:S]`.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    dims: usize,
    pe: Tensor,
}

impl PositionalEncoding {
    pub fn new(dims: usize, ctx: usize, device: &Device) -> Result<Self> {
        let pe = interleaved_sinusoids(ctx, dims, 10000.0, device)?;
        Ok(Self { dims, pe })
    }

    /// `x`: `[B, S, dims]` with `S <= ctx`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq_len, dims) = x.dims3()?;
        let ctx = self.pe.dim(0)?;
        if seq_len > ctx || dims != self.dims {
            return Err(Error::shape("positional encoding input", x.dims()));
        }
        let pe = self.pe.narrow(0, 0, seq_len)?.to_dtype(x.dtype())?;
        let scaled = (x * (self.dims as f64).sqrt())?;
        scaled.broadcast_add(&pe.unsqueeze(0)?).map_err(Into::into)
    }
}

/// Trainable position table initialized from interleaved sinusoids.
///
/// Stored as a zero-initialized learned offset on top of the fixed table, so
/// a fresh `VarMap` starts exactly at the sinusoids.
#[derive(Debug, Clone)]
pub struct LearnedSinusoids {
    base: Tensor,
    offset: Tensor,
}

impl LearnedSinusoids {
    pub fn load(vb: VarBuilder, ctx: usize, dims: usize, max_tscale: f64) -> Result<Self> {
        let base = interleaved_sinusoids(ctx, dims, max_tscale, vb.device())?.to_dtype(vb.dtype())?;
        let offset = vb.get_with_hints((ctx, dims), "positional_embeddings", Init::Const(0.0))?;
        Ok(Self { base, offset })
    }

    pub fn ctx(&self) -> usize {
        self.base.dims()[0]
    }

    /// Embeddings for `positions` (`u32`, any shape) → `[..positions, dims]`.
    pub fn forward(&self, positions: &Tensor) -> Result<Tensor> {
        let table = (&self.base + &self.offset)?;
        let flat = positions.flatten_all()?;
        let max = flat.max(0)?.to_dtype(DType::U32)?.to_scalar::<u32>()? as usize;
        if max >= self.ctx() {
            return Err(Error::UnsupportedShape(format!(
                "position {max} outside table of {} entries",
                self.ctx()
            )));
        }
        let mut shape = positions.dims().to_vec();
        shape.push(table.dim(1)?);
        table.index_select(&flat, 0)?.reshape(shape).map_err(Into::into)
    }

    /// Embeddings for `start..start + len`, `[len, dims]`.
    pub fn range(&self, start: usize, len: usize) -> Result<Tensor> {
        if start + len > self.ctx() {
            return Err(Error::UnsupportedShape(format!(
                "positions {start}..{} outside table of {} entries",
                start + len,
                self.ctx()
            )));
        }
        let table = (&self.base + &self.offset)?;
        table.narrow(0, start, len).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_sinusoids_layout() {
        let table = sinusoids(8, 16, 10000.0, &Device::Cpu).unwrap();
        assert_eq!(table.dims(), &[8, 16]);
        let rows: Vec<Vec<f32>> = table.to_vec2().unwrap();
        // Position 0: sin half is 0, cos half is 1.
        assert!(rows[0][..8].iter().all(|&v| v == 0.0));
        assert!(rows[0][8..].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        // First timescale is 1, so column 0 is sin(t).
        assert!((rows[3][0] - 3f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_sinusoids_reject_odd_dims() {
        assert!(sinusoids(4, 7, 10000.0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_positional_encoding_scales_input() {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(4, 10, &device).unwrap();
        let x = Tensor::ones((1, 3, 4), DType::F32, &device).unwrap();
        let out = pe.forward(&x).unwrap();
        let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        // Position 0: sin(0) = 0, cos(0) = 1, plus x·√4 = 2.
        assert!((vals[0] - 2.0).abs() < 1e-6);
        assert!((vals[1] - 3.0).abs() < 1e-6);
        let long = Tensor::ones((1, 11, 4), DType::F32, &device).unwrap();
        assert!(pe.forward(&long).is_err());
    }

    #[test]
    fn test_learned_sinusoids_start_at_table() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let learned = LearnedSinusoids::load(vb, 16, 8, 10000.0).unwrap();
        let positions = Tensor::new(&[[0u32, 5], [2, 3]], &device).unwrap();
        let emb = learned.forward(&positions).unwrap();
        assert_eq!(emb.dims(), &[2, 2, 8]);

        let expected = interleaved_sinusoids(16, 8, 10000.0, &device).unwrap();
        let row5: Vec<f32> = expected.get(5).unwrap().to_vec1().unwrap();
        let got: Vec<f32> = emb.get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        assert_eq!(row5, got);

        assert!(learned.forward(&Tensor::new(&[16u32], &device).unwrap()).is_err());
        assert_eq!(learned.range(4, 3).unwrap().dims(), &[3, 8]);
    }
}
