//! Fixed-size key/value cache for incremental decoding.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Pre-allocated `[max_batch, heads, max_seq, head_dim]` key and value store.
///
/// [`KvCache::update`] writes new positions in place and hands back the
/// filled prefix, so attention never sees the unwritten tail.
#[derive(Debug, Clone)]
pub struct KvCache {
    k: Tensor,
    v: Tensor,
    max_batch: usize,
    max_seq: usize,
    len: usize,
}

impl KvCache {
    pub fn new(
        max_batch: usize,
        max_seq: usize,
        heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (max_batch, heads, max_seq, head_dim);
        Ok(Self {
            k: Tensor::zeros(shape, dtype, device)?,
            v: Tensor::zeros(shape, dtype, device)?,
            max_batch,
            max_seq,
            len: 0,
        })
    }

    /// Positions written so far (the end of the furthest write).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_seq(&self) -> usize {
        self.max_seq
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Write `k`, `v` (`[B, H, S, D]`) at `start_pos..start_pos + S`.
    ///
    /// Returns keys and values for positions `0..start_pos + S` of the first
    /// `B` rows.
    pub fn update(&mut self, start_pos: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, heads, seq, head_dim) = k.dims4()?;
        let (_, cache_heads, _, cache_dim) = self.k.dims4()?;
        if v.dims() != k.dims() {
            return Err(Error::UnsupportedShape(format!(
                "kv cache: key {:?} and value {:?} differ",
                k.dims(),
                v.dims()
            )));
        }
        if batch > self.max_batch || heads != cache_heads || head_dim != cache_dim {
            return Err(Error::shape("kv cache update", k.dims()));
        }
        let end = start_pos + seq;
        if end > self.max_seq {
            return Err(Error::UnsupportedShape(format!(
                "kv cache overflow: positions {start_pos}..{end} exceed {}",
                self.max_seq
            )));
        }

        let rows = |cache: &Tensor| cache.narrow(0, 0, batch);
        let k_rows = rows(&self.k)?.slice_scatter(&k.to_dtype(self.k.dtype())?.contiguous()?, 2, start_pos)?;
        let v_rows = rows(&self.v)?.slice_scatter(&v.to_dtype(self.v.dtype())?.contiguous()?, 2, start_pos)?;
        if batch == self.max_batch {
            self.k = k_rows;
            self.v = v_rows;
        } else {
            self.k = self.k.slice_scatter0(&k_rows, 0)?;
            self.v = self.v.slice_scatter0(&v_rows, 0)?;
        }
        self.len = self.len.max(end);

        Ok((
            self.k.narrow(0, 0, batch)?.narrow(2, 0, end)?.contiguous()?,
            self.v.narrow(0, 0, batch)?.narrow(2, 0, end)?.contiguous()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_returns_filled_prefix() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(2, 8, 2, 4, DType::F32, &device).unwrap();
        let k = Tensor::ones((2, 2, 3, 4), DType::F32, &device).unwrap();
        let (k_out, v_out) = cache.update(0, &k, &k).unwrap();
        assert_eq!(k_out.dims(), &[2, 2, 3, 4]);
        assert_eq!(v_out.dims(), &[2, 2, 3, 4]);

        let step = (Tensor::ones((2, 2, 1, 4), DType::F32, &device).unwrap() * 2.0).unwrap();
        let (k_out, _) = cache.update(3, &step, &step).unwrap();
        assert_eq!(k_out.dims(), &[2, 2, 4, 4]);
        assert_eq!(cache.len(), 4);
        let last: f32 = k_out.narrow(2, 3, 1).unwrap().mean_all().unwrap().to_scalar().unwrap();
        let first: f32 = k_out.narrow(2, 0, 3).unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert_eq!(last, 2.0);
        assert_eq!(first, 1.0);
    }

    #[test]
    fn test_smaller_batch_writes_leading_rows() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(4, 4, 1, 2, DType::F32, &device).unwrap();
        let k = Tensor::ones((2, 1, 2, 2), DType::F32, &device).unwrap();
        let (k_out, v_out) = cache.update(0, &k, &k).unwrap();
        assert_eq!(k_out.dims(), &[2, 1, 2, 2]);
        assert!(k_out.is_contiguous() && v_out.is_contiguous());
        // Keys come back ready for a transposed matmul.
        let q = Tensor::ones((2, 1, 1, 2), DType::F32, &device).unwrap();
        let scores = q.matmul(&k_out.t().unwrap().contiguous().unwrap()).unwrap();
        assert_eq!(scores.dims(), &[2, 1, 1, 2]);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(1, 4, 1, 2, DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 1, 3, 2), DType::F32, &device).unwrap();
        cache.update(0, &k, &k).unwrap();
        assert!(matches!(cache.update(2, &k, &k), Err(Error::UnsupportedShape(_))));
    }

    #[test]
    fn test_head_mismatch_is_rejected() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(1, 4, 2, 2, DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 3, 1, 2), DType::F32, &device).unwrap();
        assert!(cache.update(0, &k, &k).is_err());
    }
}
