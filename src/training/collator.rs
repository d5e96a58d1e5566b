//! Batch collation for seq2seq training.

use std::collections::BTreeMap;

use candle_core::{D, Device, Tensor};

use super::tokenizer::SpecialTokens;
use crate::features::{AudioFeatures, FeatureKind};
use crate::{Error, Result};

/// One utterance: label ids plus any extracted features.
#[derive(Debug, Clone, Default)]
pub struct Example {
    pub labels: Vec<u32>,
    pub features: BTreeMap<FeatureKind, Tensor>,
}

impl From<AudioFeatures> for Example {
    fn from(features: AudioFeatures) -> Self {
        let map = features.iter().map(|(kind, t)| (kind, t.clone())).collect();
        Self {
            labels: features.labels,
            features: map,
        }
    }
}

/// A padded batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, L + 1]` u32: BOS followed by the labels.
    pub input_ids: Tensor,
    /// `[B, L + 1]` u32: the labels followed by EOS.
    pub labels: Tensor,
    /// Each feature stacked to `[B, .., T_max]`.
    pub features: BTreeMap<FeatureKind, Tensor>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataCollator {
    special: SpecialTokens,
}

impl DataCollator {
    pub fn new(special: SpecialTokens) -> Self {
        Self { special }
    }

    /// Collate `examples`. `L` is the longest label sequence; both id rows
    /// are padded with the pad id. Features are padded on their last axis
    /// with the pad id and stacked; kinds no example carries are skipped.
    pub fn collate(&self, examples: &[Example], device: &Device) -> Result<Batch> {
        if examples.is_empty() {
            return Err(Error::UnsupportedShape("cannot collate an empty batch".into()));
        }
        let SpecialTokens { pad, bos, eos } = self.special;
        let max_len = examples.iter().map(|e| e.labels.len()).max().unwrap_or(0);
        let width = max_len + 1;

        let mut input_ids = Vec::with_capacity(examples.len() * width);
        let mut labels = Vec::with_capacity(examples.len() * width);
        for example in examples {
            input_ids.push(bos);
            input_ids.extend_from_slice(&example.labels);
            input_ids.resize(input_ids.len() + max_len - example.labels.len(), pad);

            labels.extend_from_slice(&example.labels);
            labels.push(eos);
            labels.resize(labels.len() + max_len - example.labels.len(), pad);
        }

        let mut features = BTreeMap::new();
        for kind in FeatureKind::ALL {
            let items: Vec<&Tensor> = examples.iter().filter_map(|e| e.features.get(&kind)).collect();
            if items.is_empty() {
                continue;
            }
            features.insert(kind, pad_and_stack(kind, &items, pad as f64)?.to_device(device)?);
        }

        tracing::trace!(batch = examples.len(), width, features = features.len(), "collated batch");
        Ok(Batch {
            input_ids: Tensor::from_vec(input_ids, (examples.len(), width), device)?,
            labels: Tensor::from_vec(labels, (examples.len(), width), device)?,
            features,
        })
    }
}

fn pad_and_stack(kind: FeatureKind, items: &[&Tensor], value: f64) -> Result<Tensor> {
    let lead = items[0].dims()[..items[0].rank().saturating_sub(1)].to_vec();
    let mut max_len = 0;
    for item in items {
        if item.rank() == 0 || item.dims()[..item.rank() - 1] != lead[..] {
            return Err(Error::UnsupportedShape(format!(
                "feature '{kind}': cannot stack {:?} with {:?}",
                items[0].dims(),
                item.dims()
            )));
        }
        max_len = max_len.max(item.dim(D::Minus1)?);
    }

    let padded = items
        .iter()
        .map(|item| {
            let missing = max_len - item.dim(D::Minus1)?;
            if missing == 0 {
                return Ok((*item).clone());
            }
            let mut shape = lead.clone();
            shape.push(missing);
            let fill = (Tensor::ones(shape, item.dtype(), item.device())? * value)?;
            Ok(Tensor::cat(&[*item, &fill], D::Minus1)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&padded, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn example(labels: &[u32]) -> Example {
        Example {
            labels: labels.to_vec(),
            features: BTreeMap::new(),
        }
    }

    #[test]
    fn test_decoder_input_and_target_are_shifted() {
        let collator = DataCollator::default();
        let batch = collator
            .collate(&[example(&[7, 8, 9]), example(&[5])], &Device::Cpu)
            .unwrap();
        let input_ids: Vec<Vec<u32>> = batch.input_ids.to_vec2().unwrap();
        let labels: Vec<Vec<u32>> = batch.labels.to_vec2().unwrap();
        assert_eq!(input_ids, vec![vec![1, 7, 8, 9], vec![1, 5, 0, 0]]);
        assert_eq!(labels, vec![vec![7, 8, 9, 2], vec![5, 2, 0, 0]]);
        assert!(batch.features.is_empty());
    }

    #[test]
    fn test_features_padded_with_pad_id() {
        let collator = DataCollator::new(SpecialTokens { pad: 3, bos: 1, eos: 2 });
        let mut a = example(&[4]);
        a.features.insert(
            FeatureKind::Spectrogram,
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        a.features.insert(FeatureKind::F0, Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap());
        let mut b = example(&[4, 5]);
        b.features.insert(
            FeatureKind::Spectrogram,
            Tensor::ones((2, 5), DType::F32, &Device::Cpu).unwrap(),
        );

        let batch = collator.collate(&[a, b], &Device::Cpu).unwrap();
        let spec = &batch.features[&FeatureKind::Spectrogram];
        assert_eq!(spec.dims(), &[2, 2, 5]);
        let first_row: Vec<f32> = spec.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert_eq!(first_row, vec![1.0, 1.0, 1.0, 3.0, 3.0]);
        // Only one example carries f0; it is still batched.
        assert_eq!(batch.features[&FeatureKind::F0].dims(), &[1, 2]);
        assert!(!batch.features.contains_key(&FeatureKind::Waveform));
        let input_ids: Vec<Vec<u32>> = batch.input_ids.to_vec2().unwrap();
        assert_eq!(input_ids, vec![vec![1, 4, 3], vec![1, 4, 5]]);
    }

    #[test]
    fn test_mismatched_feature_shapes_rejected() {
        let collator = DataCollator::default();
        let mut a = example(&[4]);
        a.features.insert(FeatureKind::Harmonics, Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap());
        let mut b = example(&[4]);
        b.features.insert(FeatureKind::Harmonics, Tensor::zeros((5, 3), DType::F32, &Device::Cpu).unwrap());
        assert!(matches!(
            collator.collate(&[a, b], &Device::Cpu),
            Err(Error::UnsupportedShape(_))
        ));
        assert!(collator.collate(&[], &Device::Cpu).is_err());
    }

    #[test]
    fn test_from_audio_features() {
        let features = AudioFeatures {
            f0: Some(Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap()),
            labels: vec![9, 9],
            ..AudioFeatures::default()
        };
        let example = Example::from(features);
        assert_eq!(example.labels, vec![9, 9]);
        assert_eq!(example.features.keys().copied().collect::<Vec<_>>(), vec![FeatureKind::F0]);
    }
}
