//! Text tokenizer for transcripts.

use std::path::Path;

use tokenizers::Tokenizer;

use super::metrics::clean_ids;
use crate::Result;

/// Pad, BOS and EOS ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self { pad: 0, bos: 1, eos: 2 }
    }
}

/// Turns id sequences back into text.
pub trait TokenDecoder {
    fn special_tokens(&self) -> SpecialTokens;

    /// Decode ids that contain no special tokens.
    fn decode_clean(&self, ids: &[u32]) -> Result<String>;

    /// Decode after dropping pad, BOS, EOS and `-100`.
    fn decode(&self, ids: &[i64]) -> Result<String> {
        self.decode_clean(&clean_ids(ids, self.special_tokens()))
    }

    fn batch_decode(&self, batch: &[Vec<i64>]) -> Result<Vec<String>> {
        batch.iter().map(|ids| self.decode(ids)).collect()
    }
}

/// A `tokenizers` tokenizer with `<PAD>`/`<BOS>`/`<EOS>` at ids 0/1/2.
#[derive(Clone)]
pub struct SpeechTokenizer {
    inner: Tokenizer,
    special: SpecialTokens,
}

impl SpeechTokenizer {
    const SPECIAL_NAMES: [&'static str; 3] = ["<PAD>", "<BOS>", "<EOS>"];

    pub fn new(inner: Tokenizer) -> Self {
        Self {
            inner,
            special: SpecialTokens::default(),
        }
    }

    /// Load a `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("loading tokenizer from {:?}", path);
        Ok(Self::new(Tokenizer::from_file(path)?))
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Encode `text`; without `add_special_tokens` the ids of `<PAD>`,
    /// `<BOS>` and `<EOS>` are removed from the result.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let ids = self.inner.encode(text, true)?.get_ids().to_vec();
        if add_special_tokens {
            return Ok(ids);
        }
        let special: Vec<u32> = Self::SPECIAL_NAMES
            .iter()
            .filter_map(|name| self.inner.token_to_id(name))
            .collect();
        Ok(ids.into_iter().filter(|id| !special.contains(id)).collect())
    }

    /// Write `tokenizer.json` into `dir`, creating it if needed.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.inner.save(dir.join("tokenizer.json"), false)?;
        Ok(())
    }
}

impl TokenDecoder for SpeechTokenizer {
    fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    fn decode_clean(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true)?)
    }
}
