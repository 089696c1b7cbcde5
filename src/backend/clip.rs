// CLIP text encoder backed by candle

use crate::generation::encoding::{PooledTextEncoder, TextEncoder};
use crate::generation::prompt::{self, TokenLayout, WindowEncoder};
use crate::{Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{self, clip};
use std::path::Path;
use tokenizers::Tokenizer;

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";

/// Tokenizer plus CLIP text transformer for one encoder slot
pub struct ClipTextEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    device: Device,
    layout: TokenLayout,
}

impl ClipTextEncoder {
    pub fn load(
        config: &clip::Config,
        tokenizer_path: impl AsRef<Path>,
        weights: impl AsRef<Path>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path.as_ref())
            .map_err(|e| Error::Tokenization(e.to_string()))?;

        let vocab = tokenizer.get_vocab(true);
        let token = |name: &str| {
            vocab
                .get(name)
                .copied()
                .ok_or_else(|| Error::Tokenization(format!("{} not found in vocabulary", name)))
        };
        let bos_id = token(START_OF_TEXT)?;
        let eos_id = token(END_OF_TEXT)?;
        let pad_id = match &config.pad_with {
            Some(padding) => token(padding.as_str())?,
            None => eos_id,
        };

        let model = stable_diffusion::build_clip_transformer(config, weights.as_ref(), device, dtype)
            .map_err(|e| Error::ModelLoading(format!("CLIP text encoder: {}", e)))?;

        Ok(Self {
            tokenizer,
            model,
            device: device.clone(),
            layout: TokenLayout {
                context_length: config.max_position_embeddings,
                bos_id,
                eos_id,
                pad_id,
            },
        })
    }
}

/// Encoder layer to read hidden states from: `None` for the last layer,
/// otherwise counted from the end (`clip_skip = 2` is the penultimate layer)
fn skip_to_layer(clip_skip: u32) -> Option<isize> {
    (clip_skip > 1).then(|| -(clip_skip as isize))
}

impl WindowEncoder for ClipTextEncoder {
    fn layout(&self) -> TokenLayout {
        self.layout
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?
            .get_ids()
            .to_vec())
    }

    fn encode_window(&self, ids: &[u32], clip_skip: u32) -> Result<Tensor> {
        let tokens = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let hidden = match skip_to_layer(clip_skip) {
            Some(layer) => {
                let (_, skipped) = self.model.forward_until_encoder_layer(&tokens, usize::MAX, layer)?;
                skipped
            }
            None => self.model.forward(&tokens)?,
        };
        Ok(hidden)
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, text: &str, clip_skip: u32) -> Result<Tensor> {
        self.encode_padded(text, clip_skip, 0)
    }

    fn encode_padded(&self, text: &str, clip_skip: u32, min_len: usize) -> Result<Tensor> {
        Ok(prompt::encode_prompt(self, text, clip_skip, min_len)?.hidden)
    }
}

impl PooledTextEncoder for ClipTextEncoder {
    fn encode_with_pooled(&self, text: &str, clip_skip: u32) -> Result<(Tensor, Tensor)> {
        self.encode_with_pooled_padded(text, clip_skip, 0)
    }

    fn encode_with_pooled_padded(
        &self,
        text: &str,
        clip_skip: u32,
        min_len: usize,
    ) -> Result<(Tensor, Tensor)> {
        let embedding = prompt::encode_prompt(self, text, clip_skip, min_len)?;
        let pooled = embedding.first_window.i((.., embedding.eot_index, ..))?;
        Ok((embedding.hidden, pooled))
    }
}
