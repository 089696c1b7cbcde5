// Prompt encoding for single and dual text-encoder models

use super::types::ModelArchitecture;
use crate::Result;
use candle_core::{Tensor, D};

/// Text encoder producing per-token embeddings
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str, clip_skip: u32) -> Result<Tensor>;

    /// Like `encode`, but the sequence holds at least `min_len` tokens.
    /// Encoders with a fixed output length can keep the default.
    fn encode_padded(&self, text: &str, clip_skip: u32, _min_len: usize) -> Result<Tensor> {
        self.encode(text, clip_skip)
    }
}

/// Text encoder that also produces a pooled sentence embedding
pub trait PooledTextEncoder: Send + Sync {
    /// Returns (per-token embeddings, pooled embedding)
    fn encode_with_pooled(&self, text: &str, clip_skip: u32) -> Result<(Tensor, Tensor)>;

    fn encode_with_pooled_padded(
        &self,
        text: &str,
        clip_skip: u32,
        _min_len: usize,
    ) -> Result<(Tensor, Tensor)> {
        self.encode_with_pooled(text, clip_skip)
    }
}

/// The text-conditioning half of a loaded model
pub trait TextConditioner: Send + Sync {
    fn name(&self) -> &str;

    fn text_encoder(&self) -> &dyn TextEncoder;

    /// Present only on dual-encoder models
    fn text_encoder_2(&self) -> Option<&dyn PooledTextEncoder> {
        None
    }
}

/// Encoder topology of a model, detected per call
pub enum EncoderTopology<'a> {
    Single(&'a dyn TextEncoder),
    Dual(&'a dyn TextEncoder, &'a dyn PooledTextEncoder),
}

impl<'a> EncoderTopology<'a> {
    pub fn detect(model: &'a dyn TextConditioner) -> Self {
        match model.text_encoder_2() {
            Some(second) => EncoderTopology::Dual(model.text_encoder(), second),
            None => EncoderTopology::Single(model.text_encoder()),
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        match self {
            EncoderTopology::Single(_) => ModelArchitecture::SingleEncoder,
            EncoderTopology::Dual(..) => ModelArchitecture::DualEncoder,
        }
    }
}

/// Prompt conditioning ready for the runtime
#[derive(Debug, Clone)]
pub enum EncodingResult {
    Single {
        prompt_embeds: Tensor,
        negative_prompt_embeds: Tensor,
    },
    Dual {
        prompt_embeds: Tensor,
        negative_prompt_embeds: Tensor,
        pooled_prompt_embeds: Tensor,
        negative_pooled_prompt_embeds: Tensor,
    },
}

impl EncodingResult {
    pub fn architecture(&self) -> ModelArchitecture {
        match self {
            EncodingResult::Single { .. } => ModelArchitecture::SingleEncoder,
            EncodingResult::Dual { .. } => ModelArchitecture::DualEncoder,
        }
    }

    pub fn prompt_embeds(&self) -> &Tensor {
        match self {
            EncodingResult::Single { prompt_embeds, .. } => prompt_embeds,
            EncodingResult::Dual { prompt_embeds, .. } => prompt_embeds,
        }
    }

    pub fn negative_prompt_embeds(&self) -> &Tensor {
        match self {
            EncodingResult::Single {
                negative_prompt_embeds,
                ..
            } => negative_prompt_embeds,
            EncodingResult::Dual {
                negative_prompt_embeds,
                ..
            } => negative_prompt_embeds,
        }
    }
}

/// Encode a prompt pair for the given model.
///
/// Dual-encoder models concatenate both encoders' token embeddings along the
/// feature dimension. An empty negative prompt yields zero tensors shaped like
/// the positive ones without running any encoder. Prompt and negative always
/// come back with the same sequence length.
pub fn encode(
    prompt: &str,
    negative_prompt: &str,
    model: &dyn TextConditioner,
    clip_skip: u32,
) -> Result<EncodingResult> {
    match EncoderTopology::detect(model) {
        EncoderTopology::Single(encoder) => {
            tracing::debug!("Encoding prompt with single encoder ({})", model.name());
            let (prompt_embeds, negative_prompt_embeds) = encode_pair(
                prompt,
                negative_prompt,
                |text, min_len| encoder.encode_padded(text, clip_skip, min_len),
                |embeds: &Tensor| Ok(embeds.dim(1)?),
            )?;
            Ok(EncodingResult::Single {
                prompt_embeds,
                negative_prompt_embeds,
            })
        }
        EncoderTopology::Dual(first, second) => {
            tracing::debug!("Encoding prompt with dual encoders ({})", model.name());
            let ((prompt_embeds, pooled_prompt_embeds), (negative_prompt_embeds, negative_pooled_prompt_embeds)) =
                if negative_prompt.is_empty() {
                    let (embeds, pooled) = encode_dual(prompt, first, second, clip_skip, 0)?;
                    let zeros = (embeds.zeros_like()?, pooled.zeros_like()?);
                    ((embeds, pooled), zeros)
                } else {
                    encode_pair(
                        prompt,
                        negative_prompt,
                        |text, min_len| encode_dual(text, first, second, clip_skip, min_len),
                        |(embeds, _): &(Tensor, Tensor)| Ok(embeds.dim(1)?),
                    )?
                };

            Ok(EncodingResult::Dual {
                prompt_embeds,
                negative_prompt_embeds,
                pooled_prompt_embeds,
                negative_pooled_prompt_embeds,
            })
        }
    }
}

// Encode the prompt first; a longer negative pulls the prompt up to its length
fn encode_pair<T>(
    prompt: &str,
    negative_prompt: &str,
    encode: impl Fn(&str, usize) -> Result<T>,
    seq_len: impl Fn(&T) -> Result<usize>,
) -> Result<(T, T)> {
    let positive = encode(prompt, 0)?;
    let positive_len = seq_len(&positive)?;
    let negative = encode(negative_prompt, positive_len)?;
    let negative_len = seq_len(&negative)?;
    if negative_len > positive_len {
        tracing::debug!("Negative prompt is longer, re-encoding prompt to {} tokens", negative_len);
        return Ok((encode(prompt, negative_len)?, negative));
    }
    Ok((positive, negative))
}

fn encode_dual(
    text: &str,
    first: &dyn TextEncoder,
    second: &dyn PooledTextEncoder,
    clip_skip: u32,
    min_len: usize,
) -> Result<(Tensor, Tensor)> {
    let embeds_1 = first.encode_padded(text, clip_skip, min_len)?;
    let (embeds_2, pooled) = second.encode_with_pooled_padded(text, clip_skip, embeds_1.dim(1)?)?;
    let embeds_1 = if embeds_2.dim(1)? > embeds_1.dim(1)? {
        first.encode_padded(text, clip_skip, embeds_2.dim(1)?)?
    } else {
        embeds_1
    };
    let embeds = Tensor::cat(&[&embeds_1, &embeds_2], D::Minus1)?;
    Ok((embeds, pooled))
}
