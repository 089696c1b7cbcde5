// Prompt weighting and long-prompt windows for CLIP-style encoders
//
// Syntax follows the A1111 conventions: `(text)` boosts by 1.1, `[text]`
// lowers by 1.1, `(text:1.4)` sets an explicit weight, brackets nest and
// multiply, `\(` escapes a literal bracket. `BREAK` forces a new window.

use crate::{Error, Result};
use candle_core::{DType, Tensor};

/// Keyword that closes the current window early
pub const BREAK_KEYWORD: &str = "BREAK";

const ROUND_MULTIPLIER: f64 = 1.1;
const SQUARE_MULTIPLIER: f64 = 1.0 / 1.1;

/// Parsed piece of a prompt
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPiece {
    Text { text: String, weight: f64 },
    Break,
}

impl PromptPiece {
    fn text(text: impl Into<String>, weight: f64) -> Self {
        PromptPiece::Text {
            text: text.into(),
            weight,
        }
    }
}

/// Split a prompt into weighted text runs and `BREAK` markers.
///
/// Unclosed brackets still apply their multiplier to everything after them.
/// Unmatched closing brackets are kept as literal text.
pub fn parse_prompt_weights(prompt: &str) -> Vec<PromptPiece> {
    let chars: Vec<char> = prompt.chars().collect();
    let mut pieces = Vec::new();
    let mut round: Vec<usize> = Vec::new();
    let mut square: Vec<usize> = Vec::new();
    let mut literal = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() => {
                literal.push(chars[i + 1]);
                i += 2;
                continue;
            }
            '(' => {
                flush_literal(&mut literal, &mut pieces);
                round.push(pieces.len());
            }
            '[' => {
                flush_literal(&mut literal, &mut pieces);
                square.push(pieces.len());
            }
            ':' if !round.is_empty() => match explicit_weight(&chars[i..]) {
                Some((weight, consumed)) => {
                    flush_literal(&mut literal, &mut pieces);
                    if let Some(start) = round.pop() {
                        multiply_range(&mut pieces[start..], weight);
                    }
                    i += consumed;
                    continue;
                }
                None => literal.push(c),
            },
            ')' if !round.is_empty() => {
                flush_literal(&mut literal, &mut pieces);
                if let Some(start) = round.pop() {
                    multiply_range(&mut pieces[start..], ROUND_MULTIPLIER);
                }
            }
            ']' if !square.is_empty() => {
                flush_literal(&mut literal, &mut pieces);
                if let Some(start) = square.pop() {
                    multiply_range(&mut pieces[start..], SQUARE_MULTIPLIER);
                }
            }
            _ => literal.push(c),
        }
        i += 1;
    }
    flush_literal(&mut literal, &mut pieces);

    for start in round {
        multiply_range(&mut pieces[start..], ROUND_MULTIPLIER);
    }
    for start in square {
        multiply_range(&mut pieces[start..], SQUARE_MULTIPLIER);
    }

    merge_equal_weights(pieces)
}

// `:<number>)` with optional whitespace; returns the weight and chars consumed
fn explicit_weight(chars: &[char]) -> Option<(f64, usize)> {
    let mut i = 1;
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    let start = i;
    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
        i += 1;
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    let number: String = chars[start..i].iter().collect();
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    if i >= chars.len() || chars[i] != ')' {
        return None;
    }
    number.parse::<f64>().ok().map(|weight| (weight, i + 1))
}

fn flush_literal(literal: &mut String, pieces: &mut Vec<PromptPiece>) {
    if literal.is_empty() {
        return;
    }
    for (n, part) in split_on_break(literal).into_iter().enumerate() {
        if n > 0 {
            pieces.push(PromptPiece::Break);
        }
        if !part.is_empty() {
            pieces.push(PromptPiece::text(part, 1.0));
        }
    }
    literal.clear();
}

fn split_on_break(text: &str) -> Vec<&str> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut parts = Vec::new();
    let mut start = 0;
    for (at, _) in text.match_indices(BREAK_KEYWORD) {
        let end = at + BREAK_KEYWORD.len();
        let before = text[..at].chars().next_back();
        let after = text[end..].chars().next();
        if before.is_some_and(is_word) || after.is_some_and(is_word) {
            continue;
        }
        parts.push(text[start..at].trim());
        start = end;
    }
    if start == 0 {
        parts.push(text);
    } else {
        parts.push(text[start..].trim());
    }
    parts
}

fn multiply_range(pieces: &mut [PromptPiece], multiplier: f64) {
    for piece in pieces {
        if let PromptPiece::Text { weight, .. } = piece {
            *weight *= multiplier;
        }
    }
}

fn merge_equal_weights(pieces: Vec<PromptPiece>) -> Vec<PromptPiece> {
    let mut merged: Vec<PromptPiece> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let (
            Some(PromptPiece::Text {
                text: last_text,
                weight: last_weight,
            }),
            PromptPiece::Text { text, weight },
        ) = (merged.last_mut(), &piece)
        {
            if *last_weight == *weight {
                last_text.push_str(text);
                continue;
            }
        }
        merged.push(piece);
    }
    merged
}

/// Special tokens and window size of a CLIP-style tokenizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLayout {
    pub context_length: usize,
    pub bos_id: u32,
    pub eos_id: u32,
    pub pad_id: u32,
}

impl TokenLayout {
    /// Prompt tokens that fit between the start and end tokens of one window
    pub fn capacity(&self) -> usize {
        self.context_length.saturating_sub(2)
    }
}

/// One fixed-length encoder input with a weight per position
#[derive(Debug, Clone, PartialEq)]
pub struct TokenWindow {
    pub ids: Vec<u32>,
    pub weights: Vec<f32>,
    /// Position of the end-of-text token
    pub eot_index: usize,
}

impl TokenWindow {
    fn build(tokens: &[(u32, f32)], layout: TokenLayout) -> Self {
        let mut ids = Vec::with_capacity(layout.context_length);
        let mut weights = Vec::with_capacity(layout.context_length);
        ids.push(layout.bos_id);
        weights.push(1.0);
        for &(id, weight) in tokens {
            ids.push(id);
            weights.push(weight);
        }
        let eot_index = ids.len();
        ids.push(layout.eos_id);
        weights.push(1.0);
        ids.resize(layout.context_length, layout.pad_id);
        weights.resize(layout.context_length, 1.0);
        Self {
            ids,
            weights,
            eot_index,
        }
    }

    pub fn empty(layout: TokenLayout) -> Self {
        Self::build(&[], layout)
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.iter().any(|w| *w != 1.0)
    }
}

/// Tokenize parsed pieces into windows of `layout.context_length` tokens.
///
/// A prompt longer than one window continues in the next; `BREAK` closes the
/// current window. There is always at least one window.
pub fn build_windows(
    pieces: &[PromptPiece],
    layout: TokenLayout,
    mut tokenize: impl FnMut(&str) -> Result<Vec<u32>>,
) -> Result<Vec<TokenWindow>> {
    let capacity = layout.capacity();
    if capacity == 0 {
        return Err(Error::Configuration(format!(
            "context length {} leaves no room for prompt tokens",
            layout.context_length
        )));
    }

    let mut windows = Vec::new();
    let mut current: Vec<(u32, f32)> = Vec::with_capacity(capacity);
    for piece in pieces {
        match piece {
            PromptPiece::Break => {
                if !current.is_empty() {
                    windows.push(TokenWindow::build(&current, layout));
                    current.clear();
                }
            }
            PromptPiece::Text { text, weight } => {
                if text.trim().is_empty() {
                    continue;
                }
                for id in tokenize(text)? {
                    if current.len() == capacity {
                        windows.push(TokenWindow::build(&current, layout));
                        current.clear();
                    }
                    current.push((id, *weight as f32));
                }
            }
        }
    }
    if !current.is_empty() || windows.is_empty() {
        windows.push(TokenWindow::build(&current, layout));
    }
    Ok(windows)
}

/// Tokenizer plus single-window forward pass of a CLIP-style encoder
pub trait WindowEncoder {
    fn layout(&self) -> TokenLayout;

    /// Token ids without start or end tokens
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Hidden states `[1, context_length, dim]` for one window
    fn encode_window(&self, ids: &[u32], clip_skip: u32) -> Result<Tensor>;
}

/// Weighted hidden states of a whole prompt
#[derive(Debug, Clone)]
pub struct PromptEmbedding {
    /// `[1, windows * context_length, dim]`
    pub hidden: Tensor,
    /// Unweighted hidden states of the first window
    pub first_window: Tensor,
    /// End-of-text position in the first window
    pub eot_index: usize,
}

impl PromptEmbedding {
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.hidden.dim(1)?)
    }
}

/// Encode a prompt window by window and concatenate along the sequence.
///
/// Empty windows are appended until the sequence holds at least `min_len`
/// tokens, so a prompt and its negative can be brought to the same length.
pub fn encode_prompt(
    encoder: &dyn WindowEncoder,
    prompt: &str,
    clip_skip: u32,
    min_len: usize,
) -> Result<PromptEmbedding> {
    let layout = encoder.layout();
    let pieces = parse_prompt_weights(prompt);
    let mut windows = build_windows(&pieces, layout, |text| encoder.tokenize(text))?;

    let min_windows = min_len.div_ceil(layout.context_length.max(1));
    while windows.len() < min_windows {
        windows.push(TokenWindow::empty(layout));
    }
    if windows.len() > 1 {
        tracing::debug!("Prompt spans {} windows of {} tokens", windows.len(), layout.context_length);
    }

    let mut first_window = None;
    let mut hidden = Vec::with_capacity(windows.len());
    for window in &windows {
        let encoded = encoder.encode_window(&window.ids, clip_skip)?;
        hidden.push(apply_weights(&encoded, &window.weights)?);
        if first_window.is_none() {
            first_window = Some(encoded);
        }
    }

    let first_window = first_window
        .ok_or_else(|| Error::Configuration("prompt produced no windows".into()))?;
    Ok(PromptEmbedding {
        hidden: Tensor::cat(&hidden, 1)?,
        first_window,
        eot_index: windows[0].eot_index,
    })
}

/// Scale each position by its weight, then restore the overall norm
pub fn apply_weights(embeddings: &Tensor, weights: &[f32]) -> Result<Tensor> {
    if weights.iter().all(|w| *w == 1.0) {
        return Ok(embeddings.clone());
    }

    let dtype = embeddings.dtype();
    let base = embeddings.to_dtype(DType::F32)?;
    let scale = Tensor::new(weights, base.device())?.reshape((1, weights.len(), 1))?;
    let weighted = base.broadcast_mul(&scale)?;

    let base_norm = base.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
    let weighted_norm = weighted.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
    let restored = if weighted_norm > 0.0 {
        weighted.affine((base_norm / weighted_norm) as f64, 0.0)?
    } else {
        weighted
    };
    Ok(restored.to_dtype(dtype)?)
}
