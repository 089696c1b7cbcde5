// Reproducible metadata string, written next to every saved image

use super::types::GenerationParams;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const PROMPT_LABEL: &str = ", Prompt: ";
const NEGATIVE_LABEL: &str = ", Negative prompt: ";
const ESCAPED_NEGATIVE_LABEL: &str = ", Negative prompt\\: ";

/// Everything needed to reproduce an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub model: String,
    pub seed: u64,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub scheduler: String,
    pub clip_skip: u32,
    pub width: u32,
    pub height: u32,
    pub prompt: String,
    pub negative_prompt: String,
}

impl GenerationMetadata {
    pub fn build(params: &GenerationParams, seed: u64, model: &str) -> Self {
        Self {
            model: model.to_string(),
            seed,
            steps: params.steps,
            cfg_scale: params.cfg_scale,
            sampler: params.sampler.clone(),
            scheduler: params.scheduler.clone(),
            clip_skip: params.clip_skip,
            width: params.width,
            height: params.height,
            prompt: params.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
        }
    }

    /// Parse a string produced by the `Display` impl.
    ///
    /// Prompts may contain commas, so they are located by label rather than
    /// by splitting. Backslashes and the negative label inside prompts are
    /// escaped when written, so the first unescaped label is the real one.
    pub fn parse(text: &str) -> Result<Self> {
        // Only line endings are stripped; an empty negative prompt leaves a trailing space
        let text = text.trim_start().trim_end_matches(&['\r', '\n'][..]);
        let prompt_at = text
            .find(PROMPT_LABEL)
            .ok_or_else(|| invalid("missing prompt"))?;
        let (head, rest) = text.split_at(prompt_at);
        let rest = &rest[PROMPT_LABEL.len()..];

        let (prompt, negative_prompt) = match rest.find(NEGATIVE_LABEL) {
            Some(at) => (&rest[..at], &rest[at + NEGATIVE_LABEL.len()..]),
            None => (rest, ""),
        };

        let mut fields: Vec<(&str, String)> = Vec::new();
        for part in head.split(", ") {
            match part.split_once(": ") {
                Some((key, value)) if is_known_label(key) => fields.push((key, value.to_string())),
                _ => match fields.last_mut() {
                    // A value that itself contained ", "
                    Some((_, value)) => {
                        value.push_str(", ");
                        value.push_str(part);
                    }
                    None => return Err(invalid(&format!("unexpected field '{}'", part))),
                },
            }
        }

        let field = |label: &str| lookup(&fields, label);

        let (width, height) = field("Size")?
            .split_once('x')
            .ok_or_else(|| invalid("size must be WxH"))?;

        Ok(Self {
            model: field("Model")?.to_string(),
            seed: parse_number(field("Seed")?, "Seed")?,
            steps: parse_number(field("Steps")?, "Steps")?,
            cfg_scale: parse_number(field("CFG Scale")?, "CFG Scale")?,
            sampler: field("Sampler")?.to_string(),
            scheduler: field("Scheduler")?.to_string(),
            clip_skip: match field("CLIP Skip") {
                Ok(value) => parse_number(value, "CLIP Skip")?,
                Err(_) => 1,
            },
            width: parse_number(width.trim(), "Size")?,
            height: parse_number(height.trim(), "Size")?,
            prompt: unescape_prompt(prompt),
            negative_prompt: unescape_prompt(negative_prompt),
        })
    }
}

fn lookup<'a>(fields: &'a [(&str, String)], label: &str) -> Result<&'a str> {
    fields
        .iter()
        .find(|(key, _)| *key == label)
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| invalid(&format!("missing {}", label)))
}

fn escape_prompt(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(NEGATIVE_LABEL, ESCAPED_NEGATIVE_LABEL)
}

// Unknown escapes are kept verbatim
fn unescape_prompt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(next @ ('\\' | ':')) => out.push(next),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn is_known_label(key: &str) -> bool {
    matches!(
        key,
        "Model" | "Seed" | "Steps" | "CFG Scale" | "Sampler" | "Scheduler" | "CLIP Skip" | "Size"
    )
}

fn parse_number<T: FromStr>(value: &str, label: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(&format!("{} is not a number: '{}'", label, value)))
}

fn invalid(reason: &str) -> Error {
    Error::InvalidParameters(format!("malformed metadata: {}", reason))
}

impl fmt::Display for GenerationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Model: {}, Seed: {}, Steps: {}, CFG Scale: {:?}, Sampler: {}, Scheduler: {}, CLIP Skip: {}, Size: {}x{}, Prompt: {}, Negative prompt: {}",
            self.model,
            self.seed,
            self.steps,
            self.cfg_scale,
            self.sampler,
            self.scheduler,
            self.clip_skip,
            self.width,
            self.height,
            escape_prompt(&self.prompt),
            escape_prompt(&self.negative_prompt)
        )
    }
}

impl FromStr for GenerationMetadata {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl GenerationParams {
    /// Apply sampling settings from saved metadata, optionally prompts and seed too
    pub fn apply_metadata(&mut self, metadata: &GenerationMetadata, with_prompts: bool, with_seed: bool) {
        self.steps = metadata.steps;
        self.cfg_scale = metadata.cfg_scale;
        self.sampler = metadata.sampler.clone();
        self.scheduler = metadata.scheduler.clone();
        self.clip_skip = metadata.clip_skip;
        self.width = metadata.width;
        self.height = metadata.height;
        if with_prompts {
            self.prompt = metadata.prompt.clone();
            self.negative_prompt = metadata.negative_prompt.clone();
        }
        if with_seed {
            self.seed = Some(metadata.seed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GenerationParams {
        GenerationParams::new("a castle, at night, oil painting")
            .with_negative_prompt("blurry, low quality")
            .with_sampler("euler_a", "normal")
            .with_size(768, 512)
    }

    #[test]
    fn test_metadata_string_format() {
        let metadata = GenerationMetadata::build(&params(), 1234, "sd15-base");
        assert_eq!(
            metadata.to_string(),
            "Model: sd15-base, Seed: 1234, Steps: 20, CFG Scale: 7.0, Sampler: euler_a, \
             Scheduler: normal, CLIP Skip: 1, Size: 768x512, \
             Prompt: a castle, at night, oil painting, Negative prompt: blurry, low quality"
        );
    }

    #[test]
    fn test_parse_with_commas_in_prompts() {
        let metadata = GenerationMetadata::build(&params(), 99, "sdxl, refined");
        let parsed: GenerationMetadata = metadata.to_string().parse().unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_prompts_containing_labels_survive() {
        let params = GenerationParams::new(r"a \(literal\) sign, Negative prompt: none")
            .with_negative_prompt("noise, Negative prompt: more noise");
        let metadata = GenerationMetadata::build(&params, 3, "m");
        let text = metadata.to_string();
        assert_eq!(text.matches(NEGATIVE_LABEL).count(), 1);

        let parsed = GenerationMetadata::parse(&text).unwrap();
        assert_eq!(parsed.prompt, r"a \(literal\) sign, Negative prompt: none");
        assert_eq!(parsed.negative_prompt, "noise, Negative prompt: more noise");
    }

    #[test]
    fn test_parse_without_clip_skip() {
        let text = "Model: m, Seed: 5, Steps: 30, CFG Scale: 6.5, Sampler: ddim, Scheduler: simple, \
                    Size: 512x768, Prompt: a dog, Negative prompt: ";
        let parsed = GenerationMetadata::parse(text).unwrap();
        assert_eq!(parsed.clip_skip, 1);
        assert_eq!((parsed.width, parsed.height), (512, 768));
        assert_eq!(parsed.cfg_scale, 6.5);
        assert_eq!(parsed.negative_prompt, "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(GenerationMetadata::parse("hello world").is_err());
        assert!(GenerationMetadata::parse("Model: m, Seed: x, Prompt: p").is_err());
    }

    #[test]
    fn test_apply_metadata() {
        let metadata = GenerationMetadata::build(&params(), 77, "m");
        let mut target = GenerationParams::new("keep me");
        target.apply_metadata(&metadata, false, false);
        assert_eq!(target.prompt, "keep me");
        assert_eq!(target.sampler, "euler_a");
        assert_eq!((target.width, target.height), (768, 512));
        assert_eq!(target.seed, None);

        target.apply_metadata(&metadata, true, true);
        assert_eq!(target.prompt, "a castle, at night, oil painting");
        assert_eq!(target.seed, Some(77));
    }
}
