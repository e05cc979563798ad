//! Tokenizer and chat-template seams.
//!
//! The core never inspects vocabulary internals; it encodes prompts once at
//! admission and decodes generated tokens incrementally while streaming.
//! Incremental decoding matters because byte-level tokenizers can emit
//! partial UTF-8 sequences mid-stream; the stream decoder holds tokens back
//! until they decode to whole characters.

use crate::error::{Error, Result};

/// A chat message, role plus content.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Renders chat messages into the raw prompt text to tokenize.
pub trait ChatTemplate: Send + Sync {
    fn render(&self, messages: &[Message]) -> Result<String>;
}

/// Incremental detokenizer for one sequence.
pub trait DecodeStream: Send {
    /// Feed one token; returns decoded text once it forms whole characters.
    fn push(&mut self, token: u32) -> Result<Option<String>>;
}

/// Text <-> token seam consumed by the engine.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Fresh incremental decoder for a new sequence.
    fn new_stream(&self, skip_special_tokens: bool) -> Box<dyn DecodeStream>;
}

/// [`Tokenizer`] backed by a Hugging Face `tokenizers` tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        Self { inner }
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn new_stream(&self, skip_special_tokens: bool) -> Box<dyn DecodeStream> {
        Box::new(HfDecodeStream {
            inner: self.inner.clone(),
            skip_special_tokens,
            tokens: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
        })
    }
}

/// Prefix-offset incremental decoding: re-decode a trailing window of tokens
/// and emit only the text that grew past the previously read prefix,
/// holding back while the tail still ends in a replacement character.
struct HfDecodeStream {
    inner: tokenizers::Tokenizer,
    skip_special_tokens: bool,
    tokens: Vec<u32>,
    prefix_offset: usize,
    read_offset: usize,
}

impl DecodeStream for HfDecodeStream {
    fn push(&mut self, token: u32) -> Result<Option<String>> {
        self.tokens.push(token);

        let prefix_text = self
            .inner
            .decode(&self.tokens[self.prefix_offset..self.read_offset], self.skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        let new_text = self
            .inner
            .decode(&self.tokens[self.prefix_offset..], self.skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))?;

        if new_text.len() > prefix_text.len() && !new_text.ends_with('\u{fffd}') {
            let delta = new_text[prefix_text.len()..].to_string();
            self.prefix_offset = self.read_offset;
            self.read_offset = self.tokens.len();
            Ok(Some(delta))
        } else {
            Ok(None)
        }
    }
}

/// Minimal ChatML-style template: `<|im_start|>role\ncontent<|im_end|>`
/// blocks followed by an assistant header.
pub struct ChatMlTemplate;

impl ChatTemplate for ChatMlTemplate {
    fn render(&self, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            return Err(Error::invalid_request("empty message list"));
        }
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str("<|im_start|>");
            prompt.push_str(&message.role);
            prompt.push('\n');
            prompt.push_str(&message.content);
            prompt.push_str("<|im_end|>\n");
        }
        prompt.push_str("<|im_start|>assistant\n");
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chatml_render() {
        let template = ChatMlTemplate;
        let prompt = template
            .render(&[
                Message::new("system", "be brief"),
                Message::new("user", "hi"),
            ])
            .unwrap();
        assert_eq!(
            prompt,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_chatml_rejects_empty() {
        assert!(ChatMlTemplate.render(&[]).is_err());
    }
}
