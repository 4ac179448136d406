use anyhow::Result;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

/// Local token counter, used only when a server response carries no usage.
pub struct Tokenizer {
    encoder: Arc<CoreBPE>,
    model_type: ModelType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    // GPT-4, GPT-3.5-turbo and most open models served behind OpenAI APIs
    Cl100k,
    // GPT-4o models
    O200k,
}

impl Tokenizer {
    pub fn new(model: &str) -> Result<Self> {
        let (encoder, model_type) = if model.contains("gpt-4o") {
            (Arc::new(o200k_base()?), ModelType::O200k)
        } else {
            (Arc::new(cl100k_base()?), ModelType::Cl100k)
        };

        Ok(Self {
            encoder,
            model_type,
        })
    }

    /// Counts raw text only. Chat framing adds a few tokens per message on
    /// the server side, so estimates run slightly low.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_counting() {
        let tokenizer = Tokenizer::new("qwen2.5-7b-instruct").unwrap();
        assert_eq!(tokenizer.model_type(), ModelType::Cl100k);
        assert!(tokenizer.count_tokens("Hello, world!") > 0);
        assert_eq!(tokenizer.count_tokens(""), 0);
    }

    #[test]
    fn test_gpt4o_uses_o200k() {
        let tokenizer = Tokenizer::new("gpt-4o-mini").unwrap();
        assert_eq!(tokenizer.model_type(), ModelType::O200k);
    }
}
