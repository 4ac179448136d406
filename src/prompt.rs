use rand::Rng;
use serde::Serialize;

/// Instruction wrapped around every random phrase so the model echoes the
/// input back instead of free-running.
pub const RANDOM_PROMPT_TEMPLATE: &str = "Please reply back the following section unchanged: ";

pub const MIN_WORD_LENGTH: usize = 3;
pub const MAX_WORD_LENGTH: usize = 10;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Where each worker gets its prompt from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum PromptSpec {
    /// Every worker sends the same text.
    Fixed { text: String },
    /// Every worker sends its own freshly generated phrase of `words` words.
    Random { words: usize },
}

impl PromptSpec {
    pub fn fixed(text: impl Into<String>) -> Self {
        PromptSpec::Fixed { text: text.into() }
    }

    pub fn random(words: usize) -> Self {
        PromptSpec::Random { words }
    }

    /// Resolve the prompt for one worker.
    ///
    /// Random phrases are drawn from the calling thread's generator, which is
    /// seeded from the OS once per thread rather than on every call.
    pub fn resolve(&self) -> String {
        match self {
            PromptSpec::Fixed { text } => text.clone(),
            PromptSpec::Random { words } => random_prompt(&mut rand::thread_rng(), *words),
        }
    }

    /// Fixed prompts have their throughput denominators corrected by the
    /// network latency estimate; random prompts use raw wall-clock values.
    pub fn applies_latency_correction(&self) -> bool {
        matches!(self, PromptSpec::Fixed { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            PromptSpec::Fixed { text } => format!("fixed prompt ({} chars)", text.chars().count()),
            PromptSpec::Random { words } => format!("random input ({} words)", words),
        }
    }
}

pub fn random_word<R: Rng + ?Sized>(rng: &mut R) -> String {
    let len = rng.gen_range(MIN_WORD_LENGTH..=MAX_WORD_LENGTH);
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// `words` random lowercase words joined by single spaces.
pub fn random_phrase<R: Rng + ?Sized>(rng: &mut R, words: usize) -> String {
    let mut phrase = String::with_capacity(words * (MAX_WORD_LENGTH + 1));
    for i in 0..words {
        if i > 0 {
            phrase.push(' ');
        }
        phrase.push_str(&random_word(rng));
    }
    phrase
}

pub fn random_prompt<R: Rng + ?Sized>(rng: &mut R, words: usize) -> String {
    format!("{}{}", RANDOM_PROMPT_TEMPLATE, random_phrase(rng, words))
}
