//! Word-level caption vocabulary with reserved tokens.
//!
//! The artifact is a JSON object:
//!
//! ```json
//! { "word_index": { "<pad>": 0, "<unk>": 1, "<start>": 3, "<end>": 4, "a": 2 } }
//! ```
//!
//! Reserved token names can be overridden with `start_token`, `end_token`,
//! `unknown_token` and `padding_token`. Padding is always id 0; if the
//! padding token is absent it is added there.

use crate::error::CaptionError;
use crate::mask::PAD_ID;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::info;

fn default_start() -> String {
    "<start>".to_string()
}

fn default_end() -> String {
    "<end>".to_string()
}

fn default_unknown() -> String {
    "<unk>".to_string()
}

fn default_padding() -> String {
    "<pad>".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyFile {
    pub word_index: BTreeMap<String, usize>,
    #[serde(default = "default_start")]
    pub start_token: String,
    #[serde(default = "default_end")]
    pub end_token: String,
    #[serde(default = "default_unknown")]
    pub unknown_token: String,
    #[serde(default = "default_padding")]
    pub padding_token: String,
}

impl VocabularyFile {
    pub fn new(word_index: BTreeMap<String, usize>) -> Self {
        Self {
            word_index,
            start_token: default_start(),
            end_token: default_end(),
            unknown_token: default_unknown(),
            padding_token: default_padding(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    word_to_id: HashMap<String, usize>,
    id_to_word: HashMap<usize, String>,
    start_id: usize,
    end_id: usize,
    unknown_id: usize,
    names: ReservedNames,
}

#[derive(Debug, Clone)]
struct ReservedNames {
    start: String,
    end: String,
    unknown: String,
    padding: String,
}

impl Vocabulary {
    pub fn from_file(file: VocabularyFile) -> Result<Self> {
        let VocabularyFile {
            word_index,
            start_token,
            end_token,
            unknown_token,
            padding_token,
        } = file;

        let mut word_to_id = HashMap::with_capacity(word_index.len() + 1);
        let mut id_to_word = HashMap::with_capacity(word_index.len() + 1);

        for (word, id) in word_index {
            if let Some(existing) = id_to_word.get(&id) {
                return Err(CaptionError::InvalidVocabulary(format!(
                    "id {} assigned to both '{}' and '{}'",
                    id, existing, word
                ))
                .into());
            }
            if id == PAD_ID && word != padding_token {
                return Err(CaptionError::InvalidVocabulary(format!(
                    "id {} is reserved for padding but maps to '{}'",
                    PAD_ID, word
                ))
                .into());
            }
            if word == padding_token && id != PAD_ID {
                return Err(CaptionError::InvalidVocabulary(format!(
                    "padding token '{}' must have id {}, found {}",
                    word, PAD_ID, id
                ))
                .into());
            }
            id_to_word.insert(id, word.clone());
            word_to_id.insert(word, id);
        }

        if !word_to_id.contains_key(&padding_token) {
            word_to_id.insert(padding_token.clone(), PAD_ID);
            id_to_word.insert(PAD_ID, padding_token.clone());
        }

        let reserved = |name: &str| -> Result<usize> {
            word_to_id.get(name).copied().ok_or_else(|| {
                CaptionError::InvalidVocabulary(format!("reserved token '{}' is missing", name))
                    .into()
            })
        };
        let start_id = reserved(&start_token)?;
        let end_id = reserved(&end_token)?;
        let unknown_id = reserved(&unknown_token)?;

        let mut ids = [start_id, end_id, unknown_id];
        ids.sort_unstable();
        if ids.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(CaptionError::InvalidVocabulary(
                "start, end and unknown tokens must be distinct".to_string(),
            )
            .into());
        }

        Ok(Self {
            word_to_id,
            id_to_word,
            start_id,
            end_id,
            unknown_id,
            names: ReservedNames {
                start: start_token,
                end: end_token,
                unknown: unknown_token,
                padding: padding_token,
            },
        })
    }

    /// Vocabulary with the default reserved token names.
    pub fn from_word_index<I, S>(word_index: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let word_index = word_index
            .into_iter()
            .map(|(word, id)| (word.into(), id))
            .collect();
        Self::from_file(VocabularyFile::new(word_index))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: VocabularyFile =
            serde_json::from_str(json).context("failed to parse vocabulary json")?;
        Self::from_file(file)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary file {}", path.display()))?;
        let vocab = Self::from_json_str(&json)?;
        info!(path = %path.display(), words = vocab.len(), "loaded vocabulary");
        Ok(vocab)
    }

    pub fn to_file(&self) -> VocabularyFile {
        VocabularyFile {
            word_index: self
                .word_to_id
                .iter()
                .map(|(word, id)| (word.clone(), *id))
                .collect(),
            start_token: self.names.start.clone(),
            end_token: self.names.end.clone(),
            unknown_token: self.names.unknown.clone(),
            padding_token: self.names.padding.clone(),
        }
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.to_file())?;
        fs::write(path, json)
            .with_context(|| format!("failed to write vocabulary file {}", path.display()))
    }

    /// Placeholder vocabulary for demos and tests: reserved tokens, a few
    /// caption words, then `w<id>` fillers up to `vocab_size`.
    pub fn synthetic(vocab_size: usize) -> Result<Self> {
        const WORDS: &[&str] = &[
            "a", "on", "of", "the", "in", "with", "and", "is", "man", "to", "sitting", "an",
            "two", "at", "standing", "people", "are", "next", "white", "woman", "table",
            "street", "holding", "dog", "top", "large", "down", "near", "cat", "train",
            "field", "riding", "group", "plate", "tennis", "water", "small", "red", "grass",
            "pizza", "bus", "snow", "beach", "horse", "boy", "girl", "sign", "kitchen",
        ];

        let mut word_index = BTreeMap::new();
        word_index.insert(default_padding(), PAD_ID);
        word_index.insert(default_unknown(), 1);
        word_index.insert(default_start(), 2);
        word_index.insert(default_end(), 3);

        for id in 4..vocab_size.max(4) {
            let word = WORDS
                .get(id - 4)
                .map(|w| w.to_string())
                .unwrap_or_else(|| format!("w{}", id));
            word_index.insert(word, id);
        }

        Self::from_file(VocabularyFile::new(word_index))
    }

    /// Id of `word`, or the unknown id when it is not in the vocabulary.
    pub fn word_to_id(&self, word: &str) -> usize {
        self.word_to_id
            .get(word)
            .copied()
            .unwrap_or(self.unknown_id)
    }

    pub fn id_to_word(&self, id: usize) -> Option<&str> {
        self.id_to_word.get(&id).map(String::as_str)
    }

    pub fn contains(&self, word: &str) -> bool {
        self.word_to_id.contains_key(word)
    }

    pub fn start_id(&self) -> usize {
        self.start_id
    }

    pub fn end_id(&self) -> usize {
        self.end_id
    }

    pub fn unknown_id(&self) -> usize {
        self.unknown_id
    }

    pub fn pad_id(&self) -> usize {
        PAD_ID
    }

    pub fn unknown_token(&self) -> &str {
        &self.names.unknown
    }

    /// Number of entries, padding included.
    pub fn len(&self) -> usize {
        self.word_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_to_id.is_empty()
    }

    pub fn max_id(&self) -> usize {
        self.id_to_word.keys().copied().max().unwrap_or(PAD_ID)
    }

    /// Lowercased whitespace tokens mapped to ids.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.split_whitespace()
            .map(|word| self.word_to_id(&word.to_lowercase()))
            .collect()
    }

    /// Caption words for `ids`. Reserved ids and ids without a word are dropped.
    pub fn decode(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .filter(|&&id| !self.is_reserved(id))
            .filter_map(|&id| self.id_to_word(id))
            .map(str::to_string)
            .collect()
    }

    fn is_reserved(&self, id: usize) -> bool {
        id == PAD_ID || id == self.start_id || id == self.end_id || id == self.unknown_id
    }
}
