use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::VrError;

pub const NULL_TOKEN: &str = "<NULL>";
pub const START_TOKEN: &str = "<START>";
pub const END_TOKEN: &str = "<END>";
pub const SCENE_TOKEN: &str = "scene";

/// Question, program and answer vocabularies as written by the dataset tools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vocab {
    pub question_token_to_idx: BTreeMap<String, i64>,
    pub program_token_to_idx: BTreeMap<String, i64>,
    pub program_token_arity: BTreeMap<String, usize>,
    pub answer_token_to_idx: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_token_to_module_text: Option<BTreeMap<String, (Option<String>, Option<String>)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_token_to_idx: Option<BTreeMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_token_to_idx: Option<BTreeMap<String, i64>>,
}

impl Vocab {
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocab from {:?}", path))?;
        let vocab: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse vocab {:?}", path))?;
        vocab.validate()?;
        Ok(vocab)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).with_context(|| "Failed to serialize vocab")?;
        fs::write(path, json).with_context(|| format!("Failed to write vocab to {:?}", path))?;
        Ok(())
    }

    /// Every token-to-index map must cover `0..len` exactly once.
    pub fn validate(&self) -> Result<(), VrError> {
        check_dense("question_token_to_idx", &self.question_token_to_idx)?;
        check_dense("program_token_to_idx", &self.program_token_to_idx)?;
        check_dense("answer_token_to_idx", &self.answer_token_to_idx)?;
        Ok(())
    }

    pub fn num_answers(&self) -> usize {
        self.answer_token_to_idx.len()
    }

    pub fn num_question_tokens(&self) -> usize {
        self.question_token_to_idx.len()
    }

    pub fn program_idx_to_token(&self) -> Vec<String> {
        invert(&self.program_token_to_idx)
    }

    pub fn answer_idx_to_token(&self) -> Vec<String> {
        invert(&self.answer_token_to_idx)
    }

    pub fn arity(&self, token: &str) -> Result<usize, VrError> {
        self.program_token_arity
            .get(token)
            .copied()
            .ok_or_else(|| VrError::UnknownToken(token.to_string()))
    }
}

/// Assigns indices in first-seen order after the three special tokens.
pub fn build_token_index<'a, I, S>(sequences: I) -> BTreeMap<String, i64>
where
    I: IntoIterator<Item = &'a S>,
    S: AsRef<[String]> + 'a + ?Sized,
{
    let mut index: HashMap<String, i64> = HashMap::new();
    for (i, special) in [NULL_TOKEN, START_TOKEN, END_TOKEN].iter().enumerate() {
        index.insert(special.to_string(), i as i64);
    }
    for seq in sequences {
        for token in seq.as_ref() {
            if !index.contains_key(token) {
                let next = index.len() as i64;
                index.insert(token.clone(), next);
            }
        }
    }
    index.into_iter().collect()
}

fn check_dense(map: &'static str, tokens: &BTreeMap<String, i64>) -> Result<(), VrError> {
    let mut seen = vec![false; tokens.len()];
    for &idx in tokens.values() {
        if idx >= 0 && (idx as usize) < seen.len() {
            seen[idx as usize] = true;
        }
    }
    match seen.iter().position(|s| !s) {
        Some(missing) => Err(VrError::SparseVocabulary { map, missing }),
        None => Ok(()),
    }
}

fn invert(tokens: &BTreeMap<String, i64>) -> Vec<String> {
    let mut out = vec![String::new(); tokens.len()];
    for (token, &idx) in tokens {
        if let Some(slot) = out.get_mut(idx as usize) {
            *slot = token.clone();
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// The vocabulary written by the flat QA generator, trimmed to two colours and shapes.
    pub fn flat_vocab() -> Vocab {
        let program_words = ["<NULL>", "<START>", "<END>", "scene", "And", "blue", "red", "circle", "square"];
        let question_words = ["<NULL>", "<START>", "<END>", "is", "there", "a", "blue", "red", "circle", "square"];
        let arity = |w: &str| match w {
            "And" => 2,
            "scene" => 0,
            _ => 1,
        };
        Vocab {
            question_token_to_idx: question_words.iter().enumerate().map(|(i, w)| (w.to_string(), i as i64)).collect(),
            program_token_to_idx: program_words.iter().enumerate().map(|(i, w)| (w.to_string(), i as i64)).collect(),
            program_token_arity: program_words.iter().map(|w| (w.to_string(), arity(w))).collect(),
            answer_token_to_idx: [("false".to_string(), 0), ("true".to_string(), 1)].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_token_index_first_seen_order() {
        let questions = vec![
            vec!["is".to_string(), "there".to_string()],
            vec!["there".to_string(), "a".to_string()],
        ];
        let index = build_token_index(&questions);
        assert_eq!(index["<NULL>"], 0);
        assert_eq!(index["<END>"], 2);
        assert_eq!(index["is"], 3);
        assert_eq!(index["there"], 4);
        assert_eq!(index["a"], 5);
    }

    #[test]
    fn test_sparse_vocab_rejected() {
        let mut vocab = flat_vocab();
        vocab.answer_token_to_idx.insert("maybe".to_string(), 5);
        assert!(matches!(
            vocab.validate(),
            Err(VrError::SparseVocabulary { map: "answer_token_to_idx", .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vocab.json");
        flat_vocab().save(&path).unwrap();

        let loaded = Vocab::load(&path).unwrap();
        assert_eq!(loaded.num_answers(), 2);
        assert_eq!(loaded.program_idx_to_token()[4], "And");
        assert_eq!(loaded.arity("And").unwrap(), 2);
        assert!(loaded.arity("Or").is_err());
    }
}
