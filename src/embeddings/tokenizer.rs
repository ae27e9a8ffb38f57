use std::path::Path;

use anyhow::Context;

use crate::embeddings::{SubwordTokenizer, TokenEncoding};

/// bert-base-uncased WordPiece tokenizer.
///
/// No padding and no truncation: the ids describe exactly the text that was
/// embedded, with [CLS]/[SEP] added.
pub struct WordPieceTokenizer {
    inner: tokenizers::Tokenizer,
}

impl WordPieceTokenizer {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join("tokenizer.json");
        Self::from_file(&path).with_context(|| format!("load {}", path.display()))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let mut inner = tokenizers::Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("{e}"))?;
        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("disable truncation: {e}"))?;
        log::info!("Tokenizer loaded (vocab size {})", inner.get_vocab_size(true));
        Ok(Self { inner })
    }
}

impl SubwordTokenizer for WordPieceTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<TokenEncoding> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("encode error: {e}"))?;
        Ok(TokenEncoding {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Same layout as the published bert-base-uncased tokenizer.json, tiny vocab.
    const TINY_BERT_TOKENIZER: &str = r###"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 2, "content": "[CLS]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 3, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": {"type": "BertNormalizer", "clean_text": true, "handle_chinese_chars": true, "strip_accents": null, "lowercase": true},
  "pre_tokenizer": {"type": "BertPreTokenizer"},
  "post_processor": {
    "type": "TemplateProcessing",
    "single": [
      {"SpecialToken": {"id": "[CLS]", "type_id": 0}},
      {"Sequence": {"id": "A", "type_id": 0}},
      {"SpecialToken": {"id": "[SEP]", "type_id": 0}}
    ],
    "pair": [
      {"SpecialToken": {"id": "[CLS]", "type_id": 0}},
      {"Sequence": {"id": "A", "type_id": 0}},
      {"SpecialToken": {"id": "[SEP]", "type_id": 0}},
      {"Sequence": {"id": "B", "type_id": 1}},
      {"SpecialToken": {"id": "[SEP]", "type_id": 1}}
    ],
    "special_tokens": {
      "[CLS]": {"id": "[CLS]", "ids": [2], "tokens": ["[CLS]"]},
      "[SEP]": {"id": "[SEP]", "ids": [3], "tokens": ["[SEP]"]}
    }
  },
  "decoder": {"type": "WordPiece", "prefix": "##", "cleanup": true},
  "model": {
    "type": "WordPiece",
    "unk_token": "[UNK]",
    "continuing_subword_prefix": "##",
    "max_input_chars_per_word": 100,
    "vocab": {"[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3, "hello": 4, "world": 5, "!": 6, "wh": 7, "##ats": 8}
  }
}"###;

    fn tiny_tokenizer() -> (tempfile::TempDir, WordPieceTokenizer) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), TINY_BERT_TOKENIZER).unwrap();
        let tok = WordPieceTokenizer::load(dir.path()).unwrap();
        (dir, tok)
    }

    #[test]
    fn test_encode_adds_special_tokens() {
        let (_dir, tok) = tiny_tokenizer();
        let enc = tok.encode("hello world!").unwrap();
        assert_eq!(enc.input_ids, vec![2, 4, 5, 6, 3]);
        assert_eq!(enc.attention_mask, vec![1; 5]);
    }

    #[test]
    fn test_encode_splits_subwords_and_unknowns() {
        let (_dir, tok) = tiny_tokenizer();
        assert_eq!(tok.encode("whats").unwrap().input_ids, vec![2, 7, 8, 3]);
        assert_eq!(tok.encode("zzz").unwrap().input_ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_encode_empty_text() {
        let (_dir, tok) = tiny_tokenizer();
        let enc = tok.encode("").unwrap();
        assert_eq!(enc.input_ids, vec![2, 3]);
        assert_eq!(enc.attention_mask, vec![1, 1]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WordPieceTokenizer::load(dir.path()).is_err());
    }
}
