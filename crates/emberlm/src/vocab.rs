//! Token strings for rendering generated ids.
//!
//! The file is `vocab` records of a little-endian `u32` length followed by
//! that many raw bytes. Nothing else is stored.

use std::path::Path;

use anyhow::{Context, Result};

use crate::error::EngineError;

pub struct Vocab {
    tokens: Vec<Vec<u8>>,
}

impl Vocab {
    pub fn load(path: &Path, vocab_size: usize) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read vocabulary file {}", path.display()))?;
        let vocab = Self::parse(&bytes, vocab_size).map_err(|reason| EngineError::CorruptFile {
            path: path.to_path_buf(),
            reason,
        })?;
        log::info!("loaded {} tokens from {}", vocab.len(), path.display());
        Ok(vocab)
    }

    fn parse(bytes: &[u8], vocab_size: usize) -> std::result::Result<Self, String> {
        let mut tokens = Vec::with_capacity(vocab_size);
        let mut offset = 0;
        for id in 0..vocab_size {
            let len_bytes = bytes
                .get(offset..offset + 4)
                .ok_or_else(|| format!("truncated length of token {id} at byte {offset}"))?;
            let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
            offset += 4;
            let token = bytes
                .get(offset..offset + len)
                .ok_or_else(|| format!("truncated token {id}: {len} bytes at byte {offset}"))?;
            tokens.push(token.to_vec());
            offset += len;
        }
        if offset != bytes.len() {
            log::warn!(
                "vocabulary has {} trailing bytes after {} tokens",
                bytes.len() - offset,
                vocab_size
            );
        }
        Ok(Self { tokens })
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            tokens: tokens.into_iter().map(|t| t.as_ref().to_vec()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Raw bytes of `id`.
    pub fn token_bytes(&self, id: u32) -> Result<&[u8]> {
        self.tokens
            .get(id as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                EngineError::TokenOutOfRange {
                    token: id,
                    vocab: self.tokens.len(),
                }
                .into()
            })
    }

    /// Printable text of `id`; invalid UTF-8 is replaced.
    pub fn token(&self, id: u32) -> Result<String> {
        Ok(String::from_utf8_lossy(self.token_bytes(id)?).into_owned())
    }
}
