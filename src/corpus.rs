//! Restartable corpus abstraction.
//!
//! Vocabulary construction needs one full pass over the corpus and every
//! training epoch needs another, so the input must be re-iterable. The
//! [`Corpus`] trait iterates through `&self`, which rules out single-use
//! cursors at the type level: an exhausted iterator simply cannot implement
//! it.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use crate::error::Result;

/// A finite, re-iterable sequence of tokenized sentences.
pub trait Corpus {
    /// Starts a fresh pass over the corpus.
    ///
    /// Sentence items are `Result`s so file-backed corpora can surface read
    /// errors mid-pass instead of truncating silently.
    fn sentences(&self) -> Result<Box<dyn Iterator<Item = Result<Vec<String>>> + '_>>;
}

impl Corpus for [Vec<String>] {
    fn sentences(&self) -> Result<Box<dyn Iterator<Item = Result<Vec<String>>> + '_>> {
        Ok(Box::new(self.iter().map(|s| Ok(s.clone()))))
    }
}

impl Corpus for Vec<Vec<String>> {
    fn sentences(&self) -> Result<Box<dyn Iterator<Item = Result<Vec<String>>> + '_>> {
        self.as_slice().sentences()
    }
}

/// A corpus stored in a plain text file: one sentence per line, tokens
/// separated by whitespace. Blank lines are skipped. The file is reopened on
/// every pass.
pub struct LineCorpus {
    path: PathBuf,
}

impl LineCorpus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LineCorpus { path: path.into() }
    }
}

impl Corpus for LineCorpus {
    fn sentences(&self) -> Result<Box<dyn Iterator<Item = Result<Vec<String>>> + '_>> {
        let file = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(file.lines().filter_map(|line| match line {
            Ok(line) => {
                let tokens: Vec<String> =
                    line.split_whitespace().map(str::to_string).collect();
                if tokens.is_empty() {
                    None
                } else {
                    Some(Ok(tokens))
                }
            }
            Err(err) => Some(Err(err.into())),
        })))
    }
}
