//! Vocabulary construction and Huffman coding.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::corpus::Corpus;
use crate::error::{Error, Result};

/// Outcome of a per-token pruning callback.
///
/// `Default` defers to the `min_count` threshold; the other two variants
/// override it in either direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrimRule {
    Keep,
    Discard,
    Default,
}

/// One vocabulary entry. The entry's position in [`Vocabulary`] is its index,
/// which is the row key into all parameter matrices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VocabWord {
    pub word: String,
    pub count: u64,
    /// Huffman bits from root to leaf. Empty unless hierarchical softmax is
    /// configured.
    pub code: Vec<u8>,
    /// Rows of the hs-output matrix along the root-to-leaf path, parallel to
    /// `code`.
    pub point: Vec<u32>,
}

/// The finalized vocabulary: entries sorted by descending count (ties in
/// first-seen order), plus the token-to-index map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Vocabulary {
    words: Vec<VocabWord>,
    index: HashMap<String, usize>,
    /// Sum of the counts of all kept words.
    pub train_words: u64,
}

impl Vocabulary {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns the index of a word, or `None` if it was pruned or never seen.
    pub fn get(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.index.contains_key(word)
    }

    /// The entry at `index`. Panics if out of range.
    pub fn word(&self, index: usize) -> &VocabWord {
        &self.words[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &VocabWord> {
        self.words.iter()
    }

    /// Assembles a vocabulary from entries already in index order, as when
    /// loading a vector file whose rows are in frequency order.
    pub(crate) fn from_entries(words: Vec<VocabWord>) -> Vocabulary {
        let mut index = HashMap::with_capacity(words.len());
        let mut train_words = 0;
        for (i, vw) in words.iter().enumerate() {
            index.insert(vw.word.clone(), i);
            train_words += vw.count;
        }
        Vocabulary {
            words,
            index,
            train_words,
        }
    }

    /// Builds a vocabulary in a single counting pass over the corpus.
    ///
    /// When `max_vocab_size` is set, the in-progress table is pruned whenever
    /// it overflows, discarding entries at or below a floor that rises by one
    /// on each sweep. This bounds memory on huge corpora at the cost of
    /// approximate counts for rare words.
    pub fn build<C, R>(
        corpus: &C,
        min_count: u64,
        max_vocab_size: Option<usize>,
        trim_rule: R,
    ) -> Result<Vocabulary>
    where
        C: Corpus + ?Sized,
        R: Fn(&str, u64, u64) -> TrimRule,
    {
        let mut words: Vec<VocabWord> = Vec::with_capacity(1000);
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut min_reduce: u64 = 1;
        let mut warned_shape = false;

        for sentence in corpus.sentences()? {
            let sentence = sentence?;
            if !warned_shape
                && sentence.len() > 1
                && sentence.iter().all(|t| t.chars().count() == 1)
            {
                // A sentence of single characters usually means a bare string
                // was fed where a sequence of tokens was expected.
                warn!(
                    len = sentence.len(),
                    "sentence consists entirely of single-character tokens; \
                     each corpus item should be a list of words"
                );
                warned_shape = true;
            }

            for token in sentence {
                match index.get(&token) {
                    Some(&i) => words[i].count += 1,
                    None => {
                        index.insert(token.clone(), words.len());
                        words.push(VocabWord {
                            word: token,
                            count: 1,
                            code: Vec::new(),
                            point: Vec::new(),
                        });
                    }
                }
            }

            if let Some(cap) = max_vocab_size {
                while words.len() > cap {
                    let before = words.len();
                    words.retain(|vw| vw.count > min_reduce);
                    index.clear();
                    for (i, vw) in words.iter().enumerate() {
                        index.insert(vw.word.clone(), i);
                    }
                    warn!(
                        floor = min_reduce,
                        pruned = before - words.len(),
                        remaining = words.len(),
                        "pruned in-progress vocabulary to bound memory"
                    );
                    min_reduce += 1;
                }
            }
        }

        // Apply the trim rule, then sort survivors by descending count.
        // The sort is stable, so equal counts keep first-seen order.
        let mut kept: Vec<VocabWord> = words
            .into_iter()
            .filter(|vw| match trim_rule(&vw.word, vw.count, min_count) {
                TrimRule::Keep => true,
                TrimRule::Discard => false,
                TrimRule::Default => vw.count >= min_count,
            })
            .collect();
        kept.sort_by_key(|vw| Reverse(vw.count));

        if kept.is_empty() {
            return Err(Error::EmptyVocab);
        }

        let mut index = HashMap::with_capacity(kept.len());
        let mut train_words = 0;
        for (i, vw) in kept.iter().enumerate() {
            index.insert(vw.word.clone(), i);
            train_words += vw.count;
        }

        Ok(Vocabulary {
            words: kept,
            index,
            train_words,
        })
    }

    /// Creates the binary Huffman tree from the word counts and assigns each
    /// entry its bit code and path of internal-node indices. Frequent words
    /// get short codes.
    ///
    /// Internal nodes are numbered `vocab_size..2*vocab_size-2`, so the
    /// hs-output matrix needs `vocab_size - 1` rows. Ties between equal
    /// counts break on node creation order, keeping codes reproducible for a
    /// given input order.
    pub fn assign_huffman_codes(&mut self) {
        let n = self.words.len();
        if n < 2 {
            for vw in &mut self.words {
                vw.code = Vec::new();
                vw.point = Vec::new();
            }
            return;
        }

        let mut count = vec![0u64; 2 * n - 1];
        let mut bit = vec![0u8; 2 * n - 1];
        let mut parent = vec![0usize; 2 * n - 1];

        // Min-heap over (count, node id); node ids rise in creation order,
        // which makes the tiebreak deterministic.
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(2 * n);
        for (i, vw) in self.words.iter().enumerate() {
            count[i] = vw.count;
            heap.push(Reverse((vw.count, i)));
        }

        for a in 0..n - 1 {
            let Reverse((c1, min1)) = heap.pop().expect("heap underflow");
            let Reverse((c2, min2)) = heap.pop().expect("heap underflow");
            let node = n + a;
            count[node] = c1 + c2;
            parent[min1] = node;
            parent[min2] = node;
            bit[min2] = 1;
            heap.push(Reverse((count[node], node)));
        }

        let root = 2 * n - 2;
        for a in 0..n {
            let mut code: Vec<u8> = Vec::new();
            let mut point: Vec<u32> = Vec::new();
            let mut b = a;
            loop {
                if !code.is_empty() {
                    point.push((b - n) as u32);
                }
                code.push(bit[b]);
                b = parent[b];
                if b == root {
                    break;
                }
            }
            code.reverse();
            point.push((n - 2) as u32);
            point.reverse();
            self.words[a].code = code;
            self.words[a].point = point;
        }
    }
}
