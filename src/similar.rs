//! Read-only similarity queries over the normalized vector cache.

use std::cmp::Reverse;
use std::collections::HashSet;

use ordered_float::OrderedFloat;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::real;

pub fn norm(v: &[real]) -> real {
    v.iter().copied().map(|e| e * e).sum::<real>().sqrt()
}

pub fn normalize(v: &mut [real]) {
    let len = norm(v);
    if len > 0.0 {
        for e in v {
            *e /= len;
        }
    }
}

pub fn dot(a: &[real], b: &[real]) -> real {
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

/// A query term: either a vocabulary word or a raw vector.
pub enum Query<'a> {
    Word(&'a str),
    Vector(&'a [real]),
}

impl<'a> From<&'a str> for Query<'a> {
    fn from(word: &'a str) -> Self {
        Query::Word(word)
    }
}

impl<'a> From<&'a [real]> for Query<'a> {
    fn from(vector: &'a [real]) -> Self {
        Query::Vector(vector)
    }
}

impl<'a> From<&'a Vec<real>> for Query<'a> {
    fn from(vector: &'a Vec<real>) -> Self {
        Query::Vector(vector)
    }
}

impl Model {
    /// The unit-normalized vector for a word, from the cache.
    pub fn norm_vector(&self, word: &str) -> Result<Vec<real>> {
        let vocab = self.vocab()?;
        let index = vocab
            .get(word)
            .ok_or_else(|| Error::WordNotFound(word.to_string()))?;
        let size = self.config.size;
        self.with_norms(|rows| rows[index * size..][..size].to_vec())
    }

    /// The `topn` words most similar to the mean of the positive terms minus
    /// the mean of the negative terms, by cosine similarity.
    ///
    /// Words given as input are excluded from the results. Ties are broken
    /// by ascending vocabulary index, so the ordering is stable.
    pub fn most_similar(
        &self,
        positive: &[Query<'_>],
        negative: &[Query<'_>],
        topn: usize,
    ) -> Result<Vec<(String, real)>> {
        let vocab = self.vocab()?;
        let size = self.config.size;
        if positive.is_empty() && negative.is_empty() {
            return Err(Error::Format(
                "cannot compute similarity with no input".to_string(),
            ));
        }

        let mut exclude: HashSet<usize> = HashSet::new();
        let mut resolve = |q: &Query<'_>,
                           rows: &[real],
                           exclude: &mut HashSet<usize>|
         -> Result<Vec<real>> {
            match q {
                Query::Word(word) => {
                    let index = vocab
                        .get(word)
                        .ok_or_else(|| Error::WordNotFound(word.to_string()))?;
                    exclude.insert(index);
                    Ok(rows[index * size..][..size].to_vec())
                }
                Query::Vector(v) => {
                    let mut v = v.to_vec();
                    normalize(&mut v);
                    Ok(v)
                }
            }
        };

        self.with_norms(|rows| -> Result<Vec<(String, real)>> {
            let mut mean = vec![0.0 as real; size];
            for q in positive {
                let v = resolve(q, rows, &mut exclude)?;
                for (m, x) in mean.iter_mut().zip(v.iter()) {
                    *m += x / positive.len() as real;
                }
            }
            for q in negative {
                let v = resolve(q, rows, &mut exclude)?;
                for (m, x) in mean.iter_mut().zip(v.iter()) {
                    *m -= x / negative.len() as real;
                }
            }
            normalize(&mut mean);

            let mut order: Vec<usize> = (0..vocab.len()).collect();
            let scores: Vec<real> = (0..vocab.len())
                .map(|i| dot(&rows[i * size..][..size], &mean))
                .collect();
            order.sort_by_key(|&i| (Reverse(OrderedFloat(scores[i])), i));

            Ok(order
                .into_iter()
                .filter(|i| !exclude.contains(i))
                .take(topn)
                .map(|i| (vocab.word(i).word.clone(), scores[i]))
                .collect())
        })?
    }

    /// `most_similar` with a single positive word.
    pub fn similar_by_word(&self, word: &str, topn: usize) -> Result<Vec<(String, real)>> {
        self.most_similar(&[Query::Word(word)], &[], topn)
    }

    /// `most_similar` with a single positive raw vector.
    pub fn similar_by_vector(
        &self,
        vector: &[real],
        topn: usize,
    ) -> Result<Vec<(String, real)>> {
        self.most_similar(&[Query::Vector(vector)], &[], topn)
    }

    /// Cosine similarity between two words.
    pub fn similarity(&self, a: &str, b: &str) -> Result<real> {
        let mut va = self.vector(a)?;
        let mut vb = self.vector(b)?;
        normalize(&mut va);
        normalize(&mut vb);
        Ok(dot(&va, &vb))
    }

    /// Cosine similarity between the mean vectors of two word sets.
    pub fn n_similarity(&self, a: &[&str], b: &[&str]) -> Result<real> {
        let mut mean = |words: &[&str]| -> Result<Vec<real>> {
            let mut acc = vec![0.0 as real; self.config.size];
            for word in words {
                let v = self.vector(word)?;
                for (m, x) in acc.iter_mut().zip(v.iter()) {
                    *m += x / words.len() as real;
                }
            }
            normalize(&mut acc);
            Ok(acc)
        };
        let va = mean(a)?;
        let vb = mean(b)?;
        Ok(dot(&va, &vb))
    }
}
