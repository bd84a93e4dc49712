//! Persistence: the word2vec-compatible vector file format and the
//! full-model container.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::RwLock;

use aligned_box::AlignedBox;
use half::f16;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{build_exp_table, placeholder, Model, ModelConfig, NormCache, Real};
use crate::real;
use crate::vocab::{VocabWord, Vocabulary};

/// On-disk width of each vector component in the binary format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    F32,
    F16,
}

impl Precision {
    fn width(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 => 2,
        }
    }
}

fn matrix_to_vec(m: &[Real]) -> Vec<real> {
    m.iter().map(Real::get).collect()
}

fn matrix_from_slice(data: &[real]) -> AlignedBox<[Real]> {
    let m: AlignedBox<[Real]> =
        AlignedBox::slice_from_default(128, data.len()).expect("memory allocation failed");
    for (cell, &x) in m.iter().zip(data.iter()) {
        cell.set(x);
    }
    m
}

/// Reads one token from a binary vector file: bytes up to a space, with any
/// leftover newline from the previous row stripped.
fn read_token(f: &mut impl BufRead) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    let n = f.read_until(b' ', &mut bytes)?;
    if n == 0 {
        return Ok(None);
    }
    if bytes.last() == Some(&b' ') {
        bytes.pop();
    }
    bytes.retain(|&c| c != b'\n');
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| Error::Format("invalid UTF-8 word in vector file".to_string()))
}

impl Model {
    /// Saves the input vectors in the reference word-vector format: a
    /// `<vocab_size> <dimension>` header, then one row per word in frequency
    /// order. If `vocab_path` is given, a `word count` sidecar file is
    /// written beside the vectors.
    pub fn save_word2vec_format(
        &self,
        path: &Path,
        vocab_path: Option<&Path>,
        binary: bool,
        precision: Precision,
    ) -> Result<()> {
        let vocab = self.vocab()?;
        let size = self.config.size;
        let mut out = BufWriter::new(File::create(path)?);

        writeln!(out, "{} {}", vocab.len(), size)?;
        for i in 0..vocab.len() {
            let row = self.input_row(i);
            write!(out, "{} ", vocab.word(i).word)?;
            if binary {
                match precision {
                    Precision::F32 => {
                        out.write_all(bytemuck::cast_slice::<real, u8>(&row))?;
                    }
                    Precision::F16 => {
                        for &x in &row {
                            out.write_all(&f16::from_f32(x).to_bits().to_le_bytes())?;
                        }
                    }
                }
                writeln!(out)?;
            } else {
                for &x in &row {
                    write!(out, "{x} ")?;
                }
                writeln!(out)?;
            }
        }
        out.flush()?;

        if let Some(vocab_path) = vocab_path {
            let mut vout = BufWriter::new(File::create(vocab_path)?);
            for vw in vocab.iter() {
                writeln!(vout, "{} {}", vw.word, vw.count)?;
            }
            vout.flush()?;
        }
        Ok(())
    }

    /// Loads vectors saved by [`Model::save_word2vec_format`] (or the
    /// original C tool) into a query-only model.
    ///
    /// `limit` keeps only the first N rows (file order is frequency order).
    /// `precision` names the on-disk component width; vectors are always
    /// `f32` in memory. Word counts are recovered from the optional sidecar
    /// vocabulary file; without one, descending pseudo-counts keep the
    /// frequency-sorted invariant. Fails with [`Error::UnexpectedEof`] when
    /// the file ends before the header's declared row count.
    pub fn load_word2vec_format(
        path: &Path,
        vocab_path: Option<&Path>,
        binary: bool,
        limit: Option<usize>,
        precision: Precision,
    ) -> Result<Model> {
        let mut f = BufReader::new(File::open(path)?);
        let mut header = String::new();
        f.read_line(&mut header)?;
        let mut fields = header.split_whitespace();
        let declared: usize = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Format("invalid vector file header".to_string()))?;
        let size: usize = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Format("invalid vector file header".to_string()))?;

        let counts: Option<HashMap<String, u64>> = match vocab_path {
            Some(p) => Some(read_vocab_file(p)?),
            None => None,
        };

        let rows_to_read = limit.map_or(declared, |l| l.min(declared));
        let mut words: Vec<VocabWord> = Vec::with_capacity(rows_to_read);
        let mut data: Vec<real> = vec![0.0; rows_to_read * size];

        for i in 0..rows_to_read {
            let eof = |found: usize| Error::UnexpectedEof {
                expected: declared,
                found,
            };
            let row = &mut data[i * size..][..size];
            let word;
            if binary {
                word = read_token(&mut f)?.ok_or_else(|| eof(i))?;
                match precision {
                    Precision::F32 => {
                        f.read_exact(bytemuck::cast_slice_mut::<real, u8>(row))
                            .map_err(|e| match e.kind() {
                                ErrorKind::UnexpectedEof => eof(i),
                                _ => Error::Io(e),
                            })?;
                    }
                    Precision::F16 => {
                        let mut raw = vec![0u8; size * precision.width()];
                        f.read_exact(&mut raw).map_err(|e| match e.kind() {
                            ErrorKind::UnexpectedEof => eof(i),
                            _ => Error::Io(e),
                        })?;
                        for (cell, pair) in row.iter_mut().zip(raw.chunks_exact(2)) {
                            *cell = f16::from_bits(u16::from_le_bytes([pair[0], pair[1]]))
                                .to_f32();
                        }
                    }
                }
            } else {
                let mut line = String::new();
                if f.read_line(&mut line)? == 0 {
                    return Err(eof(i));
                }
                let mut parts = line.split_whitespace();
                word = parts
                    .next()
                    .ok_or_else(|| Error::Format(format!("empty row {i} in vector file")))?
                    .to_string();
                for (d, cell) in row.iter_mut().enumerate() {
                    let text = parts.next().ok_or_else(|| {
                        Error::Format(format!("row {i} has fewer than {size} values"))
                    })?;
                    *cell = text.parse::<real>().map_err(|_| {
                        Error::Format(format!("bad float in row {i}, column {d}"))
                    })?;
                    if precision == Precision::F16 {
                        *cell = f16::from_f32(*cell).to_f32();
                    }
                }
            }

            let count = match &counts {
                Some(map) => map.get(&word).copied().unwrap_or(0),
                // File order is frequency order; synthesize descending
                // counts so sorting invariants keep holding.
                None => (rows_to_read - i) as u64,
            };
            words.push(VocabWord {
                word,
                count,
                code: Vec::new(),
                point: Vec::new(),
            });
        }

        info!(rows = words.len(), size, "loaded word2vec-format vectors");
        let config = ModelConfig {
            size,
            hs: false,
            negative: 0,
            ..ModelConfig::default()
        };
        let vocab_len = words.len();
        let mut model = Model::new(config);
        model.vocab = Some(Vocabulary::from_entries(words));
        model.syn0 = matrix_from_slice(&data);
        model.syn0_lockf = vec![1.0; vocab_len];
        Ok(model)
    }
}

/// Reads a `word count` sidecar vocabulary file.
fn read_vocab_file(path: &Path) -> Result<HashMap<String, u64>> {
    let f = BufReader::new(File::open(path)?);
    let mut counts = HashMap::new();
    for (line_num, line) in f.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(Error::Format(format!(
                "vocabulary file syntax error on line {}",
                line_num + 1
            )));
        }
        let count = fields[1].parse::<u64>().map_err(|_| {
            Error::Format(format!(
                "unrecognized frequency number on line {}",
                line_num + 1
            ))
        })?;
        counts.insert(fields[0].to_string(), count);
    }
    Ok(counts)
}

/// The self-describing full-model container, serialized with bincode.
/// Matrices above the spill threshold live in raw sibling files instead.
/// The normalized cache is never part of it.
#[derive(Serialize, Deserialize)]
struct Container {
    config: ModelConfig,
    vocab: Option<Vocabulary>,
    syn0_lockf: Vec<real>,
    matrices: Vec<MatrixRecord>,
}

#[derive(Serialize, Deserialize)]
enum MatrixRecord {
    Inline { name: String, data: Vec<real> },
    Spilled { name: String, len: usize },
}

fn spill_path(path: &Path, name: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{name}.vec"));
    PathBuf::from(os)
}

impl Model {
    /// Saves the whole model: vocabulary with codes and counts, all present
    /// parameter matrices, the lock mask, and the hyperparameters.
    ///
    /// A matrix whose raw size exceeds `sep_limit` bytes is spilled to a raw
    /// little-endian `f32` sibling file `<path>.<name>.vec` next to the main
    /// container.
    pub fn save(&self, path: &Path, sep_limit: Option<u64>) -> Result<()> {
        let mut matrices = Vec::new();
        for (name, m) in [
            ("syn0", &self.syn0),
            ("syn1", &self.syn1),
            ("syn1neg", &self.syn1neg),
        ] {
            let data = matrix_to_vec(m);
            let bytes = (data.len() * std::mem::size_of::<real>()) as u64;
            let record = match sep_limit {
                Some(limit) if bytes > limit => {
                    let spill = spill_path(path, name);
                    let mut out = BufWriter::new(File::create(&spill)?);
                    out.write_all(bytemuck::cast_slice::<real, u8>(&data))?;
                    out.flush()?;
                    info!(name, bytes, file = %spill.display(), "spilled matrix");
                    MatrixRecord::Spilled {
                        name: name.to_string(),
                        len: data.len(),
                    }
                }
                _ => MatrixRecord::Inline {
                    name: name.to_string(),
                    data,
                },
            };
            matrices.push(record);
        }

        let container = Container {
            config: self.config.clone(),
            vocab: self.vocab.clone(),
            syn0_lockf: self.syn0_lockf.clone(),
            matrices,
        };
        let out = BufWriter::new(File::create(path)?);
        bincode::serialize_into(out, &container)?;
        Ok(())
    }

    /// Loads a model saved with [`Model::save`]. Spilled matrices are read
    /// back from their sibling files, memory-mapped (read-only, shared) when
    /// `mmap` is set. The normalized cache is always absent after a load.
    pub fn load(path: &Path, mmap: bool) -> Result<Model> {
        let f = BufReader::new(File::open(path)?);
        let container: Container = bincode::deserialize_from(f)?;

        let mut model = Model {
            config: container.config,
            vocab: container.vocab,
            syn0: placeholder(),
            syn1: placeholder(),
            syn1neg: placeholder(),
            syn0_lockf: container.syn0_lockf,
            exp_table: build_exp_table(),
            unigram_table: Vec::new(),
            generation: AtomicU64::new(0),
            norms: RwLock::new(NormCache::Absent),
            last_end_alpha: None,
        };

        for record in container.matrices {
            let (name, m) = match record {
                MatrixRecord::Inline { name, data } => (name, matrix_from_slice(&data)),
                MatrixRecord::Spilled { name, len } => {
                    let spill = spill_path(path, &name);
                    let data = if mmap {
                        let file = File::open(&spill)?;
                        // Safety: the mapping is read-only and fully consumed
                        // before it is dropped.
                        let map = unsafe { memmap2::Mmap::map(&file)? };
                        let floats: &[real] =
                            bytemuck::try_cast_slice(&map).map_err(|_| {
                                Error::Format(format!(
                                    "spilled matrix file {} is not a whole number \
                                     of f32 values",
                                    spill.display()
                                ))
                            })?;
                        matrix_from_slice(floats)
                    } else {
                        let mut floats = vec![0.0 as real; len];
                        File::open(&spill)?
                            .read_exact(bytemuck::cast_slice_mut::<real, u8>(&mut floats))?;
                        matrix_from_slice(&floats)
                    };
                    if data.len() != len {
                        return Err(Error::Format(format!(
                            "spilled matrix {name} has {} values, expected {len}",
                            data.len()
                        )));
                    }
                    (name, data)
                }
            };
            match name.as_str() {
                "syn0" => model.syn0 = m,
                "syn1" => model.syn1 = m,
                "syn1neg" => model.syn1neg = m,
                other => {
                    return Err(Error::Format(format!("unknown matrix record {other:?}")))
                }
            }
        }

        if model.config.negative > 0 && model.vocab.is_some() {
            model.rebuild_unigram_table();
        }
        Ok(model)
    }
}
