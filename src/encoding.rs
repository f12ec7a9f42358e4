//! One-hot encoding of MIDS strings into fixed-width `u8` tensors.
//!
//! Every sequence is prefixed with the scheme marker, right-padded to the
//! encoder's minimum length and mapped through a single alphabet, so all
//! tensors produced by one encoder share their symbol width.

use std::collections::BTreeSet;

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView3, Axis};
use rayon::prelude::*;

use crate::errors::PipelineError;

/// Per-base MIDS vocabulary: match, insertion, deletion, substitution, padding.
pub const MIDS_SYMBOLS: &str = "MIDS=";
/// Marker prepended to every sequence before encoding.
pub const SCHEME_MARKER: &str = "MIDS=";
/// Symbol used to right-pad sequences shorter than the encoder minimum.
pub const PAD_SYMBOL: char = '=';

/// Ordered symbol table; a symbol's code is its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet {
    symbols: Vec<u8>,
    codes: [Option<u8>; 256],
}

impl Alphabet {
    pub fn new(symbols: &str) -> Result<Self> {
        if !symbols.is_ascii() {
            return Err(PipelineError::Configuration(format!(
                "alphabet {:?} must be ASCII",
                symbols
            ))
            .into());
        }
        if symbols.is_empty() {
            return Err(PipelineError::Configuration("alphabet is empty".into()).into());
        }
        let mut seen = [false; 256];
        for &symbol in symbols.as_bytes() {
            if std::mem::replace(&mut seen[symbol as usize], true) {
                return Err(PipelineError::Configuration(format!(
                    "alphabet {:?} repeats symbol {:?}",
                    symbols, symbol as char
                ))
                .into());
            }
        }
        Ok(Self::from_unique(symbols.as_bytes()))
    }

    fn from_unique(symbols: &[u8]) -> Self {
        let mut codes = [None; 256];
        for (code, &symbol) in symbols.iter().enumerate() {
            codes[symbol as usize] = Some(code as u8);
        }
        Self {
            symbols: symbols.to_vec(),
            codes,
        }
    }

    pub fn mids() -> Self {
        Self::from_unique(MIDS_SYMBOLS.as_bytes())
    }

    /// Sorted union of every symbol in `seqs` plus `extra`.
    pub fn observed<'a, I>(seqs: I, extra: &str) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: BTreeSet<char> = extra.chars().collect();
        for seq in seqs {
            seen.extend(seq.chars());
        }
        let symbols: String = seen.into_iter().collect();
        Self::new(&symbols)
    }

    pub fn width(&self) -> usize {
        self.symbols.len()
    }

    pub fn code(&self, symbol: u8) -> Option<u8> {
        self.codes[symbol as usize]
    }

    /// Code of a character; anything outside ASCII has none.
    pub fn char_code(&self, symbol: char) -> Option<u8> {
        if symbol.is_ascii() {
            self.code(symbol as u8)
        } else {
            None
        }
    }

    pub fn symbol(&self, code: u8) -> Option<char> {
        self.symbols.get(code as usize).map(|&s| s as char)
    }

    pub fn symbols(&self) -> &[u8] {
        &self.symbols
    }
}

#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    alphabet: Alphabet,
    marker: String,
    pad: u8,
    min_length: usize,
}

impl SequenceEncoder {
    pub fn new(alphabet: Alphabet) -> Result<Self> {
        let encoder = Self {
            alphabet,
            marker: SCHEME_MARKER.to_string(),
            pad: PAD_SYMBOL as u8,
            min_length: 0,
        };
        if encoder.alphabet.code(encoder.pad).is_none() {
            return Err(PipelineError::Configuration(format!(
                "padding symbol {:?} is not in the alphabet",
                PAD_SYMBOL
            ))
            .into());
        }
        if let Some(bad) = encoder.marker.bytes().find(|&b| encoder.alphabet.code(b).is_none()) {
            return Err(PipelineError::Configuration(format!(
                "scheme marker symbol {:?} is not in the alphabet",
                bad as char
            ))
            .into());
        }
        Ok(encoder)
    }

    /// Sequences encoding to fewer symbols than this are right-padded.
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// Encoded length of a raw sequence of `raw_len` symbols.
    pub fn encoded_length(&self, raw_len: usize) -> usize {
        (self.marker.len() + raw_len).max(self.min_length)
    }

    /// Integer codes, shape `(N, L')`.
    pub fn label_encode<S: AsRef<str> + Sync>(&self, seqs: &[S]) -> Result<Array2<u8>> {
        let raw_len = common_length(seqs)?;
        let length = self.encoded_length(raw_len);
        let pad_code = self.pad_code();

        let mut codes = vec![pad_code; seqs.len() * length];
        codes
            .par_chunks_mut(length.max(1))
            .zip(seqs.par_iter())
            .enumerate()
            .try_for_each(|(index, (row, seq))| -> Result<(), PipelineError> {
                let symbols = self.marker.chars().chain(seq.as_ref().chars());
                for (position, (slot, symbol)) in row.iter_mut().zip(symbols).enumerate() {
                    *slot = self.alphabet.char_code(symbol).ok_or(PipelineError::UnknownSymbol {
                        sequence: index,
                        position,
                        symbol,
                    })?;
                }
                Ok(())
            })?;

        Ok(Array2::from_shape_vec((seqs.len(), length), codes)?)
    }

    /// One-hot tensor, shape `(N, L', A)`.
    pub fn encode<S: AsRef<str> + Sync>(&self, seqs: &[S]) -> Result<Array3<u8>> {
        let codes = self.label_encode(seqs)?;
        Ok(one_hot(&codes, self.alphabet.width()))
    }

    fn pad_code(&self) -> u8 {
        self.alphabet.code(self.pad).unwrap_or_default()
    }
}

/// Shared symbol count of `seqs` before marker and padding.
pub fn common_length<S: AsRef<str>>(seqs: &[S]) -> Result<usize> {
    let Some(first) = seqs.first() else {
        return Ok(0);
    };
    let expected = first.as_ref().chars().count();
    if let Some((index, length)) = seqs
        .iter()
        .map(|s| s.as_ref().chars().count())
        .enumerate()
        .find(|&(_, length)| length != expected)
    {
        return Err(PipelineError::ShapeMismatch(format!(
            "sequence {} has length {}, expected {}",
            index, length, expected
        ))
        .into());
    }
    Ok(expected)
}

/// Padding hides length differences below the encoder minimum, so raw
/// read lengths are compared before encoding.
pub fn ensure_same_read_length(training: usize, inference: usize) -> Result<()> {
    if training != inference {
        return Err(PipelineError::ShapeMismatch(format!(
            "simulated reads have {} symbols but real reads have {}",
            training, inference
        ))
        .into());
    }
    Ok(())
}

pub fn one_hot(codes: &Array2<u8>, width: usize) -> Array3<u8> {
    let (n, length) = codes.dim();
    let mut tensor = Array3::<u8>::zeros((n, length, width));
    for ((i, j), &code) in codes.indexed_iter() {
        tensor[[i, j, code as usize]] = 1;
    }
    tensor
}

/// Arg-max over the symbol axis, recovering per-position codes.
pub fn decode_one_hot(tensor: ArrayView3<u8>) -> Array2<u8> {
    tensor.map_axis(Axis(2), |symbols| {
        symbols
            .iter()
            .enumerate()
            .max_by_key(|&(code, &v)| (v, std::cmp::Reverse(code)))
            .map_or(0, |(code, _)| code as u8)
    })
}

/// Checks that two tensors agree on sequence length and symbol width.
pub fn ensure_same_width(expected: ArrayView3<u8>, actual: ArrayView3<u8>) -> Result<()> {
    let (_, l1, a1) = expected.dim();
    let (_, l2, a2) = actual.dim();
    if (l1, a1) != (l2, a2) {
        return Err(PipelineError::ShapeMismatch(format!(
            "training tensor is {}x{} per read but inference tensor is {}x{}",
            l1, a1, l2, a2
        ))
        .into());
    }
    Ok(())
}
