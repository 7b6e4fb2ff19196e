#![forbid(unsafe_code)]

use crate::bitmap::BitVec;
use crate::value::Value;
use ahash::AHashMap;
use std::borrow::Cow;
use std::ops::Index;

/// A fixed-length columnar container of values.
///
/// All blocks that make up one input batch (selection mask, group-by columns, accumulator
/// inputs) share the same logical length.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    /// Independently stored value per position.
    Array(Vec<Value>),
    /// One value logically repeated `len` times.
    Constant { value: Value, len: usize },
    /// One owned value as a block of length 1, e.g. the token set of a constant block. The value
    /// is copied in, not borrowed from its source.
    Singleton(Value),
    /// Booleans only; the representation used for selection masks.
    Bitmap(BitVec),
}

/// Result of dictionary-encoding one block: the distinct values (in first-seen order) and, for
/// every original position, the index of its token.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenizedBlock {
    pub tokens: Block,
    pub idxs: Vec<u32>,
}

impl TokenizedBlock {
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Randomly indexable values extracted from a block. Borrows from array blocks, materializes
/// the other variants.
#[derive(Clone, Debug)]
pub struct Deblocked<'a>(Cow<'a, [Value]>);

impl<'a> Deblocked<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }
}

impl Index<usize> for Deblocked<'_> {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        &self.0[idx]
    }
}

impl Block {
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Block::Array(values.into_iter().collect())
    }

    pub fn constant(value: Value, len: usize) -> Self {
        Block::Constant { value, len }
    }

    /// A selection mask from plain booleans.
    pub fn bitmap(bits: impl IntoIterator<Item = bool>) -> Self {
        Block::Bitmap(bits.into_iter().collect())
    }

    pub fn all_true(len: usize) -> Self {
        Block::Bitmap(BitVec::with_len_all_true(len))
    }

    pub fn len(&self) -> usize {
        match self {
            Block::Array(values) => values.len(),
            Block::Constant { len, .. } => *len,
            Block::Singleton(_) => 1,
            Block::Bitmap(bits) => bits.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extract(&self) -> Deblocked<'_> {
        match self {
            Block::Array(values) => Deblocked(Cow::Borrowed(values)),
            Block::Constant { value, len } => Deblocked(Cow::Owned(vec![value.clone(); *len])),
            Block::Singleton(value) => Deblocked(Cow::Borrowed(std::slice::from_ref(value))),
            Block::Bitmap(bits) => Deblocked(Cow::Owned(bits.iter().map(Value::Boolean).collect())),
        }
    }

    /// Dictionary-encode this block.
    pub fn tokenize(&self) -> TokenizedBlock {
        match self {
            Block::Array(values) => {
                let mut dictionary: Vec<Value> = Vec::new();
                let mut dict_map: AHashMap<&Value, u32> = AHashMap::new();
                let idxs = values
                    .iter()
                    .map(|v| {
                        *dict_map.entry(v).or_insert_with(|| {
                            dictionary.push(v.clone());
                            (dictionary.len() - 1) as u32
                        })
                    })
                    .collect();
                TokenizedBlock {
                    tokens: Block::Array(dictionary),
                    idxs,
                }
            }
            Block::Constant { value, len } => TokenizedBlock {
                tokens: Block::Singleton(value.clone()),
                idxs: vec![0; *len],
            },
            Block::Singleton(value) => TokenizedBlock {
                tokens: Block::Singleton(value.clone()),
                idxs: vec![0],
            },
            Block::Bitmap(bits) => {
                // At most two tokens; keep first-seen order like the other variants.
                let first = !bits.is_empty() && bits.get(0);
                let mut tokens = vec![Value::Boolean(first)];
                let idxs = bits
                    .iter()
                    .map(|b| {
                        if b == first {
                            0
                        } else {
                            if tokens.len() == 1 {
                                tokens.push(Value::Boolean(b));
                            }
                            1
                        }
                    })
                    .collect();
                if bits.is_empty() {
                    tokens.clear();
                }
                TokenizedBlock {
                    tokens: Block::Array(tokens),
                    idxs,
                }
            }
        }
    }

    /// View this block as a selection mask.
    ///
    /// Panics if any element is not a boolean: a non-boolean mask is a plan bug.
    pub fn to_selection(&self) -> Cow<'_, BitVec> {
        match self {
            Block::Bitmap(bits) => Cow::Borrowed(bits),
            Block::Constant { value, len } => match value {
                Value::Boolean(true) => Cow::Owned(BitVec::with_len_all_true(*len)),
                Value::Boolean(false) => Cow::Owned(BitVec::with_len_all_false(*len)),
                other => panic!("selection mask must hold booleans, got {}", other.type_name()),
            },
            other => Cow::Owned(other.extract().iter().map(selection_bit).collect()),
        }
    }

    /// `true` if no position is selected.
    pub fn all_false(&self) -> bool {
        match self {
            Block::Bitmap(bits) => bits.all_false(),
            other => other.to_selection().all_false(),
        }
    }

    /// Pairwise AND of two selection masks of equal length.
    pub fn bit_and(&self, other: &Block) -> Block {
        assert_eq!(
            self.len(),
            other.len(),
            "selection masks must have the same length"
        );
        let mut out = self.to_selection().into_owned();
        out.and_inplace(&other.to_selection());
        Block::Bitmap(out)
    }

    pub fn approx_size_bytes(&self) -> usize {
        match self {
            Block::Array(values) => values.iter().map(Value::approx_size_bytes).sum(),
            Block::Constant { value, .. } | Block::Singleton(value) => value.approx_size_bytes(),
            Block::Bitmap(bits) => bits.len().div_ceil(8),
        }
    }
}

pub(crate) fn selection_bit(value: &Value) -> bool {
    match value {
        Value::Boolean(b) => *b,
        other => panic!("selection mask must hold booleans, got {}", other.type_name()),
    }
}

impl From<Vec<Value>> for Block {
    fn from(values: Vec<Value>) -> Self {
        Block::Array(values)
    }
}

impl From<BitVec> for Block {
    fn from(bits: BitVec) -> Self {
        Block::Bitmap(bits)
    }
}
