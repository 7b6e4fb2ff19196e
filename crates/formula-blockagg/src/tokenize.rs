#![forbid(unsafe_code)]

//! Compound-key tokenization of group-by columns.
//!
//! Each group-by column is dictionary-encoded independently. The per-column token indices of a
//! row form its compound key; distinct compound keys become partitions, numbered in first-seen
//! order. Compound keys live in one row-major index buffer and the dedup table stores only the
//! row that first produced a key, so hashing and equality work on index ranges of that buffer.

use crate::block::{Block, Deblocked, TokenizedBlock};
use crate::value::MaterializedRow;
use ahash::RandomState;
use hashbrown::HashTable;
use std::borrow::Borrow;

/// The distinct group-by keys of one batch and the partition each row belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenizedKeys {
    /// One materialized key per partition, indexed by partition ordinal.
    pub keys: Vec<MaterializedRow>,
    /// Partition ordinal of every row.
    pub idxs: Vec<usize>,
}

impl TokenizedKeys {
    pub fn partition_count(&self) -> usize {
        self.keys.len()
    }
}

#[derive(Clone, Copy, Debug)]
struct PartitionSlot {
    first_row: usize,
    ordinal: usize,
}

/// Try to tokenize the group-by columns of one batch of `row_count` rows.
///
/// Returns `None` when the batch holds more than `max_partitions` distinct keys; callers then
/// fall back to row-at-a-time accumulation. Panics if a column's length differs from
/// `row_count`.
pub fn tokenize_group_by<B: Borrow<Block>>(
    group_by: &[B],
    row_count: usize,
    max_partitions: usize,
) -> Option<TokenizedKeys> {
    if group_by.is_empty() {
        // No group-by columns: every row shares the empty key.
        if row_count > 0 && max_partitions == 0 {
            return None;
        }
        let keys = if row_count == 0 {
            Vec::new()
        } else {
            vec![MaterializedRow::new(0)]
        };
        return Some(TokenizedKeys {
            keys,
            idxs: vec![0; row_count],
        });
    }

    let mut token_infos: Vec<TokenizedBlock> = Vec::with_capacity(group_by.len());
    for block in group_by {
        let info = block.borrow().tokenize();
        assert_eq!(
            info.idxs.len(),
            row_count,
            "all input blocks must be the same size"
        );
        // The compound key count is at least any single column's token count.
        if info.token_count() > max_partitions {
            return None;
        }
        token_infos.push(info);
    }
    let deblocked_tokens: Vec<Deblocked<'_>> =
        token_infos.iter().map(|t| t.tokens.extract()).collect();

    let width = token_infos.len();
    let mut compound_keys = vec![0u32; row_count * width];
    for (col, info) in token_infos.iter().enumerate() {
        for (row, &idx) in info.idxs.iter().enumerate() {
            compound_keys[row * width + col] = idx;
        }
    }

    let key_at = |row: usize| &compound_keys[row * width..(row + 1) * width];
    let state = RandomState::new();
    let mut key_table: HashTable<PartitionSlot> = HashTable::new();
    let mut keys: Vec<MaterializedRow> = Vec::new();
    let mut idxs = vec![0usize; row_count];

    for (row, partition) in idxs.iter_mut().enumerate() {
        let key = key_at(row);
        let hash = state.hash_one(key);
        if let Some(slot) = key_table.find(hash, |slot| key_at(slot.first_row) == key) {
            *partition = slot.ordinal;
            continue;
        }

        let ordinal = keys.len();
        if ordinal + 1 > max_partitions {
            return None;
        }
        key_table.insert_unique(
            hash,
            PartitionSlot {
                first_row: row,
                ordinal,
            },
            |slot| state.hash_one(key_at(slot.first_row)),
        );
        keys.push(MaterializedRow::from_values(
            key.iter()
                .zip(&deblocked_tokens)
                .map(|(&token, tokens)| tokens[token as usize].clone()),
        ));
        *partition = ordinal;
    }

    Some(TokenizedKeys { keys, idxs })
}

/// Selection mask for the rows of `partition`.
pub fn partition_bitmap(idxs: &[usize], partition: usize) -> Block {
    Block::bitmap(idxs.iter().map(|&p| p == partition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn strings(values: &[&str]) -> Block {
        Block::from_values(values.iter().map(|s| Value::string(s)))
    }

    #[test]
    fn compound_keys_are_numbered_in_first_seen_order() {
        let a = strings(&["x", "y", "x", "x"]);
        let b = Block::from_values([1, 1, 1, 2].map(Value::Int));
        let tokenized = tokenize_group_by(&[a, b], 4, 5).unwrap();

        assert_eq!(tokenized.idxs, vec![0, 1, 0, 2]);
        assert_eq!(
            tokenized.keys,
            vec![
                MaterializedRow::from(vec![Value::string("x"), Value::Int(1)]),
                MaterializedRow::from(vec![Value::string("y"), Value::Int(1)]),
                MaterializedRow::from(vec![Value::string("x"), Value::Int(2)]),
            ]
        );
    }

    #[test]
    fn ceiling_is_inclusive() {
        let block = Block::from_values((0..5).map(Value::Int));
        assert_eq!(
            tokenize_group_by(std::slice::from_ref(&block), 5, 5)
                .unwrap()
                .partition_count(),
            5
        );
        assert!(tokenize_group_by(&[block], 5, 4).is_none());
    }

    #[test]
    fn compound_ceiling_counts_combinations() {
        // Each column has 2 tokens but the pair has 4 distinct combinations.
        let a = Block::from_values([0, 0, 1, 1].map(Value::Int));
        let b = Block::from_values([0, 1, 0, 1].map(Value::Int));
        assert!(tokenize_group_by(&[a.clone(), b.clone()], 4, 3).is_none());
        assert_eq!(tokenize_group_by(&[a, b], 4, 4).unwrap().partition_count(), 4);
    }

    #[test]
    fn constant_columns_tokenize_to_one_partition() {
        let block = Block::constant(Value::string("k"), 3);
        let tokenized = tokenize_group_by(&[block], 3, 1).unwrap();
        assert_eq!(tokenized.idxs, vec![0, 0, 0]);
        assert_eq!(tokenized.keys[0], MaterializedRow::from(vec![Value::string("k")]));
    }

    #[test]
    #[should_panic(expected = "all input blocks must be the same size")]
    fn mismatched_lengths_are_fatal() {
        tokenize_group_by(&[strings(&["a"])], 2, 5);
    }

    #[test]
    fn partition_bitmap_selects_members() {
        assert_eq!(
            partition_bitmap(&[0, 1, 0, 2], 0),
            Block::bitmap([true, false, true, false])
        );
    }
}
