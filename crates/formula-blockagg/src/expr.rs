#![forbid(unsafe_code)]

//! The contract between the operator and compiled accumulator logic.
//!
//! Accumulators are opaque callables: the operator binds named inputs (selection bitset, data
//! inputs, the previous accumulator state, a recovered spilled partial) into an [`EvalEnv`] and
//! gets back a possibly-borrowed value. `Cow::Borrowed` means the result aliases one of the
//! bound inputs; the operator copies it before storing it.

use crate::block::Block;
use crate::error::AggResult;
use crate::value::Value;
use std::borrow::Cow;
use std::fmt;

pub type SlotId = u32;

/// One bound accumulator data input: a whole block for block-level evaluation, or a single
/// row's value for row-level evaluation.
#[derive(Clone, Copy, Debug)]
pub enum DataInput<'a> {
    Block(&'a Block),
    Scalar(&'a Value),
}

/// Inputs bound for a single evaluation.
#[derive(Clone, Copy, Debug)]
pub struct EvalEnv<'a> {
    /// Active selection for block-level accumulators.
    pub bitset: Option<&'a Block>,
    pub data: &'a [DataInput<'a>],
    /// Previous accumulator state; `Nothing` when the slot is fresh.
    pub accumulator: &'a Value,
    /// Partial aggregate recovered from the spill log, for merging expressions.
    pub spilled: Option<&'a Value>,
}

impl<'a> EvalEnv<'a> {
    pub fn data(&self, idx: usize) -> AggResult<DataInput<'a>> {
        self.data.get(idx).copied().ok_or_else(|| {
            crate::AggError::Expression(format!(
                "data input {idx} is not bound ({} inputs)",
                self.data.len()
            ))
        })
    }
}

pub trait AggExpr: fmt::Debug + Send + Sync {
    fn eval<'a>(&self, env: &EvalEnv<'a>) -> AggResult<Cow<'a, Value>>;

    /// Human-readable form used in plan summaries.
    fn debug_print(&self) -> String;

    fn box_clone(&self) -> Box<dyn AggExpr>;
}

impl Clone for Box<dyn AggExpr> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// The block-level and row-level forms of one accumulator. Both must reduce the same logical
/// rows to the same value.
#[derive(Clone, Debug)]
pub struct BlockRowAccumulators {
    pub block_agg: Box<dyn AggExpr>,
    pub row_agg: Box<dyn AggExpr>,
}

/// Storage an accumulator's previous state is read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccumulatorSlot {
    /// The group table entry being updated (accumulation phase).
    #[default]
    TableResident,
    /// The merge reader's scratch row (spill recovery phase).
    Scratch,
}

/// Selects between table-resident and scratch accumulator state.
///
/// Accumulation selects [`AccumulatorSlot::TableResident`] and updates group table entries in
/// place; spill recovery selects [`AccumulatorSlot::Scratch`] and folds partials into the
/// merge reader's scratch row.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccumulatorSwitch {
    selected: AccumulatorSlot,
}

impl AccumulatorSwitch {
    pub fn new(slot: AccumulatorSlot) -> Self {
        Self { selected: slot }
    }

    /// Evaluate one expression per accumulator against the selected storage and write each
    /// result back in place. `spilled`, when bound, supplies the recovered partial for
    /// accumulator `idx` as `spilled[idx]`.
    pub fn update<'e>(
        &self,
        table_entry: &mut [Value],
        scratch: &mut [Value],
        exprs: impl Iterator<Item = &'e Box<dyn AggExpr>>,
        bitset: Option<&Block>,
        data: &[DataInput<'_>],
        spilled: Option<&[Value]>,
    ) -> AggResult<()> {
        let state = match self.selected {
            AccumulatorSlot::TableResident => table_entry,
            AccumulatorSlot::Scratch => scratch,
        };
        for (idx, expr) in exprs.enumerate() {
            let next = {
                let env = EvalEnv {
                    bitset,
                    data,
                    accumulator: &state[idx],
                    spilled: spilled.map(|partial| &partial[idx]),
                };
                expr.eval(&env)?.into_owned()
            };
            state[idx] = next;
        }
        Ok(())
    }
}
