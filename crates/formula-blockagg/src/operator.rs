#![forbid(unsafe_code)]

//! The `block_group` operator: a blocking hash aggregation over batches of blocks.
//!
//! `open` consumes the whole input. Each batch is accumulated either partition-wise (when its
//! group-by columns tokenize into few enough distinct keys) with the block-level accumulator
//! forms, or row by row with the row-level forms. After every batch the table may be spilled;
//! if it ever was, the remainder is spilled at end of input and output is produced by merging
//! the spill log. Otherwise output drains the table directly.

use crate::block::Block;
use crate::error::AggResult;
use crate::expr::{
    AccumulatorSlot, AccumulatorSwitch, AggExpr, BlockRowAccumulators, DataInput, SlotId,
};
use crate::funcs::AggDef;
use crate::merge::SpillMergeReader;
use crate::options::HashAggOptions;
use crate::spill::SpillManager;
use crate::stats::{record_group_counters, CommonStats, HashAggStats, PlanSummary};
use crate::stream::{BlockStream, InputBatch, InterruptHandle};
use crate::table::GroupTable;
use crate::tokenize::{partition_bitmap, tokenize_group_by, TokenizedKeys};
use crate::value::{MaterializedRow, Value};
use ahash::AHashSet;
use hashbrown::hash_map::IntoIter;
use log::{debug, trace};
use std::borrow::Cow;
use std::fmt::Write as _;
use std::mem;

const STAGE_NAME: &str = "block_group";

/// Rows reserved up front per output column when the number of remaining groups is unknown.
const OUTPUT_RESERVE_ROWS: usize = 1024;

/// Slot layout and accumulator expressions of one `block_group` operator.
#[derive(Clone, Debug)]
pub struct BlockHashAggConfig {
    /// Output slots of the group-by key columns, in input column order.
    pub group_slots: Vec<SlotId>,
    /// Slot of the input (and output) selection mask.
    pub bitset_slot: SlotId,
    /// Slots of the accumulator input columns, in input column order.
    pub block_data_in_slots: Vec<SlotId>,
    /// Slots through which the accumulators see their data inputs. Same length as
    /// `block_data_in_slots`.
    pub accumulator_data_slots: Vec<SlotId>,
    /// Slot through which the block-level accumulators see the active selection.
    pub accumulator_bitset_slot: SlotId,
    /// Output slot and block/row forms of every accumulator.
    pub aggs: Vec<(SlotId, BlockRowAccumulators)>,
    /// Spill slot and merging expression of every accumulator. Required when disk use is
    /// allowed.
    pub merging_exprs: Vec<(SlotId, Box<dyn AggExpr>)>,
    pub options: HashAggOptions,
}

impl BlockHashAggConfig {
    /// A plan over built-in aggregates.
    ///
    /// The internal slots (accumulator bitset, accumulator data, spill slots) are numbered
    /// after the largest slot given here.
    pub fn builtin(
        group_slots: Vec<SlotId>,
        bitset_slot: SlotId,
        block_data_in_slots: Vec<SlotId>,
        aggs: Vec<(SlotId, AggDef)>,
        options: HashAggOptions,
    ) -> Self {
        let mut next = group_slots
            .iter()
            .chain(&block_data_in_slots)
            .chain(aggs.iter().map(|(slot, _)| slot))
            .copied()
            .max()
            .unwrap_or(bitset_slot)
            .max(bitset_slot)
            + 1;
        let mut fresh = || {
            let slot = next;
            next += 1;
            slot
        };

        let accumulator_bitset_slot = fresh();
        let accumulator_data_slots = block_data_in_slots.iter().map(|_| fresh()).collect();
        let mut built = Vec::with_capacity(aggs.len());
        let mut merging_exprs = Vec::with_capacity(aggs.len());
        for (slot, def) in aggs {
            let (accumulators, merge) = def.build();
            built.push((slot, accumulators));
            merging_exprs.push((fresh(), merge));
        }

        Self {
            group_slots,
            bitset_slot,
            block_data_in_slots,
            accumulator_data_slots,
            accumulator_bitset_slot,
            aggs: built,
            merging_exprs,
            options,
        }
    }

    fn validate(&self) {
        assert_eq!(
            self.block_data_in_slots.len(),
            self.accumulator_data_slots.len(),
            "block data slots and accumulator data slots must have the same size"
        );
        if self.options.allow_disk_use {
            assert_eq!(
                self.aggs.len(),
                self.merging_exprs.len(),
                "disk use is enabled but the number of merging expressions does not match the accumulators"
            );
        }

        let mut seen = AHashSet::new();
        let mut claim = |slot: SlotId| assert!(seen.insert(slot), "duplicate slot id s{slot}");
        claim(self.bitset_slot);
        claim(self.accumulator_bitset_slot);
        self.group_slots.iter().copied().for_each(&mut claim);
        self.aggs.iter().map(|(slot, _)| *slot).for_each(&mut claim);
        if self.options.allow_disk_use {
            self.merging_exprs.iter().map(|(slot, _)| *slot).for_each(&mut claim);
        }
        self.accumulator_data_slots.iter().copied().for_each(&mut claim);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorState {
    Unopened,
    /// Consuming input.
    Open,
    /// Emitting output.
    Draining,
    Closed,
}

enum OutputSource {
    Empty,
    Table(IntoIter<MaterializedRow, MaterializedRow>),
    Spilled(SpillMergeReader),
}

impl OutputSource {
    fn next_group(&mut self) -> AggResult<Option<(MaterializedRow, MaterializedRow)>> {
        match self {
            OutputSource::Empty => Ok(None),
            OutputSource::Table(entries) => Ok(entries.next()),
            OutputSource::Spilled(reader) => reader.next_group(),
        }
    }

    /// Rows worth reserving for an output batch of at most `cap` rows.
    fn reserve_rows(&self, cap: usize) -> usize {
        match self {
            OutputSource::Empty => 0,
            OutputSource::Table(entries) => cap.min(entries.len()),
            OutputSource::Spilled(_) => cap.min(OUTPUT_RESERVE_ROWS),
        }
    }
}

/// One output batch: the key and accumulator columns plus an all-true selection mask.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputBatch {
    pub bitmap: Block,
    pub keys: Vec<Block>,
    pub aggs: Vec<Block>,
    bitset_slot: SlotId,
    group_slots: Vec<SlotId>,
    agg_slots: Vec<SlotId>,
}

impl OutputBatch {
    pub fn len(&self) -> usize {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The column bound to `slot`: the selection mask, a key column or an accumulator column.
    pub fn column(&self, slot: SlotId) -> Option<&Block> {
        if slot == self.bitset_slot {
            return Some(&self.bitmap);
        }
        if let Some(idx) = self.group_slots.iter().position(|&s| s == slot) {
            return self.keys.get(idx);
        }
        self.agg_slots
            .iter()
            .position(|&s| s == slot)
            .and_then(|idx| self.aggs.get(idx))
    }

    /// Row-major `(key, accumulators)` view of the batch.
    pub fn rows(&self) -> Vec<(MaterializedRow, MaterializedRow)> {
        let keys: Vec<_> = self.keys.iter().map(Block::extract).collect();
        let aggs: Vec<_> = self.aggs.iter().map(Block::extract).collect();
        (0..self.len())
            .map(|row| {
                (
                    MaterializedRow::from_values(keys.iter().map(|col| col[row].clone())),
                    MaterializedRow::from_values(aggs.iter().map(|col| col[row].clone())),
                )
            })
            .collect()
    }
}

/// Vectorized hash aggregation with spilling.
pub struct BlockHashAgg {
    config: BlockHashAggConfig,
    child: Box<dyn BlockStream>,
    interrupt: InterruptHandle,
    state: OperatorState,
    table: GroupTable,
    spill: SpillManager,
    output: OutputSource,
    accumulators: AccumulatorSwitch,
    done: bool,
    common: CommonStats,
}

impl std::fmt::Debug for BlockHashAgg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHashAgg")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("groups", &self.table.len())
            .field("spill", &self.spill)
            .field("common", &self.common)
            .finish_non_exhaustive()
    }
}

impl BlockHashAgg {
    /// Panics if the slot layout is inconsistent (duplicate slots, mismatched slot lists).
    pub fn new(child: Box<dyn BlockStream>, mut config: BlockHashAggConfig) -> Self {
        config.validate();
        config.options = config.options.normalized();
        let table = GroupTable::new(config.aggs.len());
        Self {
            config,
            child,
            interrupt: InterruptHandle::new(),
            state: OperatorState::Unopened,
            table,
            spill: SpillManager::new(),
            output: OutputSource::Empty,
            accumulators: AccumulatorSwitch::new(AccumulatorSlot::TableResident),
            done: false,
            common: CommonStats::default(),
        }
    }

    /// Use `handle` for cooperative cancellation.
    pub fn with_interrupt(mut self, handle: InterruptHandle) -> Self {
        self.interrupt = handle;
        self
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn config(&self) -> &BlockHashAggConfig {
        &self.config
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn spill_stats(&self) -> &HashAggStats {
        self.spill.stats()
    }

    pub fn common_stats(&self) -> &CommonStats {
        &self.common
    }

    /// Consume the whole input. Any state from a previous execution is discarded.
    pub fn open(&mut self, reopen: bool) -> AggResult<()> {
        self.child.open(reopen)?;
        self.common.opens += 1;
        self.state = OperatorState::Open;
        self.table = GroupTable::new(self.config.aggs.len());
        // The previous run's cursor must be dropped before its log.
        self.output = OutputSource::Empty;
        self.spill.reset();
        self.done = false;
        self.common.is_eof = false;

        let mut batches = 0usize;
        while let Some(batch) = self.child.next_batch()? {
            self.interrupt.check()?;
            self.accumulate(&batch)?;
            self.spill.check_and_spill(&mut self.table, &self.config.options)?;
            batches += 1;
        }

        self.output = match self.spill.finish(&mut self.table, &self.config.options)? {
            Some(cursor) => {
                let merging_exprs = self
                    .config
                    .merging_exprs
                    .iter()
                    .map(|(_, expr)| expr.clone())
                    .collect();
                OutputSource::Spilled(SpillMergeReader::new(
                    cursor,
                    self.config.group_slots.len(),
                    merging_exprs,
                ))
            }
            None => {
                let table = mem::replace(&mut self.table, GroupTable::new(self.config.aggs.len()));
                OutputSource::Table(table.into_iter())
            }
        };
        debug!(
            "{STAGE_NAME} consumed {batches} batches, spills={}",
            self.spill.stats().spills
        );
        self.state = OperatorState::Draining;
        Ok(())
    }

    /// The next output batch of at most `block_out_size` groups, or `None` once every group
    /// has been emitted. Keeps returning `None` after that.
    ///
    /// Panics unless `open` completed.
    pub fn get_next(&mut self) -> AggResult<Option<OutputBatch>> {
        assert_eq!(
            self.state,
            OperatorState::Draining,
            "{STAGE_NAME}: get_next requires a successful open"
        );
        self.interrupt.check()?;
        if self.done {
            return Ok(None);
        }

        let cap = self.config.options.block_out_size;
        let reserve = self.output.reserve_rows(cap);
        let mut key_columns: Vec<Vec<Value>> = (0..self.config.group_slots.len())
            .map(|_| Vec::with_capacity(reserve))
            .collect();
        let mut agg_columns: Vec<Vec<Value>> = (0..self.config.aggs.len())
            .map(|_| Vec::with_capacity(reserve))
            .collect();

        let mut rows = 0usize;
        while rows < cap {
            let Some((key, accumulators)) = self.output.next_group()? else {
                self.done = true;
                break;
            };
            assert_eq!(
                key.len(),
                key_columns.len(),
                "group key has the wrong number of components"
            );
            for (column, value) in key_columns.iter_mut().zip(key) {
                column.push(value);
            }
            for (column, value) in agg_columns.iter_mut().zip(accumulators) {
                column.push(value);
            }
            rows += 1;
        }

        if rows == 0 {
            self.done = true;
            self.common.is_eof = true;
            return Ok(None);
        }
        self.common.advances += 1;
        trace!("{STAGE_NAME} emitting {rows} groups");

        Ok(Some(OutputBatch {
            bitmap: Block::all_true(rows),
            keys: key_columns.into_iter().map(Block::Array).collect(),
            aggs: agg_columns.into_iter().map(Block::Array).collect(),
            bitset_slot: self.config.bitset_slot,
            group_slots: self.config.group_slots.clone(),
            agg_slots: self.config.aggs.iter().map(|(slot, _)| *slot).collect(),
        }))
    }

    /// Release the table and the spill log. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == OperatorState::Closed {
            return;
        }
        self.common.closes += 1;
        self.table = GroupTable::new(self.config.aggs.len());
        self.output = OutputSource::Empty;
        self.spill.reset();
        self.child.close();
        self.state = OperatorState::Closed;
    }

    /// A copy of this plan with fresh runtime state and an unopened copy of the child.
    pub fn clone_plan(&self) -> Self {
        Self::new(self.child.clone_stream(), self.config.clone())
    }

    pub fn plan_summary(&self) -> PlanSummary {
        let merging_expressions = if self.config.options.allow_disk_use {
            self.config
                .merging_exprs
                .iter()
                .map(|(slot, expr)| (*slot, expr.debug_print()))
                .collect()
        } else {
            Default::default()
        };
        PlanSummary {
            stage: STAGE_NAME,
            bitset_slot: self.config.bitset_slot,
            group_by_slots: self.config.group_slots.clone(),
            block_expressions: self
                .config
                .aggs
                .iter()
                .map(|(slot, aggs)| (*slot, aggs.block_agg.debug_print()))
                .collect(),
            row_expressions: self
                .config
                .aggs
                .iter()
                .map(|(slot, aggs)| (*slot, aggs.row_agg.debug_print()))
                .collect(),
            accumulator_data_slots: self.config.accumulator_data_slots.clone(),
            merging_expressions,
            common: self.common,
            spill: *self.spill.stats(),
        }
    }

    /// One-line plan shape, e.g.
    /// `block_group bitset = s1 [s2] [s4 = valueBlockCount(bitset)] [s4 = count()] [s5]`.
    pub fn debug_print(&self) -> String {
        let config = &self.config;
        let mut out = format!("{STAGE_NAME} bitset = s{} ", config.bitset_slot);
        out.push_str(&bracketed(config.group_slots.iter().map(|s| format!("s{s}"))));
        for block_form in [true, false] {
            out.push(' ');
            out.push_str(&bracketed(config.aggs.iter().map(|(slot, aggs)| {
                let expr = if block_form { &aggs.block_agg } else { &aggs.row_agg };
                format!("s{slot} = {}", expr.debug_print())
            })));
        }
        out.push(' ');
        out.push_str(&bracketed(
            config.accumulator_data_slots.iter().map(|s| format!("s{s}")),
        ));
        if config.options.allow_disk_use && !config.merging_exprs.is_empty() {
            let _ = write!(
                out,
                " spillSlots{} mergingExprs{}",
                bracketed(config.merging_exprs.iter().map(|(s, _)| format!("s{s}"))),
                bracketed(config.merging_exprs.iter().map(|(_, e)| e.debug_print())),
            );
        }
        out
    }

    fn accumulate(&mut self, batch: &InputBatch) -> AggResult<()> {
        let len = batch.len();
        assert_eq!(
            batch.group_by.len(),
            self.config.group_slots.len(),
            "batch has the wrong number of group-by columns"
        );
        assert_eq!(
            batch.data.len(),
            self.config.block_data_in_slots.len(),
            "batch has the wrong number of data columns"
        );

        let group_by: Vec<Cow<'_, Block>> =
            batch.group_by.iter().map(|c| c.to_block(len)).collect();
        let data: Vec<Cow<'_, Block>> = batch.data.iter().map(|c| c.to_block(len)).collect();
        for block in group_by.iter().chain(&data) {
            assert_eq!(block.len(), len, "all input blocks must be the same size");
        }

        let max_partitions = self.config.options.max_partitions_for_tokenized_path;
        match tokenize_group_by(&group_by, len, max_partitions) {
            Some(tokenized) => self.accumulate_tokenized(&tokenized, &batch.bitmap, &data),
            None => {
                debug!(
                    "{STAGE_NAME}: more than {max_partitions} keys in a {len}-row batch, accumulating row by row"
                );
                self.accumulate_row_wise(&batch.bitmap, &group_by, &data)
            }
        }
    }

    fn accumulate_tokenized(
        &mut self,
        tokenized: &TokenizedKeys,
        bitmap: &Block,
        data: &[Cow<'_, Block>],
    ) -> AggResult<()> {
        let inputs: Vec<DataInput<'_>> = data.iter().map(|b| DataInput::Block(b)).collect();
        let single = tokenized.partition_count() == 1;

        for (partition, key) in tokenized.keys.iter().enumerate() {
            // With one partition the partition mask would be all true.
            let selection = if single {
                Cow::Borrowed(bitmap)
            } else {
                Cow::Owned(partition_bitmap(&tokenized.idxs, partition).bit_and(bitmap))
            };
            if selection.all_false() {
                continue;
            }

            let entry = self.table.find_or_insert(key.as_slice());
            self.accumulators.update(
                entry.as_mut_slice(),
                &mut [],
                self.config.aggs.iter().map(|(_, aggs)| &aggs.block_agg),
                Some(&*selection),
                &inputs,
                None,
            )?;
        }
        Ok(())
    }

    fn accumulate_row_wise(
        &mut self,
        bitmap: &Block,
        group_by: &[Cow<'_, Block>],
        data: &[Cow<'_, Block>],
    ) -> AggResult<()> {
        let selection = bitmap.to_selection();
        let key_columns: Vec<_> = group_by.iter().map(|b| b.extract()).collect();
        let data_columns: Vec<_> = data.iter().map(|b| b.extract()).collect();

        let mut key: Vec<Value> = Vec::with_capacity(key_columns.len());
        let mut inputs: Vec<DataInput<'_>> = Vec::with_capacity(data_columns.len());
        for (row, selected) in selection.iter().enumerate() {
            if !selected {
                continue;
            }
            key.clear();
            key.extend(key_columns.iter().map(|col| col[row].clone()));
            inputs.clear();
            inputs.extend(data_columns.iter().map(|col| DataInput::Scalar(&col[row])));

            let entry = self.table.find_or_insert(&key);
            self.accumulators.update(
                entry.as_mut_slice(),
                &mut [],
                self.config.aggs.iter().map(|(_, aggs)| &aggs.row_agg),
                None,
                &inputs,
                None,
            )?;
        }
        Ok(())
    }
}

impl Drop for BlockHashAgg {
    fn drop(&mut self) {
        record_group_counters(self.spill.stats());
    }
}

fn bracketed(items: impl Iterator<Item = String>) -> String {
    format!("[{}]", items.collect::<Vec<_>>().join(", "))
}
