#![forbid(unsafe_code)]

//! The pull-based upstream contract.

use crate::block::Block;
use crate::error::{AggError, AggResult};
use crate::value::Value;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One input column: a block, or a scalar standing in for a block of identical values.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchColumn {
    Block(Block),
    Scalar(Value),
}

impl BatchColumn {
    /// The column as a block of `len` rows; scalars expand to a constant block.
    pub fn to_block(&self, len: usize) -> Cow<'_, Block> {
        match self {
            BatchColumn::Block(block) => Cow::Borrowed(block),
            BatchColumn::Scalar(value) => Cow::Owned(Block::constant(value.clone(), len)),
        }
    }
}

impl From<Block> for BatchColumn {
    fn from(block: Block) -> Self {
        BatchColumn::Block(block)
    }
}

impl From<Value> for BatchColumn {
    fn from(value: Value) -> Self {
        BatchColumn::Scalar(value)
    }
}

/// One advanced upstream result.
#[derive(Clone, Debug, PartialEq)]
pub struct InputBatch {
    /// Selection mask; its length is the batch length.
    pub bitmap: Block,
    pub group_by: Vec<BatchColumn>,
    /// Accumulator inputs, in the order of the operator's data slots.
    pub data: Vec<BatchColumn>,
}

impl InputBatch {
    pub fn new(bitmap: Block, group_by: Vec<BatchColumn>, data: Vec<BatchColumn>) -> Self {
        Self {
            bitmap,
            group_by,
            data,
        }
    }

    /// A batch whose rows are all selected.
    pub fn all_selected(len: usize, group_by: Vec<BatchColumn>, data: Vec<BatchColumn>) -> Self {
        Self::new(Block::all_true(len), group_by, data)
    }

    pub fn len(&self) -> usize {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Upstream producer of input batches.
pub trait BlockStream: Send {
    fn open(&mut self, reopen: bool) -> AggResult<()>;

    /// The next batch, or `None` once the stream is exhausted.
    fn next_batch(&mut self) -> AggResult<Option<InputBatch>>;

    fn close(&mut self);

    /// A fresh, unopened copy of this stream.
    fn clone_stream(&self) -> Box<dyn BlockStream>;
}

/// A stream replaying a fixed list of batches.
#[derive(Clone, Debug, Default)]
pub struct VecBlockStream {
    batches: Vec<InputBatch>,
    pos: usize,
    open: bool,
}

impl VecBlockStream {
    pub fn new(batches: Vec<InputBatch>) -> Self {
        Self {
            batches,
            pos: 0,
            open: false,
        }
    }
}

impl BlockStream for VecBlockStream {
    fn open(&mut self, _reopen: bool) -> AggResult<()> {
        self.pos = 0;
        self.open = true;
        Ok(())
    }

    fn next_batch(&mut self) -> AggResult<Option<InputBatch>> {
        if !self.open {
            return Err(AggError::Upstream("stream is not open".to_string()));
        }
        let batch = self.batches.get(self.pos).cloned();
        if batch.is_some() {
            self.pos += 1;
        }
        Ok(batch)
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn clone_stream(&self) -> Box<dyn BlockStream> {
        Box::new(Self::new(self.batches.clone()))
    }
}

/// Shared cancellation flag, checked cooperatively by the operator.
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> AggResult<()> {
        if self.is_interrupted() {
            Err(AggError::Interrupted)
        } else {
            Ok(())
        }
    }
}
