#![forbid(unsafe_code)]

//! Built-in accumulators implementing the [`AggExpr`] contract.
//!
//! Every function has three forms: block-level (reduce the selected rows of a whole block into
//! the previous state), row-level (fold one scalar into the previous state) and merge (combine
//! the previous state with a spilled partial). All three are associative, so partial
//! aggregates can be combined in any grouping.

use crate::block::Block;
use crate::error::{AggError, AggResult};
use crate::expr::{AggExpr, BlockRowAccumulators, DataInput, EvalEnv};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFn {
    /// Number of selected rows.
    Count,
    /// Sum of numeric inputs; non-numeric values are ignored. An empty sum is `Int(0)`.
    Sum,
    /// Smallest non-missing input; `Nothing` if none was seen.
    Min,
    /// Largest non-missing input; `Nothing` if none was seen.
    Max,
}

/// One output aggregate: a function applied to a data input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggDef {
    pub func: AggFn,
    /// Index into the operator's accumulator data inputs.
    pub input: usize,
}

impl AggDef {
    pub fn new(func: AggFn, input: usize) -> Self {
        Self { func, input }
    }

    pub fn count() -> Self {
        Self::new(AggFn::Count, 0)
    }

    pub fn sum(input: usize) -> Self {
        Self::new(AggFn::Sum, input)
    }

    pub fn min(input: usize) -> Self {
        Self::new(AggFn::Min, input)
    }

    pub fn max(input: usize) -> Self {
        Self::new(AggFn::Max, input)
    }

    /// The block-level, row-level and merging forms of this aggregate.
    pub fn build(self) -> (BlockRowAccumulators, Box<dyn AggExpr>) {
        (self.func.accumulators(self.input), self.func.merging_expr())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggForm {
    Block,
    Row,
    Merge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltinAgg {
    func: AggFn,
    form: AggForm,
    input: usize,
}

impl AggFn {
    fn name(self) -> &'static str {
        match self {
            AggFn::Count => "count",
            AggFn::Sum => "sum",
            AggFn::Min => "min",
            AggFn::Max => "max",
        }
    }

    pub fn expr(self, form: AggForm, input: usize) -> Box<dyn AggExpr> {
        Box::new(BuiltinAgg {
            func: self,
            form,
            input,
        })
    }

    /// Block-level and row-level forms reading data input `input`.
    pub fn accumulators(self, input: usize) -> BlockRowAccumulators {
        BlockRowAccumulators {
            block_agg: self.expr(AggForm::Block, input),
            row_agg: self.expr(AggForm::Row, input),
        }
    }

    pub fn merging_expr(self) -> Box<dyn AggExpr> {
        self.expr(AggForm::Merge, 0)
    }
}

impl AggExpr for BuiltinAgg {
    fn eval<'a>(&self, env: &EvalEnv<'a>) -> AggResult<Cow<'a, Value>> {
        let acc = env.accumulator;
        match self.form {
            AggForm::Merge => {
                let partial = env.spilled.ok_or_else(|| {
                    AggError::Expression(format!(
                        "{}: spilled input is not bound",
                        self.func.name()
                    ))
                })?;
                Ok(combine(self.func, acc, partial))
            }
            AggForm::Row => {
                if self.func == AggFn::Count {
                    return Ok(Cow::Owned(add(acc, &Value::Int(1))));
                }
                let value = match env.data(self.input)? {
                    DataInput::Scalar(v) => v,
                    DataInput::Block(_) => {
                        return Err(AggError::Expression(format!(
                            "{}: row-level form bound to a block",
                            self.func.name()
                        )))
                    }
                };
                Ok(combine(self.func, acc, value))
            }
            AggForm::Block => {
                let bitset = env.bitset.ok_or_else(|| {
                    AggError::Expression(format!("{}: bitset is not bound", self.func.name()))
                })?;
                let selection = bitset.to_selection();
                if self.func == AggFn::Count {
                    let selected = selection.count_ones() as i64;
                    return Ok(Cow::Owned(add(acc, &Value::Int(selected))));
                }

                let data = block_input(env.data(self.input)?, bitset)?;
                let values = data.extract();
                let mut out = Cow::Borrowed(acc);
                for (value, selected) in values.iter().zip(selection.iter()) {
                    if selected {
                        out = Cow::Owned(combine(self.func, &out, value).into_owned());
                    }
                }
                Ok(out)
            }
        }
    }

    fn debug_print(&self) -> String {
        let name = self.func.name();
        match (self.form, self.func) {
            (AggForm::Block, AggFn::Count) => format!("valueBlock{}(bitset)", capitalize(name)),
            (AggForm::Block, _) => {
                format!("valueBlock{}(bitset, data[{}])", capitalize(name), self.input)
            }
            (AggForm::Row, AggFn::Count) => format!("{name}()"),
            (AggForm::Row, _) => format!("{name}(data[{}])", self.input),
            (AggForm::Merge, _) => format!("{name}Merge(spilled)"),
        }
    }

    fn box_clone(&self) -> Box<dyn AggExpr> {
        Box::new(self.clone())
    }
}

fn block_input<'a>(input: DataInput<'a>, bitset: &Block) -> AggResult<Cow<'a, Block>> {
    let block = match input {
        DataInput::Block(b) => Cow::Borrowed(b),
        DataInput::Scalar(v) => Cow::Owned(Block::constant(v.clone(), bitset.len())),
    };
    if block.len() != bitset.len() {
        return Err(AggError::Expression(format!(
            "data block has {} rows but bitset has {}",
            block.len(),
            bitset.len()
        )));
    }
    Ok(block)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Fold `value` into `acc` for `func`. Borrows `acc` when it is already the result.
fn combine<'a>(func: AggFn, acc: &'a Value, value: &'a Value) -> Cow<'a, Value> {
    match func {
        AggFn::Count | AggFn::Sum => Cow::Owned(add(acc, value)),
        AggFn::Min => pick(acc, value, Ordering::Less),
        AggFn::Max => pick(acc, value, Ordering::Greater),
    }
}

fn pick<'a>(acc: &'a Value, value: &'a Value, wanted: Ordering) -> Cow<'a, Value> {
    if value.is_missing() {
        return Cow::Borrowed(acc);
    }
    if acc.is_missing() || value.total_cmp(acc) == wanted {
        Cow::Borrowed(value)
    } else {
        Cow::Borrowed(acc)
    }
}

/// Numeric addition treating missing and non-numeric operands as zero. `Int` sums stay `Int`
/// until they overflow.
fn add(acc: &Value, value: &Value) -> Value {
    match (acc, value) {
        (Value::Int(a), Value::Int(b)) => match a.checked_add(*b) {
            Some(v) => Value::Int(v),
            None => Value::Number(*a as f64 + *b as f64),
        },
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Value::Number(x + y),
            (Some(_), None) => a.clone(),
            (None, Some(_)) => b.clone(),
            (None, None) => Value::Int(0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &dyn AggExpr, env: &EvalEnv<'_>) -> Value {
        expr.eval(env).unwrap().into_owned()
    }

    #[test]
    fn block_and_row_forms_agree() {
        let data = Block::from_values([
            Value::Int(1),
            Value::Number(2.5),
            Value::string("x"),
            Value::Int(4),
        ]);
        let bitset = Block::bitmap([true, true, true, false]);
        let inputs = [DataInput::Block(&data)];
        let acc = Value::Nothing;

        for func in [AggFn::Count, AggFn::Sum, AggFn::Min, AggFn::Max] {
            let accs = func.accumulators(0);
            let block_env = EvalEnv {
                bitset: Some(&bitset),
                data: &inputs,
                accumulator: &acc,
                spilled: None,
            };
            let from_block = eval(accs.block_agg.as_ref(), &block_env);

            let mut from_rows = Value::Nothing;
            for (value, selected) in data.extract().iter().zip(bitset.to_selection().iter()) {
                if !selected {
                    continue;
                }
                let row_inputs = [DataInput::Scalar(value)];
                let env = EvalEnv {
                    bitset: None,
                    data: &row_inputs,
                    accumulator: &from_rows,
                    spilled: None,
                };
                from_rows = eval(accs.row_agg.as_ref(), &env);
            }
            assert_eq!(from_block, from_rows, "{func:?}");
        }
    }

    #[test]
    fn sum_keeps_ints_until_overflow() {
        assert_eq!(add(&Value::Int(2), &Value::Int(3)), Value::Int(5));
        assert_eq!(
            add(&Value::Int(i64::MAX), &Value::Int(1)),
            Value::Number(i64::MAX as f64 + 1.0)
        );
        assert_eq!(add(&Value::Nothing, &Value::Null), Value::Int(0));
    }

    #[test]
    fn merge_combines_partials() {
        let merge = AggFn::Max.merging_expr();
        let acc = Value::Int(3);
        let partial = Value::Int(9);
        let env = EvalEnv {
            bitset: None,
            data: &[],
            accumulator: &acc,
            spilled: Some(&partial),
        };
        assert_eq!(eval(merge.as_ref(), &env), Value::Int(9));

        let missing = EvalEnv {
            spilled: None,
            ..env
        };
        assert!(merge.eval(&missing).is_err());
    }

    #[test]
    fn debug_print_names_inputs() {
        assert_eq!(
            AggFn::Sum.accumulators(1).block_agg.debug_print(),
            "valueBlockSum(bitset, data[1])"
        );
        assert_eq!(AggFn::Count.accumulators(0).row_agg.debug_print(), "count()");
        assert_eq!(AggFn::Min.merging_expr().debug_print(), "minMerge(spilled)");
    }
}
