// Evaluates a compiled query's index-hint program against the attribute
// store, producing the customer bitmap the interpreter iterates. When the
// program is empty (or malformed enough to be unusable) the index falls
// back to all customers and the query loses its countable short-circuit.

use super::ops::{HintOp, HintValue};
use super::Macro;
use crate::attributes::{Attributes, ListMode};
use crate::bitmap::IndexBits;
use crate::common::{hash_str, NONE};
use crate::error::{Error, ErrorCode, Result};
use crate::table::properties::Properties;

pub struct IndexPlan {
    pub bits: IndexBits,
    pub countable: bool,
}

pub fn build_index(
    macros: &Macro,
    attrs: &mut Attributes,
    schema: &Properties,
    stop_bit: usize,
) -> Result<IndexPlan> {
    if macros.index_hints.is_empty() || stop_bit == 0 {
        let mut bits = IndexBits::new();
        bits.make_bits(stop_bit.max(64), true);
        return Ok(IndexPlan {
            bits,
            countable: false,
        });
    }

    let mut stack: Vec<IndexBits> = Vec::new();
    let mut prop: Option<u32> = None;
    let mut value: i64 = NONE;
    let mut op_count = 0usize;

    for hint in &macros.index_hints {
        match hint {
            HintOp::PushProp(name) => {
                prop = Some(schema.require(name)?.id);
            }
            HintOp::PushValue(hint_value) => {
                value = match hint_value {
                    HintValue::None => NONE,
                    HintValue::Number(n) => *n,
                    HintValue::Text(text) => hash_str(text),
                };
            }
            HintOp::Eq | HintOp::Neq | HintOp::Gt | HintOp::Gte | HintOp::Lt | HintOp::Lte => {
                let property = prop.ok_or_else(|| {
                    Error::query(ErrorCode::GeneralQueryError, "hint plan missing property")
                })?;
                let mode = match hint {
                    HintOp::Eq => ListMode::Eq,
                    HintOp::Neq => ListMode::Neq,
                    HintOp::Gt => ListMode::Gt,
                    HintOp::Gte => ListMode::Gte,
                    HintOp::Lt => ListMode::Lt,
                    _ => ListMode::Lte,
                };
                stack.push(attrs.composite_bits(property, mode, value, stop_bit)?);
                op_count += 1;
            }
            HintOp::BitAnd | HintOp::BitOr => {
                let right = stack.pop().ok_or_else(|| {
                    Error::query(ErrorCode::GeneralQueryError, "hint plan underflow")
                })?;
                let mut left = stack.pop().ok_or_else(|| {
                    Error::query(ErrorCode::GeneralQueryError, "hint plan underflow")
                })?;
                match hint {
                    HintOp::BitAnd => left.op_and(&right),
                    _ => left.op_or(&right),
                }
                stack.push(left);
                op_count += 1;
            }
        }
    }

    match stack.pop() {
        Some(mut bits) if op_count > 0 => {
            bits.grow(stop_bit / 64 + 1);
            Ok(IndexPlan {
                bits,
                countable: macros.index_is_countable,
            })
        }
        _ => {
            let mut bits = IndexBits::new();
            bits.make_bits(stop_bit, true);
            Ok(IndexPlan {
                bits,
                countable: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeBlob;
    use crate::query;
    use crate::table::properties::{Properties, PropType};
    use std::sync::Arc;

    fn fixture() -> (Properties, Attributes) {
        let mut schema = Properties::new();
        schema.add("fruit", PropType::Text, false, false).unwrap();
        schema.add("score", PropType::Int, false, false).unwrap();
        let mut attrs = Attributes::new(0, Arc::new(AttributeBlob::new()));

        // customers: 0=banana/5, 1=pear/10, 2=banana/20
        let fruit = schema.get("fruit").unwrap().id;
        let score = schema.get("score").unwrap().id;
        for (lin, name, points) in [(0usize, "banana", 5i64), (1, "pear", 10), (2, "banana", 20)] {
            let hash = attrs.intern(name);
            attrs.set(fruit, hash, lin, true).unwrap();
            attrs.set(score, points, lin, true).unwrap();
        }
        (schema, attrs)
    }

    #[test]
    fn test_eq_and_or_plan() {
        let (schema, mut attrs) = fixture();
        let mac = query::compile("where fruit == 'pear' || score > 15", &schema).unwrap();
        let plan = build_index(&mac, &mut attrs, &schema, 3).unwrap();
        assert!(plan.countable);
        assert!(!plan.bits.bit_state(0));
        assert!(plan.bits.bit_state(1));
        assert!(plan.bits.bit_state(2));
    }

    #[test]
    fn test_and_plan() {
        let (schema, mut attrs) = fixture();
        let mac = query::compile("where fruit == 'banana' && score < 10", &schema).unwrap();
        let plan = build_index(&mac, &mut attrs, &schema, 3).unwrap();
        assert_eq!(plan.bits.population(3), 1);
        assert!(plan.bits.bit_state(0));
    }

    #[test]
    fn test_no_hints_returns_everyone_not_countable() {
        let (schema, mut attrs) = fixture();
        let mac = query::compile("each_row { tally() }", &schema).unwrap();
        let plan = build_index(&mac, &mut attrs, &schema, 3).unwrap();
        assert!(!plan.countable);
        assert_eq!(plan.bits.population(3), 3);
    }

    #[test]
    fn test_neq_covers_absent_customers() {
        let (schema, mut attrs) = fixture();
        // customer 3 exists but has no fruit value at all
        let mac = query::compile("where fruit != 'banana'", &schema).unwrap();
        let plan = build_index(&mac, &mut attrs, &schema, 4).unwrap();
        assert!(!plan.bits.bit_state(0));
        assert!(plan.bits.bit_state(1));
        assert!(!plan.bits.bit_state(2));
        assert!(plan.bits.bit_state(3));
    }
}
