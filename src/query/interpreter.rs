// The stack VM. Executes one customer's grid at a time against a
// compiled Macro, feeding tallies into the shared result set.
//
// Errors are values here: anything that goes wrong mid-dispatch becomes
// an `Err(Error)` that aborts the owning cell; nothing unwinds across
// threads. An exec-count guard bounds runaway scripts.

use super::ops::{Instr, Marshal, Modifier, OpCode};
use super::Macro;
use crate::attributes::AttributeBlob;
use crate::bitmap::IndexBits;
use crate::common::{hash_str, now_ms, NONE, UNIT_SCALE};
use crate::error::{Error, ErrorCode, Result};
use crate::grid::{CustomerData, Grid};
use crate::result::{ResultSet, ResultType, RowKey, KEY_DEPTH};
use crate::table::properties::{PropType, PROP_EVENT, PROP_SESSION, PROP_STAMP, PROP_UUID};
use chrono::{Datelike, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;

const STACK_LIMIT: usize = 256;
const DEFAULT_EXEC_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretMode {
    /// normal query: tallies into a result set
    Query,
    /// segment evaluation: the return value drives a bitmap
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Run,
    Break,
    Continue,
    Exit,
}

/// Tagged runtime value. Floats are fixed-point x10000 like everything
/// else in the engine; `Text` is a dictionary hash, `Str` a literal that
/// hashes on comparison.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Int(i64),
    Float(i64),
    Bool(bool),
    Text(i64),
    Str(String),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Bits(IndexBits),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Int(v) => *v != 0 && *v != NONE,
            Value::Float(v) => *v != 0 && *v != NONE,
            Value::Bool(b) => *b,
            Value::Text(_) => true,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(items) => !items.is_empty(),
            Value::Bits(_) => true,
        }
    }

    /// Numeric view: (scaled-or-raw value, is_float).
    fn as_num(&self) -> Option<(i64, bool)> {
        match self {
            Value::Int(v) => Some((*v, false)),
            Value::Float(v) => Some((*v, true)),
            Value::Bool(b) => Some((*b as i64, false)),
            _ => None,
        }
    }

    fn hash_id(&self) -> Option<i64> {
        match self {
            Value::Text(hash) => Some(*hash),
            Value::Str(text) => Some(hash_str(text)),
            _ => None,
        }
    }

    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::None, Value::List(items)) | (Value::List(items), Value::None) => {
                items.is_empty()
            }
            (Value::None, _) | (_, Value::None) => false,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_value(y))
            }
            (Value::List(items), single) | (single, Value::List(items)) => {
                // a set property equals a scalar when any member matches
                items.iter().any(|item| item.eq_value(single))
            }
            _ => {
                if let (Some(a), Some(b)) = (self.hash_id(), other.hash_id()) {
                    return a == b;
                }
                match (self.as_num(), other.as_num()) {
                    (Some((a, af)), Some((b, bf))) => {
                        let (a, b) = promote(a, af, b, bf);
                        a == b
                    }
                    _ => false,
                }
            }
        }
    }

    /// Result-key representation: (tagged value, type).
    fn to_key(&self) -> (i64, ResultType) {
        match self {
            Value::None => (NONE, ResultType::None),
            Value::Int(v) => (*v, ResultType::Int),
            Value::Float(v) => (*v, ResultType::Double),
            Value::Bool(b) => (*b as i64, ResultType::Bool),
            Value::Text(hash) => (*hash, ResultType::Text),
            Value::Str(text) => (hash_str(text), ResultType::Text),
            _ => (NONE, ResultType::None),
        }
    }
}

fn promote(a: i64, a_float: bool, b: i64, b_float: bool) -> (i64, i64) {
    match (a_float, b_float) {
        (true, false) => (a, b.saturating_mul(UNIT_SCALE)),
        (false, true) => (a.saturating_mul(UNIT_SCALE), b),
        _ => (a, b),
    }
}

pub type SegmentResolver = Box<dyn FnMut(&str) -> Option<IndexBits> + Send>;

pub struct Interpreter {
    pub macros: Arc<Macro>,
    pub mode: InterpretMode,
    stack: Vec<Value>,
    vars: Vec<Value>,
    loop_state: LoopState,
    row_cursor: usize,
    in_row_loop: bool,
    exec_count: u64,
    exec_limit: u64,
    /// once-per-branch gate: (column, group key, discriminator)
    distinct: HashSet<(u32, RowKey, i64)>,
    pub returns: Vec<Value>,
    /// segment comparison lanes; column group per lane after the primary
    lanes: Vec<(String, IndexBits)>,
    resolver: Option<SegmentResolver>,
    stop_bit: usize,
    blob: Option<Arc<AttributeBlob>>,
    /// variable values re-applied after each per-customer reset
    presets: Vec<(usize, Value)>,
}

struct ExecCtx<'a> {
    grid: &'a Grid,
    customer: &'a CustomerData,
    result: &'a mut ResultSet,
}

impl Interpreter {
    pub fn new(macros: Arc<Macro>, mode: InterpretMode) -> Self {
        let vars = vec![Value::None; macros.vars.len()];
        Self {
            macros,
            mode,
            stack: Vec::with_capacity(64),
            vars,
            loop_state: LoopState::Run,
            row_cursor: 0,
            in_row_loop: false,
            exec_count: 0,
            exec_limit: DEFAULT_EXEC_LIMIT,
            distinct: HashSet::new(),
            returns: Vec::new(),
            lanes: Vec::new(),
            resolver: None,
            stop_bit: 0,
            blob: None,
            presets: Vec::new(),
        }
    }

    pub fn set_segment_resolver(&mut self, resolver: SegmentResolver) {
        self.resolver = Some(resolver);
    }

    pub fn set_lanes(&mut self, lanes: Vec<(String, IndexBits)>) {
        self.lanes = lanes;
    }

    pub fn lane_count(&self) -> usize {
        1 + self.lanes.len()
    }

    pub fn set_stop_bit(&mut self, stop_bit: usize) {
        self.stop_bit = stop_bit;
    }

    pub fn set_blob(&mut self, blob: Arc<AttributeBlob>) {
        self.blob = Some(blob);
    }

    pub fn set_exec_limit(&mut self, limit: u64) {
        self.exec_limit = limit.max(1);
    }

    /// Forget per-query distinct state (a refresh pass reuses the cached
    /// interpreter but starts a fresh count).
    pub fn reset_counts(&mut self) {
        self.distinct.clear();
    }

    /// Pin a script variable to a value that survives the per-customer
    /// reset (histogram `foreach` binding).
    pub fn preset_var(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.macros.vars.iter().position(|v| v == name) {
            self.presets.retain(|(s, _)| *s != slot);
            self.presets.push((slot, value));
        }
    }

    /// Run the script over one mounted customer.
    pub fn exec(
        &mut self,
        grid: &Grid,
        customer: &CustomerData,
        result: &mut ResultSet,
    ) -> Result<()> {
        self.stack.clear();
        self.vars = vec![Value::None; self.macros.vars.len()];
        for (slot, value) in self.presets.clone() {
            if let Some(var) = self.vars.get_mut(slot) {
                *var = value;
            }
        }
        self.returns.clear();
        self.loop_state = LoopState::Run;
        self.row_cursor = 0;
        self.in_row_loop = false;
        self.exec_count = 0;

        let mut ctx = ExecCtx {
            grid,
            customer,
            result,
        };
        self.exec_block(0, &mut ctx)
    }

    /// Count-mode outcome for segment scripts: did the customer land in
    /// the segment?
    pub fn last_return_truthy(&self) -> bool {
        self.returns.first().map(|v| v.truthy()).unwrap_or(false)
    }

    /// Segment-math scripts return bits instead of a boolean.
    pub fn last_return_bits(&mut self) -> Option<IndexBits> {
        match self.returns.first() {
            Some(Value::Bits(bits)) => Some(bits.clone()),
            _ => None,
        }
    }

    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(Error::run_time(
                ErrorCode::Recursion,
                "operand stack overflow",
            ));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| {
            Error::run_time(ErrorCode::IterationError, "operand stack underflow")
        })
    }

    fn prop_value(&self, slot: i32, ctx: &ExecCtx) -> Value {
        let prop = &self.macros.props[slot as usize];
        let raw = match prop.id {
            PROP_STAMP => {
                if self.in_row_loop {
                    ctx.grid
                        .rows()
                        .get(self.row_cursor)
                        .map(|r| r.stamp)
                        .unwrap_or(NONE)
                } else {
                    NONE
                }
            }
            PROP_EVENT => {
                if self.in_row_loop {
                    ctx.grid
                        .rows()
                        .get(self.row_cursor)
                        .map(|r| r.event)
                        .unwrap_or(NONE)
                } else {
                    NONE
                }
            }
            PROP_SESSION => {
                if self.in_row_loop {
                    ctx.grid.session(self.row_cursor)
                } else {
                    NONE
                }
            }
            PROP_UUID => return Value::Str(ctx.customer.id.clone()),
            id if prop.is_customer => ctx.grid.customer_value(id).unwrap_or(NONE),
            id => {
                if self.in_row_loop {
                    ctx.grid
                        .rows()
                        .get(self.row_cursor)
                        .and_then(|r| r.first_value(id))
                        .unwrap_or(NONE)
                } else {
                    NONE
                }
            }
        };
        if raw == NONE {
            return Value::None;
        }
        match prop.ptype {
            PropType::Int => Value::Int(raw),
            PropType::Double => Value::Float(raw),
            PropType::Bool => Value::Bool(raw != 0),
            PropType::Text => Value::Text(raw),
        }
    }

    fn prop_values(&self, slot: i32, ctx: &ExecCtx) -> Value {
        let prop = &self.macros.props[slot as usize];
        if !self.in_row_loop || prop.id < 1000 || prop.is_customer {
            let single = self.prop_value(slot, ctx);
            return match single {
                Value::None => Value::List(Vec::new()),
                other => Value::List(vec![other]),
            };
        }
        let values: Vec<Value> = ctx
            .grid
            .rows()
            .get(self.row_cursor)
            .map(|row| {
                row.values(prop.id)
                    .map(|raw| match prop.ptype {
                        PropType::Int => Value::Int(raw),
                        PropType::Double => Value::Float(raw),
                        PropType::Bool => Value::Bool(raw != 0),
                        PropType::Text => Value::Text(raw),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Value::List(values)
    }

    fn exec_block(&mut self, block: usize, ctx: &mut ExecCtx) -> Result<()> {
        let macros = self.macros.clone();
        let code = macros.blocks.get(block).ok_or_else(|| {
            Error::run_time(ErrorCode::GeneralQueryError, "missing code block")
        })?;

        for instr in code {
            if self.loop_state != LoopState::Run {
                return Ok(());
            }
            self.exec_count += 1;
            if self.exec_count > self.exec_limit {
                return Err(Error::run_time(
                    ErrorCode::ExecCountExceeded,
                    format!("script exceeded {} operations", self.exec_limit),
                ));
            }
            self.exec_instr(instr, ctx).map_err(|e| {
                if e.additional.is_none() && instr.dbg.line > 0 {
                    e.with_additional(format!("line {}", instr.dbg.line))
                } else {
                    e
                }
            })?;
        }
        Ok(())
    }

    fn exec_instr(&mut self, instr: &Instr, ctx: &mut ExecCtx) -> Result<()> {
        match instr.op {
            OpCode::Nop => {}
            OpCode::PshTblCol => {
                let value = self.prop_value(instr.index, ctx);
                self.push(value)?;
            }
            OpCode::PshTblFlt => {
                let value = self.prop_values(instr.index, ctx);
                self.push(value)?;
            }
            OpCode::PshUsrVar => {
                let value = self
                    .vars
                    .get(instr.index as usize)
                    .cloned()
                    .unwrap_or(Value::None);
                self.push(value)?;
            }
            OpCode::PopUsrVar => {
                let value = self.pop()?;
                if let Some(slot) = self.vars.get_mut(instr.index as usize) {
                    *slot = value;
                }
            }
            OpCode::PshLitTrue => self.push(Value::Bool(true))?,
            OpCode::PshLitFalse => self.push(Value::Bool(false))?,
            OpCode::PshLitNul => self.push(Value::None)?,
            OpCode::PshLitInt => self.push(Value::Int(instr.value))?,
            OpCode::PshLitFlt => self.push(Value::Float(instr.value))?,
            OpCode::PshLitStr => {
                let text = self.macros.literals[instr.index as usize].clone();
                self.push(Value::Str(text))?;
            }
            OpCode::CndIf => {
                self.exec_block(instr.value as usize, ctx)?;
                if self.loop_state != LoopState::Run {
                    return Ok(());
                }
                let cond = self.pop()?;
                if cond.truthy() {
                    self.exec_block(instr.index as usize, ctx)?;
                } else if instr.extra >= 0 {
                    self.exec_block(instr.extra as usize, ctx)?;
                }
            }
            OpCode::ItForR | OpCode::ItRForR => {
                let count = ctx.grid.rows().len();
                let was_in_loop = self.in_row_loop;
                self.in_row_loop = true;
                let indexes: Vec<usize> = if instr.op == OpCode::ItForR {
                    (0..count).collect()
                } else {
                    (0..count).rev().collect()
                };
                for row in indexes {
                    self.row_cursor = row;
                    self.exec_block(instr.index as usize, ctx)?;
                    match self.loop_state {
                        LoopState::Continue => self.loop_state = LoopState::Run,
                        LoopState::Break => {
                            self.loop_state = LoopState::Run;
                            break;
                        }
                        LoopState::Exit => break,
                        LoopState::Run => {}
                    }
                }
                self.in_row_loop = was_in_loop;
            }
            OpCode::MathAdd | OpCode::MathSub | OpCode::MathMul | OpCode::MathDiv => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(math(instr.op, &left, &right)?)?;
            }
            OpCode::OpGt | OpCode::OpLt | OpCode::OpGte | OpCode::OpLte => {
                let right = self.pop()?;
                let left = self.pop()?;
                let out = match (left.as_num(), right.as_num()) {
                    (Some((a, af)), Some((b, bf))) => {
                        let (a, b) = promote(a, af, b, bf);
                        match instr.op {
                            OpCode::OpGt => a > b,
                            OpCode::OpLt => a < b,
                            OpCode::OpGte => a >= b,
                            _ => a <= b,
                        }
                    }
                    _ => false,
                };
                self.push(Value::Bool(out))?;
            }
            OpCode::OpEq => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left.eq_value(&right)))?;
            }
            OpCode::OpNeq => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(!left.eq_value(&right)))?;
            }
            OpCode::OpWthn => {
                let range = self.pop()?;
                let right = self.pop()?;
                let left = self.pop()?;
                let out = match (left.as_num(), right.as_num(), range.as_num()) {
                    (Some((a, _)), Some((b, _)), Some((r, _))) => (a - b).abs() <= r,
                    _ => false,
                };
                self.push(Value::Bool(out))?;
            }
            OpCode::OpNot => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.truthy()))?;
            }
            OpCode::OpCont | OpCode::OpAny | OpCode::OpIn => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(contains(instr.op, &left, &right)))?;
            }
            OpCode::LgcAnd => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left.truthy() && right.truthy()))?;
            }
            OpCode::LgcOr => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left.truthy() || right.truthy()))?;
            }
            OpCode::Marshal => {
                let marshal = Marshal::from_i64(instr.value).ok_or_else(|| {
                    Error::run_time(ErrorCode::GeneralQueryError, "bad marshal id")
                })?;
                self.exec_marshal(marshal, instr.extra as usize, ctx)?;
            }
            OpCode::Discard => {
                let _ = self.pop();
            }
            OpCode::Return => {
                let value = self.pop()?;
                self.returns = vec![value];
                self.loop_state = LoopState::Exit;
            }
            OpCode::Term => {
                self.loop_state = LoopState::Exit;
            }
        }
        Ok(())
    }

    fn pop_args(&mut self, argc: usize) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn resolve_segment(&mut self, name: &Value) -> Result<IndexBits> {
        let name = match name {
            Value::Str(s) => s.clone(),
            _ => {
                return Err(Error::run_time(
                    ErrorCode::SetMathParamInvalid,
                    "segment functions take segment names",
                ))
            }
        };
        let resolver = self.resolver.as_mut().ok_or_else(|| {
            Error::run_time(ErrorCode::SetMathParamInvalid, "no segment context")
        })?;
        resolver(&name).ok_or_else(|| {
            Error::query(ErrorCode::ItemNotFound, format!("unknown segment '{name}'"))
        })
    }

    fn exec_marshal(&mut self, marshal: Marshal, argc: usize, ctx: &mut ExecCtx) -> Result<()> {
        let args = self.pop_args(argc)?;
        match marshal {
            Marshal::Tally => {
                self.tally(&args, ctx)?;
                self.push(Value::None)?;
            }
            Marshal::Now => self.push(Value::Int(now_ms()))?,
            Marshal::Bucket => {
                let value = args.first().cloned().unwrap_or(Value::None);
                let size = args.get(1).cloned().unwrap_or(Value::Int(1));
                let out = match (value.as_num(), size.as_num()) {
                    (Some((v, vf)), Some((s, sf))) => {
                        let (v, s) = promote(v, vf, s, sf);
                        if s == 0 {
                            Value::None
                        } else {
                            let floored = v.div_euclid(s) * s;
                            if vf || sf {
                                Value::Float(floored)
                            } else {
                                Value::Int(floored)
                            }
                        }
                    }
                    _ => Value::None,
                };
                self.push(out)?;
            }
            Marshal::Round | Marshal::Fix => {
                let out = match args.first().and_then(|v| v.as_num()) {
                    Some((v, true)) => {
                        Value::Float((v as f64 / UNIT_SCALE as f64).round() as i64 * UNIT_SCALE)
                    }
                    Some((v, false)) => Value::Int(v),
                    None => Value::None,
                };
                self.push(out)?;
            }
            Marshal::Trunc => {
                let out = match args.first().and_then(|v| v.as_num()) {
                    Some((v, true)) => Value::Int(v / UNIT_SCALE),
                    Some((v, false)) => Value::Int(v),
                    None => Value::None,
                };
                self.push(out)?;
            }
            Marshal::Iso8601ToStamp => {
                let out = match args.first() {
                    Some(Value::Str(text)) => chrono::DateTime::parse_from_rfc3339(text)
                        .map(|dt| Value::Int(dt.timestamp_millis()))
                        .map_err(|_| Error::parse(ErrorCode::DateParseError, text.clone()))?,
                    _ => Value::None,
                };
                self.push(out)?;
            }
            Marshal::ToSeconds | Marshal::ToMinutes | Marshal::ToHours | Marshal::ToDays => {
                let unit = match marshal {
                    Marshal::ToSeconds => 1_000,
                    Marshal::ToMinutes => 60_000,
                    Marshal::ToHours => 3_600_000,
                    _ => 86_400_000,
                };
                let out = match args.first().and_then(|v| v.as_num()) {
                    Some((v, false)) => Value::Int(v / unit),
                    Some((v, true)) => Value::Int(v / UNIT_SCALE / unit),
                    None => Value::None,
                };
                self.push(out)?;
            }
            Marshal::GetSecond
            | Marshal::GetMinute
            | Marshal::GetHour
            | Marshal::GetDayOfWeek
            | Marshal::GetDayOfMonth
            | Marshal::GetDayOfYear
            | Marshal::GetMonth
            | Marshal::GetQuarter
            | Marshal::GetYear => {
                let out = stamp_arg(&args)
                    .map(|stamp| Value::Int(date_part(marshal, stamp)))
                    .unwrap_or(Value::None);
                self.push(out)?;
            }
            Marshal::RoundSecond
            | Marshal::RoundMinute
            | Marshal::RoundHour
            | Marshal::RoundDay
            | Marshal::RoundWeek
            | Marshal::RoundMonth
            | Marshal::RoundQuarter
            | Marshal::RoundYear => {
                let out = stamp_arg(&args)
                    .map(|stamp| Value::Int(date_round(marshal, stamp)))
                    .unwrap_or(Value::None);
                self.push(out)?;
            }
            Marshal::RowCount => self.push(Value::Int(ctx.grid.rows().len() as i64))?,
            Marshal::FirstStamp => self.push(
                ctx.grid
                    .rows()
                    .first()
                    .map(|r| Value::Int(r.stamp))
                    .unwrap_or(Value::None),
            )?,
            Marshal::LastStamp => self.push(
                ctx.grid
                    .rows()
                    .last()
                    .map(|r| Value::Int(r.stamp))
                    .unwrap_or(Value::None),
            )?,
            Marshal::SessionCount => self.push(Value::Int(ctx.grid.session_count()))?,
            Marshal::Population => {
                let bits = self.resolve_segment(
                    args.first().unwrap_or(&Value::None),
                )?;
                let population = bits.population(self.stop_bit) as i64;
                self.push(Value::Int(population))?;
            }
            Marshal::Union | Marshal::Intersection | Marshal::Difference => {
                if args.len() < 2 {
                    return Err(Error::run_time(
                        ErrorCode::SetMathParamInvalid,
                        "set math needs two segments",
                    ));
                }
                let mut out = self.resolve_segment(&args[0])?;
                for arg in &args[1..] {
                    let rhs = self.resolve_segment(arg)?;
                    match marshal {
                        Marshal::Union => out.op_or(&rhs),
                        Marshal::Intersection => out.op_and(&rhs),
                        _ => out.op_and_not(&rhs),
                    }
                }
                self.push(Value::Bits(out))?;
            }
            Marshal::Compliment => {
                let mut out = self.resolve_segment(
                    args.first().unwrap_or(&Value::None),
                )?;
                out.grow(self.stop_bit / 64 + 1);
                out.op_not();
                self.push(Value::Bits(out))?;
            }
            Marshal::Break => {
                self.loop_state = LoopState::Break;
            }
            Marshal::Continue => {
                self.loop_state = LoopState::Continue;
            }
            Marshal::Log => {
                tracing::info!(values = ?args, "query log()");
                self.push(Value::None)?;
            }
            Marshal::InitList => self.push(Value::List(args))?,
            Marshal::InitDict | Marshal::Set => {
                // dict(k, v, k, v...) / set(a, b, c)
                if marshal == Marshal::InitDict {
                    let mut pairs = Vec::new();
                    let mut iter = args.into_iter();
                    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                        pairs.push((k, v));
                    }
                    self.push(Value::Dict(pairs))?;
                } else {
                    let mut unique: Vec<Value> = Vec::new();
                    for arg in args {
                        if !unique.iter().any(|u| u.eq_value(&arg)) {
                            unique.push(arg);
                        }
                    }
                    self.push(Value::List(unique))?;
                }
            }
            Marshal::Len => {
                let out = match args.first() {
                    Some(Value::List(items)) => Value::Int(items.len() as i64),
                    Some(Value::Dict(items)) => Value::Int(items.len() as i64),
                    Some(Value::Str(s)) => Value::Int(s.len() as i64),
                    _ => Value::Int(0),
                };
                self.push(out)?;
            }
            Marshal::Append => {
                let mut iter = args.into_iter();
                let list = iter.next().unwrap_or(Value::None);
                let item = iter.next().unwrap_or(Value::None);
                match list {
                    Value::List(mut items) => {
                        items.push(item);
                        self.push(Value::List(items))?;
                    }
                    other => self.push(other)?,
                }
            }
            Marshal::Keys => {
                let out = match args.first() {
                    Some(Value::Dict(items)) => {
                        Value::List(items.iter().map(|(k, _)| k.clone()).collect())
                    }
                    _ => Value::List(Vec::new()),
                };
                self.push(out)?;
            }
            Marshal::Range => {
                let start = args.first().and_then(|v| v.as_num()).map(|(v, _)| v).unwrap_or(0);
                let end = args.get(1).and_then(|v| v.as_num()).map(|(v, _)| v).unwrap_or(0);
                let items = (start..end).map(Value::Int).collect();
                self.push(Value::List(items))?;
            }
        }
        Ok(())
    }

    /// Accumulate the current row into the result set: build the group
    /// key from the `group` clause plus any tally arguments, then fold
    /// every aggregate column in at every key prefix depth, per lane.
    fn tally(&mut self, args: &[Value], ctx: &mut ExecCtx) -> Result<()> {
        let macros = self.macros.clone();

        let mut key = RowKey::default();
        let mut depth = 0usize;
        let mut group_values: Vec<Value> = Vec::new();
        for &slot in &macros.group_props {
            group_values.push(self.prop_value(slot, ctx));
        }
        group_values.extend(args.iter().cloned());

        for value in &group_values {
            if depth >= KEY_DEPTH {
                break;
            }
            let (k, t) = value.to_key();
            key.key[depth] = k;
            key.types[depth] = t;
            if t == ResultType::Text {
                if let Some(blob) = &self.blob {
                    if let Some(text) = blob.get(k) {
                        ctx.result.add_local_text(k, &text);
                    } else if let Value::Str(text) = value {
                        ctx.result.add_local_text(k, text);
                    }
                } else if let Value::Str(text) = value {
                    ctx.result.add_local_text(k, text);
                }
            }
            depth += 1;
        }
        if depth == 0 {
            // ungrouped queries accumulate under a single root key
            key.key[0] = 0;
            key.types[0] = ResultType::Int;
            depth = 1;
        }

        let per_lane = macros.aggs.len();
        let lane_count = self.lane_count();
        let linear = ctx.customer.linear_id;

        for level in 1..=depth {
            let prefix = key.key_from(level);
            for lane in 0..lane_count {
                if lane > 0 && !self.lanes[lane - 1].1.bit_state(linear) {
                    continue;
                }
                for (column, agg) in macros.aggs.iter().enumerate() {
                    let source = agg
                        .prop
                        .map(|slot| self.prop_value(slot, ctx))
                        .unwrap_or(Value::None);

                    let discriminator = match agg.modifier {
                        Modifier::DistCountPerson => ctx.customer.id_hash,
                        Modifier::Dist => source.to_key().0,
                        _ => NONE,
                    };
                    if matches!(agg.modifier, Modifier::Dist | Modifier::DistCountPerson) {
                        let gate = (
                            (lane * per_lane + column) as u32,
                            prefix,
                            discriminator,
                        );
                        if !self.distinct.insert(gate) {
                            continue;
                        }
                    }

                    let raw = match agg.modifier {
                        Modifier::Count => {
                            if agg.prop.is_some() && matches!(source, Value::None) {
                                continue; // counting a property counts rows where it is present
                            }
                            0
                        }
                        _ => source.to_key().0,
                    };
                    let accums = ctx.result.accum_mut(prefix);
                    accums[lane * per_lane + column].apply(agg.modifier, raw);
                }
            }
        }
        Ok(())
    }
}

fn math(op: OpCode, left: &Value, right: &Value) -> Result<Value> {
    // string concatenation rides MathAdd
    if op == OpCode::MathAdd {
        if let (Value::Str(a), Value::Str(b)) = (left, right) {
            return Ok(Value::Str(format!("{a}{b}")));
        }
    }
    let (Some((a, af)), Some((b, bf))) = (left.as_num(), right.as_num()) else {
        return Ok(Value::None);
    };
    let is_float = af || bf;
    let (a, b) = promote(a, af, b, bf);
    let out = match op {
        OpCode::MathAdd => a.checked_add(b),
        OpCode::MathSub => a.checked_sub(b),
        OpCode::MathMul => {
            if is_float {
                a.checked_mul(b).map(|v| v / UNIT_SCALE)
            } else {
                a.checked_mul(b)
            }
        }
        _ => {
            if b == 0 {
                None
            } else if is_float {
                a.checked_mul(UNIT_SCALE).map(|v| v / b)
            } else {
                Some(a / b)
            }
        }
    };
    match out {
        Some(v) if is_float => Ok(Value::Float(v)),
        Some(v) => Ok(Value::Int(v)),
        None => Ok(Value::None),
    }
}

fn contains(op: OpCode, left: &Value, right: &Value) -> bool {
    let as_list = |v: &Value| -> Vec<Value> {
        match v {
            Value::List(items) => items.clone(),
            Value::None => Vec::new(),
            other => vec![other.clone()],
        }
    };
    match op {
        // left in right
        OpCode::OpIn => as_list(right).iter().any(|item| item.eq_value(left)),
        // left contains all of right
        OpCode::OpCont => {
            let l = as_list(left);
            as_list(right).iter().all(|item| l.iter().any(|x| x.eq_value(item)))
        }
        // left contains any of right
        _ => {
            let l = as_list(left);
            as_list(right).iter().any(|item| l.iter().any(|x| x.eq_value(item)))
        }
    }
}

fn stamp_arg(args: &[Value]) -> Option<i64> {
    args.first().and_then(|v| v.as_num()).map(|(v, _)| v)
}

fn date_part(marshal: Marshal, stamp: i64) -> i64 {
    use chrono::Timelike;
    let Some(dt) = Utc.timestamp_millis_opt(stamp).single() else {
        return NONE;
    };
    match marshal {
        Marshal::GetSecond => dt.second() as i64,
        Marshal::GetMinute => dt.minute() as i64,
        Marshal::GetHour => dt.hour() as i64,
        Marshal::GetDayOfWeek => dt.weekday().num_days_from_monday() as i64,
        Marshal::GetDayOfMonth => dt.day() as i64,
        Marshal::GetDayOfYear => dt.ordinal() as i64,
        Marshal::GetMonth => dt.month() as i64,
        Marshal::GetQuarter => ((dt.month0() / 3) + 1) as i64,
        Marshal::GetYear => dt.year() as i64,
        _ => NONE,
    }
}

fn date_round(marshal: Marshal, stamp: i64) -> i64 {
    match marshal {
        Marshal::RoundSecond => stamp - stamp.rem_euclid(1_000),
        Marshal::RoundMinute => stamp - stamp.rem_euclid(60_000),
        Marshal::RoundHour => stamp - stamp.rem_euclid(3_600_000),
        Marshal::RoundDay => stamp - stamp.rem_euclid(86_400_000),
        Marshal::RoundWeek => {
            let day = stamp - stamp.rem_euclid(86_400_000);
            let weekday = Utc
                .timestamp_millis_opt(day)
                .single()
                .map(|dt| dt.weekday().num_days_from_monday() as i64)
                .unwrap_or(0);
            day - weekday * 86_400_000
        }
        Marshal::RoundMonth | Marshal::RoundQuarter | Marshal::RoundYear => {
            let Some(dt) = Utc.timestamp_millis_opt(stamp).single() else {
                return NONE;
            };
            let month = match marshal {
                Marshal::RoundMonth => dt.month(),
                Marshal::RoundQuarter => (dt.month0() / 3) * 3 + 1,
                _ => 1,
            };
            Utc.with_ymd_and_hms(dt.year(), month, 1, 0, 0, 0)
                .single()
                .map(|d| d.timestamp_millis())
                .unwrap_or(NONE)
        }
        _ => NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attributes;
    use crate::grid::People;
    use crate::query;
    use crate::table::properties::Properties;

    fn schema() -> Properties {
        let mut schema = Properties::new();
        schema.add("product", PropType::Text, true, false).unwrap();
        schema.add("price", PropType::Double, false, false).unwrap();
        schema.add("score", PropType::Int, false, false).unwrap();
        schema
    }

    struct Rig {
        schema: Properties,
        attrs: Attributes,
        people: People,
        grid: Grid,
    }

    fn rig() -> Rig {
        let schema = schema();
        let attrs = Attributes::new(0, Arc::new(AttributeBlob::new()));
        let people = People::new(0);
        let mut grid = Grid::new();
        grid.map_table(&schema, None).unwrap();
        Rig {
            schema,
            attrs,
            people,
            grid,
        }
    }

    fn load(rig: &mut Rig, id: &str, events: &[(i64, &str, serde_json::Value)]) -> Arc<CustomerData> {
        let customer = rig.people.get_make(id);
        rig.grid.mount(customer);
        rig.grid.prepare().unwrap();
        for (stamp, name, extra) in events {
            let mut payload = serde_json::json!({ "event": name });
            if let Some(map) = extra.as_object() {
                for (k, v) in map {
                    payload[k] = v.clone();
                }
            }
            rig.grid
                .insert(
                    &mut rig.attrs,
                    &serde_json::json!({ "stamp": stamp, "_": payload }),
                )
                .unwrap();
        }
        let committed = rig.grid.commit().unwrap();
        rig.people.replace(committed.clone());
        committed
    }

    fn run(rig: &mut Rig, source: &str, customer: &Arc<CustomerData>) -> (ResultSet, Interpreter) {
        let mac = query::compile(source, &rig.schema).unwrap();
        let mut result = ResultSet::new(mac.aggs.len());
        let mut interp = Interpreter::new(mac, InterpretMode::Query);
        interp.set_blob(rig.attrs.blob().clone());
        interp.exec(&rig.grid, customer, &mut result).unwrap();
        (result, interp)
    }

    #[test]
    fn test_tally_counts_customer_once() {
        let mut rig = rig();
        let customer = load(
            &mut rig,
            "u",
            &[
                (1, "view", serde_json::json!({})),
                (2, "view", serde_json::json!({})),
            ],
        );
        let (result, _) = run(&mut rig, "each_row { tally() }", &customer);
        // dist_count_person: two rows, one customer
        let accums = result.results.values().next().unwrap();
        assert_eq!(accums[0].emit(Modifier::DistCountPerson), 1);
    }

    #[test]
    fn test_sum_and_group_by_product() {
        let mut rig = rig();
        let customer = load(
            &mut rig,
            "u",
            &[
                (1, "buy", serde_json::json!({"product": "pear", "price": 2.5})),
                (2, "buy", serde_json::json!({"product": "pear", "price": 1.0})),
                (3, "buy", serde_json::json!({"product": "fig", "price": 4.0})),
            ],
        );
        let (mut result, _) = run(
            &mut rig,
            "agg sum(price) as revenue\ngroup product\neach_row { tally() }",
            &customer,
        );
        result.make_sorted();
        assert_eq!(result.sorted.len(), 2);
        let pear_key = hash_str("pear");
        let pear = result
            .sorted
            .iter()
            .find(|(k, _)| k.key[0] == pear_key)
            .unwrap();
        assert_eq!(pear.1[0].emit(Modifier::Sum), 35_000); // 3.5 scaled
        assert_eq!(result.local_text.get(&pear_key).map(|s| s.as_str()), Some("pear"));
    }

    #[test]
    fn test_if_filters_rows() {
        let mut rig = rig();
        let customer = load(
            &mut rig,
            "u",
            &[
                (1, "buy", serde_json::json!({"score": 5})),
                (2, "buy", serde_json::json!({"score": 50})),
            ],
        );
        let (result, _) = run(
            &mut rig,
            "agg count(score)\neach_row { if score > 10 { tally() } }",
            &customer,
        );
        let accums = result.results.values().next().unwrap();
        assert_eq!(accums[0].emit(Modifier::Count), 1);
    }

    #[test]
    fn test_within_fuzzy_match() {
        let mut rig = rig();
        let minute = 60_000i64;
        let customer = load(
            &mut rig,
            "u",
            &[
                (0, "a", serde_json::json!({})),
                (3 * minute, "b", serde_json::json!({})),
                (30 * minute, "c", serde_json::json!({})),
            ],
        );
        let (result, _) = run(
            &mut rig,
            "agg count(event)\neach_row { if stamp within 5 minutes of 0 { tally() } }",
            &customer,
        );
        let accums = result.results.values().next().unwrap();
        assert_eq!(accums[0].emit(Modifier::Count), 2);
    }

    #[test]
    fn test_variables_and_math() {
        let mut rig = rig();
        let customer = load(&mut rig, "u", &[(1, "e", serde_json::json!({}))]);
        let mac = query::compile(
            "x = 2\nx += 3\nif x == 5 { each_row { tally() } }",
            &rig.schema,
        )
        .unwrap();
        let mut result = ResultSet::new(1);
        let mut interp = Interpreter::new(mac, InterpretMode::Query);
        interp.exec(&rig.grid, &customer, &mut result).unwrap();
        assert_eq!(result.results.len(), 1);
    }

    #[test]
    fn test_return_value_for_segments() {
        let mut rig = rig();
        let customer = load(
            &mut rig,
            "u",
            &[(1, "purchase", serde_json::json!({"score": 9}))],
        );
        let mac = query::compile(
            "each_row { if event == 'purchase' { return true } }\nreturn false",
            &rig.schema,
        )
        .unwrap();
        let mut result = ResultSet::new(1);
        let mut interp = Interpreter::new(mac, InterpretMode::Count);
        interp.exec(&rig.grid, &customer, &mut result).unwrap();
        assert!(interp.last_return_truthy());
    }

    #[test]
    fn test_segment_math_union() {
        let rig0 = rig();
        let mac = query::compile("return union('a', 'b')", &rig0.schema).unwrap();
        assert!(mac.is_segment_math);

        let mut a = IndexBits::new();
        a.bit_set(0);
        let mut b = IndexBits::new();
        b.bit_set(2);
        let mut interp = Interpreter::new(mac, InterpretMode::Count);
        interp.set_stop_bit(3);
        interp.set_segment_resolver(Box::new(move |name: &str| match name {
            "a" => Some(a.clone()),
            "b" => Some(b.clone()),
            _ => None,
        }));

        let mut rig = rig();
        let customer = load(&mut rig, "u", &[(1, "e", serde_json::json!({}))]);
        let mut result = ResultSet::new(1);
        interp.exec(&rig.grid, &customer, &mut result).unwrap();
        let bits = interp.last_return_bits().unwrap();
        assert!(bits.bit_state(0));
        assert!(!bits.bit_state(1));
        assert!(bits.bit_state(2));
    }

    #[test]
    fn test_unknown_segment_is_error() {
        let rig0 = rig();
        let mac = query::compile("return population('ghost')", &rig0.schema).unwrap();
        let mut interp = Interpreter::new(mac, InterpretMode::Count);
        interp.set_segment_resolver(Box::new(|_| None));
        let mut rig = rig();
        let customer = load(&mut rig, "u", &[(1, "e", serde_json::json!({}))]);
        let mut result = ResultSet::new(1);
        let err = interp.exec(&rig.grid, &customer, &mut result).unwrap_err();
        assert_eq!(err.code, ErrorCode::ItemNotFound);
    }

    #[test]
    fn test_segment_lanes_split_columns() {
        let mut rig = rig();
        let customer = load(&mut rig, "u", &[(1, "e", serde_json::json!({}))]);

        let mac = query::compile("each_row { tally() }", &rig.schema).unwrap();
        let mut in_lane = IndexBits::new();
        in_lane.bit_set(0); // linear id 0 is in the segment
        let out_lane = IndexBits::new();

        let mut interp = Interpreter::new(mac, InterpretMode::Query);
        interp.set_lanes(vec![
            ("yes".to_string(), in_lane),
            ("no".to_string(), out_lane),
        ]);
        let mut result = ResultSet::new(3); // 1 agg x 3 lanes
        interp.exec(&rig.grid, &customer, &mut result).unwrap();

        let accums = result.results.values().next().unwrap();
        assert_eq!(accums[0].count, 1); // primary
        assert_eq!(accums[1].count, 1); // in segment
        assert_eq!(accums[2].count, 0); // not in segment
    }

    #[test]
    fn test_exec_count_guard() {
        let mut rig = rig();
        let customer = load(&mut rig, "u", &[(1, "e", serde_json::json!({}))]);
        let mac = query::compile("each_row { x = 0 }", &rig.schema).unwrap();
        let mut interp = Interpreter::new(mac, InterpretMode::Query);
        interp.exec_limit = 1;
        let mut result = ResultSet::new(1);
        let err = interp.exec(&rig.grid, &customer, &mut result).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecCountExceeded);
    }
}
