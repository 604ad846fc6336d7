// The compiled query representation: opcodes, marshaled built-ins,
// index-hint ops and result column modifiers.

use serde::{Deserialize, Serialize};

/// Result column modifiers: how a tally folds a value into its
/// accumulator cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Sum,
    Min,
    Max,
    Avg,
    Count,
    DistCountPerson,
    Dist,
    Value,
    Var,
}

impl Modifier {
    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "sum" => Modifier::Sum,
            "min" => Modifier::Min,
            "max" => Modifier::Max,
            "avg" => Modifier::Avg,
            "count" => Modifier::Count,
            "people" => Modifier::DistCountPerson,
            "dist" => Modifier::Dist,
            "value" | "val" => Modifier::Value,
            "var" | "variable" => Modifier::Var,
            _ => return None,
        })
    }

    pub fn debug_name(&self) -> &'static str {
        match self {
            Modifier::Sum => "SUM",
            Modifier::Min => "MIN",
            Modifier::Max => "MAX",
            Modifier::Avg => "AVG",
            Modifier::Count => "COUNT",
            Modifier::DistCountPerson => "DCNTPP",
            Modifier::Dist => "DIST",
            Modifier::Value => "VALUE",
            Modifier::Var => "VAR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Nop,
    /// push first value of a property from the current row
    PshTblCol,
    /// push every value of a property from the current row as a list
    PshTblFlt,
    /// push a variable
    PshUsrVar,
    PshLitTrue,
    PshLitFalse,
    PshLitStr,
    PshLitInt,
    PshLitFlt,
    PshLitNul,
    /// pop into a variable
    PopUsrVar,
    /// condition: value = cond block, index = body block, extra = else block or -1
    CndIf,
    /// row iterators: index = body block
    ItForR,
    ItRForR,
    MathAdd,
    MathSub,
    MathMul,
    MathDiv,
    OpGt,
    OpLt,
    OpGte,
    OpLte,
    OpEq,
    OpNeq,
    /// fuzzy range: pops range, right, left
    OpWthn,
    OpNot,
    /// left contains all of right
    OpCont,
    /// left contains any of right
    OpAny,
    /// left in right
    OpIn,
    LgcAnd,
    LgcOr,
    /// call a built-in: value = marshal id, extra = argc
    Marshal,
    /// drop the top of stack (expression statements)
    Discard,
    /// exits the script, leaving return values behind
    Return,
    Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marshal {
    Tally,
    Now,
    Bucket,
    Round,
    Trunc,
    Fix,
    Iso8601ToStamp,
    ToSeconds,
    ToMinutes,
    ToHours,
    ToDays,
    GetSecond,
    RoundSecond,
    GetMinute,
    RoundMinute,
    GetHour,
    RoundHour,
    RoundDay,
    GetDayOfWeek,
    GetDayOfMonth,
    GetDayOfYear,
    RoundWeek,
    RoundMonth,
    GetMonth,
    GetQuarter,
    RoundQuarter,
    GetYear,
    RoundYear,
    RowCount,
    FirstStamp,
    LastStamp,
    SessionCount,
    Population,
    Intersection,
    Union,
    Compliment,
    Difference,
    Break,
    Continue,
    Log,
    InitList,
    InitDict,
    Set,
    Len,
    Append,
    Keys,
    Range,
}

impl Marshal {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "tally" => Marshal::Tally,
            "now" => Marshal::Now,
            "bucket" => Marshal::Bucket,
            "round" => Marshal::Round,
            "trunc" => Marshal::Trunc,
            "fix" => Marshal::Fix,
            "iso8601_to_stamp" => Marshal::Iso8601ToStamp,
            "to_seconds" => Marshal::ToSeconds,
            "to_minutes" => Marshal::ToMinutes,
            "to_hours" => Marshal::ToHours,
            "to_days" => Marshal::ToDays,
            "get_second" => Marshal::GetSecond,
            "round_second" => Marshal::RoundSecond,
            "get_minute" => Marshal::GetMinute,
            "round_minute" => Marshal::RoundMinute,
            "get_hour" => Marshal::GetHour,
            "round_hour" => Marshal::RoundHour,
            "round_day" => Marshal::RoundDay,
            "get_day_of_week" => Marshal::GetDayOfWeek,
            "get_day_of_month" => Marshal::GetDayOfMonth,
            "get_day_of_year" => Marshal::GetDayOfYear,
            "round_week" => Marshal::RoundWeek,
            "round_month" => Marshal::RoundMonth,
            "get_month" => Marshal::GetMonth,
            "get_quarter" => Marshal::GetQuarter,
            "round_quarter" => Marshal::RoundQuarter,
            "get_year" => Marshal::GetYear,
            "round_year" => Marshal::RoundYear,
            "row_count" => Marshal::RowCount,
            "first_stamp" => Marshal::FirstStamp,
            "last_stamp" => Marshal::LastStamp,
            "session_count" => Marshal::SessionCount,
            "population" => Marshal::Population,
            "intersection" => Marshal::Intersection,
            "union" => Marshal::Union,
            "compliment" => Marshal::Compliment,
            "difference" => Marshal::Difference,
            "log" => Marshal::Log,
            "list" => Marshal::InitList,
            "dict" => Marshal::InitDict,
            "set" => Marshal::Set,
            "len" => Marshal::Len,
            "append" => Marshal::Append,
            "keys" => Marshal::Keys,
            "range" => Marshal::Range,
            _ => return None,
        })
    }

    /// Recover a marshal from the id stored in an instruction. Order
    /// matches declaration order.
    pub fn from_i64(value: i64) -> Option<Self> {
        const ALL: &[Marshal] = &[
            Marshal::Tally,
            Marshal::Now,
            Marshal::Bucket,
            Marshal::Round,
            Marshal::Trunc,
            Marshal::Fix,
            Marshal::Iso8601ToStamp,
            Marshal::ToSeconds,
            Marshal::ToMinutes,
            Marshal::ToHours,
            Marshal::ToDays,
            Marshal::GetSecond,
            Marshal::RoundSecond,
            Marshal::GetMinute,
            Marshal::RoundMinute,
            Marshal::GetHour,
            Marshal::RoundHour,
            Marshal::RoundDay,
            Marshal::GetDayOfWeek,
            Marshal::GetDayOfMonth,
            Marshal::GetDayOfYear,
            Marshal::RoundWeek,
            Marshal::RoundMonth,
            Marshal::GetMonth,
            Marshal::GetQuarter,
            Marshal::RoundQuarter,
            Marshal::GetYear,
            Marshal::RoundYear,
            Marshal::RowCount,
            Marshal::FirstStamp,
            Marshal::LastStamp,
            Marshal::SessionCount,
            Marshal::Population,
            Marshal::Intersection,
            Marshal::Union,
            Marshal::Compliment,
            Marshal::Difference,
            Marshal::Break,
            Marshal::Continue,
            Marshal::Log,
            Marshal::InitList,
            Marshal::InitDict,
            Marshal::Set,
            Marshal::Len,
            Marshal::Append,
            Marshal::Keys,
            Marshal::Range,
        ];
        usize::try_from(value).ok().and_then(|i| ALL.get(i).copied())
    }

    /// Segment-math marshals combine other segments with no customer
    /// iteration at all.
    pub fn is_segment_math(&self) -> bool {
        matches!(
            self,
            Marshal::Population
                | Marshal::Intersection
                | Marshal::Union
                | Marshal::Compliment
                | Marshal::Difference
        )
    }
}

/// Index planner ops: a reverse-Polish program over attribute scans.
#[derive(Debug, Clone, PartialEq)]
pub enum HintOp {
    PushProp(String),
    /// comparable value: int/bool as-is, doubles scaled, text hashed
    PushValue(HintValue),
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    BitAnd,
    BitOr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HintValue {
    None,
    Number(i64),
    Text(String),
}

/// Where an instruction came from, for error attribution.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub line: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub op: OpCode,
    /// property slot, variable slot, literal slot or block index
    pub index: i32,
    /// literal value, condition block or marshal id
    pub value: i64,
    /// else block, argc
    pub extra: i64,
    pub dbg: DebugInfo,
}

impl Instr {
    pub fn new(op: OpCode, dbg: DebugInfo) -> Self {
        Self {
            op,
            index: -1,
            value: 0,
            extra: -1,
            dbg,
        }
    }
}
