// Recursive-descent compiler: token stream -> Macro.
//
// Statements emit into the current bytecode block; `if` conditions and
// loop bodies get blocks of their own. The `where` clause never reaches
// the interpreter - it compiles straight to the index-hint program the
// planner evaluates against the attribute store.

use super::lexer::{lex, Lexed, Tok};
use super::ops::*;
use super::{AggSpec, Macro, PropRef};
use crate::common::scale_double;
use crate::error::{Error, ErrorCode, Result};
use crate::table::properties::{Properties, PropType};
use std::collections::HashMap;

const MAX_GROUP_DEPTH: usize = 3;

pub struct Parser<'a> {
    toks: Vec<Lexed>,
    pos: usize,
    schema: &'a Properties,
    mac: Macro,
    var_map: HashMap<String, i32>,
    prop_map: HashMap<String, i32>,
    has_body_logic: bool,
    has_where: bool,
}

impl<'a> Parser<'a> {
    pub fn new(source: &str, schema: &'a Properties) -> Result<Self> {
        Ok(Self {
            toks: lex(source)?,
            pos: 0,
            schema,
            mac: Macro::default(),
            var_map: HashMap::new(),
            prop_map: HashMap::new(),
            has_body_logic: false,
            has_where: false,
        })
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos].tok
    }

    fn line(&self) -> u32 {
        self.toks[self.pos].line
    }

    fn next(&mut self) -> Tok {
        let tok = self.toks[self.pos].tok.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Tok) -> Result<()> {
        if self.peek() == expected {
            self.next();
            Ok(())
        } else {
            Err(self.err(format!("expected {expected:?}, found {:?}", self.peek())))
        }
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Tok::Ident(name) if name == word) {
            self.next();
            true
        } else {
            false
        }
    }

    fn err(&self, detail: String) -> Error {
        Error::parse(ErrorCode::SyntaxError, detail)
            .with_additional(format!("line {}", self.line()))
    }

    fn dbg(&self) -> DebugInfo {
        DebugInfo {
            line: self.line(),
            text: String::new(),
        }
    }

    fn prop_slot(&mut self, name: &str) -> Result<i32> {
        if let Some(&slot) = self.prop_map.get(name) {
            return Ok(slot);
        }
        let prop = self.schema.require(name)?;
        let slot = self.mac.props.len() as i32;
        self.mac.props.push(PropRef {
            id: prop.id,
            name: prop.name.clone(),
            ptype: prop.ptype,
            is_set: prop.is_set,
            is_customer: prop.is_customer,
        });
        self.prop_map.insert(name.to_string(), slot);
        Ok(slot)
    }

    fn var_slot(&mut self, name: &str) -> i32 {
        if let Some(&slot) = self.var_map.get(name) {
            return slot;
        }
        let slot = self.mac.vars.len() as i32;
        self.mac.vars.push(name.to_string());
        self.var_map.insert(name.to_string(), slot);
        slot
    }

    fn literal_slot(&mut self, text: &str) -> i32 {
        if let Some(pos) = self.mac.literals.iter().position(|l| l == text) {
            return pos as i32;
        }
        self.mac.literals.push(text.to_string());
        (self.mac.literals.len() - 1) as i32
    }

    fn new_block(&mut self) -> usize {
        self.mac.blocks.push(Vec::new());
        self.mac.blocks.len() - 1
    }

    pub fn parse(mut self) -> Result<Macro> {
        let entry = self.new_block();
        let mut code = Vec::new();
        while *self.peek() != Tok::Eof {
            self.parse_statement(&mut code)?;
        }
        code.push(Instr::new(OpCode::Term, DebugInfo::default()));
        self.mac.blocks[entry] = code;

        if self.mac.aggs.is_empty() {
            self.mac.aggs.push(AggSpec {
                name: "count".to_string(),
                modifier: Modifier::DistCountPerson,
                prop: None,
            });
        }
        self.mac.index_is_countable = self.has_where && !self.has_body_logic;
        self.mac.capture_return = self
            .mac
            .blocks
            .iter()
            .any(|b| b.iter().any(|i| i.op == OpCode::Return));
        Ok(self.mac)
    }

    fn parse_statement(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        match self.peek().clone() {
            Tok::Ident(word) => match word.as_str() {
                "agg" => {
                    self.next();
                    self.parse_agg()
                }
                "group" => {
                    self.next();
                    self.parse_group()
                }
                "where" => {
                    self.next();
                    self.parse_where()
                }
                "each_row" => {
                    self.next();
                    self.has_body_logic = true;
                    let reverse = self.eat_ident("reverse");
                    let body = self.parse_block()?;
                    let mut instr = Instr::new(
                        if reverse {
                            OpCode::ItRForR
                        } else {
                            OpCode::ItForR
                        },
                        self.dbg(),
                    );
                    instr.index = body as i32;
                    code.push(instr);
                    Ok(())
                }
                "if" => {
                    self.next();
                    self.has_body_logic = true;
                    self.parse_if(code)
                }
                "return" => {
                    self.next();
                    self.has_body_logic = true;
                    if matches!(self.peek(), Tok::RBrace | Tok::Eof) {
                        code.push(Instr::new(OpCode::PshLitNul, self.dbg()));
                    } else {
                        self.parse_expr(code)?;
                    }
                    code.push(Instr::new(OpCode::Return, self.dbg()));
                    Ok(())
                }
                "break" => {
                    self.next();
                    self.has_body_logic = true;
                    let mut instr = Instr::new(OpCode::Marshal, self.dbg());
                    instr.value = Marshal::Break as i64;
                    instr.extra = 0;
                    code.push(instr);
                    Ok(())
                }
                "continue" => {
                    self.next();
                    self.has_body_logic = true;
                    let mut instr = Instr::new(OpCode::Marshal, self.dbg());
                    instr.value = Marshal::Continue as i64;
                    instr.extra = 0;
                    code.push(instr);
                    Ok(())
                }
                "exit" => {
                    self.next();
                    self.has_body_logic = true;
                    code.push(Instr::new(OpCode::Term, self.dbg()));
                    Ok(())
                }
                _ => {
                    // assignment or expression statement
                    self.has_body_logic = true;
                    let assign_op = self.toks.get(self.pos + 1).map(|l| l.tok.clone());
                    match assign_op {
                        Some(Tok::Assign) => {
                            self.next();
                            self.next();
                            let slot = self.var_slot(&word);
                            self.parse_expr(code)?;
                            let mut instr = Instr::new(OpCode::PopUsrVar, self.dbg());
                            instr.index = slot;
                            code.push(instr);
                            Ok(())
                        }
                        Some(Tok::PlusEq) | Some(Tok::MinusEq) | Some(Tok::StarEq)
                        | Some(Tok::SlashEq) => {
                            self.next();
                            let op = self.next();
                            let slot = self.var_slot(&word);
                            let mut push = Instr::new(OpCode::PshUsrVar, self.dbg());
                            push.index = slot;
                            code.push(push);
                            self.parse_expr(code)?;
                            code.push(Instr::new(
                                match op {
                                    Tok::PlusEq => OpCode::MathAdd,
                                    Tok::MinusEq => OpCode::MathSub,
                                    Tok::StarEq => OpCode::MathMul,
                                    _ => OpCode::MathDiv,
                                },
                                self.dbg(),
                            ));
                            let mut pop = Instr::new(OpCode::PopUsrVar, self.dbg());
                            pop.index = slot;
                            code.push(pop);
                            Ok(())
                        }
                        _ => {
                            self.parse_expr(code)?;
                            code.push(Instr::new(OpCode::Discard, self.dbg()));
                            Ok(())
                        }
                    }
                }
            },
            Tok::Eof => Ok(()),
            other => Err(self.err(format!("unexpected {other:?}"))),
        }
    }

    fn parse_block(&mut self) -> Result<usize> {
        self.eat(&Tok::LBrace)?;
        let block = self.new_block();
        let mut code = Vec::new();
        while *self.peek() != Tok::RBrace {
            if *self.peek() == Tok::Eof {
                return Err(self.err("unterminated block".to_string()));
            }
            self.parse_statement(&mut code)?;
        }
        self.eat(&Tok::RBrace)?;
        self.mac.blocks[block] = code;
        Ok(block)
    }

    fn parse_if(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        let cond = self.new_block();
        let mut cond_code = Vec::new();
        self.parse_expr(&mut cond_code)?;
        self.mac.blocks[cond] = cond_code;

        let body = self.parse_block()?;

        let mut else_block: i64 = -1;
        if self.eat_ident("else") {
            if matches!(self.peek(), Tok::Ident(w) if w == "if") {
                // else-if chains nest through a synthesized block
                let chain = self.new_block();
                let mut chain_code = Vec::new();
                self.next(); // consume 'if'
                self.parse_if(&mut chain_code)?;
                self.mac.blocks[chain] = chain_code;
                else_block = chain as i64;
            } else {
                else_block = self.parse_block()? as i64;
            }
        }

        let mut instr = Instr::new(OpCode::CndIf, self.dbg());
        instr.value = cond as i64;
        instr.index = body as i32;
        instr.extra = else_block;
        code.push(instr);
        Ok(())
    }

    fn parse_agg(&mut self) -> Result<()> {
        loop {
            let Tok::Ident(word) = self.next() else {
                return Err(self.err("expected aggregate".to_string()));
            };
            let modifier = Modifier::parse(&word)
                .ok_or_else(|| self.err(format!("unknown aggregate '{word}'")))?;

            let mut prop = None;
            if *self.peek() == Tok::LParen {
                self.next();
                let Tok::Ident(name) = self.next() else {
                    return Err(self.err("expected property".to_string()));
                };
                prop = Some(self.prop_slot(&name)?);
                self.eat(&Tok::RParen)?;
            }

            let mut name = match prop {
                Some(slot) => format!(
                    "{}_{}",
                    word,
                    self.mac.props[slot as usize].name.clone()
                ),
                None => word.clone(),
            };
            if self.eat_ident("as") {
                let Tok::Ident(alias) = self.next() else {
                    return Err(self.err("expected alias".to_string()));
                };
                name = alias;
            }

            if modifier != Modifier::DistCountPerson && modifier != Modifier::Count && prop.is_none()
            {
                return Err(self.err(format!("aggregate '{word}' needs a property")));
            }

            self.mac.aggs.push(AggSpec {
                name,
                modifier,
                prop,
            });

            if *self.peek() == Tok::Comma {
                self.next();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn parse_group(&mut self) -> Result<()> {
        loop {
            let Tok::Ident(name) = self.next() else {
                return Err(self.err("expected property in group".to_string()));
            };
            if self.mac.group_props.len() >= MAX_GROUP_DEPTH {
                return Err(self.err(format!("group depth is limited to {MAX_GROUP_DEPTH}")));
            }
            let slot = self.prop_slot(&name)?;
            self.mac.group_props.push(slot);
            if *self.peek() == Tok::Comma {
                self.next();
            } else {
                break;
            }
        }
        Ok(())
    }

    // ---- where clause -> index hints -------------------------------------

    fn parse_where(&mut self) -> Result<()> {
        if self.has_where {
            return Err(self.err("only one where clause is allowed".to_string()));
        }
        self.has_where = true;
        let mut hints = Vec::new();
        self.parse_hint_or(&mut hints)?;
        self.mac.index_hints = hints;
        Ok(())
    }

    fn parse_hint_or(&mut self, hints: &mut Vec<HintOp>) -> Result<()> {
        self.parse_hint_and(hints)?;
        while *self.peek() == Tok::OrOr || matches!(self.peek(), Tok::Ident(w) if w == "or") {
            self.next();
            self.parse_hint_and(hints)?;
            hints.push(HintOp::BitOr);
        }
        Ok(())
    }

    fn parse_hint_and(&mut self, hints: &mut Vec<HintOp>) -> Result<()> {
        self.parse_hint_term(hints)?;
        while *self.peek() == Tok::AndAnd || matches!(self.peek(), Tok::Ident(w) if w == "and") {
            self.next();
            self.parse_hint_term(hints)?;
            hints.push(HintOp::BitAnd);
        }
        Ok(())
    }

    fn parse_hint_term(&mut self, hints: &mut Vec<HintOp>) -> Result<()> {
        if *self.peek() == Tok::LParen {
            self.next();
            self.parse_hint_or(hints)?;
            return self.eat(&Tok::RParen);
        }

        let Tok::Ident(name) = self.next() else {
            return Err(self.err("where expects a property comparison".to_string()));
        };
        let prop = self.schema.require(&name)?.clone();
        hints.push(HintOp::PushProp(prop.name.clone()));

        // `is present` / `is none`
        if self.eat_ident("is") {
            if self.eat_ident("present") {
                hints.push(HintOp::PushValue(HintValue::None));
                hints.push(HintOp::Neq);
            } else if self.eat_ident("none") {
                hints.push(HintOp::PushValue(HintValue::None));
                hints.push(HintOp::Eq);
            } else {
                return Err(self.err("expected 'present' or 'none' after 'is'".to_string()));
            }
            return Ok(());
        }

        let op = match self.next() {
            Tok::EqEq => HintOp::Eq,
            Tok::NotEq => HintOp::Neq,
            Tok::Gt => HintOp::Gt,
            Tok::Gte => HintOp::Gte,
            Tok::Lt => HintOp::Lt,
            Tok::Lte => HintOp::Lte,
            other => return Err(self.err(format!("bad comparison {other:?} in where"))),
        };
        if prop.ptype == PropType::Text && !matches!(op, HintOp::Eq | HintOp::Neq) {
            return Err(self.err(format!("text property '{name}' supports == and != only")));
        }

        let value = match self.next() {
            Tok::Int(v) => HintValue::Number(match prop.ptype {
                PropType::Double => v * crate::common::UNIT_SCALE,
                _ => v,
            }),
            Tok::Float(v) => HintValue::Number(scale_double(v)),
            Tok::Str(text) => HintValue::Text(text),
            Tok::Ident(word) if word == "true" => HintValue::Number(1),
            Tok::Ident(word) if word == "false" => HintValue::Number(0),
            Tok::Ident(word) if word == "none" => HintValue::None,
            other => return Err(self.err(format!("bad literal {other:?} in where"))),
        };
        hints.push(HintOp::PushValue(value));
        hints.push(op);
        Ok(())
    }

    // ---- expressions ------------------------------------------------------

    fn parse_expr(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        self.parse_or(code)
    }

    fn parse_or(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        self.parse_and(code)?;
        loop {
            if *self.peek() == Tok::OrOr || matches!(self.peek(), Tok::Ident(w) if w == "or") {
                self.next();
                self.parse_and(code)?;
                code.push(Instr::new(OpCode::LgcOr, self.dbg()));
            } else {
                return Ok(());
            }
        }
    }

    fn parse_and(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        self.parse_cmp(code)?;
        loop {
            if *self.peek() == Tok::AndAnd || matches!(self.peek(), Tok::Ident(w) if w == "and") {
                self.next();
                self.parse_cmp(code)?;
                code.push(Instr::new(OpCode::LgcAnd, self.dbg()));
            } else {
                return Ok(());
            }
        }
    }

    fn time_unit(&mut self) -> Result<i64> {
        let Tok::Ident(unit) = self.next() else {
            return Err(self.err("expected time unit".to_string()));
        };
        match unit.as_str() {
            "second" | "seconds" => Ok(1_000),
            "minute" | "minutes" => Ok(60_000),
            "hour" | "hours" => Ok(3_600_000),
            "day" | "days" => Ok(86_400_000),
            other => Err(Error::parse(
                ErrorCode::DateWithinMalformed,
                format!("unknown time unit '{other}'"),
            )),
        }
    }

    fn parse_cmp(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        self.parse_add(code)?;

        // `a within N <unit> of b` - fuzzy stamp range
        if matches!(self.peek(), Tok::Ident(w) if w == "within") {
            self.next();
            let count = match self.next() {
                Tok::Int(v) => v,
                other => {
                    return Err(Error::parse(
                        ErrorCode::DateWithinMalformed,
                        format!("within expects a count, found {other:?}"),
                    ))
                }
            };
            let unit = self.time_unit()?;
            if !self.eat_ident("of") {
                return Err(Error::parse(
                    ErrorCode::DateWithinMalformed,
                    "within expects 'of'",
                ));
            }
            self.parse_add(code)?;
            let mut range = Instr::new(OpCode::PshLitInt, self.dbg());
            range.value = count * unit;
            code.push(range);
            code.push(Instr::new(OpCode::OpWthn, self.dbg()));
            return Ok(());
        }

        if matches!(self.peek(), Tok::Ident(w) if w == "is") {
            self.next();
            let negate = self.eat_ident("not");
            if self.eat_ident("present") {
                code.push(Instr::new(OpCode::PshLitNul, self.dbg()));
                code.push(Instr::new(
                    if negate { OpCode::OpEq } else { OpCode::OpNeq },
                    self.dbg(),
                ));
                return Ok(());
            }
            if self.eat_ident("none") {
                code.push(Instr::new(OpCode::PshLitNul, self.dbg()));
                code.push(Instr::new(
                    if negate { OpCode::OpNeq } else { OpCode::OpEq },
                    self.dbg(),
                ));
                return Ok(());
            }
            return Err(self.err("expected 'present' or 'none' after 'is'".to_string()));
        }

        let op = match self.peek() {
            Tok::EqEq => Some(OpCode::OpEq),
            Tok::NotEq => Some(OpCode::OpNeq),
            Tok::Gt => Some(OpCode::OpGt),
            Tok::Gte => Some(OpCode::OpGte),
            Tok::Lt => Some(OpCode::OpLt),
            Tok::Lte => Some(OpCode::OpLte),
            Tok::Ident(w) if w == "in" => Some(OpCode::OpIn),
            Tok::Ident(w) if w == "contains" => Some(OpCode::OpCont),
            Tok::Ident(w) if w == "any" => Some(OpCode::OpAny),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            self.parse_add(code)?;
            code.push(Instr::new(op, self.dbg()));
        }
        Ok(())
    }

    fn parse_add(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        self.parse_mul(code)?;
        loop {
            let op = match self.peek() {
                Tok::Plus => OpCode::MathAdd,
                Tok::Minus => OpCode::MathSub,
                _ => return Ok(()),
            };
            self.next();
            self.parse_mul(code)?;
            code.push(Instr::new(op, self.dbg()));
        }
    }

    fn parse_mul(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        self.parse_unary(code)?;
        loop {
            let op = match self.peek() {
                Tok::Star => OpCode::MathMul,
                Tok::Slash => OpCode::MathDiv,
                _ => return Ok(()),
            };
            self.next();
            self.parse_unary(code)?;
            code.push(Instr::new(op, self.dbg()));
        }
    }

    fn parse_unary(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        match self.peek() {
            Tok::Bang => {
                self.next();
                self.parse_unary(code)?;
                code.push(Instr::new(OpCode::OpNot, self.dbg()));
                Ok(())
            }
            Tok::Ident(w) if w == "not" => {
                self.next();
                self.parse_unary(code)?;
                code.push(Instr::new(OpCode::OpNot, self.dbg()));
                Ok(())
            }
            Tok::Minus => {
                self.next();
                let mut zero = Instr::new(OpCode::PshLitInt, self.dbg());
                zero.value = 0;
                code.push(zero);
                self.parse_unary(code)?;
                code.push(Instr::new(OpCode::MathSub, self.dbg()));
                Ok(())
            }
            _ => self.parse_primary(code),
        }
    }

    fn parse_call(&mut self, name: &str, code: &mut Vec<Instr>) -> Result<()> {
        let marshal = Marshal::parse(name)
            .ok_or_else(|| self.err(format!("unknown function '{name}'")))?;
        if marshal.is_segment_math() {
            self.mac.is_segment_math = true;
        }
        self.eat(&Tok::LParen)?;
        let mut argc = 0i64;
        while *self.peek() != Tok::RParen {
            self.parse_expr(code)?;
            argc += 1;
            if *self.peek() == Tok::Comma {
                self.next();
            } else {
                break;
            }
        }
        self.eat(&Tok::RParen)?;
        let mut instr = Instr::new(OpCode::Marshal, self.dbg());
        instr.value = marshal as i64;
        instr.extra = argc;
        code.push(instr);
        Ok(())
    }

    fn parse_primary(&mut self, code: &mut Vec<Instr>) -> Result<()> {
        match self.next() {
            Tok::Int(v) => {
                let mut instr = Instr::new(OpCode::PshLitInt, self.dbg());
                instr.value = v;
                code.push(instr);
                Ok(())
            }
            Tok::Float(v) => {
                let mut instr = Instr::new(OpCode::PshLitFlt, self.dbg());
                instr.value = scale_double(v);
                code.push(instr);
                Ok(())
            }
            Tok::Str(text) => {
                let mut instr = Instr::new(OpCode::PshLitStr, self.dbg());
                instr.index = self.literal_slot(&text);
                code.push(instr);
                Ok(())
            }
            Tok::LParen => {
                self.parse_expr(code)?;
                self.eat(&Tok::RParen)
            }
            Tok::LBracket => {
                let mut argc = 0i64;
                while *self.peek() != Tok::RBracket {
                    self.parse_expr(code)?;
                    argc += 1;
                    if *self.peek() == Tok::Comma {
                        self.next();
                    } else {
                        break;
                    }
                }
                self.eat(&Tok::RBracket)?;
                let mut instr = Instr::new(OpCode::Marshal, self.dbg());
                instr.value = Marshal::InitList as i64;
                instr.extra = argc;
                code.push(instr);
                Ok(())
            }
            Tok::Ident(word) => match word.as_str() {
                "true" => {
                    code.push(Instr::new(OpCode::PshLitTrue, self.dbg()));
                    Ok(())
                }
                "false" => {
                    code.push(Instr::new(OpCode::PshLitFalse, self.dbg()));
                    Ok(())
                }
                "none" => {
                    code.push(Instr::new(OpCode::PshLitNul, self.dbg()));
                    Ok(())
                }
                _ => {
                    if *self.peek() == Tok::LParen {
                        return self.parse_call(&word, code);
                    }
                    if self.schema.get(&word).is_some() {
                        let slot = self.prop_slot(&word)?;
                        let is_set = self.mac.props[slot as usize].is_set;
                        let mut instr = Instr::new(
                            if is_set {
                                OpCode::PshTblFlt
                            } else {
                                OpCode::PshTblCol
                            },
                            self.dbg(),
                        );
                        instr.index = slot;
                        code.push(instr);
                        Ok(())
                    } else {
                        let slot = self.var_slot(&word);
                        let mut instr = Instr::new(OpCode::PshUsrVar, self.dbg());
                        instr.index = slot;
                        code.push(instr);
                        Ok(())
                    }
                }
            },
            other => Err(self.err(format!("unexpected {other:?} in expression"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::properties::Properties;

    fn schema() -> Properties {
        let mut schema = Properties::new();
        schema.add("product", PropType::Text, true, false).unwrap();
        schema.add("price", PropType::Double, false, false).unwrap();
        schema.add("plan", PropType::Text, false, true).unwrap();
        schema.add("score", PropType::Int, false, false).unwrap();
        schema
    }

    fn compile(source: &str) -> Macro {
        Parser::new(source, &schema()).unwrap().parse().unwrap()
    }

    #[test]
    fn test_default_agg_is_people() {
        let mac = compile("each_row { tally() }");
        assert_eq!(mac.aggs.len(), 1);
        assert_eq!(mac.aggs[0].modifier, Modifier::DistCountPerson);
    }

    #[test]
    fn test_agg_and_group_clauses() {
        let mac = compile(
            "agg people, sum(price) as revenue, count(event)\n\
             group product\n\
             each_row { tally() }",
        );
        assert_eq!(mac.aggs.len(), 3);
        assert_eq!(mac.aggs[1].name, "revenue");
        assert_eq!(mac.aggs[1].modifier, Modifier::Sum);
        assert_eq!(mac.group_props.len(), 1);
    }

    #[test]
    fn test_where_compiles_to_hint_rpn() {
        let mac = compile("where product == 'pear' || score > 10");
        assert!(mac.index_is_countable);
        // prop, value, EQ, prop, value, GT, OR
        assert_eq!(mac.index_hints.len(), 7);
        assert_eq!(mac.index_hints[6], HintOp::BitOr);
        assert_eq!(mac.index_hints[2], HintOp::Eq);
    }

    #[test]
    fn test_body_logic_clears_countable() {
        let mac = compile("where score > 1\neach_row { tally() }");
        assert!(!mac.index_is_countable);
        assert!(!mac.index_hints.is_empty());
    }

    #[test]
    fn test_double_literal_scaled_in_where() {
        let mac = compile("where price >= 2.5");
        assert!(mac
            .index_hints
            .iter()
            .any(|h| *h == HintOp::PushValue(HintValue::Number(25_000))));
    }

    #[test]
    fn test_unknown_property_errors() {
        let err = Parser::new("where frogs == 1", &schema())
            .unwrap()
            .parse()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PropertyNotInTable);
    }

    #[test]
    fn test_unknown_function_errors() {
        assert!(Parser::new("each_row { frobnicate(1) }", &schema())
            .unwrap()
            .parse()
            .is_err());
    }

    #[test]
    fn test_within_emits_fuzzy_compare() {
        let mac = compile("each_row { if stamp within 5 minutes of 1000 { tally() } }");
        let has_wthn = mac
            .blocks
            .iter()
            .any(|b| b.iter().any(|i| i.op == OpCode::OpWthn));
        assert!(has_wthn);
    }

    #[test]
    fn test_segment_math_flag() {
        let mac = compile("return union('plan_a', 'plan_b')");
        assert!(mac.is_segment_math);
        assert!(mac.capture_return);
    }

    #[test]
    fn test_else_if_chain() {
        let mac = compile(
            "each_row {\n\
               if score > 10 { tally() }\n\
               else if score > 5 { tally() }\n\
               else { tally() }\n\
             }",
        );
        assert!(mac.blocks.len() >= 5);
    }

    #[test]
    fn test_text_property_ordering_rejected_in_where() {
        assert!(Parser::new("where product > 'a'", &schema())
            .unwrap()
            .parse()
            .is_err());
    }
}
