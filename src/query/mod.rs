// Query compilation and execution.
//
// A query document is one or more sections. Sections start with an
// `@segment name param=value ...` (or `@query name`) header line; a
// headerless document is a single anonymous query. Each section body
// compiles to a `Macro`: bytecode blocks for the interpreter plus an
// index-hint program for the planner.

pub mod indexing;
pub mod interpreter;
pub mod lexer;
pub mod ops;
pub mod parser;

pub use interpreter::{InterpretMode, Interpreter, Value};
pub use ops::*;

use crate::error::{Error, ErrorCode, Result};
use crate::table::properties::{Properties, PropType};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PropRef {
    pub id: u32,
    pub name: String,
    pub ptype: PropType,
    pub is_set: bool,
    pub is_customer: bool,
}

#[derive(Debug, Clone)]
pub struct AggSpec {
    pub name: String,
    pub modifier: Modifier,
    /// slot in `Macro::props`; None for customer counting
    pub prop: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct SegmentFlags {
    pub ttl_ms: i64,
    pub refresh_ms: i64,
    pub on_insert: bool,
    pub z_index: i64,
    pub use_cached: bool,
}

impl Default for SegmentFlags {
    fn default() -> Self {
        Self {
            ttl_ms: 0,
            refresh_ms: 60_000,
            on_insert: false,
            z_index: 100,
            use_cached: false,
        }
    }
}

/// A compiled query.
#[derive(Debug, Clone, Default)]
pub struct Macro {
    pub blocks: Vec<Vec<Instr>>,
    pub vars: Vec<String>,
    pub props: Vec<PropRef>,
    pub literals: Vec<String>,
    pub aggs: Vec<AggSpec>,
    /// group-by property slots, outermost first (max 3)
    pub group_props: Vec<i32>,
    pub index_hints: Vec<HintOp>,
    /// the whole filter maps onto the hint plan; segment refresh can run
    /// as pure index math
    pub index_is_countable: bool,
    pub is_segment_math: bool,
    pub capture_return: bool,
    pub segment: Option<SegmentFlags>,
}

impl Macro {
    /// User property names this query touches; feeds the grid projection.
    pub fn referenced_names(&self) -> Vec<String> {
        self.props.iter().map(|p| p.name.clone()).collect()
    }

    pub fn result_width(&self) -> usize {
        self.aggs.len().max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Query,
    Segment,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    pub name: String,
    pub params: HashMap<String, String>,
    pub body: String,
    pub flags: SegmentFlags,
}

fn parse_flags(params: &HashMap<String, String>) -> Result<SegmentFlags> {
    let mut flags = SegmentFlags::default();
    for (key, value) in params {
        match key.as_str() {
            "ttl" => {
                flags.ttl_ms = value
                    .parse::<i64>()
                    .map_err(|_| Error::parse(ErrorCode::SyntaxError, "bad ttl"))?
                    * 1000
            }
            "refresh" => {
                flags.refresh_ms = value
                    .parse::<i64>()
                    .map_err(|_| Error::parse(ErrorCode::SyntaxError, "bad refresh"))?
                    * 1000
            }
            "z_index" => {
                flags.z_index = value
                    .parse::<i64>()
                    .map_err(|_| Error::parse(ErrorCode::SyntaxError, "bad z_index"))?
            }
            "on_insert" => flags.on_insert = value == "true" || value.is_empty(),
            "use_cached" => flags.use_cached = value == "true" || value.is_empty(),
            other => {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    format!("unknown segment parameter '{other}'"),
                ))
            }
        }
    }
    Ok(flags)
}

/// Split a document into sections on `@segment` / `@query` header lines.
/// A document with no headers is one anonymous query section.
pub fn parse_sections(source: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    let mut pending: Option<(SectionKind, String, HashMap<String, String>)> = None;
    let mut body = String::new();
    let mut saw_header = false;

    let mut flush =
        |pending: &mut Option<(SectionKind, String, HashMap<String, String>)>,
         body: &mut String,
         sections: &mut Vec<Section>|
         -> Result<()> {
            if let Some((kind, name, params)) = pending.take() {
                let flags = parse_flags(&params)?;
                sections.push(Section {
                    kind,
                    name,
                    params,
                    body: std::mem::take(body),
                    flags,
                });
            }
            body.clear(); // text before the first header belongs to no section
            Ok(())
        };

    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(header) = trimmed.strip_prefix('@') {
            saw_header = true;
            flush(&mut pending, &mut body, &mut sections)?;

            let mut parts = header.split_whitespace();
            let kind = match parts.next() {
                Some("segment") => SectionKind::Segment,
                Some("query") => SectionKind::Query,
                other => {
                    return Err(Error::parse(
                        ErrorCode::SyntaxError,
                        format!("unknown section header '@{}'", other.unwrap_or("")),
                    ))
                }
            };
            let name = parts
                .next()
                .ok_or_else(|| Error::parse(ErrorCode::SyntaxError, "section missing name"))?
                .to_string();
            let mut params = HashMap::new();
            for part in parts {
                match part.split_once('=') {
                    Some((key, value)) => {
                        params.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        params.insert(part.to_string(), String::new());
                    }
                }
            }
            pending = Some((kind, name, params));
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    if saw_header {
        flush(&mut pending, &mut body, &mut sections)?;
    } else {
        sections.push(Section {
            kind: SectionKind::Query,
            name: "_".to_string(),
            params: HashMap::new(),
            body,
            flags: SegmentFlags::default(),
        });
    }
    Ok(sections)
}

/// Compile one section body against a table schema.
pub fn compile(source: &str, schema: &Properties) -> Result<Arc<Macro>> {
    let sections = parse_sections(source)?;
    let section = sections
        .first()
        .ok_or_else(|| Error::parse(ErrorCode::SyntaxError, "empty query"))?;
    compile_section(section, schema)
}

pub fn compile_section(section: &Section, schema: &Properties) -> Result<Arc<Macro>> {
    let mut compiled = parser::Parser::new(&section.body, schema)?.parse()?;
    if section.kind == SectionKind::Segment {
        compiled.segment = Some(section.flags.clone());
    }
    Ok(Arc::new(compiled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_headerless() {
        let sections = parse_sections("agg people\n").unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].kind, SectionKind::Query);
        assert_eq!(sections[0].name, "_");
    }

    #[test]
    fn test_sections_with_headers() {
        let doc = "@segment plan_a ttl=300 refresh=60 on_insert z_index=10\n\
                   where plan == 'a'\n\
                   @segment plan_b refresh=120\n\
                   where plan == 'b'\n";
        let sections = parse_sections(doc).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "plan_a");
        assert_eq!(sections[0].flags.ttl_ms, 300_000);
        assert_eq!(sections[0].flags.refresh_ms, 60_000);
        assert!(sections[0].flags.on_insert);
        assert_eq!(sections[0].flags.z_index, 10);
        assert_eq!(sections[1].name, "plan_b");
        assert!(!sections[1].flags.on_insert);
    }

    #[test]
    fn test_bad_header_rejected() {
        assert!(parse_sections("@bogus thing\n").is_err());
    }
}
