use crate::error::{Error, ErrorCode, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Assign,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    Plus,
    Minus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Lexed {
    pub tok: Tok,
    pub line: u32,
}

fn err(line: u32, detail: String) -> Error {
    Error::parse(ErrorCode::SyntaxError, detail).with_additional(format!("line {line}"))
}

/// Tokenize a query body. `#` comments run to end of line; newlines are
/// whitespace (structure comes from braces).
pub fn lex(source: &str) -> Result<Vec<Lexed>> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line: u32 = 1;

    macro_rules! push {
        ($tok:expr) => {
            out.push(Lexed { tok: $tok, line })
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => break,
                        }
                        continue;
                    }
                    if c == '\n' {
                        line += 1;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(err(line, "unterminated string".into()));
                }
                push!(Tok::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        // lookahead: only a digit makes this a float
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
                            is_float = true;
                            text.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let text = text.replace('_', "");
                if is_float {
                    let value: f64 = text
                        .parse()
                        .map_err(|_| err(line, format!("bad number '{text}'")))?;
                    push!(Tok::Float(value));
                } else {
                    let value: i64 = text
                        .parse()
                        .map_err(|_| err(line, format!("bad number '{text}'")))?;
                    push!(Tok::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                push!(Tok::Ident(text));
            }
            _ => {
                chars.next();
                let two = |next: char, chars: &mut std::iter::Peekable<std::str::Chars>| {
                    if chars.peek() == Some(&next) {
                        chars.next();
                        true
                    } else {
                        false
                    }
                };
                let tok = match c {
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    ',' => Tok::Comma,
                    '+' => {
                        if two('=', &mut chars) {
                            Tok::PlusEq
                        } else {
                            Tok::Plus
                        }
                    }
                    '-' => {
                        if two('=', &mut chars) {
                            Tok::MinusEq
                        } else {
                            Tok::Minus
                        }
                    }
                    '*' => {
                        if two('=', &mut chars) {
                            Tok::StarEq
                        } else {
                            Tok::Star
                        }
                    }
                    '/' => {
                        if two('=', &mut chars) {
                            Tok::SlashEq
                        } else {
                            Tok::Slash
                        }
                    }
                    '=' => {
                        if two('=', &mut chars) {
                            Tok::EqEq
                        } else {
                            Tok::Assign
                        }
                    }
                    '!' => {
                        if two('=', &mut chars) {
                            Tok::NotEq
                        } else {
                            Tok::Bang
                        }
                    }
                    '<' => {
                        if two('=', &mut chars) {
                            Tok::Lte
                        } else if two('>', &mut chars) {
                            Tok::NotEq
                        } else {
                            Tok::Lt
                        }
                    }
                    '>' => {
                        if two('=', &mut chars) {
                            Tok::Gte
                        } else {
                            Tok::Gt
                        }
                    }
                    '&' => {
                        if two('&', &mut chars) {
                            Tok::AndAnd
                        } else {
                            return Err(err(line, "stray '&'".into()));
                        }
                    }
                    '|' => {
                        if two('|', &mut chars) {
                            Tok::OrOr
                        } else {
                            return Err(err(line, "stray '|'".into()));
                        }
                    }
                    other => return Err(err(line, format!("unexpected character '{other}'"))),
                };
                push!(tok);
            }
        }
    }

    out.push(Lexed {
        tok: Tok::Eof,
        line,
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        lex(source).unwrap().into_iter().map(|l| l.tok).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            toks("price >= 2.5 && product == 'pear'"),
            vec![
                Tok::Ident("price".into()),
                Tok::Gte,
                Tok::Float(2.5),
                Tok::AndAnd,
                Tok::Ident("product".into()),
                Tok::EqEq,
                Tok::Str("pear".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let lexed = lex("a # comment\nb").unwrap();
        assert_eq!(lexed[0].line, 1);
        assert_eq!(lexed[1].line, 2);
    }

    #[test]
    fn test_compound_assign() {
        assert_eq!(
            toks("x += 1"),
            vec![Tok::Ident("x".into()), Tok::PlusEq, Tok::Int(1), Tok::Eof]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        assert!(lex("'oops").is_err());
    }
}
