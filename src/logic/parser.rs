//! Tokenizer and recursive-descent parser for the rule syntax.
//!
//! Grammar (informal):
//!
//! ```text
//! program  := (rule)*
//! rule     := literal ( ":-" body )? "."
//! body     := item ("," item)*
//! item     := "not" literal | literal | cmp | arith
//! cmp      := term op term           op in < =< > >= = !=
//! arith    := VAR "is" term aop term aop in + - * /
//! literal  := IDENT ( "(" term ("," term)* ")" )?
//! term     := VAR | "_" | IDENT | STRING | NUMBER
//! ```
//!
//! `%` starts a comment running to end of line. Identifiers beginning
//! with an uppercase letter are variables; lowercase identifiers are
//! atoms (and predicate names).

use super::ast::{ArithOp, BodyItem, CmpOp, Literal, Rule, RuleSet, RuleTerm};
use crate::error::{EngineError, EngineResult};
use crate::facts::Term;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Var(String),
    Wildcard,
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Comma,
    Dot,
    Implies, // :-
    Op(String),
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, msg: impl Into<String>) -> EngineError {
        EngineError::Parse(format!("line {}: {}", self.line, msg.into()))
    }

    fn tokenize(mut self) -> EngineResult<Vec<(Token, usize)>> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.chars.next();
                }
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '%' => {
                    // comment to end of line
                    for c in self.chars.by_ref() {
                        if c == '\n' {
                            self.line += 1;
                            break;
                        }
                    }
                }
                '(' => {
                    self.chars.next();
                    tokens.push((Token::LParen, self.line));
                }
                ')' => {
                    self.chars.next();
                    tokens.push((Token::RParen, self.line));
                }
                ',' => {
                    self.chars.next();
                    tokens.push((Token::Comma, self.line));
                }
                '.' => {
                    self.chars.next();
                    tokens.push((Token::Dot, self.line));
                }
                '"' => {
                    self.chars.next();
                    let mut s = String::new();
                    let mut closed = false;
                    while let Some(c) = self.chars.next() {
                        match c {
                            '"' => {
                                closed = true;
                                break;
                            }
                            '\\' => match self.chars.next() {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(other) => s.push(other),
                                None => break,
                            },
                            '\n' => return Err(self.error("unterminated string")),
                            other => s.push(other),
                        }
                    }
                    if !closed {
                        return Err(self.error("unterminated string"));
                    }
                    tokens.push((Token::Str(s), self.line));
                }
                ':' => {
                    self.chars.next();
                    match self.chars.next() {
                        Some('-') => tokens.push((Token::Implies, self.line)),
                        _ => return Err(self.error("expected ':-'")),
                    }
                }
                '<' | '>' | '=' | '!' | '+' | '*' | '/' => {
                    let mut op = String::new();
                    op.push(c);
                    self.chars.next();
                    if let Some(&next) = self.chars.peek() {
                        if (c == '>' && next == '=')
                            || (c == '=' && next == '<')
                            || (c == '!' && next == '=')
                        {
                            op.push(next);
                            self.chars.next();
                        }
                    }
                    tokens.push((Token::Op(op), self.line));
                }
                '-' => {
                    self.chars.next();
                    // negative number literal or the subtraction operator
                    if self.chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                        let (tok, _) = self.number(true)?;
                        tokens.push((tok, self.line));
                    } else {
                        tokens.push((Token::Op("-".to_string()), self.line));
                    }
                }
                c if c.is_ascii_digit() => {
                    let (tok, _) = self.number(false)?;
                    tokens.push((tok, self.line));
                }
                '_' => {
                    self.chars.next();
                    // `_` alone is the wildcard; `_foo` is a named variable
                    let mut rest = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            rest.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    if rest.is_empty() {
                        tokens.push((Token::Wildcard, self.line));
                    } else {
                        tokens.push((Token::Var(format!("_{}", rest)), self.line));
                    }
                }
                c if c.is_ascii_alphabetic() => {
                    let mut ident = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            ident.push(c);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    if ident.chars().next().unwrap().is_ascii_uppercase() {
                        tokens.push((Token::Var(ident), self.line));
                    } else {
                        tokens.push((Token::Ident(ident), self.line));
                    }
                }
                other => return Err(self.error(format!("unexpected character '{}'", other))),
            }
        }
        Ok(tokens)
    }

    fn number(&mut self, negative: bool) -> EngineResult<(Token, usize)> {
        let mut digits = String::new();
        if negative {
            digits.push('-');
        }
        let mut is_float = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.chars.next();
            } else if c == '.' {
                // lookahead: "1." terminating a rule vs "1.5"
                let mut clone = self.chars.clone();
                clone.next();
                if clone.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    is_float = true;
                    digits.push('.');
                    self.chars.next();
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        if is_float {
            let v: f64 = digits
                .parse()
                .map_err(|_| self.error(format!("bad float '{}'", digits)))?;
            Ok((Token::Float(v), self.line))
        } else {
            let v: i64 = digits
                .parse()
                .map_err(|_| self.error(format!("bad integer '{}'", digits)))?;
            Ok((Token::Int(v), self.line))
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, l)| *l)
            .unwrap_or(0)
    }

    fn error(&self, msg: impl Into<String>) -> EngineError {
        EngineError::Parse(format!("line {}: {}", self.line(), msg.into()))
    }

    fn parse_program(&mut self) -> EngineResult<RuleSet> {
        let mut rules = Vec::new();
        while self.peek().is_some() {
            rules.push(self.parse_rule()?);
        }
        Ok(RuleSet { rules })
    }

    fn parse_rule(&mut self) -> EngineResult<Rule> {
        let head = self.parse_literal()?;
        let mut body = Vec::new();
        match self.next() {
            Some(Token::Dot) => {}
            Some(Token::Implies) => {
                loop {
                    body.push(self.parse_body_item()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::Dot) => break,
                        other => {
                            return Err(self.error(format!(
                                "expected ',' or '.', found {:?}",
                                other
                            )))
                        }
                    }
                }
            }
            other => return Err(self.error(format!("expected ':-' or '.', found {:?}", other))),
        }
        Ok(Rule { head, body })
    }

    fn parse_body_item(&mut self) -> EngineResult<BodyItem> {
        // `not literal`
        if let Some(Token::Ident(id)) = self.peek() {
            if id == "not" {
                self.next();
                return Ok(BodyItem::Neg(self.parse_literal()?));
            }
        }

        // A body item starting with an identifier followed by `(` or a
        // bare identifier followed by `,`/`.` is a positive literal;
        // `Var is ...` and comparisons are recognized by lookahead.
        let start = self.pos;
        let lhs = self.parse_term()?;

        match self.peek() {
            Some(Token::Ident(id)) if id == "is" => {
                let var = match lhs {
                    RuleTerm::Var(v) => v,
                    other => {
                        return Err(self.error(format!("'is' requires a variable, found {}", other)))
                    }
                };
                self.next(); // is
                let a = self.parse_term()?;
                let op = match self.next() {
                    Some(Token::Op(op)) => match op.as_str() {
                        "+" => ArithOp::Add,
                        "-" => ArithOp::Sub,
                        "*" => ArithOp::Mul,
                        "/" => ArithOp::Div,
                        other => {
                            return Err(self.error(format!("unknown arithmetic op '{}'", other)))
                        }
                    },
                    other => return Err(self.error(format!("expected arithmetic op, found {:?}", other))),
                };
                let b = self.parse_term()?;
                Ok(BodyItem::Is { var, lhs: a, op, rhs: b })
            }
            Some(Token::Op(_)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => match op.as_str() {
                        "<" => CmpOp::Lt,
                        "=<" => CmpOp::Le,
                        ">" => CmpOp::Gt,
                        ">=" => CmpOp::Ge,
                        "=" => CmpOp::Eq,
                        "!=" => CmpOp::Ne,
                        other => return Err(self.error(format!("unknown comparison '{}'", other))),
                    },
                    _ => unreachable!(),
                };
                let rhs = self.parse_term()?;
                Ok(BodyItem::Cmp { op, lhs, rhs })
            }
            _ => {
                // rewind and parse as a literal
                self.pos = start;
                Ok(BodyItem::Pos(self.parse_literal()?))
            }
        }
    }

    fn parse_literal(&mut self) -> EngineResult<Literal> {
        let predicate = match self.next() {
            Some(Token::Ident(id)) => id,
            other => return Err(self.error(format!("expected predicate, found {:?}", other))),
        };
        let mut args = Vec::new();
        if self.peek() == Some(&Token::LParen) {
            self.next();
            loop {
                args.push(self.parse_term()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => {
                        return Err(self.error(format!("expected ',' or ')', found {:?}", other)))
                    }
                }
            }
        }
        Ok(Literal { predicate, args })
    }

    fn parse_term(&mut self) -> EngineResult<RuleTerm> {
        match self.next() {
            Some(Token::Var(v)) => Ok(RuleTerm::Var(v)),
            Some(Token::Wildcard) => Ok(RuleTerm::Wildcard),
            Some(Token::Ident(id)) => Ok(RuleTerm::Ground(Term::Atom(id))),
            Some(Token::Str(s)) => Ok(RuleTerm::Ground(Term::Str(s))),
            Some(Token::Int(n)) => Ok(RuleTerm::Ground(Term::Int(n))),
            Some(Token::Float(x)) => Ok(RuleTerm::Ground(Term::Float(x))),
            other => Err(self.error(format!("expected term, found {:?}", other))),
        }
    }
}

/// Parse a full ruleset.
pub fn parse_rules(text: &str) -> EngineResult<RuleSet> {
    let tokens = Lexer::new(text).tokenize()?;
    Parser { tokens, pos: 0 }.parse_program()
}

/// Parse a single goal literal, e.g. `valid_transition(S)`.
pub fn parse_goal(text: &str) -> EngineResult<Literal> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let lit = parser.parse_literal()?;
    if parser.peek().is_some() && parser.peek() != Some(&Token::Dot) {
        return Err(EngineError::Parse(format!(
            "trailing input after goal '{}'",
            text.trim()
        )));
    }
    Ok(lit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::ast::{BodyItem, CmpOp};

    #[test]
    fn parses_facts_and_rules() {
        let rs = parse_rules(
            r#"
            % seed
            slack(0.2).
            valid(S) :- proposed(S), base_stability(S, B), B >= 0.5.
            "#,
        )
        .unwrap();
        assert_eq!(rs.rules.len(), 2);
        assert!(rs.rules[0].is_fact());
        assert_eq!(rs.rules[1].head.predicate, "valid");
        assert_eq!(rs.rules[1].body.len(), 3);
        assert!(matches!(rs.rules[1].body[2], BodyItem::Cmp { op: CmpOp::Ge, .. }));
    }

    #[test]
    fn parses_negation_and_wildcard() {
        let rs = parse_rules("viol(P) :- ast_import(P, _), not allowed_package(P).").unwrap();
        let body = &rs.rules[0].body;
        assert!(matches!(body[0], BodyItem::Pos(_)));
        assert!(matches!(body[1], BodyItem::Neg(_)));
    }

    #[test]
    fn parses_arithmetic() {
        let rs = parse_rules("p(S, E) :- q(S, B), r(S, P), E is B - P.").unwrap();
        assert!(matches!(rs.rules[0].body[2], BodyItem::Is { .. }));
    }

    #[test]
    fn parses_zero_arity() {
        let rs = parse_rules("halt :- stagnation_detected.").unwrap();
        assert!(rs.rules[0].head.args.is_empty());
        let goal = parse_goal("stagnation_detected").unwrap();
        assert!(goal.args.is_empty());
    }

    #[test]
    fn rejects_unterminated_rule() {
        assert!(parse_rules("p(X) :- q(X)").is_err());
    }

    #[test]
    fn parses_negative_numbers_and_strings() {
        let rs = parse_rules(r#"limit(-5). name("word count")."#).unwrap();
        assert_eq!(rs.rules.len(), 2);
    }
}
