use std::fmt;

use crate::error::VrError;

/// An s-expression: a bare atom or a parenthesised list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    List(Vec<Sexp>),
}

impl Sexp {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Sexp::Atom(a) => Some(a),
            Sexp::List(_) => None,
        }
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Atom(a) => write!(f, "{}", a),
            Sexp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Parse exactly one s-expression from `input`.
pub fn parse_sexp(input: &str) -> Result<Sexp, VrError> {
    let tokens = tokenize(input);
    let mut pos = 0;
    let expr = parse_at(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(VrError::Sexp(format!("trailing input after '{}'", expr)));
    }
    Ok(expr)
}

fn tokenize(input: &str) -> Vec<String> {
    input
        .replace('(', " ( ")
        .replace(')', " ) ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn parse_at(tokens: &[String], pos: &mut usize) -> Result<Sexp, VrError> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| VrError::Sexp("unexpected end of input".into()))?;
    *pos += 1;
    match token.as_str() {
        "(" => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos).map(String::as_str) {
                    Some(")") => {
                        *pos += 1;
                        return Ok(Sexp::List(items));
                    }
                    Some(_) => items.push(parse_at(tokens, pos)?),
                    None => return Err(VrError::Sexp("unclosed '('".into())),
                }
            }
        }
        ")" => Err(VrError::Sexp("unexpected ')'".into())),
        atom => Ok(Sexp::Atom(atom.to_string())),
    }
}
