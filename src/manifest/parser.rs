//! Manifest grammar.
//!
//! ```text
//! manifest   := assignment*
//! assignment := IDENT '=' expr
//! expr       := term ('+' term)*
//! term       := STRING+ | INT | IDENT | IDENT '(' args ')' | dict | list
//! dict       := '{' (expr ':' expr (',' expr ':' expr)* ','?)? '}'
//! list       := '[' (expr (',' expr)* ','?)? ']'
//! ```
//!
//! The grammar accepts any identifier and call shape; lowering then keeps
//! `True`, `False`, `None` and `Var("name")` and rejects everything else, so
//! nothing in the tree is executable.

use chumsky::prelude::*;
use chumsky::Stream;
use std::ops::Range;

use super::lexer::{tokenize, TokenKind};
use super::span::{to_syntax_error, LineIndex, Pos};
use crate::traits::ManifestError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    None,
    Var { name: String, pos: Pos },
    Concat(Vec<(Expr, Pos)>),
    Dict(Vec<((Expr, Pos), Expr)>),
    List(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Assignment {
    pub name: String,
    pub pos: Pos,
    pub value: Expr,
}

/// Parse tree before lowering.
#[derive(Debug, Clone, PartialEq)]
enum RawExpr {
    Str(String),
    Int(i64),
    Name { name: String, pos: Pos },
    Call { name: String, args: Vec<RawExpr>, pos: Pos },
    Concat(Vec<(RawExpr, Pos)>),
    Dict(Vec<((RawExpr, Pos), RawExpr)>),
    List(Vec<RawExpr>),
}

pub(crate) fn parse(source: &str) -> Result<Vec<Assignment>, ManifestError> {
    let index = LineIndex::new(source);
    let tokens = tokenize(source, &index)?;

    let eoi = source.chars().count();
    let stream = Stream::from_iter(eoi..eoi + 1, tokens.into_iter());
    let raw = grammar(&index)
        .parse(stream)
        .map_err(|errors| to_syntax_error(errors, &index))?;

    raw.into_iter()
        .map(|(name, pos, value)| -> Result<Assignment, ManifestError> {
            Ok(Assignment {
                name,
                pos,
                value: lower(value)?,
            })
        })
        .collect()
}

fn grammar(
    index: &LineIndex,
) -> impl Parser<TokenKind, Vec<(String, Pos, RawExpr)>, Error = Simple<TokenKind>> + '_ {
    let string = select! { TokenKind::Str(s) => s };
    let int = select! { TokenKind::Int(n) => n };
    let ident = select! { TokenKind::Ident(s) => s };

    let expr = recursive(|expr| {
        // Adjacent literals concatenate.
        let strings = string
            .clone()
            .repeated()
            .at_least(1)
            .map(|parts: Vec<String>| RawExpr::Str(parts.concat()));

        let args = expr
            .clone()
            .separated_by(just(TokenKind::Comma))
            .allow_trailing()
            .delimited_by(just(TokenKind::LParen), just(TokenKind::RParen));
        let named = ident.clone().then(args.or_not()).map_with_span(
            move |(name, args), span: Range<usize>| {
                let pos = index.pos(span.start);
                match args {
                    Some(args) => RawExpr::Call { name, args, pos },
                    None => RawExpr::Name { name, pos },
                }
            },
        );

        let entry = expr
            .clone()
            .map_with_span(move |key, span: Range<usize>| (key, index.pos(span.start)))
            .then_ignore(just(TokenKind::Colon))
            .then(expr.clone());
        let dict = entry
            .separated_by(just(TokenKind::Comma))
            .allow_trailing()
            .delimited_by(just(TokenKind::LBrace), just(TokenKind::RBrace))
            .map(RawExpr::Dict);

        let list = expr
            .clone()
            .separated_by(just(TokenKind::Comma))
            .allow_trailing()
            .delimited_by(just(TokenKind::LBracket), just(TokenKind::RBracket))
            .map(RawExpr::List);

        let term = choice::<_, Simple<TokenKind>>((
            strings,
            int.clone().map(RawExpr::Int),
            named,
            dict,
            list,
        ));

        term.map_with_span(move |term, span: Range<usize>| (term, index.pos(span.start)))
            .separated_by(just(TokenKind::Plus))
            .at_least(1)
            .map(|mut operands: Vec<(RawExpr, Pos)>| {
                if operands.len() == 1 {
                    operands.remove(0).0
                } else {
                    RawExpr::Concat(operands)
                }
            })
    });

    ident
        .map_with_span(move |name, span: Range<usize>| (name, index.pos(span.start)))
        .then_ignore(just(TokenKind::Assign))
        .then(expr)
        .map(|((name, pos), value)| (name, pos, value))
        .repeated()
        .then_ignore(end())
}

fn error_at(pos: Pos, message: impl Into<String>) -> ManifestError {
    ManifestError::Syntax {
        line: pos.line,
        column: pos.column,
        message: message.into(),
    }
}

fn lower(expr: RawExpr) -> Result<Expr, ManifestError> {
    match expr {
        RawExpr::Str(s) => Ok(Expr::Str(s)),
        RawExpr::Int(n) => Ok(Expr::Int(n)),
        RawExpr::Name { name, pos } => match name.as_str() {
            "True" => Ok(Expr::Bool(true)),
            "False" => Ok(Expr::Bool(false)),
            "None" => Ok(Expr::None),
            "import" | "from" | "def" | "class" => Err(error_at(
                pos,
                format!("`{}` statements are not allowed in a manifest", name),
            )),
            _ => Err(error_at(
                pos,
                format!("bare identifier `{}` is not a value", name),
            )),
        },
        RawExpr::Call { name, args, pos } => {
            if name != "Var" {
                return Err(error_at(
                    pos,
                    format!("call to `{}` is not allowed, only `Var` is supported", name),
                ));
            }
            match <[RawExpr; 1]>::try_from(args) {
                Ok([RawExpr::Str(var)]) => Ok(Expr::Var { name: var, pos }),
                _ => Err(error_at(pos, "`Var` takes exactly one string literal")),
            }
        }
        RawExpr::Concat(operands) => operands
            .into_iter()
            .map(|(operand, pos)| lower(operand).map(|operand| (operand, pos)))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Concat),
        RawExpr::Dict(entries) => entries
            .into_iter()
            .map(|((key, key_pos), value)| -> Result<_, ManifestError> {
                Ok(((lower(key)?, key_pos), lower(value)?))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Dict),
        RawExpr::List(items) => items
            .into_iter()
            .map(lower)
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::List),
    }
}
