use chumsky::prelude::*;
use std::fmt;
use std::ops::Range;

use super::span::{to_syntax_error, LineIndex};
use crate::traits::ManifestError;

pub(crate) type Spanned<T> = (T, Range<usize>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TokenKind {
    Ident(String),
    Str(String),
    Int(i64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Comma,
    Plus,
    Assign,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "identifier `{}`", name),
            Self::Str(_) => f.write_str("string literal"),
            Self::Int(n) => write!(f, "integer `{}`", n),
            Self::LBrace => f.write_str("`{`"),
            Self::RBrace => f.write_str("`}`"),
            Self::LBracket => f.write_str("`[`"),
            Self::RBracket => f.write_str("`]`"),
            Self::LParen => f.write_str("`(`"),
            Self::RParen => f.write_str("`)`"),
            Self::Colon => f.write_str("`:`"),
            Self::Comma => f.write_str("`,`"),
            Self::Plus => f.write_str("`+`"),
            Self::Assign => f.write_str("`=`"),
        }
    }
}

pub(crate) fn lexer() -> impl Parser<char, Vec<Spanned<TokenKind>>, Error = Simple<char>> {
    let int = text::digits(10).try_map(|digits: String, span| {
        digits
            .parse::<i64>()
            .map(TokenKind::Int)
            .map_err(|_| Simple::custom(span, "integer literal out of range"))
    });

    let escape = just('\\').ignore_then(any()).map(|c: char| match c {
        'n' => "\n".to_string(),
        't' => "\t".to_string(),
        '\\' | '\'' | '"' => c.to_string(),
        // line continuation
        '\n' => String::new(),
        other => format!("\\{}", other),
    });
    let string = |quote: char| {
        just(quote)
            .ignore_then(
                filter(move |c: &char| *c != quote && *c != '\\' && *c != '\n')
                    .map(String::from)
                    .or(escape.clone())
                    .repeated()
                    .map(|parts: Vec<String>| parts.concat()),
            )
            .then_ignore(just(quote))
            .map(TokenKind::Str)
    };

    let punct = choice::<_, Simple<char>>((
        just('{').to(TokenKind::LBrace),
        just('}').to(TokenKind::RBrace),
        just('[').to(TokenKind::LBracket),
        just(']').to(TokenKind::RBracket),
        just('(').to(TokenKind::LParen),
        just(')').to(TokenKind::RParen),
        just(':').to(TokenKind::Colon),
        just(',').to(TokenKind::Comma),
        just('+').to(TokenKind::Plus),
        just('=').to(TokenKind::Assign),
    ));

    let token = choice::<_, Simple<char>>((
        int,
        string('"'),
        string('\''),
        punct,
        text::ident().map(TokenKind::Ident),
    ));

    let comment = just('#')
        .then(filter(|c: &char| *c != '\n').repeated())
        .ignored();
    let trivia = filter(|c: &char| c.is_whitespace())
        .ignored()
        .or(comment)
        .repeated();

    trivia
        .clone()
        .ignore_then(
            token
                .map_with_span(|tok, span| (tok, span))
                .then_ignore(trivia)
                .repeated(),
        )
        .then_ignore(end())
}

pub(crate) fn tokenize(
    source: &str,
    index: &LineIndex,
) -> Result<Vec<Spanned<TokenKind>>, ManifestError> {
    lexer()
        .parse(source)
        .map_err(|errors| to_syntax_error(errors, index))
}
