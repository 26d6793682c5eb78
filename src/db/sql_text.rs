//! SQL text handling on top of the sqlparser tokenizer.
//!
//! Commands are written with the vendor's `@name` convention. sqlx expects
//! `$1, $2, ...` and tiberius expects `@P1, @P2, ...`, so the adapters rewrite
//! placeholders that name a bound parameter. Rewriting splices the original
//! text at token boundaries, so literals, quoted identifiers and comments come
//! through exactly as written. Anything that is not a bound name (`@@ROWCOUNT`,
//! local variables, `@>` operators) is left untouched.

use crate::error::{DbError, DbResult};
use crate::models::Parameter;
use sqlparser::dialect::{Dialect, MsSqlDialect, PostgreSqlDialect};
use sqlparser::tokenizer::{Location, Span, Token, TokenWithSpan, Tokenizer, Word};
use std::ops::Range;

/// Positional placeholder syntax of the target driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaceholderStyle {
    /// `$1` (PostgreSQL)
    Dollar,
    /// `@P1` (SQL Server via tiberius)
    AtP,
}

impl PlaceholderStyle {
    pub(crate) fn placeholder(&self, position: usize) -> String {
        match self {
            Self::Dollar => format!("${position}"),
            Self::AtP => format!("@P{position}"),
        }
    }

    /// Dialect whose lexical rules apply to the command text.
    pub(crate) fn dialect(&self) -> Box<dyn Dialect> {
        match self {
            Self::Dollar => Box::new(PostgreSqlDialect {}),
            Self::AtP => Box::new(MsSqlDialect {}),
        }
    }
}

/// Rewritten SQL plus the parameter indices to bind, in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rewritten {
    pub sql: String,
    pub bind_order: Vec<usize>,
}

/// Tokenize `sql`, keeping source spans. Lexical errors (an unterminated
/// literal, say) are reported against the command text.
pub(crate) fn tokenize(sql: &str, dialect: &dyn Dialect) -> DbResult<Vec<TokenWithSpan>> {
    Tokenizer::new(dialect, sql)
        .tokenize_with_location()
        .map_err(|e| DbError::invalid_argument("command_text", e.to_string()))
}

/// Maps tokenizer locations (1-based line and column, counted in chars) back
/// to byte offsets in the source text.
pub(crate) struct SourceMap<'a> {
    sql: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> SourceMap<'a> {
    pub(crate) fn new(sql: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(sql.match_indices('\n').map(|(i, _)| i + 1));
        Self { sql, line_starts }
    }

    pub(crate) fn offset(&self, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let column = (location.column as usize).saturating_sub(1);
        let Some(&start) = self.line_starts.get(line) else {
            return self.sql.len();
        };
        self.sql[start..]
            .char_indices()
            .nth(column)
            .map_or(self.sql.len(), |(i, _)| start + i)
    }

    pub(crate) fn range(&self, span: Span) -> Range<usize> {
        self.offset(span.start)..self.offset(span.end)
    }
}

fn bare_name(token: &str, prefix: char) -> Option<&str> {
    token
        .strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.starts_with(prefix))
}

/// `{prefix}name` references with their source ranges.
///
/// Depending on the dialect the tokenizer yields a placeholder, a word that
/// starts with the prefix (SQL Server variables) or an `@` sign directly
/// followed by a word. Quoted words never count.
fn named_references<'t>(
    tokens: &'t [TokenWithSpan],
    map: &SourceMap<'_>,
    prefix: char,
) -> Vec<(Range<usize>, &'t str)> {
    let mut refs = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let current = &tokens[i];
        match &current.token {
            Token::Placeholder(s)
            | Token::Word(Word {
                value: s,
                quote_style: None,
                ..
            }) => {
                if let Some(name) = bare_name(s, prefix) {
                    refs.push((map.range(current.span), name));
                }
            }
            Token::AtSign if prefix == '@' => {
                if let Some(next) = tokens.get(i + 1) {
                    if let Token::Word(Word {
                        value,
                        quote_style: None,
                        ..
                    }) = &next.token
                    {
                        if next.span.start == current.span.end {
                            let range = map.offset(current.span.start)..map.offset(next.span.end);
                            refs.push((range, value.as_str()));
                            i += 1;
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    refs
}

/// Rewrite `{prefix}name` placeholders into positional ones.
///
/// Each distinct name gets one position, assigned on first use. When the text
/// references no parameter by name it is assumed to already be positional and
/// every input parameter is bound in caller order.
pub(crate) fn rewrite_named(
    sql: &str,
    prefix: char,
    parameters: &[Parameter],
    style: PlaceholderStyle,
) -> DbResult<Rewritten> {
    let dialect = style.dialect();
    let tokens = tokenize(sql, dialect.as_ref())?;
    let map = SourceMap::new(sql);

    let mut out = String::with_capacity(sql.len() + 8);
    let mut bind_order: Vec<usize> = Vec::new();
    let mut copied = 0;

    for (range, name) in named_references(&tokens, &map, prefix) {
        let Some(idx) = parameters
            .iter()
            .position(|p| p.bare_name().eq_ignore_ascii_case(name))
        else {
            continue;
        };
        let position = match bind_order.iter().position(|&o| o == idx) {
            Some(pos) => pos + 1,
            None => {
                bind_order.push(idx);
                bind_order.len()
            }
        };
        out.push_str(&sql[copied..range.start]);
        out.push_str(&style.placeholder(position));
        copied = range.end;
    }
    out.push_str(&sql[copied..]);

    if bind_order.is_empty() {
        bind_order = input_positions(parameters);
    }

    Ok(Rewritten {
        sql: out,
        bind_order,
    })
}

/// Indices of parameters that carry a value to the server, in caller order.
pub(crate) fn input_positions(parameters: &[Parameter]) -> Vec<usize> {
    parameters
        .iter()
        .enumerate()
        .filter(|(_, p)| p.direction.is_input())
        .map(|(i, _)| i)
        .collect()
}
