pub mod ast;
pub mod duration;
pub mod lexer;

pub use ast::{LabelMatcher, ParseError, RollupSuffix, Selector};
pub use duration::{duration_value, positive_duration_value};
pub use lexer::{Lexer, LexerError, Spanned, Token};

use std::iter::Peekable;
use std::slice::Iter;

use crate::storage::search::{TagFilter, TagFilterOp};

/// Parses `name{label="value",...}` into a conjunction of tag filters
pub fn parse_metric_selector(s: &str) -> Result<Vec<TagFilter>, ParseError> {
    let tokens = Lexer::new(s).tokenize()?;
    let mut parser = Parser::new(&tokens);
    let selector = parser.parse_selector()?;
    parser.expect_end()?;
    selector.into_tag_filters()
}

/// Splits a query that ends with `[window]` or `[window:step]` (optionally
/// followed by `offset d`) into its parts. Returns `None` for any other query.
pub fn split_rollup_suffix(query: &str) -> Result<Option<RollupSuffix<'_>>, ParseError> {
    let spanned = Lexer::new(query).tokenize()?;
    // Drop EOF
    let mut toks = &spanned[..spanned.len().saturating_sub(1)];

    let (rest, offset) = split_offset(query, toks);
    toks = rest;

    let [head @ .., last] = toks else {
        return Ok(None);
    };
    if last.token != Token::RBracket {
        return Ok(None);
    }
    let Some(lb) = head.iter().rposition(|s| s.token == Token::LBracket) else {
        return Ok(None);
    };
    let (window, step) = match &head[lb + 1..] {
        [w] if is_duration_like(&w.token) => (span_text(query, w), None),
        [w, c] if is_duration_like(&w.token) && c.token == Token::Colon => {
            (span_text(query, w), Some(String::new()))
        }
        [w, c, s]
            if is_duration_like(&w.token)
                && c.token == Token::Colon
                && is_duration_like(&s.token) =>
        {
            (span_text(query, w), Some(span_text(query, s)))
        }
        _ => return Ok(None),
    };

    let child = &head[..lb];
    if !is_balanced(child) || !is_primary(child) {
        return Ok(None);
    }
    let child_text = &query[child[0].start..child[child.len() - 1].end];
    Ok(Some(RollupSuffix {
        child: child_text,
        window,
        step,
        offset,
    }))
}

/// Strips a trailing `offset d` or `offset -d`
fn split_offset<'t>(src: &str, toks: &'t [Spanned]) -> (&'t [Spanned], Option<String>) {
    match toks {
        [head @ .., o, d] if o.token == Token::Offset && is_duration_like(&d.token) => {
            (head, Some(src[d.start..d.end].to_string()))
        }
        [head @ .., o, m, d]
            if o.token == Token::Offset && m.token == Token::Minus && is_duration_like(&d.token) =>
        {
            (head, Some(src[m.start..d.end].to_string()))
        }
        _ => (toks, None),
    }
}

fn is_duration_like(token: &Token) -> bool {
    matches!(token, Token::Duration(_) | Token::NumberLiteral(_))
}

fn span_text(src: &str, s: &Spanned) -> String {
    src[s.start..s.end].to_string()
}

/// Reports whether `toks` form a single operand the suffix binds to: a
/// selector, a function call or a parenthesized expression. In `1 + up[5m]`
/// the suffix belongs to `up` only, so the whole query is no rollup.
fn is_primary(toks: &[Spanned]) -> bool {
    match toks {
        [] => false,
        [s] => matches!(s.token, Token::Identifier(_)),
        [first, ..] if matches!(first.token, Token::LParen | Token::LBrace) => {
            closes_at_end(toks, 0)
        }
        [first, second, ..]
            if matches!(first.token, Token::Identifier(_))
                && matches!(second.token, Token::LParen | Token::LBrace) =>
        {
            closes_at_end(toks, 1)
        }
        _ => false,
    }
}

/// Reports whether the bracket opened at `toks[open]` is closed by the last token
fn closes_at_end(toks: &[Spanned], open: usize) -> bool {
    let mut depth = 0usize;
    for (i, s) in toks.iter().enumerate().skip(open) {
        match s.token {
            Token::LParen | Token::LBrace | Token::LBracket => depth += 1,
            Token::RParen | Token::RBrace | Token::RBracket => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == toks.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// Reports whether every bracket in `toks` is closed in order
fn is_balanced(toks: &[Spanned]) -> bool {
    let mut stack = Vec::new();
    for s in toks {
        match s.token {
            Token::LParen | Token::LBrace | Token::LBracket => stack.push(&s.token),
            Token::RParen | Token::RBrace | Token::RBracket => {
                let open = match s.token {
                    Token::RParen => Token::LParen,
                    Token::RBrace => Token::LBrace,
                    _ => Token::LBracket,
                };
                if stack.pop() != Some(&open) {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

pub struct Parser<'a> {
    tokens: Peekable<Iter<'a, Spanned>>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Spanned]) -> Self {
        Self {
            tokens: tokens.iter().peekable(),
        }
    }

    /// Parses `name`, `name{...}` or `{...}`
    pub fn parse_selector(&mut self) -> Result<Selector, ParseError> {
        let mut selector = Selector::default();

        if let Some(Token::Identifier(_)) = self.peek_token() {
            if let Token::Identifier(name) = &self.next_token("metric name")?.token {
                selector.metric_name = Some(name.clone());
            }
        }

        if self.peek_token() == Some(&Token::LBrace) {
            self.next_token("{")?;
            selector.matchers = self.parse_matchers()?;
        }

        if selector.metric_name.is_none() && selector.matchers.is_empty() {
            return Err(ParseError::EmptySelector);
        }
        Ok(selector)
    }

    fn parse_matchers(&mut self) -> Result<Vec<LabelMatcher>, ParseError> {
        let mut matchers = Vec::new();

        loop {
            if self.peek_token() == Some(&Token::RBrace) {
                self.next_token("}")?;
                return Ok(matchers);
            }

            let next = self.next_token("label name")?;
            let label = match &next.token {
                Token::Identifier(name) => name.clone(),
                Token::Offset => "offset".to_string(),
                other => return Err(unexpected("label name", other, next.start)),
            };

            let next = self.next_token("label matching operator")?;
            let op = match next.token {
                Token::Eq => TagFilterOp::Eq,
                Token::Neq => TagFilterOp::Neq,
                Token::RegexEq => TagFilterOp::Regex,
                Token::RegexNeq => TagFilterOp::NotRegex,
                ref other => return Err(unexpected("label matching operator", other, next.start)),
            };

            let next = self.next_token("label value")?;
            let value = match &next.token {
                Token::StringLiteral(value) => value.clone(),
                other => return Err(unexpected("quoted label value", other, next.start)),
            };
            matchers.push(LabelMatcher { label, op, value });

            match self.peek_token() {
                Some(Token::Comma) => {
                    self.next_token(",")?;
                }
                Some(Token::RBrace) => {}
                _ => {
                    let next = self.next_token("`,` or `}`")?;
                    return Err(unexpected("`,` or `}`", &next.token, next.start));
                }
            }
        }
    }

    fn expect_end(&mut self) -> Result<(), ParseError> {
        let next = self.next_token("end of input")?;
        if next.token == Token::EOF {
            Ok(())
        } else {
            Err(unexpected("end of input", &next.token, next.start))
        }
    }

    fn next_token(&mut self, expected: &'static str) -> Result<&'a Spanned, ParseError> {
        match self.tokens.next() {
            Some(s) if s.token == Token::EOF && expected != "end of input" => {
                Err(ParseError::UnexpectedEnd(expected))
            }
            Some(s) => Ok(s),
            None => Err(ParseError::UnexpectedEnd(expected)),
        }
    }

    fn peek_token(&mut self) -> Option<&Token> {
        self.tokens.peek().map(|s| &s.token)
    }
}

fn unexpected(expected: &'static str, found: &Token, pos: usize) -> ParseError {
    ParseError::UnexpectedToken {
        expected,
        found: format!("{:?}", found),
        pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data::{MetricName, NAME_LABEL};

    #[test]
    fn test_parse_metric_selector() {
        let filters = parse_metric_selector(r#"up{job="api", env=~"prod|stage",}"#).unwrap();
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0], TagFilter::eq(NAME_LABEL, "up"));
        assert_eq!(filters[1], TagFilter::eq("job", "api"));
        assert_eq!(filters[2].op, TagFilterOp::Regex);

        let mn = MetricName::new("up").with_tag("job", "api").with_tag("env", "stage");
        assert!(filters.iter().all(|tf| tf.matches(&mn)));
    }

    #[test]
    fn test_parse_selector_forms() {
        assert_eq!(parse_metric_selector("up").unwrap().len(), 1);
        assert_eq!(parse_metric_selector("up{}").unwrap().len(), 1);
        let filters = parse_metric_selector(r#"{__name__!=''}"#).unwrap();
        assert_eq!(filters[0].op, TagFilterOp::Neq);
        let filters = parse_metric_selector(r#"{offset="1"}"#).unwrap();
        assert_eq!(filters[0].key, "offset");
    }

    #[test]
    fn test_parse_selector_errors() {
        assert!(matches!(parse_metric_selector("{}"), Err(ParseError::EmptySelector)));
        assert!(matches!(parse_metric_selector(""), Err(ParseError::EmptySelector)));
        assert!(matches!(
            parse_metric_selector("up{job=api}"),
            Err(ParseError::UnexpectedToken { pos: 7, .. })
        ));
        assert!(matches!(
            parse_metric_selector(r#"up{job="a""#),
            Err(ParseError::UnexpectedEnd(_))
        ));
        assert!(matches!(
            parse_metric_selector("rate(up[5m])"),
            Err(ParseError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse_metric_selector(r#"up{job=~"("}"#),
            Err(ParseError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_split_rollup_suffix() {
        let s = split_rollup_suffix(r#"up{job="a"}[5m] offset 1h"#).unwrap().unwrap();
        assert_eq!(s.child, r#"up{job="a"}"#);
        assert_eq!(s.window, "5m");
        assert_eq!(s.step, None);
        assert_eq!(s.offset.as_deref(), Some("1h"));

        let s = split_rollup_suffix("rate(up[1m])[30m:1m]").unwrap().unwrap();
        assert_eq!(s.child, "rate(up[1m])");
        assert_eq!(s.step.as_deref(), Some("1m"));
        assert_eq!(s.offset, None);

        let s = split_rollup_suffix("up[1h:] offset -5m").unwrap().unwrap();
        assert_eq!(s.step.as_deref(), Some(""));
        assert_eq!(s.offset.as_deref(), Some("-5m"));

        assert_eq!(split_rollup_suffix("rate(up[5m])").unwrap(), None);
        assert_eq!(split_rollup_suffix("up").unwrap(), None);
        assert_eq!(split_rollup_suffix("[5m]").unwrap(), None);
        assert_eq!(split_rollup_suffix("up[5m] offset").unwrap(), None);
        assert_eq!(split_rollup_suffix("sum(up[5m]").unwrap(), None);
        assert_eq!(split_rollup_suffix("1 + up[5m]").unwrap(), None);
        assert_eq!(split_rollup_suffix("foo[5m] + bar[5m]").unwrap(), None);
        assert_eq!(split_rollup_suffix("rate(a[1m]) / rate(b[1m])[1h:]").unwrap(), None);

        let s = split_rollup_suffix("(a + b)[10m:1m]").unwrap().unwrap();
        assert_eq!(s.child, "(a + b)");
        let s = split_rollup_suffix(r#"{job="a"}[5m]"#).unwrap().unwrap();
        assert_eq!(s.child, r#"{job="a"}"#);
    }
}
