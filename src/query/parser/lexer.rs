use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LexerError {
    #[error("Unexpected character {0:?} at position {1}")]
    UnexpectedChar(char, usize),
    #[error("Invalid number format: {0}")]
    InvalidNumber(String),
    #[error("Unterminated string literal starting at position {0}")]
    UnterminatedString(usize),
    #[error("Invalid escape sequence \\{0}")]
    InvalidEscape(char),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Offset,

    // Operators
    Eq,        // =
    EqEq,      // ==
    Neq,       // !=
    RegexEq,   // =~
    RegexNeq,  // !~
    Gt,        // >
    Lt,        // <
    Gte,       // >=
    Lte,       // <=
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /
    Percent,   // %
    Caret,     // ^
    Pipe,      // |

    // Punctuation
    Comma,     // ,
    Colon,     // :
    LParen,    // (
    RParen,    // )
    LBrace,    // {
    RBrace,    // }
    LBracket,  // [
    RBracket,  // ]

    // Literals
    Identifier(String),
    StringLiteral(String),
    NumberLiteral(f64),
    /// Number immediately followed by unit letters, e.g. `5m` or `1h30m`
    Duration(String),

    // Special
    EOF,
}

/// Token with the byte range it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

pub struct Lexer<'a> {
    src: &'a str,
    input: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            src: input,
            input: input.char_indices().peekable(),
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        tokens.push(Spanned {
            token: Token::EOF,
            start: self.src.len(),
            end: self.src.len(),
        });
        Ok(tokens)
    }

    fn pos(&mut self) -> usize {
        self.input.peek().map_or(self.src.len(), |&(i, _)| i)
    }

    fn bump_if(&mut self, want: char) -> bool {
        if let Some(&(_, c)) = self.input.peek() {
            if c == want {
                self.input.next();
                return true;
            }
        }
        false
    }

    fn next_token(&mut self) -> Result<Option<Spanned>, LexerError> {
        self.skip_whitespace();

        let Some(&(start, c)) = self.input.peek() else {
            return Ok(None);
        };
        let token = match c {
            '=' => {
                self.input.next();
                if self.bump_if('=') {
                    Token::EqEq
                } else if self.bump_if('~') {
                    Token::RegexEq
                } else {
                    Token::Eq
                }
            }
            '!' => {
                self.input.next();
                if self.bump_if('=') {
                    Token::Neq
                } else if self.bump_if('~') {
                    Token::RegexNeq
                } else {
                    return Err(LexerError::UnexpectedChar('!', start));
                }
            }
            '>' => {
                self.input.next();
                if self.bump_if('=') {
                    Token::Gte
                } else {
                    Token::Gt
                }
            }
            '<' => {
                self.input.next();
                if self.bump_if('=') {
                    Token::Lte
                } else {
                    Token::Lt
                }
            }
            '+' | '-' | '*' | '/' | '%' | '^' | '|' | ',' | ':' | '(' | ')' | '{' | '}' | '['
            | ']' => {
                self.input.next();
                match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '^' => Token::Caret,
                    '|' => Token::Pipe,
                    ',' => Token::Comma,
                    ':' => Token::Colon,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    _ => Token::RBracket,
                }
            }

            // String literals
            '"' | '\'' | '`' => self.parse_string()?,

            // Numbers, durations and identifiers
            c if c.is_ascii_digit() || c == '.' => self.parse_number()?,
            c if c.is_ascii_alphabetic() || c == '_' => self.parse_identifier(),

            c => return Err(LexerError::UnexpectedChar(c, start)),
        };

        let end = self.pos();
        Ok(Some(Spanned { token, start, end }))
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, c)) = self.input.peek() {
            if c.is_whitespace() {
                self.input.next();
            } else {
                break;
            }
        }
    }

    fn parse_string(&mut self) -> Result<Token, LexerError> {
        let Some((start, quote)) = self.input.next() else {
            return Err(LexerError::UnterminatedString(self.src.len()));
        };
        let mut string = String::new();

        while let Some((_, c)) = self.input.next() {
            if c == quote {
                return Ok(Token::StringLiteral(string));
            }
            if c == '\\' && quote != '`' {
                let Some((_, escaped)) = self.input.next() else {
                    break;
                };
                string.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' | '"' | '\'' => escaped,
                    other => return Err(LexerError::InvalidEscape(other)),
                });
                continue;
            }
            string.push(c);
        }

        Err(LexerError::UnterminatedString(start))
    }

    fn parse_number(&mut self) -> Result<Token, LexerError> {
        let start = self.pos();
        let mut has_decimal = false;

        while let Some(&(_, c)) = self.input.peek() {
            match c {
                '0'..='9' => {
                    self.input.next();
                }
                '.' if !has_decimal => {
                    has_decimal = true;
                    self.input.next();
                }
                _ => break,
            }
        }

        // A unit suffix turns the number into a duration literal; the rest of
        // the literal (`1h30m`) is consumed together with it.
        if matches!(self.input.peek(), Some(&(_, c)) if c.is_ascii_alphabetic()) {
            while let Some(&(_, c)) = self.input.peek() {
                if c.is_ascii_alphanumeric() || c == '.' {
                    self.input.next();
                } else {
                    break;
                }
            }
            let end = self.pos();
            return Ok(Token::Duration(self.src[start..end].to_string()));
        }

        let end = self.pos();
        let number = &self.src[start..end];
        number
            .parse::<f64>()
            .map(Token::NumberLiteral)
            .map_err(|_| LexerError::InvalidNumber(number.to_string()))
    }

    fn parse_identifier(&mut self) -> Token {
        let start = self.pos();

        while let Some(&(_, c)) = self.input.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '.' {
                self.input.next();
            } else {
                break;
            }
        }

        let end = self.pos();
        let identifier = &self.src[start..end];
        if identifier.eq_ignore_ascii_case("offset") {
            Token::Offset
        } else {
            Token::Identifier(identifier.to_string())
        }
    }
}

/// Convenience wrapper returning only the tokens
pub fn tokens(input: &str) -> Result<Vec<Token>, LexerError> {
    Ok(Lexer::new(input)
        .tokenize()?
        .into_iter()
        .map(|s| s.token)
        .collect())
}
