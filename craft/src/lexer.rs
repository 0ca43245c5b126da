//! Pull-based lexer: the compiler asks for one token at a time, never forcing
//! a whole-source tokenization pass up front.

use std::fmt;
use std::str::Chars;

use crate::reporting::Location;

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum TokenType {
    // Single character
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Caret,

    // One or two character
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals
    Identifier,
    String,
    Number,

    // Keywords
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenType,
    pub lexeme: &'src str,
    pub line: usize,
}

impl<'src> Token<'src> {
    pub fn loc(&self) -> Location {
        Location::new(self.line)
    }
}

#[derive(Debug, Clone)]
pub struct ScanError {
    pub error: ScanErrorType,
    pub loc: Location,
}

#[derive(Debug, Clone)]
pub enum ScanErrorType {
    UnexpectedCharacter(char),
    UnterminatedString,
}

impl fmt::Display for ScanErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanErrorType::UnexpectedCharacter(c) => write!(f, "Unexpected character '{}'.", c),
            ScanErrorType::UnterminatedString => write!(f, "Unterminated string."),
        }
    }
}

pub struct Lexer<'src> {
    source: &'src str,
    chars: Chars<'src>,
    start: usize,
    current: usize,
    line: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Lexer<'src> {
        Lexer {
            source,
            chars: source.chars(),
            start: 0,
            current: 0,
            line: 0,
        }
    }

    /// Produces the next token. Always terminates: repeated calls after EOF
    /// keep returning an `Eof` token.
    pub fn next_token(&mut self) -> Result<Token<'src>, ScanError> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        let c = match self.advance() {
            Some(c) => c,
            None => return Ok(self.make_token(TokenType::Eof)),
        };

        if is_alpha(c) {
            return Ok(self.identifier());
        }
        if c.is_ascii_digit() {
            return Ok(self.number());
        }

        match c {
            '(' => Ok(self.make_token(TokenType::LeftParen)),
            ')' => Ok(self.make_token(TokenType::RightParen)),
            '{' => Ok(self.make_token(TokenType::LeftBrace)),
            '}' => Ok(self.make_token(TokenType::RightBrace)),
            ';' => Ok(self.make_token(TokenType::Semicolon)),
            ',' => Ok(self.make_token(TokenType::Comma)),
            '.' => Ok(self.make_token(TokenType::Dot)),
            '-' => Ok(self.make_token(TokenType::Minus)),
            '+' => Ok(self.make_token(TokenType::Plus)),
            '/' => Ok(self.make_token(TokenType::Slash)),
            '*' => Ok(self.make_token(TokenType::Star)),
            '^' => Ok(self.make_token(TokenType::Caret)),
            '!' => {
                let kind = if self.matches('=') { TokenType::BangEqual } else { TokenType::Bang };
                Ok(self.make_token(kind))
            }
            '=' => {
                let kind = if self.matches('=') { TokenType::EqualEqual } else { TokenType::Equal };
                Ok(self.make_token(kind))
            }
            '<' => {
                let kind = if self.matches('=') { TokenType::LessEqual } else { TokenType::Less };
                Ok(self.make_token(kind))
            }
            '>' => {
                let kind = if self.matches('=') { TokenType::GreaterEqual } else { TokenType::Greater };
                Ok(self.make_token(kind))
            }
            '"' => self.string(),
            c => Err(self.error(ScanErrorType::UnexpectedCharacter(c))),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while self.peek() != Some('\n') && self.peek().is_some() {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn identifier(&mut self) -> Token<'src> {
        while self.peek().map(is_alphanumeric).unwrap_or(false) {
            self.advance();
        }
        let kind = self.identifier_type();
        self.make_token(kind)
    }

    /// A nested match on the first one or two characters, mirroring a
    /// hand-rolled keyword trie: avoids a hash lookup (and the allocation a
    /// generic map would need) for the overwhelmingly common case of a
    /// plain identifier.
    fn identifier_type(&self) -> TokenType {
        let text = &self.source[self.start..self.current];
        let mut chars = text.chars();
        match chars.next() {
            Some('a') => self.check_keyword(text, "and", TokenType::And),
            Some('c') => self.check_keyword(text, "class", TokenType::Class),
            Some('e') => self.check_keyword(text, "else", TokenType::Else),
            Some('f') => match chars.next() {
                Some('a') => self.check_keyword(text, "false", TokenType::False),
                Some('o') => self.check_keyword(text, "for", TokenType::For),
                Some('u') => self.check_keyword(text, "fun", TokenType::Fun),
                _ => TokenType::Identifier,
            },
            Some('i') => self.check_keyword(text, "if", TokenType::If),
            Some('n') => self.check_keyword(text, "nil", TokenType::Nil),
            Some('o') => self.check_keyword(text, "or", TokenType::Or),
            Some('p') => self.check_keyword(text, "print", TokenType::Print),
            Some('r') => self.check_keyword(text, "return", TokenType::Return),
            Some('s') => self.check_keyword(text, "super", TokenType::Super),
            Some('t') => match chars.next() {
                Some('h') => self.check_keyword(text, "this", TokenType::This),
                Some('r') => self.check_keyword(text, "true", TokenType::True),
                _ => TokenType::Identifier,
            },
            Some('v') => self.check_keyword(text, "var", TokenType::Var),
            Some('w') => self.check_keyword(text, "while", TokenType::While),
            _ => TokenType::Identifier,
        }
    }

    fn check_keyword(&self, text: &str, keyword: &'static str, kind: TokenType) -> TokenType {
        if text == keyword {
            kind
        } else {
            TokenType::Identifier
        }
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.advance();
            while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                self.advance();
            }
        }
        if self.peek() == Some('e') || self.peek() == Some('E') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            let next_is_sign = matches!(lookahead.next(), Some('+') | Some('-'));
            let digits_follow = if next_is_sign {
                lookahead.next().map(|c| c.is_ascii_digit()).unwrap_or(false)
            } else {
                self.peek_next().map(|c| c.is_ascii_digit()).unwrap_or(false)
            };
            if digits_follow {
                self.advance();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    self.advance();
                }
                while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    self.advance();
                }
            }
        }
        self.make_token(TokenType::Number)
    }

    fn string(&mut self) -> Result<Token<'src>, ScanError> {
        loop {
            match self.peek() {
                Some('"') => {
                    self.advance();
                    return Ok(self.make_token(TokenType::String));
                }
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
                None => return Err(self.error(ScanErrorType::UnterminatedString)),
            }
        }
    }

    fn make_token(&self, kind: TokenType) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error(&self, error: ScanErrorType) -> ScanError {
        ScanError { error, loc: Location::new(self.line) }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c.is_some() {
            self.current += c.unwrap().len_utf8();
        }
        c
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next()
    }

    /// Matches the expected character against the *dereferenced* peek, not a
    /// raw pointer comparison — a historical source of bugs in hand-rolled
    /// lexers that compare positions instead of values.
    fn matches(&mut self, expected: char) -> bool {
        match self.peek() {
            Some(c) if c == expected => {
                self.advance();
                true
            }
            _ => false,
        }
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_alphanumeric(c: char) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(src: &str) -> Vec<TokenType> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().expect("no scan errors in these fixtures");
            let done = token.kind == TokenType::Eof;
            out.push(token.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_empty() {
        assert_eq!(scan_all(""), vec![TokenType::Eof]);
    }

    #[test]
    fn test_keywords() {
        use TokenType::*;
        assert_eq!(
            scan_all("and class else false for fun if nil or print return super this true var while"),
            vec![And, Class, Else, False, For, Fun, If, Nil, Or, Print, Return, Super, This, True, Var, While, Eof]
        );
    }

    #[test]
    fn test_identifiers_not_keywords() {
        use TokenType::*;
        assert_eq!(scan_all("classy forest printer"), vec![Identifier, Identifier, Identifier, Eof]);
    }

    #[test]
    fn test_numbers() {
        use TokenType::*;
        assert_eq!(scan_all("123 3.14 1e10 1e+10 1e-10"), vec![Number, Number, Number, Number, Number, Eof]);
    }

    #[test]
    fn test_string_literal() {
        let mut lexer = Lexer::new("\"hello world\"");
        let token = lexer.next_token().unwrap();
        assert_eq!(token.kind, TokenType::String);
        assert_eq!(token.lexeme, "\"hello world\"");
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("\"hello");
        let err = lexer.next_token().unwrap_err();
        assert!(matches!(err.error, ScanErrorType::UnterminatedString));
    }

    #[test]
    fn test_line_tracking_through_multiline_string() {
        let mut lexer = Lexer::new("\"a\nb\"\nvar");
        let string_tok = lexer.next_token().unwrap();
        assert_eq!(string_tok.line, 1);
        let var_tok = lexer.next_token().unwrap();
        assert_eq!(var_tok.kind, TokenType::Var);
        assert_eq!(var_tok.line, 2);
    }

    #[test]
    fn test_comment_skipped() {
        use TokenType::*;
        assert_eq!(scan_all("var x; // a trailing comment\nvar y;"), vec![Var, Identifier, Semicolon, Var, Identifier, Semicolon, Eof]);
    }

    #[test]
    fn test_two_char_operators() {
        use TokenType::*;
        assert_eq!(scan_all("! != = == < <= > >="), vec![Bang, BangEqual, Equal, EqualEqual, Less, LessEqual, Greater, GreaterEqual, Eof]);
    }
}
