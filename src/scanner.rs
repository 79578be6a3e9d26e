use std::borrow::Cow;
use std::iter::FusedIterator;

/// Scanner takes in an input and spits out tokens.
#[derive(Debug)]
pub struct Scanner<'a> {
    input: &'a str,
    // Bytes of `input` that belong to the token being scanned. Once the token is made,
    // reset_scanned_input drops them from the front of `input`.
    scanned_input_len: usize,
    current_line: usize,
    current_column: usize,
    token_line: usize,
    token_column: usize,
    ended: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    // Brackets and punctuation.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    DoubleColon,
    Semicolon,
    Arrow,
    // Arithmetic.
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Percent,
    // Assignment, plain and compound.
    Equal,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    CaretEqual,
    PercentEqual,
    // Comparison and logic.
    Bang,
    BangEqual,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    And,
    Or,
    // Literals.
    Identifier,
    String,
    Number,
    // Keywords.
    Var,
    Fn,
    If,
    Elif,
    Else,
    For,
    In,
    While,
    Return,
    Break,
    Continue,
    Reflect,
    Shine,
    Extern,
    Delete,
    True,
    False,

    Error,
    Eof,
}

/// Token is a single token, including a ref to the raw characters that constitute it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    /// What kind of token this is.
    pub typ: TokenType,
    /// The source text of the token, or the message of an Error token.
    pub raw: Cow<'a, str>,
    /// 1-based line the token starts on.
    pub line: usize,
    /// 1-based column the token starts at.
    pub column: usize,
}

impl<'a> Scanner<'a> {
    /// Returns a fresh Scanner, ready to spit out tokens from the given source
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            input: source,
            scanned_input_len: 0,
            current_line: 1,
            current_column: 1,
            token_line: 1,
            token_column: 1,
            ended: false,
        }
    }

    /// Returns the next token from the input, advancing the scanner.
    /// Errors are represented in-band as TokenType::Error.
    /// The scanner will return one Eof token, then None afterwards.
    pub fn next_token(&mut self) -> Option<Token<'a>> {
        if let Some(error) = self.skip_whitespace() {
            self.reset_scanned_input();
            return Some(error);
        }
        self.token_line = self.current_line;
        self.token_column = self.current_column;
        let next_char = match self.take_next_char() {
            None if self.ended => return None,
            None => {
                self.ended = true;
                return Some(self.make_token(TokenType::Eof));
            }
            Some(c) => c,
        };
        let token = match next_char {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            '[' => self.make_token(TokenType::LeftBracket),
            ']' => self.make_token(TokenType::RightBracket),
            ';' => self.make_token(TokenType::Semicolon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            ':' => self.one_or_two(':', TokenType::DoubleColon, TokenType::Colon),
            '-' => {
                if self.take_next_char_if_matches('>') {
                    self.make_token(TokenType::Arrow)
                } else {
                    self.one_or_two('=', TokenType::MinusEqual, TokenType::Minus)
                }
            }
            '+' => self.one_or_two('=', TokenType::PlusEqual, TokenType::Plus),
            '*' => self.one_or_two('=', TokenType::StarEqual, TokenType::Star),
            '/' => self.one_or_two('=', TokenType::SlashEqual, TokenType::Slash),
            '^' => self.one_or_two('=', TokenType::CaretEqual, TokenType::Caret),
            '%' => self.one_or_two('=', TokenType::PercentEqual, TokenType::Percent),
            '!' => self.one_or_two('=', TokenType::BangEqual, TokenType::Bang),
            '=' => self.one_or_two('=', TokenType::EqualEqual, TokenType::Equal),
            '<' => self.one_or_two('=', TokenType::LessEqual, TokenType::Less),
            '>' => self.one_or_two('=', TokenType::GreaterEqual, TokenType::Greater),
            '&' if self.take_next_char_if_matches('&') => self.make_token(TokenType::And),
            '|' if self.take_next_char_if_matches('|') => self.make_token(TokenType::Or),
            '"' | '\'' | '`' => self.scan_string_literal(next_char),
            '0'..='9' => self.scan_numeric_literal(),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier_or_keyword(),
            c => self.err_token(format!("Unexpected character '{}'.", c)),
        };
        self.reset_scanned_input();
        Some(token)
    }

    fn unscanned_input(&self) -> &'a str {
        if self.scanned_input_len < self.input.len() {
            &self.input[self.scanned_input_len..]
        } else {
            ""
        }
    }

    fn peek_next_char(&self) -> Option<char> {
        self.unscanned_input().chars().next()
    }

    fn peek_next_next_char(&self) -> Option<char> {
        self.unscanned_input().chars().nth(1)
    }

    fn take_next_char(&mut self) -> Option<char> {
        let next_char = self.peek_next_char()?;
        self.scanned_input_len += next_char.len_utf8();
        if next_char == '\n' {
            self.current_line += 1;
            self.current_column = 1;
        } else {
            self.current_column += 1;
        }
        Some(next_char)
    }

    fn take_next_char_if_matches(&mut self, target: char) -> bool {
        if self.peek_next_char() == Some(target) {
            self.take_next_char();
            true
        } else {
            false
        }
    }

    fn one_or_two(&mut self, second: char, two: TokenType, one: TokenType) -> Token<'a> {
        if self.take_next_char_if_matches(second) {
            self.make_token(two)
        } else {
            self.make_token(one)
        }
    }

    // Skips whitespace, `## line` comments and `##* block *##` comments.
    // An unterminated block comment comes back as an error token.
    fn skip_whitespace(&mut self) -> Option<Token<'a>> {
        loop {
            match self.peek_next_char() {
                Some(c) if c.is_whitespace() => {
                    self.take_next_char();
                }
                Some('#') if self.peek_next_next_char() == Some('#') => {
                    self.token_line = self.current_line;
                    self.token_column = self.current_column;
                    self.take_next_char();
                    self.take_next_char();
                    if self.take_next_char_if_matches('*') {
                        if !self.skip_block_comment() {
                            return Some(self.err_token("Unterminated block comment.".to_string()));
                        }
                    } else {
                        while !matches!(self.peek_next_char(), Some('\n') | None) {
                            self.take_next_char();
                        }
                    }
                }
                _ => break,
            }
        }
        self.reset_scanned_input();
        None
    }

    fn skip_block_comment(&mut self) -> bool {
        loop {
            if self.unscanned_input().starts_with("*##") {
                for _ in 0..3 {
                    self.take_next_char();
                }
                return true;
            }
            if self.take_next_char().is_none() {
                return false;
            }
        }
    }

    // Makes a token of the given type from the scanned portion of input.
    // Does NOT reset scanned input, caller of this probably also wants to call that.
    fn make_token(&self, typ: TokenType) -> Token<'a> {
        Token {
            typ,
            raw: Cow::Borrowed(&self.input[0..self.scanned_input_len]),
            line: self.token_line,
            column: self.token_column,
        }
    }

    fn err_token(&self, message: String) -> Token<'a> {
        Token {
            typ: TokenType::Error,
            raw: Cow::Owned(message),
            line: self.token_line,
            column: self.token_column,
        }
    }

    fn reset_scanned_input(&mut self) {
        self.input = self.unscanned_input();
        self.scanned_input_len = 0;
    }

    // Assumes we have just scanned the opening delimiter. The token's raw chars include both
    // delimiters and any escape sequences exactly as written; the parser decodes them.
    fn scan_string_literal(&mut self, delimiter: char) -> Token<'a> {
        loop {
            match self.take_next_char() {
                Some('\\') => {
                    if self.take_next_char().is_none() {
                        break;
                    }
                }
                Some(c) if c == delimiter => return self.make_token(TokenType::String),
                Some(_) => {}
                None => break,
            }
        }
        self.err_token("Unterminated string literal.".to_string())
    }

    // Digits may be grouped with underscores. A '.' joins the literal only when a digit follows,
    // and so does an exponent. Anything word-like glued onto the end makes the literal invalid.
    fn scan_numeric_literal(&mut self) -> Token<'a> {
        self.take_digits();
        if self.peek_next_char() == Some('.') {
            if !matches!(self.peek_next_next_char(), Some('0'..='9')) {
                self.take_next_char();
                return self.err_token("Invalid number literal!".to_string());
            }
            self.take_next_char();
            self.take_digits();
        }
        if matches!(self.peek_next_char(), Some('e' | 'E')) {
            let rest = &self.unscanned_input()[1..];
            let exponent = rest
                .strip_prefix(|c: char| c == '+' || c == '-')
                .unwrap_or(rest);
            if exponent.starts_with(|c: char| c.is_ascii_digit()) {
                self.take_next_char();
                if matches!(self.peek_next_char(), Some('+' | '-')) {
                    self.take_next_char();
                }
                self.take_digits();
            }
        }
        let glued = self
            .peek_next_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '.');
        if glued || self.input[..self.scanned_input_len].ends_with('_') {
            while self
                .peek_next_char()
                .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '.')
            {
                self.take_next_char();
            }
            return self.err_token("Invalid number literal!".to_string());
        }
        self.make_token(TokenType::Number)
    }

    fn take_digits(&mut self) {
        while let Some('0'..='9' | '_') = self.peek_next_char() {
            self.take_next_char();
        }
    }

    fn scan_identifier_or_keyword(&mut self) -> Token<'a> {
        while self
            .peek_next_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '_')
        {
            self.take_next_char();
        }
        self.make_token(token_type_from_str(&self.input[0..self.scanned_input_len]))
    }
}

fn token_type_from_str(token_text: &str) -> TokenType {
    match token_text {
        "var" => TokenType::Var,
        "fn" => TokenType::Fn,
        "if" => TokenType::If,
        "elif" => TokenType::Elif,
        "else" => TokenType::Else,
        "for" => TokenType::For,
        "in" => TokenType::In,
        "while" => TokenType::While,
        "return" => TokenType::Return,
        "break" => TokenType::Break,
        "continue" => TokenType::Continue,
        "reflect" => TokenType::Reflect,
        "shine" => TokenType::Shine,
        "extern" => TokenType::Extern,
        "delete" => TokenType::Delete,
        "true" => TokenType::True,
        "false" => TokenType::False,
        "and" => TokenType::And,
        "or" => TokenType::Or,
        _ => TokenType::Identifier,
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

impl<'a> FusedIterator for Scanner<'a> {}

#[cfg(test)]
mod test {
    use super::*;

    fn types(text: &str) -> Vec<TokenType> {
        Scanner::new(text).map(|t| t.typ).collect()
    }

    #[test]
    fn big_happy_path_test() {
        let input = r#"
var x = 1_000.5 ## comment
x += 'hi' -> :: ##* spans
lines *## y[0]
"#;
        let tokens: Vec<Token<'_>> = Scanner::new(input).collect();
        let expected = vec![
            (TokenType::Var, "var", 2, 1),
            (TokenType::Identifier, "x", 2, 5),
            (TokenType::Equal, "=", 2, 7),
            (TokenType::Number, "1_000.5", 2, 9),
            (TokenType::Identifier, "x", 3, 1),
            (TokenType::PlusEqual, "+=", 3, 3),
            (TokenType::String, "'hi'", 3, 6),
            (TokenType::Arrow, "->", 3, 11),
            (TokenType::DoubleColon, "::", 3, 14),
            (TokenType::Identifier, "y", 4, 11),
            (TokenType::LeftBracket, "[", 4, 12),
            (TokenType::Number, "0", 4, 13),
            (TokenType::RightBracket, "]", 4, 14),
            (TokenType::Eof, "", 5, 1),
        ];
        assert_eq!(tokens.len(), expected.len());
        for (i, (got, (typ, raw, line, column))) in tokens.into_iter().zip(expected).enumerate() {
            let expected = Token {
                typ,
                raw: raw.into(),
                line,
                column,
            };
            assert_eq!(expected, got, "on the token number {}", i);
        }
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let text = "var fn if elif else for in while return break continue reflect shine extern delete true false and or fnord _x";
        assert_eq!(
            types(text),
            vec![
                TokenType::Var,
                TokenType::Fn,
                TokenType::If,
                TokenType::Elif,
                TokenType::Else,
                TokenType::For,
                TokenType::In,
                TokenType::While,
                TokenType::Return,
                TokenType::Break,
                TokenType::Continue,
                TokenType::Reflect,
                TokenType::Shine,
                TokenType::Extern,
                TokenType::Delete,
                TokenType::True,
                TokenType::False,
                TokenType::And,
                TokenType::Or,
                TokenType::Identifier,
                TokenType::Identifier,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            types("&& || == != >= <= > < ! ^ % ^= %= -= *= /="),
            vec![
                TokenType::And,
                TokenType::Or,
                TokenType::EqualEqual,
                TokenType::BangEqual,
                TokenType::GreaterEqual,
                TokenType::LessEqual,
                TokenType::Greater,
                TokenType::Less,
                TokenType::Bang,
                TokenType::Caret,
                TokenType::Percent,
                TokenType::CaretEqual,
                TokenType::PercentEqual,
                TokenType::MinusEqual,
                TokenType::StarEqual,
                TokenType::SlashEqual,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn strings_keep_escapes_and_delimiters() {
        let tokens: Vec<_> = Scanner::new(r#""a \"b\"" `c`"#).collect();
        assert_eq!(tokens[0].raw, r#""a \"b\"""#);
        assert_eq!(tokens[1].raw, "`c`");
    }

    #[test]
    fn exponents() {
        let tokens: Vec<_> = Scanner::new("2e10 1.5E-3").collect();
        assert_eq!(tokens[0].raw, "2e10");
        assert_eq!(tokens[1].raw, "1.5E-3");
    }

    #[test]
    fn malformed_numbers() {
        for text in ["1_", "12abc", "3.", "1e"] {
            let first = Scanner::new(text).next().unwrap();
            assert_eq!(first.typ, TokenType::Error, "for {}", text);
            assert_eq!(first.raw, "Invalid number literal!");
        }
    }

    #[test]
    fn unterminated() {
        assert_eq!(types("\"abc")[0], TokenType::Error);
        assert_eq!(types("##* never closed")[0], TokenType::Error);
        assert_eq!(types("#")[0], TokenType::Error);
    }
}
