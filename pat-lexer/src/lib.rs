//! Converts a source's text into a token stream with locations.

pub mod error;
pub mod token;

use pat_diagnostics::{Location, SourceId};
use token::{FloatSuffix, IntSuffix, Keyword, Operator, Separator, Token, TokenKind, ValueType};
use ustr::Ustr;

pub use error::Error;

struct Cursor<'a> {
    source: SourceId,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Cursor<'a> {
    fn new(source: SourceId, text: &'a str) -> Self {
        Self { source, chars: text.chars().collect(), pos: 0, line: 1, column: 1 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn loc(&self, start_line: u32, start_col: u32, len: u32) -> Location {
        Location::new(self.source, start_line, start_col, len)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }
}

/// Lexes `text` (from `source`) into a token stream, collecting as many
/// [`Error`]s as possible rather than stopping at the first one.
pub fn lex(source: SourceId, text: &str) -> (Vec<Token>, Vec<Error>) {
    let mut cur = Cursor::new(source, text);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    loop {
        let Some(c) = cur.peek() else { break };

        if c.is_whitespace() {
            cur.bump();
            continue;
        }

        let start_line = cur.line;
        let start_col = cur.column;

        if c == '/' && cur.peek_at(1) == Some('/') {
            lex_line_comment(&mut cur, &mut tokens, start_line, start_col);
            continue;
        }

        if c == '/' && cur.peek_at(1) == Some('*') {
            lex_block_comment(&mut cur, &mut tokens, &mut errors, start_line, start_col);
            continue;
        }

        if c == '#' {
            lex_directive(&mut cur, &mut tokens, start_line, start_col);
            continue;
        }

        if c.is_ascii_digit() {
            match lex_number(&mut cur) {
                Ok(kind) => {
                    let len = (cur.column - start_col).max(1);
                    tokens.push(Token::new(kind, cur.loc(start_line, start_col, len)));
                }
                Err(text) => {
                    let len = (cur.column - start_col).max(1);
                    errors.push(Error::InvalidIntegerLiteral { text, location: cur.loc(start_line, start_col, len) });
                }
            }
            continue;
        }

        if c == '"' {
            match lex_string(&mut cur) {
                Ok(s) => {
                    let len = cur.column - start_col;
                    tokens.push(Token::new(TokenKind::String(s), cur.loc(start_line, start_col, len)));
                }
                Err(()) => {
                    let len = cur.column - start_col;
                    errors.push(Error::InvalidStringLiteral { location: cur.loc(start_line, start_col, len) });
                }
            }
            continue;
        }

        if c == '\'' {
            match lex_char(&mut cur) {
                Ok(ch) => {
                    let len = cur.column - start_col;
                    tokens.push(Token::new(TokenKind::Character(ch), cur.loc(start_line, start_col, len)));
                }
                Err(()) => {
                    let len = cur.column - start_col;
                    errors.push(Error::InvalidCharacterLiteral { location: cur.loc(start_line, start_col, len) });
                }
            }
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let ident = lex_ident(&mut cur);
            let len = ident.len() as u32;
            let loc = cur.loc(start_line, start_col, len);
            let kind = if let Some(kw) = Keyword::lookup(&ident) {
                TokenKind::Keyword(kw)
            } else if let Some(vt) = ValueType::lookup(&ident) {
                TokenKind::ValueType(vt)
            } else {
                TokenKind::Identifier(Ustr::from(&ident))
            };
            tokens.push(Token::new(kind, loc));
            continue;
        }

        if let Some((kind, width)) = lex_operator_or_separator(&mut cur) {
            let loc = cur.loc(start_line, start_col, width);
            tokens.push(Token::new(kind, loc));
            continue;
        }

        // unknown character sequence
        let bad = cur.bump().unwrap();
        errors.push(Error::UnknownSequence {
            text: bad.to_string(),
            location: cur.loc(start_line, start_col, 1),
        });
    }

    tokens.push(Token::new(TokenKind::EndOfProgram, Location::new(source, cur.line, cur.column, 0)));

    log::trace!("lexed {} bytes into {} tokens ({} errors)", text.len(), tokens.len(), errors.len());
    (tokens, errors)
}

fn lex_line_comment(cur: &mut Cursor, tokens: &mut Vec<Token>, line: u32, col: u32) {
    cur.bump();
    cur.bump(); // `//`

    let global = cur.peek() == Some('!');
    let doc = cur.peek() == Some('/') || global;
    if doc {
        cur.bump();
    }

    let mut text = String::new();
    while let Some(c) = cur.peek() {
        if c == '\n' {
            break;
        }
        text.push(c);
        cur.bump();
    }

    let len = cur.column - col;
    let loc = cur.loc(line, col, len);
    let kind = if doc {
        TokenKind::DocComment { global, single_line: true, text: text.trim().to_string() }
    } else {
        TokenKind::Comment(text.trim().to_string())
    };
    tokens.push(Token::new(kind, loc));
}

fn lex_block_comment(cur: &mut Cursor, tokens: &mut Vec<Token>, errors: &mut Vec<Error>, line: u32, col: u32) {
    cur.bump();
    cur.bump(); // `/*`

    let global = cur.peek() == Some('!');
    let doc = cur.peek() == Some('*') || global;
    if doc {
        cur.bump();
    }

    let mut text = String::new();
    let mut terminated = false;
    while let Some(c) = cur.peek() {
        if c == '*' && cur.peek_at(1) == Some('/') {
            cur.bump();
            cur.bump();
            terminated = true;
            break;
        }
        text.push(c);
        cur.bump();
    }

    if !terminated {
        errors.push(Error::UnknownSequence {
            text: "/*".to_string(),
            location: cur.loc(line, col, cur.column.saturating_sub(col)),
        });
        return;
    }

    let len = cur.column - col;
    let loc = cur.loc(line, col, len);
    let kind = if doc {
        TokenKind::DocComment { global, single_line: false, text: text.trim().to_string() }
    } else {
        TokenKind::Comment(text.trim().to_string())
    };
    tokens.push(Token::new(kind, loc));
}

fn lex_directive(cur: &mut Cursor, tokens: &mut Vec<Token>, line: u32, col: u32) {
    cur.bump(); // `#`
    let mut name = String::new();
    while let Some(c) = cur.peek() {
        if c.is_alphanumeric() || c == '_' {
            name.push(c);
            cur.bump();
        } else {
            break;
        }
    }
    let len = cur.column - col;
    tokens.push(Token::new(TokenKind::Directive(Ustr::from(&name)), cur.loc(line, col, len)));
}

fn lex_ident(cur: &mut Cursor) -> String {
    let mut s = String::new();
    while let Some(c) = cur.peek() {
        if c.is_alphanumeric() || c == '_' {
            s.push(c);
            cur.bump();
        } else {
            break;
        }
    }
    s
}

fn lex_number(cur: &mut Cursor) -> Result<TokenKind, String> {
    let mut raw = String::new();

    let radix = if cur.peek() == Some('0') {
        match cur.peek_at(1) {
            Some('x') | Some('X') => {
                cur.bump();
                cur.bump();
                Some(16)
            }
            Some('o') | Some('O') => {
                cur.bump();
                cur.bump();
                Some(8)
            }
            Some('b') | Some('B') => {
                cur.bump();
                cur.bump();
                Some(2)
            }
            _ => None,
        }
    } else {
        None
    };

    let digit_ok = |c: char, radix: u32| c == '\'' || c.is_digit(radix);

    if let Some(radix) = radix {
        while let Some(c) = cur.peek() {
            if digit_ok(c, radix) {
                if c != '\'' {
                    raw.push(c);
                }
                cur.bump();
            } else {
                break;
            }
        }
        if raw.is_empty() {
            return Err(raw);
        }
        let value = u128::from_str_radix(&raw, radix).map_err(|_| raw.clone())?;
        let suffix = lex_int_suffix(cur);
        return Ok(TokenKind::Integer(value, suffix));
    }

    let mut is_float = false;
    while let Some(c) = cur.peek() {
        if c.is_ascii_digit() || c == '\'' {
            if c != '\'' {
                raw.push(c);
            }
            cur.bump();
        } else {
            break;
        }
    }

    if cur.peek() == Some('.') && cur.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
        is_float = true;
        raw.push('.');
        cur.bump();
        while let Some(c) = cur.peek() {
            if c.is_ascii_digit() || c == '\'' {
                if c != '\'' {
                    raw.push(c);
                }
                cur.bump();
            } else {
                break;
            }
        }
    }

    if matches!(cur.peek(), Some('e') | Some('E')) {
        let save = (cur.pos, cur.line, cur.column);
        let mut exp = String::new();
        exp.push(cur.bump().unwrap());
        if matches!(cur.peek(), Some('+') | Some('-')) {
            exp.push(cur.bump().unwrap());
        }
        let mut has_digits = false;
        while let Some(c) = cur.peek() {
            if c.is_ascii_digit() {
                exp.push(c);
                has_digits = true;
                cur.bump();
            } else {
                break;
            }
        }
        if has_digits {
            is_float = true;
            raw.push_str(&exp);
        } else {
            (cur.pos, cur.line, cur.column) = save;
        }
    }

    if is_float {
        let suffix = match cur.peek() {
            Some('f') | Some('F') => {
                cur.bump();
                FloatSuffix::Float
            }
            Some('d') | Some('D') => {
                cur.bump();
                FloatSuffix::Double
            }
            _ => FloatSuffix::None,
        };
        let value: f64 = raw.parse().map_err(|_| raw.clone())?;
        Ok(TokenKind::Float(value, suffix))
    } else {
        // explicit float suffix with no fractional part, e.g. `1f`
        if matches!(cur.peek(), Some('f') | Some('F')) {
            cur.bump();
            let value: f64 = raw.parse().map_err(|_| raw.clone())?;
            return Ok(TokenKind::Float(value, FloatSuffix::Float));
        }
        if matches!(cur.peek(), Some('d') | Some('D')) {
            cur.bump();
            let value: f64 = raw.parse().map_err(|_| raw.clone())?;
            return Ok(TokenKind::Float(value, FloatSuffix::Double));
        }
        let value: u128 = raw.parse().map_err(|_| raw.clone())?;
        let suffix = lex_int_suffix(cur);
        Ok(TokenKind::Integer(value, suffix))
    }
}

fn lex_int_suffix(cur: &mut Cursor) -> IntSuffix {
    if matches!(cur.peek(), Some('u') | Some('U')) {
        cur.bump();
        IntSuffix::Unsigned
    } else {
        IntSuffix::None
    }
}

fn unescape(cur: &mut Cursor) -> Result<char, ()> {
    match cur.bump() {
        Some('n') => Ok('\n'),
        Some('r') => Ok('\r'),
        Some('t') => Ok('\t'),
        Some('0') => Ok('\0'),
        Some('\\') => Ok('\\'),
        Some('\'') => Ok('\''),
        Some('"') => Ok('"'),
        Some('x') => {
            let mut hex = String::new();
            for _ in 0..2 {
                match cur.peek() {
                    Some(c) if c.is_ascii_hexdigit() => {
                        hex.push(c);
                        cur.bump();
                    }
                    _ => return Err(()),
                }
            }
            let byte = u8::from_str_radix(&hex, 16).map_err(|_| ())?;
            Ok(byte as char)
        }
        _ => Err(()),
    }
}

fn lex_string(cur: &mut Cursor) -> Result<String, ()> {
    cur.bump(); // opening quote
    let mut s = String::new();
    loop {
        match cur.peek() {
            None | Some('\n') => return Err(()),
            Some('"') => {
                cur.bump();
                return Ok(s);
            }
            Some('\\') => {
                cur.bump();
                s.push(unescape(cur)?);
            }
            Some(c) => {
                s.push(c);
                cur.bump();
            }
        }
    }
}

fn lex_char(cur: &mut Cursor) -> Result<char, ()> {
    cur.bump(); // opening quote
    let ch = match cur.peek() {
        None | Some('\n') => return Err(()),
        Some('\\') => {
            cur.bump();
            unescape(cur)?
        }
        Some(c) => {
            cur.bump();
            c
        }
    };
    if cur.peek() != Some('\'') {
        return Err(());
    }
    cur.bump();
    Ok(ch)
}

fn lex_operator_or_separator(cur: &mut Cursor) -> Option<(TokenKind, u32)> {
    let c = cur.peek()?;
    let c1 = cur.peek_at(1);

    macro_rules! two {
        ($a:expr, $b:expr, $kind:expr) => {
            if c == $a && c1 == Some($b) {
                cur.bump();
                cur.bump();
                return Some(($kind, 2));
            }
        };
    }

    two!('=', '=', TokenKind::Operator(Operator::Eq));
    two!('!', '=', TokenKind::Operator(Operator::NotEq));
    two!('<', '=', TokenKind::Operator(Operator::LtEq));
    two!('>', '=', TokenKind::Operator(Operator::GtEq));
    two!('&', '&', TokenKind::Operator(Operator::AndAnd));
    two!('|', '|', TokenKind::Operator(Operator::OrOr));
    two!('^', '^', TokenKind::Operator(Operator::XorXor));
    two!('<', '<', TokenKind::Operator(Operator::Shl));
    two!('>', '>', TokenKind::Operator(Operator::Shr));
    two!(':', ':', TokenKind::Operator(Operator::ScopeRes));
    two!('-', '>', TokenKind::Operator(Operator::Arrow));

    let (kind, _) = match c {
        '+' => (TokenKind::Operator(Operator::Plus), 1),
        '-' => (TokenKind::Operator(Operator::Minus), 1),
        '*' => (TokenKind::Operator(Operator::Star), 1),
        '/' => (TokenKind::Operator(Operator::Slash), 1),
        '%' => (TokenKind::Operator(Operator::Percent), 1),
        '=' => (TokenKind::Operator(Operator::Assign), 1),
        '<' => (TokenKind::Operator(Operator::Lt), 1),
        '>' => (TokenKind::Operator(Operator::Gt), 1),
        '&' => (TokenKind::Operator(Operator::Amp), 1),
        '|' => (TokenKind::Operator(Operator::Pipe), 1),
        '^' => (TokenKind::Operator(Operator::Caret), 1),
        '~' => (TokenKind::Operator(Operator::Tilde), 1),
        '!' => (TokenKind::Operator(Operator::Not), 1),
        '.' => (TokenKind::Operator(Operator::Dot), 1),
        '@' => (TokenKind::Operator(Operator::At), 1),
        '$' => (TokenKind::Operator(Operator::Dollar), 1),
        '?' => (TokenKind::Operator(Operator::Question), 1),
        ':' => (TokenKind::Operator(Operator::Colon), 1),
        '(' => (TokenKind::Separator(Separator::LParen), 1),
        ')' => (TokenKind::Separator(Separator::RParen), 1),
        '{' => (TokenKind::Separator(Separator::LBrace), 1),
        '}' => (TokenKind::Separator(Separator::RBrace), 1),
        '[' => (TokenKind::Separator(Separator::LBracket), 1),
        ']' => (TokenKind::Separator(Separator::RBracket), 1),
        ';' => (TokenKind::Separator(Separator::Semi), 1),
        ',' => (TokenKind::Separator(Separator::Comma), 1),
        _ => return None,
    };
    cur.bump();
    Some((kind, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use token::TokenKind::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = lex(1, src);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_struct_decl() {
        let ks = kinds("struct P { u8 a; u16 b; };");
        assert_eq!(
            ks,
            vec![
                Keyword(token::Keyword::Struct),
                Identifier(Ustr::from("P")),
                Separator(token::Separator::LBrace),
                ValueType(token::ValueType::U8),
                Identifier(Ustr::from("a")),
                Separator(token::Separator::Semi),
                ValueType(token::ValueType::U16),
                Identifier(Ustr::from("b")),
                Separator(token::Separator::Semi),
                Separator(token::Separator::RBrace),
                Separator(token::Separator::Semi),
                EndOfProgram,
            ]
        );
    }

    #[test]
    fn lexes_hex_and_separated_decimal() {
        let ks = kinds("0x1A 1'000'000");
        assert_eq!(ks, vec![Integer(0x1A, IntSuffix::None), Integer(1_000_000, IntSuffix::None), EndOfProgram]);
    }

    #[test]
    fn lexes_float_with_exponent_and_suffix() {
        let ks = kinds("1.5e2f");
        assert_eq!(ks, vec![Float(150.0, FloatSuffix::Float), EndOfProgram]);
    }

    #[test]
    fn lexes_doc_comments() {
        let ks = kinds("/// hello\nu8 a;");
        assert_eq!(
            ks[0],
            DocComment { global: false, single_line: true, text: "hello".into() }
        );
    }

    #[test]
    fn invalid_char_literal_reports_l0001() {
        let (_, errors) = lex(1, "'ab'");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), 1);
    }

    #[test]
    fn unterminated_block_comment_errors() {
        let (_, errors) = lex(1, "/* never closed");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), 4);
    }

    #[test]
    fn scope_resolution_is_two_chars() {
        let ks = kinds("std::mem");
        assert_eq!(
            ks,
            vec![
                Identifier(Ustr::from("std")),
                Operator(token::Operator::ScopeRes),
                Identifier(Ustr::from("mem")),
                EndOfProgram,
            ]
        );
    }
}
