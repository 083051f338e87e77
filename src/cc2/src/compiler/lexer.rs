
use super::*;

/// One token of the compiled dialect. Tokens are produced one at a time into
/// a caller-owned record; there is no token list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Parsed value for integer and character literals.
    pub value: i32,
    /// Identifier spelling or string-literal payload, truncated at
    /// [`TOKEN_TEXT_MAX`] bytes.
    pub text: String,
}

impl Token {
    pub fn new() -> Token {
        Token {
            kind: TokenKind::Eof,
            value: 0,
            text: String::new(),
        }
    }

    pub fn clear(&mut self) {
        self.kind = TokenKind::Eof;
        self.value = 0;
        self.text.clear();
    }

    fn set(&mut self, kind: TokenKind, text: &str) {
        self.kind = kind;
        self.text.clear();
        self.text.push_str(text);
    }

    fn push_text(&mut self, b: u8) {
        if self.text.len() < TOKEN_TEXT_MAX {
            self.text.push(b as char);
        }
    }
}

impl Default for Token {
    fn default() -> Token {
        Token::new()
    }
}

/// Saved cursor state, used by the parser to rewind after speculative reads
/// (cast sniffing, parenthesised-lvalue sniffing, statement fallbacks).
#[derive(Debug, Clone, Copy)]
pub struct LexMark {
    pos: usize,
    line: u32,
}

/// Stateful cursor over the preprocessed byte stream.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a [u8]) -> Lexer<'a> {
        Lexer { src, pos: 0, line: 1 }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn mark(&self) -> LexMark {
        LexMark {
            pos: self.pos,
            line: self.line,
        }
    }

    pub fn rewind(&mut self, mark: LexMark) {
        self.pos = mark.pos;
        self.line = mark.line;
    }

    fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn peek2(&self) -> u8 {
        self.src.get(self.pos + 1).copied().unwrap_or(0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        if c != 0 {
            self.pos += 1;
            if c == b'\n' {
                self.line += 1;
            }
        }
        c
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'/' if self.peek2() == b'/' => {
                    self.bump();
                    self.bump();
                    while self.peek() != 0 && self.peek() != b'\n' {
                        self.bump();
                    }
                }
                b'/' if self.peek2() == b'*' => {
                    self.bump();
                    self.bump();
                    loop {
                        let c = self.peek();
                        if c == 0 {
                            break;
                        }
                        if c == b'*' && self.peek2() == b'/' {
                            self.bump();
                            self.bump();
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_ident(&mut self, out: &mut Token) {
        while ident_body(self.peek()) {
            let c = self.bump();
            out.push_text(c);
        }
        out.kind = TokenKind::from_keyword(&out.text).unwrap_or(TokenKind::Ident);
    }

    fn read_number(&mut self, out: &mut Token) {
        let mut v: i32 = 0;
        if self.peek() == b'0' && (self.peek2() == b'x' || self.peek2() == b'X') {
            out.push_text(self.bump());
            out.push_text(self.bump());
            while let Some(d) = hex_digit(self.peek()) {
                v = (v << 4) | d;
                out.push_text(self.bump());
            }
        } else {
            while self.peek().is_ascii_digit() {
                v = v.wrapping_mul(10).wrapping_add((self.peek() - b'0') as i32);
                out.push_text(self.bump());
            }
        }
        out.kind = TokenKind::IntLit;
        out.value = v;
    }

    /// Decodes one character after a backslash has been consumed.
    fn read_escape(&mut self) -> u8 {
        let esc = self.bump();
        match esc {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'0' => 0,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'x' => {
                let Some(d1) = hex_digit(self.peek()) else {
                    return 0;
                };
                self.bump();
                if let Some(d2) = hex_digit(self.peek()) {
                    self.bump();
                    ((d1 << 4) | d2) as u8
                } else {
                    d1 as u8
                }
            }
            other => other,
        }
    }

    /// Produces the next token into `out`. EOF is returned once the cursor
    /// reaches the terminating NUL byte or the end of the buffer.
    pub fn next(&mut self, out: &mut Token) {
        out.clear();
        self.skip_ws();
        let c = self.peek();
        if c == 0 {
            out.kind = TokenKind::Eof;
            return;
        }
        if ident_start(c) {
            self.read_ident(out);
            return;
        }
        if c.is_ascii_digit() {
            self.read_number(out);
            return;
        }
        if c == b'"' {
            self.bump();
            while self.peek() != 0 && self.peek() != b'"' {
                let ch = self.bump();
                let v = if ch == b'\\' { self.read_escape() } else { ch };
                out.push_text(v);
            }
            if self.peek() == b'"' {
                self.bump();
            }
            out.kind = TokenKind::String;
            return;
        }
        if c == b'\'' {
            self.bump();
            let ch = self.bump();
            let v = if ch == b'\\' { self.read_escape() } else { ch };
            if self.peek() == b'\'' {
                self.bump();
            }
            out.kind = TokenKind::IntLit;
            out.value = v as i32;
            out.text.push('\'');
            return;
        }

        self.bump();
        match c {
            b'=' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::EqEq, "==");
            }
            b'=' => out.set(TokenKind::Eq, "="),
            b'!' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::Ne, "!=");
            }
            b'!' => out.set(TokenKind::Bang, "!"),
            b';' => out.set(TokenKind::Semi, ";"),
            b',' => out.set(TokenKind::Comma, ","),
            b'?' => out.set(TokenKind::Question, "?"),
            b':' => out.set(TokenKind::Colon, ":"),
            b'(' => out.set(TokenKind::LParen, "("),
            b')' => out.set(TokenKind::RParen, ")"),
            b'{' => out.set(TokenKind::LBrace, "{"),
            b'}' => out.set(TokenKind::RBrace, "}"),
            b'[' => out.set(TokenKind::LBracket, "["),
            b']' => out.set(TokenKind::RBracket, "]"),
            b'.' => out.set(TokenKind::Dot, "."),
            b'<' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::Le, "<=");
            }
            b'<' if self.peek() == b'<' && self.peek2() == b'=' => {
                self.bump();
                self.bump();
                out.set(TokenKind::ShlEq, "<<=");
            }
            b'<' if self.peek() == b'<' => {
                self.bump();
                out.set(TokenKind::Shl, "<<");
            }
            b'<' => out.set(TokenKind::Lt, "<"),
            b'>' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::Ge, ">=");
            }
            b'>' if self.peek() == b'>' && self.peek2() == b'=' => {
                self.bump();
                self.bump();
                out.set(TokenKind::ShrEq, ">>=");
            }
            b'>' if self.peek() == b'>' => {
                self.bump();
                out.set(TokenKind::Shr, ">>");
            }
            b'>' => out.set(TokenKind::Gt, ">"),
            b'+' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::PlusEq, "+=");
            }
            b'+' if self.peek() == b'+' => {
                self.bump();
                out.set(TokenKind::PlusPlus, "++");
            }
            b'+' => out.set(TokenKind::Plus, "+"),
            b'-' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::MinusEq, "-=");
            }
            b'-' if self.peek() == b'-' => {
                self.bump();
                out.set(TokenKind::MinusMinus, "--");
            }
            // `->` and `.` deliberately share a kind: structs and struct
            // pointers are disambiguated by symbol kind at parse time.
            b'-' if self.peek() == b'>' => {
                self.bump();
                out.set(TokenKind::Dot, ".");
            }
            b'-' => out.set(TokenKind::Minus, "-"),
            b'*' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::StarEq, "*=");
            }
            b'*' => out.set(TokenKind::Star, "*"),
            b'%' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::PercentEq, "%=");
            }
            b'%' => out.set(TokenKind::Percent, "%"),
            b'/' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::SlashEq, "/=");
            }
            b'/' => out.set(TokenKind::Slash, "/"),
            b'&' if self.peek() == b'&' => {
                self.bump();
                out.set(TokenKind::AndAnd, "&&");
            }
            b'&' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::AndEq, "&=");
            }
            b'&' => out.set(TokenKind::Amp, "&"),
            b'|' if self.peek() == b'|' => {
                self.bump();
                out.set(TokenKind::OrOr, "||");
            }
            b'|' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::OrEq, "|=");
            }
            b'|' => out.set(TokenKind::Pipe, "|"),
            b'^' if self.peek() == b'=' => {
                self.bump();
                out.set(TokenKind::XorEq, "^=");
            }
            b'^' => out.set(TokenKind::Caret, "^"),
            b'~' => out.set(TokenKind::Tilde, "~"),
            other => {
                out.kind = TokenKind::Unknown;
                out.text.push(other as char);
            }
        }
    }
}

pub fn ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

pub fn ident_body(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

pub fn hex_digit(c: u8) -> Option<i32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as i32),
        b'a'..=b'f' => Some(10 + (c - b'a') as i32),
        b'A'..=b'F' => Some(10 + (c - b'A') as i32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(src.as_bytes());
        let mut out = Vec::new();
        let mut tok = Token::new();
        loop {
            lx.next(&mut tok);
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok.clone());
        }
        out
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex_all(src).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_a_declaration() {
        assert_eq!(
            kinds("int x = 42;"),
            vec![
                TokenKind::IntKw,
                TokenKind::Ident,
                TokenKind::Eq,
                TokenKind::IntLit,
                TokenKind::Semi
            ]
        );
    }

    #[test]
    fn integer_literals_carry_values() {
        let toks = lex_all("10 0x1F 0XFF");
        assert_eq!(toks[0].value, 10);
        assert_eq!(toks[1].value, 0x1f);
        assert_eq!(toks[2].value, 0xff);
    }

    #[test]
    fn char_literals_become_int_lits() {
        let toks = lex_all(r"'a' '\n' '\x41' '\0'");
        let vals: Vec<i32> = toks.iter().map(|t| t.value).collect();
        assert_eq!(vals, vec![97, 10, 0x41, 0]);
        assert!(toks.iter().all(|t| t.kind == TokenKind::IntLit));
    }

    #[test]
    fn string_literals_decode_escapes() {
        let toks = lex_all(r#""hi\tthere\x21""#);
        assert_eq!(toks[0].kind, TokenKind::String);
        assert_eq!(toks[0].text, "hi\tthere!");
    }

    #[test]
    fn arrow_and_dot_share_a_kind() {
        assert_eq!(kinds("p->x"), kinds("p.x"));
        assert_eq!(kinds("p->x")[1], TokenKind::Dot);
    }

    #[test]
    fn comments_are_skipped_and_lines_counted() {
        let src = "a // one\n/* two\nthree */ b";
        let mut lx = Lexer::new(src.as_bytes());
        let mut tok = Token::new();
        lx.next(&mut tok);
        assert_eq!(tok.text, "a");
        lx.next(&mut tok);
        assert_eq!(tok.text, "b");
        assert_eq!(lx.line(), 3);
    }

    #[test]
    fn compound_operators_take_longest_match() {
        assert_eq!(
            kinds("<<= >>= << >> <= >= ++ -- && || += ^="),
            vec![
                TokenKind::ShlEq,
                TokenKind::ShrEq,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::PlusEq,
                TokenKind::XorEq,
            ]
        );
    }

    #[test]
    fn unknown_bytes_do_not_halt() {
        let toks = lex_all("a @ b");
        assert_eq!(toks[1].kind, TokenKind::Unknown);
        assert_eq!(toks[2].text, "b");
    }

    #[test]
    fn nul_terminates_the_stream() {
        let src = b"a\0b";
        let mut lx = Lexer::new(src);
        let mut tok = Token::new();
        lx.next(&mut tok);
        assert_eq!(tok.text, "a");
        lx.next(&mut tok);
        assert_eq!(tok.kind, TokenKind::Eof);
    }

    // Relexing each token's reconstructed text reproduces the stream.
    #[test]
    fn relex_is_stable() {
        let src = "int f(int n){ if(n<=1) return n; return f(n-1)+f(n-2); }";
        let first = lex_all(src);
        let rebuilt: String = first
            .iter()
            .map(|t| match t.kind {
                TokenKind::String => format!("\"{}\" ", t.text),
                TokenKind::IntLit => format!("{} ", t.value),
                _ => format!("{} ", t.text),
            })
            .collect();
        let second = lex_all(&rebuilt);
        let a: Vec<TokenKind> = first.iter().map(|t| t.kind).collect();
        let b: Vec<TokenKind> = second.iter().map(|t| t.kind).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn rewind_restores_position_and_line() {
        let mut lx = Lexer::new(b"a\nb c");
        let mut tok = Token::new();
        lx.next(&mut tok);
        let mark = lx.mark();
        lx.next(&mut tok);
        assert_eq!(tok.text, "b");
        lx.rewind(mark);
        lx.next(&mut tok);
        assert_eq!(tok.text, "b");
        assert_eq!(lx.line(), 2);
    }
}
