
macro_rules! token_kinds {
    ($($name:ident = $value:literal, $label:literal;)*) => {
        /// Token kinds of the compiled dialect.
        ///
        /// The numeric values are part of the dialect itself: programs
        /// under compilation (including the compiler's own sources) name
        /// them through the `CC2_TK_*` constant vocabulary, so the
        /// discriminants are fixed and `Unknown` keeps its historical slot
        /// at 99.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum TokenKind {
            $($name = $value,)*
        }

        impl TokenKind {
            pub fn name(&self) -> &'static str {
                match self {
                    $(TokenKind::$name => $label,)*
                }
            }

            /// Resolves a `CC2_TK_*` spelling to its dialect value.
            pub fn dialect_const(ident: &str) -> Option<i32> {
                match ident.strip_prefix("CC2_TK_")? {
                    $($label => Some($value),)*
                    _ => None,
                }
            }
        }
    };
}

token_kinds! {
    Eof = 0, "EOF";
    IntKw = 1, "INT_KW";
    If = 2, "IF";
    Ident = 3, "IDENT";
    IntLit = 4, "INT_LIT";
    Eq = 5, "EQ";
    Semi = 6, "SEMI";
    LParen = 7, "LPAREN";
    RParen = 8, "RPAREN";
    Ge = 9, "GE";
    PlusEq = 10, "PLUSEQ";
    Plus = 11, "PLUS";
    Minus = 12, "MINUS";
    Star = 13, "STAR";
    Slash = 14, "SLASH";
    Return = 15, "RETURN";
    EqEq = 16, "EQEQ";
    Ne = 17, "NE";
    Lt = 18, "LT";
    Le = 19, "LE";
    Gt = 20, "GT";
    While = 21, "WHILE";
    Break = 22, "BREAK";
    Continue = 23, "CONTINUE";
    LBrace = 24, "LBRACE";
    RBrace = 25, "RBRACE";
    Else = 26, "ELSE";
    For = 27, "FOR";
    Comma = 28, "COMMA";
    AndAnd = 29, "ANDAND";
    OrOr = 30, "OROR";
    Bang = 31, "BANG";
    Percent = 32, "PERCENT";
    Amp = 33, "AMP";
    Pipe = 34, "PIPE";
    Caret = 35, "CARET";
    Shl = 36, "SHL";
    Shr = 37, "SHR";
    Tilde = 38, "TILDE";
    Struct = 39, "STRUCT";
    Dot = 40, "DOT";
    LBracket = 41, "LBRACKET";
    RBracket = 42, "RBRACKET";
    MinusEq = 43, "MINUSEQ";
    StarEq = 44, "STAREQ";
    SlashEq = 45, "SLASHEQ";
    PercentEq = 46, "PERCENTEQ";
    AndEq = 47, "ANDEQ";
    OrEq = 48, "OREQ";
    XorEq = 49, "XOREQ";
    ShlEq = 50, "SHLEQ";
    ShrEq = 51, "SHREQ";
    PlusPlus = 52, "PLUSPLUS";
    MinusMinus = 53, "MINUSMINUS";
    Question = 54, "QUESTION";
    Colon = 55, "COLON";
    Switch = 56, "SWITCH";
    Case = 57, "CASE";
    Default = 58, "DEFAULT";
    Do = 59, "DO";
    Asm = 60, "ASM";
    String = 61, "STRING";
    Unknown = 99, "UNKNOWN";
}

impl TokenKind {
    pub fn from_keyword(text: &str) -> Option<TokenKind> {
        match text {
            "int" => Some(TokenKind::IntKw),
            "if" => Some(TokenKind::If),
            "else" => Some(TokenKind::Else),
            "for" => Some(TokenKind::For),
            "return" => Some(TokenKind::Return),
            "while" => Some(TokenKind::While),
            "break" => Some(TokenKind::Break),
            "continue" => Some(TokenKind::Continue),
            "struct" => Some(TokenKind::Struct),
            "switch" => Some(TokenKind::Switch),
            "case" => Some(TokenKind::Case),
            "default" => Some(TokenKind::Default),
            "do" => Some(TokenKind::Do),
            "asm" => Some(TokenKind::Asm),
            _ => None,
        }
    }

    /// Binary operator precedence; 0 means "not a binary operator".
    pub fn precedence(&self) -> i32 {
        match self {
            TokenKind::OrOr => 1,
            TokenKind::AndAnd => 2,
            TokenKind::Pipe => 3,
            TokenKind::Caret => 4,
            TokenKind::Amp => 5,
            TokenKind::EqEq | TokenKind::Ne => 6,
            TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge => 7,
            TokenKind::Shl | TokenKind::Shr => 8,
            TokenKind::Plus | TokenKind::Minus => 9,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 10,
            _ => 0,
        }
    }

    pub fn is_compound_assign(&self) -> bool {
        matches!(
            self,
            TokenKind::PlusEq
                | TokenKind::MinusEq
                | TokenKind::StarEq
                | TokenKind::SlashEq
                | TokenKind::PercentEq
                | TokenKind::AndEq
                | TokenKind::OrEq
                | TokenKind::XorEq
                | TokenKind::ShlEq
                | TokenKind::ShrEq
        )
    }

    pub fn is_assign_op(&self) -> bool {
        *self == TokenKind::Eq
            || self.is_compound_assign()
            || matches!(self, TokenKind::PlusPlus | TokenKind::MinusMinus)
    }
}

/// Spellings that are consumed as part of a type prefix. All of them denote
/// word-sized values except the byte types, which select byte loads/stores
/// for globals and array elements.
pub fn is_type_word(name: &str) -> bool {
    matches!(
        name,
        "char"
            | "short"
            | "long"
            | "unsigned"
            | "signed"
            | "void"
            | "const"
            | "volatile"
            | "uint8_t"
            | "uint16_t"
            | "uint32_t"
            | "int8_t"
            | "int16_t"
            | "int32_t"
            | "size_t"
    )
}

pub fn is_byte_type(name: &str) -> bool {
    matches!(name, "char" | "uint8_t" | "int8_t")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_values_are_stable() {
        assert_eq!(TokenKind::Eof as i32, 0);
        assert_eq!(TokenKind::String as i32, 61);
        assert_eq!(TokenKind::Unknown as i32, 99);
        assert_eq!(TokenKind::dialect_const("CC2_TK_SHREQ"), Some(51));
        assert_eq!(TokenKind::dialect_const("CC2_TK_NOPE"), None);
    }

    #[test]
    fn precedence_orders_operators() {
        assert!(TokenKind::Star.precedence() > TokenKind::Plus.precedence());
        assert!(TokenKind::Plus.precedence() > TokenKind::Shl.precedence());
        assert!(TokenKind::EqEq.precedence() > TokenKind::AndAnd.precedence());
        assert_eq!(TokenKind::Eq.precedence(), 0);
    }

    #[test]
    fn keywords_resolve() {
        assert_eq!(TokenKind::from_keyword("do"), Some(TokenKind::Do));
        assert_eq!(TokenKind::from_keyword("asm"), Some(TokenKind::Asm));
        assert_eq!(TokenKind::from_keyword("main"), None);
    }
}
