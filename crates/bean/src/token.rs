//! Token kinds and tokens produced by the lexer.

use strum::IntoStaticStr;

use crate::position::Position;

/// Every token kind in the language.
///
/// The strum-derived `Into<&'static str>` conversion gives each kind a total,
/// human-readable name used in parse diagnostics ("expected \"(\", got ...").
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum TokenKind {
    #[strum(serialize = "ILLEGAL")]
    Illegal,
    #[strum(serialize = "EOF")]
    Eof,

    // Operators
    #[strum(serialize = "=")]
    Assign,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "!")]
    Bang,
    #[strum(serialize = "*")]
    Asterisk,
    #[strum(serialize = "/")]
    Slash,
    #[strum(serialize = "%")]
    Percent,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Lte,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Gte,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "<<")]
    Lshift,
    #[strum(serialize = ">>")]
    Rshift,

    // Compound assignment
    #[strum(serialize = "+=")]
    PlusAssign,
    #[strum(serialize = "-=")]
    MinusAssign,
    #[strum(serialize = "*=")]
    AsteriskAssign,
    #[strum(serialize = "/=")]
    SlashAssign,
    #[strum(serialize = "%=")]
    PercentAssign,
    #[strum(serialize = "&=")]
    BitAndAssign,
    #[strum(serialize = "|=")]
    BitOrAssign,
    #[strum(serialize = "^=")]
    BitXorAssign,
    #[strum(serialize = "<<=")]
    LshiftAssign,
    #[strum(serialize = ">>=")]
    RshiftAssign,

    // Delimiters
    #[strum(serialize = ",")]
    Comma,
    #[strum(serialize = ";")]
    Semicolon,
    #[strum(serialize = ":")]
    Colon,
    #[strum(serialize = "(")]
    Lparen,
    #[strum(serialize = ")")]
    Rparen,
    #[strum(serialize = "{")]
    Lbrace,
    #[strum(serialize = "}")]
    Rbrace,
    #[strum(serialize = "[")]
    Lbracket,
    #[strum(serialize = "]")]
    Rbracket,
    #[strum(serialize = ".")]
    Dot,

    // Literals and identifiers
    #[strum(serialize = "IDENT")]
    Ident,
    #[strum(serialize = "NUMBER")]
    Number,
    #[strum(serialize = "STRING")]
    String,

    // Keywords
    #[strum(serialize = "fn")]
    Function,
    #[strum(serialize = "const")]
    Const,
    #[strum(serialize = "var")]
    Var,
    #[strum(serialize = "true")]
    True,
    #[strum(serialize = "false")]
    False,
    #[strum(serialize = "if")]
    If,
    #[strum(serialize = "else")]
    Else,
    #[strum(serialize = "return")]
    Return,
    #[strum(serialize = "while")]
    While,
    #[strum(serialize = "break")]
    Break,
    #[strum(serialize = "for")]
    For,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "continue")]
    Continue,
    #[strum(serialize = "null")]
    Null,
    #[strum(serialize = "import")]
    Import,
    #[strum(serialize = "recover")]
    Recover,
}

impl TokenKind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Maps an identifier spelling to its keyword kind, if it is one.
pub fn lookup_keyword(ident: &str) -> Option<TokenKind> {
    let kind = match ident {
        "fn" => TokenKind::Function,
        "const" => TokenKind::Const,
        "var" => TokenKind::Var,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "return" => TokenKind::Return,
        "while" => TokenKind::While,
        "break" => TokenKind::Break,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "continue" => TokenKind::Continue,
        "null" => TokenKind::Null,
        "import" => TokenKind::Import,
        "recover" => TokenKind::Recover,
        _ => return None,
    };
    Some(kind)
}

/// A token borrowing its literal text from the source buffer.
#[derive(Debug, Clone)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub literal: &'src str,
    pub position: Position,
}

impl<'src> Token<'src> {
    pub fn new(kind: TokenKind, literal: &'src str, position: Position) -> Self {
        Self {
            kind,
            literal,
            position,
        }
    }

    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }
}
