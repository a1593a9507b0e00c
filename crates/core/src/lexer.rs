use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifiers and keywords, distinguished in the parser
    Ident(String),
    /// Quoted string literal (content without quotes, escapes resolved)
    Str(String),
    /// Numeric literal, kept as text to preserve the exact decimal
    Number(String),
    // Punctuation
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Assign,
    /// `;` or a newline
    Separator,
    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    // Comparison
    EqEq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    // Logical
    AndAnd,
    OrOr,
    Bang,
    // End of input
    Eof,
}

impl Token {
    /// Source-like rendering used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Number(n) => n.clone(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Question => "?".into(),
            Token::Colon => ":".into(),
            Token::Assign => "=".into(),
            Token::Separator => ";".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Percent => "%".into(),
            Token::EqEq => "==".into(),
            Token::Neq => "!=".into(),
            Token::Lt => "<".into(),
            Token::Lte => "<=".into(),
            Token::Gt => ">".into(),
            Token::Gte => ">=".into(),
            Token::AndAnd => "&&".into(),
            Token::OrOr => "||".into(),
            Token::Bang => "!".into(),
            Token::Eof => "end of expression".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    /// Character offset of the first character of the token.
    pub pos: usize,
}

pub fn lex(src: &str) -> Result<Vec<Spanned>, ValidationError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut pos = 0usize;

    let push = |tokens: &mut Vec<Spanned>, token: Token, at: usize| {
        tokens.push(Spanned { token, pos: at });
    };

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        // Line comment
        if c == '#' {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        if c == '\n' || c == ';' {
            // Collapse runs of separators; the parser skips leading ones too.
            if !matches!(tokens.last(), Some(Spanned { token: Token::Separator, .. })) {
                push(&mut tokens, Token::Separator, start);
            }
            pos += 1;
            continue;
        }

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        // String literal
        if c == '"' || c == '\'' {
            let quote = c;
            pos += 1;
            let mut s = String::new();
            loop {
                if pos >= chars.len() || chars[pos] == '\n' {
                    return Err(ValidationError::syntax(start, "unterminated string literal")
                        .with_token(quote.to_string()));
                }
                let sc = chars[pos];
                if sc == quote {
                    pos += 1;
                    break;
                }
                if sc == '\\' {
                    pos += 1;
                    if pos >= chars.len() {
                        return Err(ValidationError::syntax(start, "unterminated escape in string"));
                    }
                    match chars[pos] {
                        '"' => s.push('"'),
                        '\'' => s.push('\''),
                        '\\' => s.push('\\'),
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        other => {
                            return Err(ValidationError::syntax(
                                pos,
                                format!("unknown escape '\\{}' in string", other),
                            )
                            .with_token(format!("\\{}", other)))
                        }
                    }
                    pos += 1;
                    continue;
                }
                s.push(sc);
                pos += 1;
            }
            push(&mut tokens, Token::Str(s), start);
            continue;
        }

        // Number: digits with an optional fractional part. No exponent form.
        if c.is_ascii_digit() {
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos < chars.len() && chars[pos] == '.' {
                if pos + 1 < chars.len() && chars[pos + 1].is_ascii_digit() {
                    pos += 1;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                } else {
                    return Err(ValidationError::syntax(pos, "expected digit after '.'")
                        .with_token("."));
                }
            }
            if pos < chars.len() && (chars[pos].is_alphabetic() || chars[pos] == '_') {
                return Err(ValidationError::syntax(start, "malformed number")
                    .with_token(chars[start..=pos].iter().collect::<String>()));
            }
            let s: String = chars[start..pos].iter().collect();
            push(&mut tokens, Token::Number(s), start);
            continue;
        }

        // Identifier or keyword
        if c.is_ascii_alphabetic() || c == '_' {
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let s: String = chars[start..pos].iter().collect();
            push(&mut tokens, Token::Ident(s), start);
            continue;
        }

        let next = chars.get(pos + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', Some('=')) => (Token::Neq, 2),
            ('!', _) => (Token::Bang, 1),
            ('<', Some('=')) => (Token::Lte, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', Some('=')) => (Token::Gte, 2),
            ('>', _) => (Token::Gt, 1),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) | ('\u{2212}', _) => (Token::Minus, 1),
            ('*', _) | ('\u{00D7}', _) => (Token::Star, 1),
            ('/', _) | ('\u{00F7}', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('\u{2260}', _) => (Token::Neq, 1),
            ('\u{2264}', _) => (Token::Lte, 1),
            ('\u{2265}', _) => (Token::Gte, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            _ => {
                return Err(
                    ValidationError::syntax(start, format!("unexpected character '{}'", c))
                        .with_token(c.to_string()),
                )
            }
        };
        push(&mut tokens, token, start);
        pos += width;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        pos: chars.len(),
    });
    Ok(tokens)
}
