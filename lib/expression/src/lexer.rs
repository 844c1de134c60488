//! Tokenizer for expression source text.

use crate::error::ExpressionErrorKind;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Integer(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionErrorKind> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let peek = chars.get(i + 1).map(|(_, c)| *c);
        let peek2 = chars.get(i + 2).map(|(_, c)| *c);
        let (kind, width) = match c {
            '(' => (TokenKind::LParen, 1),
            ')' => (TokenKind::RParen, 1),
            '[' => (TokenKind::LBracket, 1),
            ']' => (TokenKind::RBracket, 1),
            ',' => (TokenKind::Comma, 1),
            '.' => (TokenKind::Dot, 1),
            '?' => (TokenKind::Question, 1),
            ':' => (TokenKind::Colon, 1),
            '+' => (TokenKind::Plus, 1),
            '-' => (TokenKind::Minus, 1),
            '*' => (TokenKind::Star, 1),
            '/' => (TokenKind::Slash, 1),
            '%' => (TokenKind::Percent, 1),
            '<' if peek == Some('=') => (TokenKind::Le, 2),
            '<' => (TokenKind::Lt, 1),
            '>' if peek == Some('=') => (TokenKind::Ge, 2),
            '>' => (TokenKind::Gt, 1),
            '=' if peek == Some('=') && peek2 == Some('=') => (TokenKind::StrictEq, 3),
            '=' if peek == Some('=') => (TokenKind::EqEq, 2),
            '!' if peek == Some('=') && peek2 == Some('=') => (TokenKind::StrictNotEq, 3),
            '!' if peek == Some('=') => (TokenKind::NotEq, 2),
            '!' => (TokenKind::Bang, 1),
            '&' if peek == Some('&') => (TokenKind::AndAnd, 2),
            '|' if peek == Some('|') => (TokenKind::OrOr, 2),
            '"' | '\'' => {
                let (text, consumed) = lex_string(&chars, i)?;
                (TokenKind::Str(text), consumed)
            }
            c if c.is_ascii_digit() => lex_number(&chars, i)?,
            c if is_ident_start(c) => {
                let end = chars[i..]
                    .iter()
                    .position(|(_, c)| !is_ident_continue(*c))
                    .map_or(chars.len(), |offset| i + offset);
                let word: String = chars[i..end].iter().map(|(_, c)| *c).collect();
                let kind = match word.as_str() {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    _ => TokenKind::Ident(word),
                };
                (kind, end - i)
            }
            other => {
                return Err(ExpressionErrorKind::Syntax {
                    position,
                    message: format!("unexpected character '{other}'"),
                });
            }
        };

        tokens.push(Token { kind, position });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: source.len(),
    });
    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn lex_number(
    chars: &[(usize, char)],
    start: usize,
) -> Result<(TokenKind, usize), ExpressionErrorKind> {
    let mut end = start;
    while end < chars.len() && chars[end].1.is_ascii_digit() {
        end += 1;
    }
    let is_fraction = end + 1 < chars.len()
        && chars[end].1 == '.'
        && chars[end + 1].1.is_ascii_digit();
    if is_fraction {
        end += 1;
        while end < chars.len() && chars[end].1.is_ascii_digit() {
            end += 1;
        }
    }

    let text: String = chars[start..end].iter().map(|(_, c)| *c).collect();
    let position = chars[start].0;
    let invalid = |_| ExpressionErrorKind::Syntax {
        position,
        message: format!("invalid number '{text}'"),
    };
    let kind = if is_fraction {
        TokenKind::Float(text.parse::<f64>().map_err(|e| invalid(e.to_string()))?)
    } else {
        match text.parse::<i64>() {
            Ok(n) => TokenKind::Integer(n),
            Err(_) => TokenKind::Float(text.parse::<f64>().map_err(|e| invalid(e.to_string()))?),
        }
    };
    Ok((kind, end - start))
}

fn lex_string(
    chars: &[(usize, char)],
    start: usize,
) -> Result<(String, usize), ExpressionErrorKind> {
    let quote = chars[start].1;
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i].1 {
            c if c == quote => return Ok((text, i + 1 - start)),
            '\\' => {
                let escaped = chars.get(i + 1).map(|(_, c)| *c).ok_or_else(|| {
                    ExpressionErrorKind::Syntax {
                        position: chars[i].0,
                        message: "dangling escape".to_string(),
                    }
                })?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                i += 2;
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    Err(ExpressionErrorKind::Syntax {
        position: chars[start].0,
        message: "unterminated string literal".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_member_access_and_operators() {
        assert_eq!(
            kinds("$json.price >= 10 && !done"),
            vec![
                TokenKind::Ident("$json".to_string()),
                TokenKind::Dot,
                TokenKind::Ident("price".to_string()),
                TokenKind::Ge,
                TokenKind::Integer(10),
                TokenKind::AndAnd,
                TokenKind::Bang,
                TokenKind::Ident("done".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn distinguishes_loose_and_strict_equality() {
        assert_eq!(
            kinds("a == b !== c"),
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::EqEq,
                TokenKind::Ident("b".to_string()),
                TokenKind::StrictNotEq,
                TokenKind::Ident("c".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_numbers_and_strings() {
        assert_eq!(
            kinds(r#"1.5 'it\'s' "a\nb""#),
            vec![
                TokenKind::Float(1.5),
                TokenKind::Str("it's".to_string()),
                TokenKind::Str("a\nb".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn integer_followed_by_method_is_not_a_float() {
        assert_eq!(
            kinds("1.x"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Dot,
                TokenKind::Ident("x".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = tokenize("'open").unwrap_err();
        assert!(matches!(err, ExpressionErrorKind::Syntax { position: 0, .. }));
    }

    #[test]
    fn rejects_single_ampersand() {
        assert!(tokenize("a & b").is_err());
    }
}
