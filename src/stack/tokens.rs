//! Tokenizer for the stack language, using winnow.
//!
//! Tokens are whitespace-separated; a double- or single-quoted span keeps
//! embedded spaces (quotes are preserved in the token and stripped by the
//! interpreter); a token starting with `#` comments out the rest of its
//! line.

use crate::error::{Error, Result};
use winnow::combinator::{alt, delimited};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};
use winnow::Parser;

type WResult<T> = std::result::Result<T, ContextError>;

/// Split a program into tokens, honouring quotes and `#` comments.
///
/// # Example
///
/// ```rust
/// use moviola::stack::tokenize;
///
/// let tokens = tokenize("test: filter:clip in=1 # trailing noise\n2 2 +").unwrap();
/// assert_eq!(tokens, vec!["test:", "filter:clip", "in=1", "2", "2", "+"]);
/// ```
pub fn tokenize(program: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    for line in program.lines() {
        let mut input = line.trim_start();
        while !input.is_empty() {
            if input.starts_with('#') {
                break;
            }
            let token = token
                .parse_next(&mut input)
                .map_err(|_| Error::Syntax(format!("unterminated token in {line:?}")))?;
            if token.starts_with('#') {
                break;
            }
            tokens.push(token);
            input = input.trim_start();
        }
    }
    Ok(tokens)
}

/// One token: bare spans and quoted spans glued together.
fn token(input: &mut &str) -> WResult<String> {
    let mut out = String::new();
    loop {
        let piece: &str = alt((quoted, bare)).parse_next(input)?;
        out.push_str(piece);
        // Another quote or bare span directly attached continues the token
        // (e.g. `title="a b"`).
        if input.is_empty() || input.starts_with(|c: char| c.is_whitespace()) {
            break;
        }
    }
    Ok(out)
}

/// A quoted span, returned with its quotes.
fn quoted<'a>(input: &mut &'a str) -> WResult<&'a str> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        delimited('\'', take_till(0.., '\''), '\''),
    ))
    .take()
    .parse_next(input)
}

/// An unquoted span.
fn bare<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| !c.is_whitespace() && c != '"' && c != '\'').parse_next(input)
}

/// Strip one pair of surrounding quotes, if present.
pub fn strip_quotes(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_split() {
        let tokens = tokenize("a b  c").unwrap();
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_quotes_keep_spaces() {
        let tokens = tokenize(r#"title="two words" next"#).unwrap();
        assert_eq!(tokens, vec![r#"title="two words""#, "next"]);
    }

    #[test]
    fn test_standalone_quoted_token() {
        let tokens = tokenize(r#"$ "a quoted phrase""#).unwrap();
        assert_eq!(tokens, vec!["$", r#""a quoted phrase""#]);
    }

    #[test]
    fn test_comment_kills_line() {
        let tokens = tokenize("one # two three\nfour").unwrap();
        assert_eq!(tokens, vec!["one", "four"]);
    }

    #[test]
    fn test_comment_token_prefix() {
        let tokens = tokenize("one #two three\nfour").unwrap();
        assert_eq!(tokens, vec!["one", "four"]);
    }

    #[test]
    fn test_unterminated_quote_fails() {
        assert!(tokenize(r#"name="oops"#).is_err());
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes(r#""hello there""#), "hello there");
        assert_eq!(strip_quotes("'single'"), "single");
        assert_eq!(strip_quotes("plain"), "plain");
        assert_eq!(strip_quotes(r#""unbalanced"#), r#""unbalanced"#);
    }

    #[test]
    fn test_unbalanced_apostrophe_fails() {
        // An apostrophe opens a quoted span, so it must be balanced.
        assert!(tokenize("it's fine").is_err());
        assert!(tokenize("it's fine, isn't it").is_ok());
    }
}
