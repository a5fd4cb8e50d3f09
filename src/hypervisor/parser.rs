//! Control-line tokenizer. One request per line; tokens are separated by
//! whitespace and double quotes preserve embedded whitespace. There are no
//! escape sequences.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected quote in a word")]
    UnexpectedQuote,
    #[error("unexpected end of line")]
    UnexpectedEndOfLine,
}

enum State {
    Blank,
    Word,
    Quoted,
}

/// Splits one request line into tokens. The first two tokens are the
/// module and command names.
pub fn tokenize(line: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = State::Blank;

    for ch in line.chars() {
        match state {
            State::Blank => match ch {
                c if c.is_whitespace() => {}
                '"' => state = State::Quoted,
                c => {
                    current.push(c);
                    state = State::Word;
                }
            },
            State::Word => match ch {
                c if c.is_whitespace() => {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Blank;
                }
                '"' => return Err(ParseError::UnexpectedQuote),
                c => current.push(c),
            },
            State::Quoted => match ch {
                '"' => {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Blank;
                }
                c => current.push(c),
            },
        }
    }

    match state {
        State::Quoted => Err(ParseError::UnexpectedEndOfLine),
        State::Word => {
            tokens.push(current);
            Ok(tokens)
        }
        State::Blank => Ok(tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(line: &str) -> Vec<String> {
        tokenize(line).unwrap()
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(
            tokens("bridge create br0"),
            vec!["bridge", "create", "br0"]
        );
        assert_eq!(tokens("  bridge\tlist  \n"), vec!["bridge", "list"]);
        assert!(tokens("").is_empty());
        assert!(tokens("   \r\n").is_empty());
    }

    #[test]
    fn quotes_preserve_embedded_whitespace() {
        assert_eq!(
            tokens("bridge add_packet_filter br0 f1 bpf \"udp dst port 53\""),
            vec![
                "bridge",
                "add_packet_filter",
                "br0",
                "f1",
                "bpf",
                "udp dst port 53"
            ]
        );
        assert_eq!(tokens("a \"\" b"), vec!["a", "", "b"]);
    }

    #[test]
    fn quote_inside_a_word_is_an_error() {
        assert_eq!(tokenize("br\"0"), Err(ParseError::UnexpectedQuote));
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            tokenize("bridge create \"half open"),
            Err(ParseError::UnexpectedEndOfLine)
        );
    }

    #[test]
    fn no_escape_sequences_inside_quotes() {
        assert_eq!(tokens(r#""a\b""#), vec![r"a\b"]);
    }
}
