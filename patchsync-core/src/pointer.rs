//! JSON Pointer (RFC 6901) paths.
//!
//! `""` addresses the document root; every other pointer is a sequence of
//! `/`-prefixed reference tokens where `~1` stands for `/` and `~0` for `~`.

use crate::error::PatchError;

/// Token that addresses the slot one past the end of an array.
pub const APPEND_TOKEN: &str = "-";

/// Split a pointer into its unescaped reference tokens.
pub fn parse(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PatchError::PathNotFound(pointer.to_string()));
    };
    Ok(rest.split('/').map(unescape).collect())
}

/// Join reference tokens back into a pointer string.
pub fn format(tokens: &[String]) -> String {
    let mut out = String::with_capacity(tokens.iter().map(|t| t.len() + 1).sum());
    for token in tokens {
        out.push('/');
        out.push_str(&escape(token));
    }
    out
}

pub fn escape(token: &str) -> String {
    if !token.contains('~') && !token.contains('/') {
        return token.to_string();
    }
    token.replace('~', "~0").replace('/', "~1")
}

pub fn unescape(token: &str) -> String {
    if !token.contains('~') {
        return token.to_string();
    }
    token.replace("~1", "/").replace("~0", "~")
}

/// Parse an array index token.
///
/// Only canonical decimal indices are accepted: no sign, no leading zeros.
/// Anything else cannot address an array element, which is a type mismatch
/// rather than a missing path.
pub fn array_index(token: &str, pointer: &str) -> Result<usize, PatchError> {
    let canonical = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !canonical {
        return Err(PatchError::TypeMismatch(pointer.to_string()));
    }
    token
        .parse()
        .map_err(|_| PatchError::PathNotFound(pointer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_nested() {
        assert_eq!(parse("/nodes/42/name").unwrap(), vec!["nodes", "42", "name"]);
    }

    #[test]
    fn test_parse_empty_token() {
        // "/" addresses the member with the empty-string key
        assert_eq!(parse("/").unwrap(), vec![""]);
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(parse("/a~1b/c~0d/~01").unwrap(), vec!["a/b", "c~d", "~1"]);
    }

    #[test]
    fn test_parse_rejects_relative() {
        assert_eq!(
            parse("nodes/42"),
            Err(PatchError::PathNotFound("nodes/42".into()))
        );
    }

    #[test]
    fn test_format_inverts_parse() {
        for pointer in ["", "/nodes", "/a~1b/c~0d", "/nodes/42/x", "/"] {
            assert_eq!(format(&parse(pointer).unwrap()), pointer);
        }
    }

    #[test]
    fn test_array_index() {
        assert_eq!(array_index("0", "/a/0"), Ok(0));
        assert_eq!(array_index("17", "/a/17"), Ok(17));
        assert!(matches!(array_index("01", "/a/01"), Err(PatchError::TypeMismatch(_))));
        assert!(matches!(array_index("-1", "/a/-1"), Err(PatchError::TypeMismatch(_))));
        assert!(matches!(array_index("x", "/a/x"), Err(PatchError::TypeMismatch(_))));
        assert!(matches!(array_index("", "/a/"), Err(PatchError::TypeMismatch(_))));
    }

    #[test]
    fn test_array_index_overflow() {
        let huge = "99999999999999999999999999";
        assert!(matches!(array_index(huge, huge), Err(PatchError::PathNotFound(_))));
    }
}
