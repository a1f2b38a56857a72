//! Local pre-flight check for submitted code.
//!
//! Catches the mistakes that would otherwise cost a full remote round trip:
//! unbalanced brackets and unterminated string literals. The check is
//! lexical only; it understands `#` comments, single and triple quoted
//! strings and backslash escapes, and nothing else about the language.

use crate::error::SyntaxError;

/// Checks `code` for balanced brackets and terminated strings.
///
/// # Examples
///
/// ```
/// use flock::syntax::check;
///
/// assert!(check("print((1, 2))").is_ok());
/// let err = check("x = [1, 2").unwrap_err();
/// assert_eq!((err.line, err.column), (1, 5));
/// ```
pub fn check(code: &str) -> Result<(), SyntaxError> {
    scan(code).map(|_| ())
}

/// Returns `code` with string literal contents and comments replaced by
/// spaces, keeping line structure. Code that fails [`check`] is returned
/// as far as it could be scanned.
pub fn strip_literals(code: &str) -> String {
    match scan(code) {
        Ok(stripped) => stripped,
        Err(_) => code.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Pos {
    line: usize,
    column: usize,
}

fn error_at(pos: Pos, message: impl Into<String>) -> SyntaxError {
    SyntaxError {
        line: pos.line,
        column: pos.column,
        message: message.into(),
    }
}

fn closer_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn blank(c: char) -> char {
    if c == '\n' {
        '\n'
    } else {
        ' '
    }
}

fn scan(code: &str) -> Result<String, SyntaxError> {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut stack: Vec<(char, Pos)> = Vec::new();
    let mut pos = Pos { line: 1, column: 1 };
    let mut i = 0;

    let advance = |c: char, pos: &mut Pos| {
        if c == '\n' {
            pos.line += 1;
            pos.column = 1;
        } else {
            pos.column += 1;
        }
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    advance(chars[i], &mut pos);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let start = pos;
                let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                let width = if triple { 3 } else { 1 };
                for _ in 0..width {
                    out.push(c);
                    advance(c, &mut pos);
                }
                i += width;

                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' {
                        out.push(' ');
                        advance(ch, &mut pos);
                        i += 1;
                        if let Some(&escaped) = chars.get(i) {
                            out.push(blank(escaped));
                            advance(escaped, &mut pos);
                            i += 1;
                        }
                        continue;
                    }
                    if ch == '\n' && !triple {
                        break;
                    }
                    let closes = ch == c
                        && (!triple
                            || (chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c)));
                    if closes {
                        for _ in 0..width {
                            out.push(c);
                            advance(c, &mut pos);
                        }
                        i += width;
                        closed = true;
                        break;
                    }
                    out.push(blank(ch));
                    advance(ch, &mut pos);
                    i += 1;
                }
                if !closed {
                    let message = if triple {
                        "unterminated triple-quoted string literal"
                    } else {
                        "unterminated string literal"
                    };
                    return Err(error_at(start, message));
                }
            }
            '(' | '[' | '{' => {
                stack.push((c, pos));
                out.push(c);
                advance(c, &mut pos);
                i += 1;
            }
            ')' | ']' | '}' => {
                match stack.pop() {
                    None => return Err(error_at(pos, format!("unmatched '{c}'"))),
                    Some((open, open_pos)) if closer_for(open) != c => {
                        return Err(error_at(
                            pos,
                            format!(
                                "closing '{c}' does not match '{open}' on line {}",
                                open_pos.line
                            ),
                        ));
                    }
                    Some(_) => {}
                }
                out.push(c);
                advance(c, &mut pos);
                i += 1;
            }
            _ => {
                out.push(c);
                advance(c, &mut pos);
                i += 1;
            }
        }
    }

    match stack.pop() {
        Some((open, open_pos)) => Err(error_at(open_pos, format!("'{open}' was never closed"))),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_code_passes() {
        let code = "def f(x):\n    return {'a': [x, (1, 2)]}\n\nprint(f(3))\n";
        assert!(check(code).is_ok());
    }

    #[test]
    fn unclosed_bracket_points_at_opener() {
        let err = check("a = 1\nb = foo(1,\n  2\n").unwrap_err();
        assert_eq!((err.line, err.column), (2, 8));
        assert_eq!(err.message, "'(' was never closed");
    }

    #[test]
    fn stray_closer() {
        let err = check("x = 1)\n").unwrap_err();
        assert_eq!((err.line, err.column), (1, 6));
        assert_eq!(err.message, "unmatched ')'");
    }

    #[test]
    fn mismatched_closer() {
        let err = check("x = [1, 2)\n").unwrap_err();
        assert_eq!((err.line, err.column), (1, 10));
        assert!(err.message.contains("does not match '['"));
    }

    #[test]
    fn brackets_inside_strings_and_comments_are_ignored() {
        assert!(check("s = '(' # )\nt = \"]\"\n").is_ok());
    }

    #[test]
    fn unterminated_string_stops_at_newline() {
        let err = check("x = 'abc\ny = 2\n").unwrap_err();
        assert_eq!((err.line, err.column), (1, 5));
        assert_eq!(err.message, "unterminated string literal");
    }

    #[test]
    fn triple_quoted_strings_span_lines() {
        assert!(check("doc = \"\"\"line one\nline (two\n\"\"\"\n").is_ok());
        let err = check("doc = '''never\nclosed\n").unwrap_err();
        assert_eq!(err.message, "unterminated triple-quoted string literal");
        assert_eq!((err.line, err.column), (1, 7));
    }

    #[test]
    fn escaped_quotes_do_not_close() {
        assert!(check(r#"s = 'it\'s fine'"#).is_ok());
        assert!(check("s = 'a\\\nb'\n").is_ok());
    }

    #[test]
    fn strip_blanks_literals_and_comments() {
        let stripped = strip_literals("x = 'name' # other\ny\n");
        assert_eq!(stripped, "x = '    '        \ny\n");
    }
}
