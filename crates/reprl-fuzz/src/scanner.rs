//! String- and comment-aware scanning over fuzzer-generated scripts.
//!
//! A pragmatic lexer, not a parser. Two blind spots are deliberate and
//! tolerated upstream: `//` line comments are not tracked, and regex
//! literals are not tracked (a `/` can open a regex or mean division, and
//! disambiguating that needs a real parser).
//!
//! Multi-byte characters are consumed whole using the host locale's
//! `mblen`, and all reported offsets are logical-character positions. The
//! locale must have been initialized from the environment first;
//! [`crate::host::EngineHost::initialize`] does that.

use std::sync::Once;

use crate::errors::Error;

/// Initializes the process locale from the environment, once.
pub(crate) fn init_locale() {
    static LOCALE: Once = Once::new();
    LOCALE.call_once(|| unsafe {
        libc::setlocale(libc::LC_ALL, c"".as_ptr());
    });
}

/// Logical index of the next occurrence of `symbol` in `content` that is
/// outside string literals (single, double, backtick), outside `/* … */`
/// comments, and — for closing brackets and commas — at the outermost
/// nesting level: `)`, `]` and `}` are only reported when their own bracket
/// depth is zero, `,` only when all three depths are zero.
///
/// A backslash escapes the following character inside a string and
/// suppresses the open/close semantics of a quote anywhere.
///
/// `\` and `*` interact with the scanner's own state and are rejected with
/// [`Error::UnsupportedSymbol`].
pub fn next_symbol_outside_strings(content: &[u8], symbol: u8) -> Result<Option<usize>, Error> {
    if symbol == b'\\' || symbol == b'*' {
        return Err(Error::UnsupportedSymbol(symbol as char));
    }

    let mut bracket_depth = 0usize;
    let mut curly_depth = 0usize;
    let mut square_depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut in_comment = false;
    let mut escaped = false;
    let mut byte_idx = 0usize;
    let mut logical_idx = 0usize;

    while byte_idx < content.len() {
        let byte = content[byte_idx];

        // Multi-byte characters count as one logical position and can never
        // match an ASCII symbol or affect scanner state.
        if byte >= 0x80 {
            byte_idx += multibyte_len(&content[byte_idx..]);
            logical_idx += 1;
            escaped = false;
            continue;
        }

        if in_comment {
            if byte == b'*' && content.get(byte_idx + 1) == Some(&b'/') {
                in_comment = false;
                byte_idx += 2;
                logical_idx += 2;
            } else {
                byte_idx += 1;
                logical_idx += 1;
            }
            continue;
        }

        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == quote {
                in_string = None;
            }
            byte_idx += 1;
            logical_idx += 1;
            continue;
        }

        if byte == b'/' && content.get(byte_idx + 1) == Some(&b'*') {
            in_comment = true;
            escaped = false;
            byte_idx += 2;
            logical_idx += 2;
            continue;
        }

        let reportable = byte == symbol
            && match symbol {
                b')' => bracket_depth == 0,
                b']' => square_depth == 0,
                b'}' => curly_depth == 0,
                b',' => bracket_depth == 0 && curly_depth == 0 && square_depth == 0,
                _ => true,
            };
        if reportable {
            return Ok(Some(logical_idx));
        }

        match byte {
            b'\'' | b'"' | b'`' => {
                if !escaped {
                    in_string = Some(byte);
                }
            }
            b'(' => bracket_depth += 1,
            b')' => bracket_depth = bracket_depth.saturating_sub(1),
            b'[' => square_depth += 1,
            b']' => square_depth = square_depth.saturating_sub(1),
            b'{' => curly_depth += 1,
            b'}' => curly_depth = curly_depth.saturating_sub(1),
            _ => {}
        }
        escaped = byte == b'\\' && !escaped;
        byte_idx += 1;
        logical_idx += 1;
    }
    Ok(None)
}

/// 1-based line number of the logical offset, counting `\n`. `offset` equal
/// to the logical length yields the final line; anything past that is out
/// of range.
pub fn line_number_of_offset(content: &[u8], offset: usize) -> Option<usize> {
    let mut line = 1usize;
    let mut byte_idx = 0usize;
    let mut logical_idx = 0usize;
    while byte_idx < content.len() {
        if logical_idx == offset {
            return Some(line);
        }
        let byte = content[byte_idx];
        if byte >= 0x80 {
            byte_idx += multibyte_len(&content[byte_idx..]);
        } else {
            if byte == b'\n' {
                line += 1;
            }
            byte_idx += 1;
        }
        logical_idx += 1;
    }
    (logical_idx == offset).then_some(line)
}

/// Byte length of the multi-byte character at the start of `bytes`, per the
/// host locale. Undecodable bytes are consumed one at a time.
fn multibyte_len(bytes: &[u8]) -> usize {
    // Not exposed by the `libc` crate's bindings on this target; declare the
    // same libc symbol directly.
    unsafe extern "C" {
        fn mblen(s: *const libc::c_char, n: libc::size_t) -> libc::c_int;
    }
    let probe = bytes.len().min(6);
    let length = unsafe { mblen(bytes.as_ptr().cast::<libc::c_char>(), probe) };
    if length > 0 { length as usize } else { 1 }
}
