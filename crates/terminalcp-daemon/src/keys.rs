//! Key notation translation: symbolic key tokens to terminal input bytes.
//!
//! Tokens are either named keys (`Up`, `PageDown`, `F5`), modifier
//! combinations (`C-c`, `M-x`, `C-M-a`), or literal text. Higher layers
//! decide *whether* a string is a key token; this module only translates.

use crate::errors::DaemonError;

/// Translate a key token into the bytes an xterm-256color terminal would
/// emit for that keystroke.
///
/// Rules:
/// - Named keys map through the table below.
/// - `C-x` produces the control byte for an ASCII letter or control-row
///   punctuation; `M-x` prefixes ESC; prefixes combine (`C-M-x`).
/// - A single character is sent as itself.
/// - `F<n>` outside 1–12, or a modifier with an unusable remainder, fails
///   with `InvalidKey`.
/// - Any other token is literal text, passed through verbatim.
pub fn key_to_bytes(token: &str) -> Result<Vec<u8>, DaemonError> {
    let mut ctrl = false;
    let mut meta = false;
    let mut rest = token;

    loop {
        if let Some(stripped) = rest.strip_prefix("C-") {
            if ctrl {
                return Err(DaemonError::InvalidKey(token.to_string()));
            }
            ctrl = true;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("M-") {
            if meta {
                return Err(DaemonError::InvalidKey(token.to_string()));
            }
            meta = true;
            rest = stripped;
        } else {
            break;
        }
    }

    if (ctrl || meta) && rest.is_empty() {
        return Err(DaemonError::InvalidKey(token.to_string()));
    }

    let base: Vec<u8> = if let Some(named) = named_key(rest) {
        if ctrl {
            // Control chords are defined over characters, not named keys.
            return Err(DaemonError::InvalidKey(token.to_string()));
        }
        named
    } else if rest.chars().count() == 1 {
        let c = rest.chars().next().unwrap_or('\0');
        if ctrl {
            vec![control_byte(c).ok_or_else(|| DaemonError::InvalidKey(token.to_string()))?]
        } else {
            rest.as_bytes().to_vec()
        }
    } else if ctrl || meta {
        return Err(DaemonError::InvalidKey(token.to_string()));
    } else if looks_like_function_key(rest) {
        // `F13`, `F0`, `F99`: the shape of a named key, but not one.
        return Err(DaemonError::InvalidKey(token.to_string()));
    } else {
        // Literal text passthrough.
        return Ok(token.as_bytes().to_vec());
    };

    if meta {
        let mut out = Vec::with_capacity(base.len() + 1);
        out.push(0x1b);
        out.extend_from_slice(&base);
        Ok(out)
    } else {
        Ok(base)
    }
}

fn named_key(name: &str) -> Option<Vec<u8>> {
    let bytes: &[u8] = match name {
        "Enter" => b"\r",
        "Tab" => b"\t",
        "Backspace" => b"\x7f",
        "Escape" => b"\x1b",
        "Space" => b" ",
        "Up" => b"\x1b[A",
        "Down" => b"\x1b[B",
        "Right" => b"\x1b[C",
        "Left" => b"\x1b[D",
        "Home" => b"\x1b[H",
        "End" => b"\x1b[F",
        "PageUp" => b"\x1b[5~",
        "PageDown" => b"\x1b[6~",
        "Delete" => b"\x1b[3~",
        "F1" => b"\x1bOP",
        "F2" => b"\x1bOQ",
        "F3" => b"\x1bOR",
        "F4" => b"\x1bOS",
        "F5" => b"\x1b[15~",
        "F6" => b"\x1b[17~",
        "F7" => b"\x1b[18~",
        "F8" => b"\x1b[19~",
        "F9" => b"\x1b[20~",
        "F10" => b"\x1b[21~",
        "F11" => b"\x1b[23~",
        "F12" => b"\x1b[24~",
        _ => return None,
    };
    Some(bytes.to_vec())
}

/// Map a character to its control byte (`C-a` → 0x01, …).
fn control_byte(c: char) -> Option<u8> {
    match c {
        'a'..='z' => Some(c as u8 & 0x1f),
        'A'..='Z' => Some(c.to_ascii_lowercase() as u8 & 0x1f),
        '@' | ' ' => Some(0x00),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        ']' => Some(0x1d),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

fn looks_like_function_key(token: &str) -> bool {
    token
        .strip_prefix('F')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
