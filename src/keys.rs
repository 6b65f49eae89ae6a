//! Keyboard synthesis: characters and named keys to `Input.dispatchKeyEvent`
//! payload sequences.
//!
//! Mappings follow the US layout. Uppercase letters and shifted symbols
//! imply the shift modifier on the synthesized events.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use zendriver_cdp::input::{DispatchKeyEvent, KeyEventType};

use crate::errors::{Error, ErrorKind, Result};

/// Modifier bitmask values understood by the Input domain.
pub mod modifiers {
    pub const NONE: i64 = 0;
    pub const ALT: i64 = 1;
    pub const CTRL: i64 = 2;
    pub const META: i64 = 4;
    pub const SHIFT: i64 = 8;
}

/// Digits produce these symbols under shift, indexed by digit value.
const NUM_SHIFT: &[char] = &[')', '!', '@', '#', '$', '%', '^', '&', '*', '('];

static NAMED_KEYS: Lazy<HashMap<&'static str, (&'static str, &'static str, i64)>> =
    Lazy::new(|| {
        // name -> (key, code, windows virtual key code)
        HashMap::from([
            ("Enter", ("Enter", "Enter", 13)),
            ("Tab", ("Tab", "Tab", 9)),
            ("Backspace", ("Backspace", "Backspace", 8)),
            ("Escape", ("Escape", "Escape", 27)),
            ("Delete", ("Delete", "Delete", 46)),
            ("ArrowLeft", ("ArrowLeft", "ArrowLeft", 37)),
            ("ArrowUp", ("ArrowUp", "ArrowUp", 38)),
            ("ArrowRight", ("ArrowRight", "ArrowRight", 39)),
            ("ArrowDown", ("ArrowDown", "ArrowDown", 40)),
            ("Home", ("Home", "Home", 36)),
            ("End", ("End", "End", 35)),
            ("PageUp", ("PageUp", "PageUp", 33)),
            ("PageDown", ("PageDown", "PageDown", 34)),
            ("Space", (" ", "Space", 32)),
        ])
    });

static SPECIAL_CHARS: Lazy<HashMap<char, (&'static str, i64)>> = Lazy::new(|| {
    HashMap::from([
        (';', ("Semicolon", 186)),
        ('=', ("Equal", 187)),
        (',', ("Comma", 188)),
        ('-', ("Minus", 189)),
        ('.', ("Period", 190)),
        ('/', ("Slash", 191)),
        ('`', ("Backquote", 192)),
        ('[', ("BracketLeft", 219)),
        ('\\', ("Backslash", 220)),
        (']', ("BracketRight", 221)),
        ('\'', ("Quote", 222)),
    ])
});

static SHIFTED_CHARS: Lazy<HashMap<char, char>> = Lazy::new(|| {
    HashMap::from([
        (':', ';'),
        ('+', '='),
        ('<', ','),
        ('_', '-'),
        ('>', '.'),
        ('?', '/'),
        ('~', '`'),
        ('{', '['),
        ('|', '\\'),
        ('}', ']'),
        ('"', '\''),
    ])
});

#[derive(Clone, Debug)]
struct KeyDescriptor {
    key: String,
    code: String,
    virtual_key: i64,
    shift: bool,
    text: Option<String>,
}

fn descriptor_for_char(ch: char) -> Option<KeyDescriptor> {
    if ch.is_ascii_alphabetic() {
        let upper = ch.to_ascii_uppercase();
        return Some(KeyDescriptor {
            key: ch.to_string(),
            code: format!("Key{upper}"),
            virtual_key: upper as i64,
            shift: ch.is_ascii_uppercase(),
            text: Some(ch.to_string()),
        });
    }

    if ch.is_ascii_digit() {
        return Some(KeyDescriptor {
            key: ch.to_string(),
            code: format!("Digit{ch}"),
            virtual_key: ch as i64,
            shift: false,
            text: Some(ch.to_string()),
        });
    }

    if let Some(digit) = NUM_SHIFT.iter().position(|&symbol| symbol == ch) {
        return Some(KeyDescriptor {
            key: ch.to_string(),
            code: format!("Digit{digit}"),
            virtual_key: b'0' as i64 + digit as i64,
            shift: true,
            text: Some(ch.to_string()),
        });
    }

    if ch == ' ' {
        return Some(KeyDescriptor {
            key: " ".into(),
            code: "Space".into(),
            virtual_key: 32,
            shift: false,
            text: Some(" ".into()),
        });
    }

    if ch == '\n' {
        return Some(KeyDescriptor {
            key: "Enter".into(),
            code: "Enter".into(),
            virtual_key: 13,
            shift: false,
            text: Some("\r".into()),
        });
    }

    if ch == '\t' {
        return Some(KeyDescriptor {
            key: "Tab".into(),
            code: "Tab".into(),
            virtual_key: 9,
            shift: false,
            text: None,
        });
    }

    if let Some((code, virtual_key)) = SPECIAL_CHARS.get(&ch) {
        return Some(KeyDescriptor {
            key: ch.to_string(),
            code: (*code).to_string(),
            virtual_key: *virtual_key,
            shift: false,
            text: Some(ch.to_string()),
        });
    }

    if let Some(base) = SHIFTED_CHARS.get(&ch) {
        let (code, virtual_key) = SPECIAL_CHARS.get(base)?;
        return Some(KeyDescriptor {
            key: ch.to_string(),
            code: (*code).to_string(),
            virtual_key: *virtual_key,
            shift: true,
            text: Some(ch.to_string()),
        });
    }

    None
}

fn down_up(descriptor: KeyDescriptor, extra_modifiers: i64) -> Vec<DispatchKeyEvent> {
    let modifiers = extra_modifiers
        | if descriptor.shift {
            modifiers::SHIFT
        } else {
            modifiers::NONE
        };
    let modifiers = (modifiers != 0).then_some(modifiers);

    let mut down = DispatchKeyEvent::new(KeyEventType::KeyDown);
    down.modifiers = modifiers;
    down.text = descriptor.text.clone();
    down.key = Some(descriptor.key.clone());
    down.code = Some(descriptor.code.clone());
    down.windows_virtual_key_code = Some(descriptor.virtual_key);
    down.native_virtual_key_code = Some(descriptor.virtual_key);

    let mut up = DispatchKeyEvent::new(KeyEventType::KeyUp);
    up.modifiers = modifiers;
    up.key = Some(descriptor.key);
    up.code = Some(descriptor.code);
    up.windows_virtual_key_code = Some(descriptor.virtual_key);
    up.native_virtual_key_code = Some(descriptor.virtual_key);

    vec![down, up]
}

/// Ordered down/up pair for one named key ("Escape", "Enter", ...) or one
/// printable character.
pub fn events_for_key(key: &str, extra_modifiers: i64) -> Result<Vec<DispatchKeyEvent>> {
    if let Some((name, code, virtual_key)) = NAMED_KEYS.get(key) {
        return Ok(down_up(
            KeyDescriptor {
                key: (*name).to_string(),
                code: (*code).to_string(),
                virtual_key: *virtual_key,
                shift: false,
                text: None,
            },
            extra_modifiers,
        ));
    }

    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => events_for_char(ch, extra_modifiers),
        _ => Err(Error::new(ErrorKind::Config)
            .with_hint(format!("unknown key '{key}'"))),
    }
}

/// Ordered down/up pair for one printable character.
pub fn events_for_char(ch: char, extra_modifiers: i64) -> Result<Vec<DispatchKeyEvent>> {
    match descriptor_for_char(ch) {
        Some(descriptor) => Ok(down_up(descriptor, extra_modifiers)),
        // Outside the US layout: deliver the glyph as a bare char event.
        None => {
            let mut event = DispatchKeyEvent::new(KeyEventType::Char);
            event.text = Some(ch.to_string());
            if extra_modifiers != 0 {
                event.modifiers = Some(extra_modifiers);
            }
            Ok(vec![event])
        }
    }
}
