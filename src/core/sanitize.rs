//! Minimal HTML sanitization applied before streaming.
//!
//! Strips script/style blocks and inline event handlers. This is not a full
//! sanitizer; the output is model-generated document HTML, not arbitrary
//! user input.

use std::sync::OnceLock;

use regex::Regex;

fn script_style() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)<\s*script[^>]*>.*?<\s*/\s*script\s*>|<\s*style[^>]*>.*?<\s*/\s*style\s*>",
        )
        .expect("static regex")
    })
}

fn handler_double_quoted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\son[a-z]+\s*=\s*"[^"]*""#).expect("static regex"))
}

fn handler_single_quoted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\son[a-z]+\s*=\s*'[^']*'").expect("static regex"))
}

/// Remove script/style elements and inline `on*=` handlers.
pub fn sanitize_html(html: &str) -> String {
    let html = script_style().replace_all(html, "");
    let html = handler_double_quoted().replace_all(&html, "");
    handler_single_quoted().replace_all(&html, "").into_owned()
}
