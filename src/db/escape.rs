//! Parameter sanitization.
//!
//! String parameters are HTML-entity escaped before binding unless the
//! caller flags them as pre-escaped. Only `&`, `<`, `>` and `"` are
//! rewritten; an `&` that already starts an entity is left alone so a value
//! is never escaped twice. Non-string parameters pass through untouched.

use std::borrow::Cow;

use crate::models::QueryParam;

/// Escape one string.
pub fn escape_string(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"']) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 16);
    for (i, c) in input.char_indices() {
        match c {
            '&' if starts_entity(&input[i..]) => out.push('&'),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Whether `s` (starting at `&`) begins a named or numeric entity.
fn starts_entity(s: &str) -> bool {
    let Some(end) = s[1..].find(';').map(|p| p + 1) else {
        return false;
    };
    let body = &s[1..end];
    if body.is_empty() || body.len() > 32 {
        return false;
    }
    if let Some(num) = body.strip_prefix('#') {
        return match num.strip_prefix(['x', 'X']) {
            Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
            None => !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()),
        };
    }
    body.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && body.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Escape a parameter list.
///
/// `escapes[i] == false` leaves parameter `i` as given; positions past the
/// end of `escapes` are escaped.
pub fn escape_params(params: &[QueryParam], escapes: Option<&[bool]>) -> Vec<QueryParam> {
    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let wanted = escapes.and_then(|e| e.get(i).copied()).unwrap_or(true);
            match param {
                QueryParam::String(s) if wanted => {
                    QueryParam::String(escape_string(s).into_owned())
                }
                other => other.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_string() {
        assert_eq!(escape_string("plain"), "plain");
        assert!(matches!(escape_string("plain"), Cow::Borrowed(_)));
        assert_eq!(
            escape_string("<b>\"Tom\" & 'Jerry'</b>"),
            "&lt;b&gt;&quot;Tom&quot; &amp; 'Jerry'&lt;/b&gt;"
        );
    }

    #[test]
    fn test_existing_entities_are_kept() {
        assert_eq!(escape_string("a &amp; b"), "a &amp; b");
        assert_eq!(escape_string("&#39; &#x27;"), "&#39; &#x27;");
        assert_eq!(escape_string("R&D & co"), "R&amp;D &amp; co");
        assert_eq!(escape_string("a & b;"), "a &amp; b;");
        assert_eq!(escape_string("&;"), "&amp;;");
    }

    #[test]
    fn test_escape_params_respects_flags() {
        let params = vec![
            QueryParam::from("<a>"),
            QueryParam::from("<b>"),
            QueryParam::Int(5),
            QueryParam::Bool(true),
            QueryParam::Null,
            QueryParam::from("<c>"),
        ];
        let escaped = escape_params(&params, Some(&[true, false]));
        assert_eq!(escaped[0], QueryParam::from("&lt;a&gt;"));
        assert_eq!(escaped[1], QueryParam::from("<b>"));
        assert_eq!(escaped[2], QueryParam::Int(5));
        assert_eq!(escaped[3], QueryParam::Bool(true));
        assert_eq!(escaped[4], QueryParam::Null);
        assert_eq!(escaped[5], QueryParam::from("&lt;c&gt;"));
    }
}
