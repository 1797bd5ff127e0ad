use axum::http::{header, HeaderMap};

/// Find the largest char boundary in `s` that is <= `max_bytes`.
/// Safe for slicing: `&s[..find_char_boundary(s, max_bytes)]` never panics.
pub fn find_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

/// Shorten `s` for log output.
pub fn preview(s: &str, max_bytes: usize) -> String {
    let end = find_char_boundary(s, max_bytes);
    if end == s.len() {
        s.to_string()
    } else {
        format!("{}...", &s[..end])
    }
}

/// Value of the cookie `name` from the request's `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_find_char_boundary_ascii() {
        let s = "hello world";
        assert_eq!(find_char_boundary(s, 5), 5);
        assert_eq!(find_char_boundary(s, 100), s.len());
        assert_eq!(find_char_boundary(s, 0), 0);
    }

    #[test]
    fn test_find_char_boundary_multibyte() {
        let s = "café";
        // 'é' is 2 bytes starting at byte 3
        assert_eq!(find_char_boundary(s, 4), 3);
        assert_eq!(&s[..find_char_boundary(s, 4)], "caf");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("a longer line", 6), "a long...");
        assert_eq!(preview("🎉🎉", 5), "🎉...");
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session_id=abc-123"),
        );
        assert_eq!(cookie_value(&headers, "session_id").as_deref(), Some("abc-123"));
        assert_eq!(cookie_value(&headers, "theme").as_deref(), Some("dark"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_value_ignores_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session_id="));
        assert_eq!(cookie_value(&headers, "session_id"), None);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<b>\"x\" & y</b>"), "&lt;b&gt;&quot;x&quot; &amp; y&lt;/b&gt;");
    }
}
