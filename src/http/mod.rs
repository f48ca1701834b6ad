//! HTTP endpoints served by the proxy core: the authorization-code
//! callback and the self-hosted Client ID Metadata Document.
//!
//! Everything user-facing here is defensive: HTML output carries a strict
//! header set, interpolated values are escaped, and IdP-provided error
//! detail never reaches a page.

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

pub(crate) mod callback;
pub(crate) mod cimd;

/// Headers attached to every HTML response of the callback endpoint.
pub(crate) const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    (
        "Content-Security-Policy",
        "default-src 'none'; style-src 'unsafe-inline'",
    ),
    ("Referrer-Policy", "no-referrer"),
    ("Cache-Control", "no-store, no-cache, must-revalidate"),
];

/// Minimal HTML escaping for values interpolated into the callback pages.
pub(crate) fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Render one callback page. `title` and `message` must already be escaped
/// (or static).
pub(crate) fn html_page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head>\n\
         <meta charset=\"utf-8\">\n\
         <title>{title}</title>\n\
         <style>\n\
         body {{ font-family: system-ui, sans-serif; margin: 4rem auto; max-width: 32rem; text-align: center; }}\n\
         p {{ color: #444; }}\n\
         </style>\n\
         </head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <p>{message}</p>\n\
         </body>\n\
         </html>\n"
    );
    (status, SECURITY_HEADERS, Html(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_metacharacters() {
        assert_eq!(
            escape_html(r#"<script>alert("x&y")</script>'"#),
            "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;&#39;"
        );
        assert_eq!(escape_html("mcp-k8s"), "mcp-k8s");
    }

    #[test]
    fn pages_carry_the_full_security_header_set() {
        let response = html_page(StatusCode::OK, "Title", "Message");
        let headers = response.headers();

        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(
            headers["content-security-policy"],
            "default-src 'none'; style-src 'unsafe-inline'"
        );
        assert_eq!(headers["referrer-policy"], "no-referrer");
        assert_eq!(
            headers["cache-control"],
            "no-store, no-cache, must-revalidate"
        );
        assert!(
            headers["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
    }
}
