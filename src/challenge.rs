//! `WWW-Authenticate` Bearer challenge parsing.
//!
//! Remote servers advertise their identity provider by answering `401` with
//! a challenge such as:
//!
//! ```text
//! WWW-Authenticate: Bearer realm="https://auth.example.com", scope="openid profile"
//! ```
//!
//! [`BearerChallenge::parse`] turns one header value into a structured
//! record. Parsing is total: malformed input yields an empty record, never
//! an error. Whether the record actually demands an OAuth flow is a
//! separate question answered by [`BearerChallenge::is_oauth_challenge`].

/// A parsed `WWW-Authenticate` header value.
///
/// Parameter names are matched case-insensitively and may appear in any
/// order; unknown parameters are ignored. Values may be quoted
/// (`realm="..."`, with `\"` escapes) or bare tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    /// Authentication scheme, as written (`Bearer`, `Basic`, ...).
    pub scheme: String,
    /// The protection realm. For OAuth challenges this is the issuer URL.
    pub realm: Option<String>,
    /// Space-separated scopes the remote server wants.
    pub scope: Option<String>,
    /// RFC 6750 error code (`invalid_token`, `insufficient_scope`, ...).
    pub error: Option<String>,
    /// Human-readable error detail from the remote server.
    pub error_description: Option<String>,
    /// RFC 9728 protected-resource-metadata URL.
    pub resource_metadata: Option<String>,
}

impl BearerChallenge {
    /// Parse a single `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        if header.is_empty() {
            return Self::default();
        }

        // The scheme is the first whitespace-delimited token. Everything
        // after it is the auth-param list.
        let (scheme, params) = match header.find(char::is_whitespace) {
            Some(idx) => (&header[..idx], header[idx..].trim_start()),
            None => (header, ""),
        };

        let mut challenge = Self {
            scheme: scheme.to_string(),
            ..Self::default()
        };

        for (name, value) in split_auth_params(params) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = Some(value),
                "scope" => challenge.scope = Some(value),
                "error" => challenge.error = Some(value),
                "error_description" => challenge.error_description = Some(value),
                "resource_metadata" => challenge.resource_metadata = Some(value),
                _ => {}
            }
        }

        challenge
    }

    /// Whether this challenge asks for an OAuth bearer flow.
    ///
    /// Requires the `Bearer` scheme (case-insensitive) and at least one of
    /// `realm` or `resource_metadata`, so that the proxy has somewhere to
    /// discover the identity provider from.
    pub fn is_oauth_challenge(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("Bearer")
            && (self.realm.as_deref().is_some_and(|r| !r.is_empty())
                || self
                    .resource_metadata
                    .as_deref()
                    .is_some_and(|r| !r.is_empty()))
    }

    /// The issuer advertised by the challenge (the realm).
    pub fn issuer(&self) -> Option<&str> {
        self.realm.as_deref().filter(|r| !r.is_empty())
    }

    /// The requested scopes, split into individual tokens.
    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// Split an auth-param list (`k1="v1", k2=v2, ...`) into name/value pairs.
///
/// Commas inside quoted values do not terminate a parameter; `\"` inside a
/// quoted value unescapes to `"`. Fragments without `=` (e.g. a stray
/// token68) are skipped.
fn split_auth_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.char_indices().peekable();
    let bytes = input;

    while let Some(&(start, _)) = chars.peek() {
        // Name runs up to '=' and must not contain a comma (otherwise the
        // fragment was not a parameter at all).
        let mut eq_idx = None;
        for (idx, ch) in chars.by_ref() {
            match ch {
                '=' => {
                    eq_idx = Some(idx);
                    break;
                }
                ',' => break,
                _ => {}
            }
        }
        let Some(eq_idx) = eq_idx else {
            continue;
        };
        let name = bytes[start..eq_idx].trim();
        if name.is_empty() {
            skip_to_next_param(&mut chars);
            continue;
        }

        // Value: quoted string or bare token up to the next comma.
        let value = match chars.peek() {
            Some(&(_, '"')) => {
                chars.next();
                let mut value = String::new();
                let mut escaped = false;
                for (_, ch) in chars.by_ref() {
                    if escaped {
                        value.push(ch);
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == '"' {
                        break;
                    } else {
                        value.push(ch);
                    }
                }
                skip_to_next_param(&mut chars);
                value
            }
            _ => {
                let value_start = chars.peek().map(|&(idx, _)| idx).unwrap_or(bytes.len());
                let mut value_end = bytes.len();
                for (idx, ch) in chars.by_ref() {
                    if ch == ',' {
                        value_end = idx;
                        break;
                    }
                }
                bytes[value_start..value_end.max(value_start)].trim().to_string()
            }
        };

        params.push((name.to_string(), value));
    }

    params
}

fn skip_to_next_param(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) {
    for (_, ch) in chars.by_ref() {
        if ch == ',' {
            break;
        }
    }
    while let Some(&(_, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else {
            break;
        }
    }
}
