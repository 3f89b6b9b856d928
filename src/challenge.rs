use crate::scope::Scope;

/// A parsed `WWW-Authenticate: Bearer …` challenge from the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChallenge {
    pub realm: String,
    pub service: String,
    pub scopes: Vec<Scope>,
}

/// Parses a Bearer challenge header value. Returns `None` for any other
/// auth scheme so the caller can surface the upstream response untouched.
///
/// Handles RFC 7235 quoted strings with backslash escapes and multiple
/// space-separated scopes inside a single `scope` parameter.
pub fn parse_bearer_challenge(header: &str) -> Option<TokenChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scopes = Vec::new();
    for (key, value) in parse_auth_params(params)? {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => {
                for raw in value.split_ascii_whitespace() {
                    scopes.push(Scope::parse(raw)?);
                }
            }
            _ => {}
        }
    }

    Some(TokenChallenge {
        realm: realm?,
        service: service.unwrap_or_default(),
        scopes,
    })
}

/// Splits `k1="v1",k2=v2,…` into pairs, honoring quoted strings.
fn parse_auth_params(raw: &str) -> Option<Vec<(String, String)>> {
    let mut params = Vec::new();
    let mut chars = raw.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return None;
        }

        let value = match chars.peek() {
            Some('"') => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next()? {
                        '\\' => value.push(chars.next()?),
                        '"' => break,
                        c => value.push(c),
                    }
                }
                value
            }
            _ => {
                let mut value = String::new();
                while matches!(chars.peek(), Some(c) if *c != ',') {
                    value.push(chars.next().expect("peeked"));
                }
                value.trim().to_string()
            }
        };

        params.push((key, value));
    }

    Some(params)
}
