use crate::config::Config;
use crate::investigations::Principal;
use http::header::{HeaderMap, AUTHORIZATION};
use std::collections::HashMap;
use std::sync::Arc;
use warp::{Filter, Rejection};

const TOKEN_SCHEME: &str = "LupaToken";

/// Static token table split by principal class; service principals bypass
/// row-level access checks in the store.
pub struct Tokens {
    users: HashMap<String, String>,
    services: HashMap<String, String>,
}

impl Tokens {
    pub fn from_config(config: &Config) -> Self {
        Tokens {
            users: config.server.user_tokens.clone(),
            services: config.server.service_tokens.clone(),
        }
    }

    fn principal_for(&self, token: &str) -> Option<Principal> {
        if let Some(user) = self.users.get(token) {
            return Some(Principal::User(user.clone()));
        }
        self.services
            .get(token)
            .map(|name| Principal::Service(name.clone()))
    }
}

fn parse_token(authorization: &str) -> Option<&str> {
    let mut segments = authorization.split(' ');
    if let Some(scheme) = segments.next() {
        if scheme == TOKEN_SCHEME {
            if let Some(token) = segments.next() {
                if segments.next().is_none() {
                    return Some(token);
                }
            }
        }
    }

    None
}

fn check_auth(tokens: &Tokens, headers: &HeaderMap, query_token: Option<&str>) -> Option<Principal> {
    if let Some(authorization_value) = headers.get(AUTHORIZATION) {
        if let Ok(authorization) = authorization_value.to_str() {
            if let Some(token) = parse_token(authorization) {
                return tokens.principal_for(token);
            }
        }
        return None;
    }

    // Streaming clients (EventSource, browsers) cannot set headers; they
    // pass the token in the query string instead.
    query_token.and_then(|token| tokens.principal_for(token))
}

#[derive(Debug)]
pub struct Forbidden;

impl warp::reject::Reject for Forbidden {}

/// Header-based auth for the JSON endpoints.
pub fn auth_filter(
    tokens: Arc<Tokens>,
) -> impl Filter<Extract = (Principal,), Error = Rejection> + Clone {
    warp::header::headers_cloned().and_then(move |headers: HeaderMap| {
        let tokens = tokens.clone();
        async move {
            match check_auth(&tokens, &headers, None) {
                Some(principal) => Ok(principal),
                None => Err(warp::reject::custom(Forbidden)),
            }
        }
    })
}

#[derive(serde_derive::Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

/// Auth for the streaming endpoints: header or `?token=` query parameter.
pub fn stream_auth_filter(
    tokens: Arc<Tokens>,
) -> impl Filter<Extract = (Principal,), Error = Rejection> + Clone {
    warp::header::headers_cloned()
        .and(warp::query::<StreamQuery>())
        .and_then(move |headers: HeaderMap, query: StreamQuery| {
            let tokens = tokens.clone();
            async move {
                match check_auth(&tokens, &headers, query.token.as_deref()) {
                    Some(principal) => Ok(principal),
                    None => Err(warp::reject::custom(Forbidden)),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::{check_auth, parse_token, Tokens};
    use crate::config::Config;
    use crate::investigations::Principal;
    use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};

    fn tokens() -> Tokens {
        let mut config = Config::default();
        config
            .server
            .user_tokens
            .insert("usertoken".into(), "maria".into());
        config
            .server
            .service_tokens
            .insert("svctoken".into(), "ops".into());
        Tokens::from_config(&config)
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token("foo"), None);
        assert_eq!(parse_token("foo bar"), None);
        assert_eq!(parse_token("LupaToken"), None);
        assert_eq!(parse_token("LupaToken foo"), Some("foo"));
        assert_eq!(parse_token("LupaToken foo bar"), None);
    }

    #[test]
    fn test_check_auth() {
        let tokens = tokens();

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("LupaToken usertoken"),
        );
        assert_eq!(
            check_auth(&tokens, &headers, None),
            Some(Principal::User("maria".into()))
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("LupaToken svctoken"));
        assert_eq!(
            check_auth(&tokens, &headers, None),
            Some(Principal::Service("ops".into()))
        );

        // A bad header never falls back to the query token.
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("LupaToken wrong"));
        assert_eq!(check_auth(&tokens, &headers, Some("usertoken")), None);

        // No header at all does.
        let headers = HeaderMap::new();
        assert_eq!(
            check_auth(&tokens, &headers, Some("usertoken")),
            Some(Principal::User("maria".into()))
        );
        assert_eq!(check_auth(&tokens, &headers, None), None);
    }
}
