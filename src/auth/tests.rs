use super::*;
use axum::http::HeaderMap;

fn with_auth(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

#[cfg(test)]
mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let headers = with_auth("Bearer user-42");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "user-42");
    }

    #[test]
    fn valid_bearer_token_with_extra_whitespace() {
        let headers = with_auth("Bearer   user-42  ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "user-42");
    }

    #[test]
    fn case_insensitive_bearer() {
        let headers = with_auth("bearer user-42");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "user-42");
    }

    #[test]
    fn missing_authorization_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Missing));
    }

    #[test]
    fn empty_authorization_header() {
        let headers = with_auth("");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn wrong_auth_scheme() {
        let headers = with_auth("Basic dXNlcjpwYXNz");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_without_token() {
        let headers = with_auth("Bearer");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_with_empty_token() {
        let headers = with_auth("Bearer  ");
        assert_eq!(extract_bearer_token(&headers), Err(TokenError::Empty));
    }
}

#[cfg(test)]
mod user_resolver_tests {
    use super::*;

    #[test]
    fn single_user_ignores_headers() {
        let headers = with_auth("Bearer someone-else");
        assert_eq!(SingleUser.resolve(&headers).unwrap(), DEFAULT_USER);
        assert_eq!(SingleUser.resolve(&HeaderMap::new()).unwrap(), DEFAULT_USER);
    }

    #[test]
    fn directory_maps_token_to_user() {
        let directory = TokenDirectory::parse("alice:tok-a1, bob:tok-b2").unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(
            directory.resolve(&with_auth("Bearer tok-a1")).unwrap(),
            "alice"
        );
        assert_eq!(directory.resolve(&with_auth("Bearer tok-b2")).unwrap(), "bob");
    }

    #[test]
    fn directory_rejects_bare_user_id() {
        let directory = TokenDirectory::parse("alice:tok-a1").unwrap();
        assert_eq!(
            directory.resolve(&with_auth("Bearer alice")),
            Err(TokenError::Unknown)
        );
        assert_eq!(
            directory.resolve(&HeaderMap::new()),
            Err(TokenError::Missing)
        );
    }

    #[test]
    fn revoked_token_stops_resolving() {
        let directory = TokenDirectory::new();
        directory.insert("tok-a1", "alice");
        assert!(directory.revoke("tok-a1"));
        assert!(!directory.revoke("tok-a1"));
        assert_eq!(
            directory.resolve(&with_auth("Bearer tok-a1")),
            Err(TokenError::Unknown)
        );
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        assert!(TokenDirectory::parse("").unwrap().is_empty());
        assert_eq!(TokenDirectory::parse("alice:tok, ,").unwrap().len(), 1);

        let err = TokenDirectory::parse("alice:tok-a1,bob").unwrap_err();
        assert!(err.to_string().contains("entry 2"));
        assert!(TokenDirectory::parse("alice:").is_err());
        assert!(TokenDirectory::parse(":tok").is_err());

        let err = TokenDirectory::parse("alice:same,bob:same").unwrap_err();
        assert!(!err.to_string().contains("same"));
    }
}

#[cfg(test)]
mod shared_secret_tests {
    use super::*;

    #[test]
    fn matching_secret_accepted() {
        let headers = with_auth("Bearer cron-secret");
        assert_eq!(verify_shared_secret(&headers, Some("cron-secret")), Ok(()));
    }

    #[test]
    fn mismatched_secret_rejected() {
        let headers = with_auth("Bearer cron-secreT");
        assert_eq!(
            verify_shared_secret(&headers, Some("cron-secret")),
            Err(TokenError::Mismatch)
        );
        let shorter = with_auth("Bearer cron");
        assert_eq!(
            verify_shared_secret(&shorter, Some("cron-secret")),
            Err(TokenError::Mismatch)
        );
    }

    #[test]
    fn unconfigured_secret_rejects_everything() {
        let headers = with_auth("Bearer anything");
        assert_eq!(verify_shared_secret(&headers, None), Err(TokenError::NotConfigured));
        assert_eq!(verify_shared_secret(&headers, Some("")), Err(TokenError::NotConfigured));
    }

    #[test]
    fn missing_header_rejected() {
        assert_eq!(
            verify_shared_secret(&HeaderMap::new(), Some("cron-secret")),
            Err(TokenError::Missing)
        );
    }
}

#[cfg(test)]
mod token_error_display_tests {
    use super::*;

    #[test]
    fn missing_error_message() {
        assert_eq!(TokenError::Missing.to_string(), "Authorization token not provided");
    }

    #[test]
    fn invalid_format_error_message() {
        assert_eq!(
            TokenError::InvalidFormat.to_string(),
            "Invalid authorization token format"
        );
    }

    #[test]
    fn empty_error_message() {
        assert_eq!(TokenError::Empty.to_string(), "Authorization token is empty");
    }
}
