use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use clipforge_core::UserId;

use crate::app::errors::json_error;
use crate::context::UserContext;

/// Header carrying the authenticated user id, set by the upstream gateway.
pub const USER_HEADER: &str = "x-user-id";

pub async fn user_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let user_id = match extract_user(req.headers()) {
        Ok(user_id) => user_id,
        Err(message) => return json_error(StatusCode::UNAUTHORIZED, "unauthorized", message),
    };

    req.extensions_mut().insert(UserContext::new(user_id));
    next.run(req).await
}

fn extract_user(headers: &HeaderMap) -> Result<UserId, &'static str> {
    let header = headers
        .get(USER_HEADER)
        .ok_or("missing x-user-id header")?;

    let raw = header.to_str().map_err(|_| "x-user-id is not valid ascii")?.trim();
    if raw.is_empty() {
        return Err("missing x-user-id header");
    }

    raw.parse().map_err(|_| "x-user-id is not a valid user id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_user_header() {
        let user = UserId::new();
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(&user.to_string()).unwrap());
        assert_eq!(extract_user(&headers), Ok(user));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert!(extract_user(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert!(extract_user(&headers).is_err());

        headers.insert(USER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(extract_user(&headers).is_err());
    }
}
