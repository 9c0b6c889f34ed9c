use axum::http::{header, HeaderMap};

fn auth_cookie_name(cluster: &str) -> String {
    format!("porthole-auth.{cluster}")
}

/// Extracts the caller's bearer token for a cluster from the request
/// cookies. Absence is not an error; the kubeconfig's own credentials apply.
pub fn token_from_cookie(headers: &HeaderMap, cluster: &str) -> Option<String> {
    let name = auth_cookie_name(cluster);
    for value in headers.get_all(header::COOKIE) {
        let Ok(cookies) = value.to_str() else { continue };
        for cookie in cookies.split(';') {
            if let Some((cookie_name, token)) = cookie.trim().split_once('=') {
                if cookie_name == name && !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}
