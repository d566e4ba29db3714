use once_cell::sync::Lazy;
use std::env;

pub static DEFAULT_API_VERSION: Lazy<String> = Lazy::new(|| {
    env::var("SHOPIFY_API_VERSION")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "2024-10".to_string())
});

/// Admin GraphQL endpoint for a shop. Accepts a bare domain or a full URL.
pub fn graphql_endpoint(shop_url: &str, api_version: &str) -> String {
    let trimmed = shop_url.trim().trim_end_matches('/');
    let host = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    if trimmed.starts_with("http://") {
        format!("http://{host}/admin/api/{api_version}/graphql.json")
    } else {
        format!("https://{host}/admin/api/{api_version}/graphql.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalises_shop_urls() {
        assert_eq!(
            graphql_endpoint("demo.myshopify.com", "2024-10"),
            "https://demo.myshopify.com/admin/api/2024-10/graphql.json"
        );
        assert_eq!(
            graphql_endpoint("https://demo.myshopify.com/", "2024-07"),
            "https://demo.myshopify.com/admin/api/2024-07/graphql.json"
        );
        assert_eq!(
            graphql_endpoint("http://127.0.0.1:9000", "2024-10"),
            "http://127.0.0.1:9000/admin/api/2024-10/graphql.json"
        );
    }
}
