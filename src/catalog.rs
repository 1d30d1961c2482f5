//! Typed descriptors for product catalog requests.
//!
//! Each descriptor spells out its own canonical parameters; the flight key
//! is derived from the upstream call it turns into (method, path and body
//! digest), so it lives in a keyspace separate from the cached response.

use crate::cache::{sha256_hex, CanonicalParams, RequestDescriptor};
use bytes::Bytes;
use reqwest::Method;

/// A raw upstream call: method, path and an optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Bytes>,
}

impl UpstreamCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn body_digest(&self) -> Option<String> {
        self.body.as_ref().map(|b| sha256_hex(b))
    }
}

impl RequestDescriptor for UpstreamCall {
    const NAMESPACE: &'static str = "upstream";

    fn params(&self) -> CanonicalParams {
        CanonicalParams::new()
            .with("method", self.method.as_str())
            .with("path", self.path.as_str())
            .with("body", self.body_digest())
    }
}

/// Paged product listing, optionally narrowed to one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductListQuery {
    pub category: Option<String>,
    pub page: u32,
    pub per_page: u32,
    pub sort: Option<String>,
}

impl Default for ProductListQuery {
    fn default() -> Self {
        Self {
            category: None,
            page: 1,
            per_page: 24,
            sort: None,
        }
    }
}

impl RequestDescriptor for ProductListQuery {
    const NAMESPACE: &'static str = "products";

    fn params(&self) -> CanonicalParams {
        CanonicalParams::new()
            .with("category", self.category.as_deref())
            .with("page", self.page)
            .with("per_page", self.per_page)
            .with("sort", self.sort.as_deref())
    }

    fn flight_params(&self) -> CanonicalParams {
        UpstreamCall::get("/products")
            .params()
            .with("query", self.params().to_canonical_json())
    }
}

/// Free-text product search. The query is trimmed and lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSearch {
    pub query: String,
    pub limit: u32,
}

impl ProductSearch {
    pub fn new(query: impl AsRef<str>, limit: u32) -> Self {
        Self {
            query: query.as_ref().trim().to_lowercase(),
            limit,
        }
    }
}

impl RequestDescriptor for ProductSearch {
    const NAMESPACE: &'static str = "product-search";

    fn params(&self) -> CanonicalParams {
        CanonicalParams::new()
            .with("q", self.query.as_str())
            .with("limit", self.limit)
    }

    fn flight_params(&self) -> CanonicalParams {
        let body = serde_json::json!({ "q": self.query, "limit": self.limit }).to_string();
        UpstreamCall::new(Method::POST, "/products/search")
            .with_body(body)
            .params()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductLookup {
    pub product_id: String,
}

impl ProductLookup {
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
        }
    }
}

impl RequestDescriptor for ProductLookup {
    const NAMESPACE: &'static str = "product";

    fn params(&self) -> CanonicalParams {
        CanonicalParams::new().with("id", self.product_id.as_str())
    }

    fn flight_params(&self) -> CanonicalParams {
        UpstreamCall::get(format!("/products/{}", self.product_id)).params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyDeriver;

    #[test]
    fn test_absent_category_is_part_of_the_key() {
        let deriver = KeyDeriver::new();
        let all = ProductListQuery::default();
        let shoes = ProductListQuery {
            category: Some("shoes".into()),
            ..ProductListQuery::default()
        };
        assert_ne!(all.cache_key(&deriver), shoes.cache_key(&deriver));
        assert_eq!(all.cache_key(&deriver), ProductListQuery::default().cache_key(&deriver));
    }

    #[test]
    fn test_flight_and_cache_keyspaces_differ() {
        let deriver = KeyDeriver::new();
        let lookup = ProductLookup::new("sku-9");
        let cache = lookup.cache_key(&deriver);
        let flight = lookup.flight_key(&deriver);
        assert_eq!(cache.namespace(), "product");
        assert_eq!(flight.namespace(), "flight:product");
        assert_ne!(cache.as_str(), flight.as_str());
    }

    #[test]
    fn test_tilde_category_does_not_join_unfiltered_listing() {
        let deriver = KeyDeriver::new();
        let all = ProductListQuery::default();
        let tilde = ProductListQuery {
            category: Some("~".into()),
            ..ProductListQuery::default()
        };
        assert_ne!(all.flight_key(&deriver), tilde.flight_key(&deriver));
        assert_ne!(all.cache_key(&deriver), tilde.cache_key(&deriver));

        let sorted = ProductListQuery {
            sort: Some("1".into()),
            ..ProductListQuery::default()
        };
        assert_ne!(all.flight_key(&deriver), sorted.flight_key(&deriver));
    }

    #[test]
    fn test_search_query_is_normalized() {
        let deriver = KeyDeriver::new();
        assert_eq!(
            ProductSearch::new("  Running Shoes ", 10).cache_key(&deriver),
            ProductSearch::new("running shoes", 10).cache_key(&deriver)
        );
        assert_ne!(
            ProductSearch::new("shoes", 10).flight_key(&deriver),
            ProductSearch::new("shoes", 20).flight_key(&deriver)
        );
    }

    #[test]
    fn test_body_digest_distinguishes_calls() {
        let a = UpstreamCall::new(Method::POST, "/cart").with_body(r#"{"sku":"a"}"#);
        let b = UpstreamCall::new(Method::POST, "/cart").with_body(r#"{"sku":"b"}"#);
        assert_ne!(a.params(), b.params());
        assert_eq!(a.body_digest().map(|d| d.len()), Some(64));
        assert_eq!(UpstreamCall::get("/cart").body_digest(), None);
    }
}
