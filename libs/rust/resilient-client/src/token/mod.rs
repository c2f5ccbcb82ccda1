//! Access token acquisition and caching.

pub mod fetcher;
pub mod store;
pub mod types;

pub use fetcher::{HttpTokenFetcher, MockTokenFetcher, TokenFetcher, classify_token_error};
pub use store::{DEFAULT_SAFETY_MARGIN_MS, TokenStore};
pub use types::{AccessToken, TokenCacheEntry, TokenResponse, TokenState};
