//! GitHub App integration: JWT signing and installation-token vending.

pub mod auth;

pub use auth::{GithubAppAuth, StaticTokenProvider, TokenProvider};
