//! HTTP middleware for operator authentication.
pub mod auth;
