pub mod auth;
pub mod cookies;
pub mod encryption;
pub mod errors;
pub mod identity;
pub mod oauth;
pub mod pds;
pub mod routes;
pub mod security;
pub mod state;
