pub mod db;
pub mod dpop;
pub mod flow;
pub mod par;
pub mod pkce;
pub mod session;
