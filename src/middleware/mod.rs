// Request/response interceptors of the session client

pub mod auth;
pub mod guard;

pub use auth::{attach_token, AuthDecision, AuthInterceptor};
pub use guard::{LogRedirect, LoginRedirect, ResponseGuard, Verdict};
