//! `tg-auth` — authentication for the ToolGate gateway.
//!
//! - [`TokenIssuer`] signs and verifies the bearer tokens the gateway
//!   hands out after a successful login (HMAC-SHA256 over JSON claims).
//! - [`OAuthRegistry`] drives the per-provider authorization-code flow:
//!   authorize URL with a random `state`, code exchange, userinfo fetch,
//!   and group-claim extraction.
//! - [`LoginService`] glues the two to the RBAC engine: local password
//!   logins, and the OAuth callback pipeline that maps identity-provider
//!   groups to gateway roles.

pub mod login;
pub mod oauth;
pub mod token;

pub use login::{CallbackRedirect, LocalLogin, LoginError, LoginService};
pub use oauth::{AuthorizationRequest, OAuthError, OAuthRegistry, UserInfo};
pub use token::{Claims, TokenError, TokenIssuer};
