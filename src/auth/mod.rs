use reqwest::header::{HeaderValue, InvalidHeaderValue};

mod provider;
mod session;


pub use provider::{IdentityError, IdentityProvider, OAuthRefreshProvider, TokenGrant};
pub use session::{SessionAuthority, SessionEvent};

/// Build the `Authorization` header value for a bearer token
pub fn bearer_header(token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
    value.set_sensitive(true);
    Ok(value)
}
