pub mod listener;
pub mod provider;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use listener::{capture_auth_code, AuthCodeExchange, Browser, CallbackListener, SystemBrowser};
pub use provider::{Account, IdentityProvider, MicrosoftIdentityClient, TokenResult};
pub use token::{AuthHeaders, TokenManager, TokenRecord, TokenStatus, TokenStore};
