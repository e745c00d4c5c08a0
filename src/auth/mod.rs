pub mod gate;
pub mod keys;
pub mod limiter;

pub use gate::{authenticate, AuthError, AuthSettings};
pub use keys::{KeyStore, KeyStoreError, MaskedKey};
pub use limiter::RateLimiter;
