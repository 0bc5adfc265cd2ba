/// Hush Crypto Library
///
/// - `keys`: ephemeral RSA session keypairs. The private half stays in a
///   `KeyVault`; only the public half is handed to clients.
/// - `encrypt`: the hybrid envelope used for message bodies (RSA-OAEP wrapped
///   AES-256-GCM key) and single-block RSA-OAEP for short fields.
/// - `token`: stateless bearer tokens, AES-256-CBC under a server-wide secret.

pub mod encrypt;
pub mod keys;
pub mod token;

pub use keys::{KeyError, KeyExchange, KeyVault, MemoryKeyVault};
pub use token::{SessionTokens, TokenError};
