//! Random identifiers handed out to clients (share keys, session codes).

use rand::Rng;
use rand::distr::Alphanumeric;

/// A random alphanumeric token of `len` characters.
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
