//! Bearer-token verification for `hello`.
//!
//! Token issuance and signing live outside this service; the lobby only
//! asks whether a presented token maps to an account.

use std::collections::HashMap;

use crate::lobby::AccountId;

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AccountId>;
}

/// Accepts nothing; every participant stays anonymous
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousOnly;

impl IdentityVerifier for AnonymousOnly {
    fn verify(&self, _token: &str) -> Option<AccountId> {
        None
    }
}

/// Fixed token table, for tests and closed deployments
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, AccountId>,
}

impl StaticTokens {
    pub fn new(pairs: impl IntoIterator<Item = (String, AccountId)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }
}

impl IdentityVerifier for StaticTokens {
    fn verify(&self, token: &str) -> Option<AccountId> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifiers() {
        assert_eq!(AnonymousOnly.verify("anything"), None);
        let tokens = StaticTokens::new([("t1".to_string(), "acct-1".to_string())]);
        assert_eq!(tokens.verify("t1").as_deref(), Some("acct-1"));
        assert_eq!(tokens.verify("t2"), None);
    }
}
