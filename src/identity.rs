//! Caller identity resolvers

use crate::core::{Caller, Entity, EntityType, Error, IdentityResolver, Ledger, Result};

/// Fixed caller, for tests and trusted front ends.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub Caller);

impl StaticIdentity {
    pub fn new(username: impl Into<String>, role: EntityType) -> Self {
        Self(Caller::new(username, role))
    }
}

impl IdentityResolver for StaticIdentity {
    fn resolve_caller(&self, _ledger: &dyn Ledger) -> Result<Caller> {
        Ok(self.0.clone())
    }
}

/// Username supplied by the host; the role is the type on the caller's entity record.
#[derive(Debug, Clone, Default)]
pub struct LedgerIdentity {
    username: Option<String>,
}

impl LedgerIdentity {
    pub fn new(username: Option<String>) -> Self {
        Self { username }
    }
}

impl IdentityResolver for LedgerIdentity {
    fn resolve_caller(&self, ledger: &dyn Ledger) -> Result<Caller> {
        let username = self
            .username
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::IdentityUnavailable("no caller supplied".into()))?;

        let stored = ledger
            .get_state(username)?
            .ok_or_else(|| Error::IdentityUnavailable(format!("{} is not a registered party", username)))?;
        let entity: Entity = serde_json::from_slice(&stored.value)
            .map_err(|e| Error::IdentityUnavailable(format!("{}: {}", username, e)))?;
        Ok(Caller::new(entity.id, entity.kind))
    }
}
