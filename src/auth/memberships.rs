//! Fixed membership list

use crate::auth::{AuthError, Identity, MembershipResolver};
use crate::channels::{IdError, Membership};
use async_trait::async_trait;
use std::collections::HashSet;

/// Resolver that hands every identity the same memberships
///
/// Suits single-room deployments and local development. Identities listed
/// in `denied` are refused outright.
#[derive(Debug, Clone, Default)]
pub struct StaticMemberships {
    memberships: Vec<Membership>,
    denied: HashSet<Identity>,
}

impl StaticMemberships {
    pub fn new(memberships: Vec<Membership>) -> Self {
        let mut set = Self::default();
        set.add_all(memberships);
        set
    }

    /// Parse a comma-separated `tenant/channel` list
    pub fn parse(list: &str) -> Result<Self, IdError> {
        let memberships = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Membership::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(memberships))
    }

    /// Add a membership, ignoring duplicates
    pub fn add(&mut self, membership: Membership) {
        if !self.memberships.contains(&membership) {
            self.memberships.push(membership);
        }
    }

    pub fn add_all(&mut self, memberships: impl IntoIterator<Item = Membership>) {
        for membership in memberships {
            self.add(membership);
        }
    }

    pub fn deny(&mut self, identity: Identity) {
        self.denied.insert(identity);
    }

    pub fn memberships(&self) -> &[Membership] {
        &self.memberships
    }

    pub fn is_empty(&self) -> bool {
        self.memberships.is_empty()
    }
}

#[async_trait]
impl MembershipResolver for StaticMemberships {
    async fn initial_memberships(&self, identity: &Identity) -> Result<Vec<Membership>, AuthError> {
        if self.denied.contains(identity) {
            return Err(AuthError::Forbidden(identity.to_string()));
        }
        Ok(self.memberships.clone())
    }
}
