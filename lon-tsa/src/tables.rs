//! Domain, group-membership and key lookup.
//!
//! These tables are owned by the stack context but written externally (by
//! network management) only between scheduler passes; the engine itself
//! only reads them.

use lon_proto::DomainId;

/// An authentication key: the standard 48-bit form or the 96-bit OMA form.
/// Which form a domain uses decides whether challenges go out as the OMA
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKey {
    Std([u8; 6]),
    Oma([u8; 12]),
}

impl AuthKey {
    pub fn is_oma(&self) -> bool {
        matches!(self, AuthKey::Oma(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            AuthKey::Std(k) => k,
            AuthKey::Oma(k) => k,
        }
    }
}

impl Default for AuthKey {
    fn default() -> Self {
        AuthKey::Std([0; 6])
    }
}

/// One configured domain: our address within it and its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainEntry {
    pub id: DomainId,
    pub subnet: u8,
    pub node: u8,
    pub key: AuthKey,
}

/// Membership of one group: which domain it lives in, our member index and
/// the group size (self-inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupEntry {
    pub domain_index: u8,
    pub group: u8,
    pub member: u8,
    pub size: u8,
}

/// The lookup surface the engine reads.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub domains: Vec<DomainEntry>,
    pub groups: Vec<GroupEntry>,
}

impl Tables {
    pub fn domain(&self, index: usize) -> Option<&DomainEntry> {
        self.domains.get(index)
    }

    /// Matches a received domain id against the configured domains.
    pub fn match_domain(&self, id: &DomainId) -> Option<(u8, &DomainEntry)> {
        self.domains
            .iter()
            .enumerate()
            .find(|(_, d)| d.id == *id)
            .map(|(i, d)| (i as u8, d))
    }

    /// Our membership entry for `group` within a domain, if any.
    pub fn group_member(&self, domain_index: u8, group: u8) -> Option<&GroupEntry> {
        self.groups
            .iter()
            .find(|g| g.domain_index == domain_index && g.group == group)
    }
}
