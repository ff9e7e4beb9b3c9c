use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Transport that produced a descriptor.
///
/// Unknown tags written by newer peers deserialize to [`HostKind::Unknown`]
/// so a snapshot can still be read; the dispatcher treats such candidates as
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Http,
    Queue,
    #[serde(other)]
    Unknown,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Http => "http",
            HostKind::Queue => "queue",
            HostKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hosted service instance as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Unique across the registry, generated when the service is hosted
    pub id: Uuid,
    /// Fully-qualified interface name used for resolution
    pub interface_type: String,
    /// Optional label, never `Some("")`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host_kind: HostKind,
    /// URL for HTTP hosts, queue name for queue hosts
    pub address: String,
    /// Lease expiry; `None` for registries without leases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
}

impl ServiceDescriptor {
    /// Creates a descriptor with a fresh random id.
    ///
    /// An empty `name` is normalized to `None`.
    pub fn new(
        interface_type: impl Into<String>,
        name: Option<&str>,
        host_kind: HostKind,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            interface_type: interface_type.into(),
            name: normalize_name(name),
            host_kind,
            address: address.into(),
            expire_at: None,
        }
    }

    /// Whether the lease ran out before `now`. Descriptors without a lease never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.map(|at| at < now).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}) - {}",
            self.id,
            self.interface_type,
            self.name.as_deref().unwrap_or(""),
            self.address
        )
    }
}

/// Maps the empty string to "no name".
pub fn normalize_name(name: Option<&str>) -> Option<String> {
    match name {
        Some(n) if !n.is_empty() => Some(n.to_string()),
        _ => None,
    }
}

/// All descriptors stored in a registry at one instant.
///
/// This is also the document persisted by lease-based backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

impl RegistrySnapshot {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self { services }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.services.iter().any(|s| &s.id == id)
    }

    pub fn find(&self, id: &Uuid) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| &s.id == id)
    }

    /// Inserts `descriptor`, replacing any entry with the same id.
    pub fn upsert(&mut self, descriptor: ServiceDescriptor) {
        match self.services.iter_mut().find(|s| s.id == descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => self.services.push(descriptor),
        }
    }

    /// Removes the entry with `id`, returning whether one was present.
    pub fn remove(&mut self, id: &Uuid) -> bool {
        let before = self.services.len();
        self.services.retain(|s| &s.id != id);
        before != self.services.len()
    }

    /// Drops every descriptor whose lease ran out before `now` and returns their ids.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .services
            .iter()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id)
            .collect();
        self.services.retain(|s| !s.is_expired_at(now));
        expired
    }
}

impl IntoIterator for RegistrySnapshot {
    type Item = ServiceDescriptor;
    type IntoIter = std::vec::IntoIter<ServiceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.services.into_iter()
    }
}

impl FromIterator<ServiceDescriptor> for RegistrySnapshot {
    fn from_iter<I: IntoIterator<Item = ServiceDescriptor>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().collect(),
        }
    }
}
