//! Device session table.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tunnel_types::DeviceId;

/// Connection-level liveness as last observed by keepalive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Unknown,
    Online,
    Offline,
}

/// Registration state machine: `Unregistered → Pending → Registered`, back
/// to `Unregistered` on validation failure, back through `Pending` on an
/// explicit re-registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Pending,
    Registered,
}

/// Tracked state for one remote device.
#[derive(Clone, Debug)]
pub struct DeviceSession {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
    pub last_seen_at: DateTime<Utc>,
    pub registration: RegistrationState,
    pub connected_at: DateTime<Utc>,
}

impl DeviceSession {
    fn new(device_id: DeviceId) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            status: DeviceStatus::Unknown,
            last_seen_at: now,
            registration: RegistrationState::Unregistered,
            connected_at: now,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration == RegistrationState::Registered
    }
}

/// Status transitions announced by the keepalive driver. Emitted only on
/// actual change, never on repeated observations of the same state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Online(DeviceId),
    Offline(DeviceId),
}

/// All known device sessions.
///
/// Created on first contact, never implicitly deleted. Mutation goes through
/// these methods only; keepalive and registration are the writers, everyone
/// else reads. `set_status` performs the field assignment and reports whether
/// anything changed; announcing a change is the caller's concern.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<DeviceId, DeviceSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session on first contact; no-op if it already exists.
    pub fn ensure(&self, device_id: &DeviceId) {
        self.sessions
            .entry(device_id.clone())
            .or_insert_with(|| DeviceSession::new(device_id.clone()));
    }

    /// Record that the device was just heard from.
    pub fn touch(&self, device_id: &DeviceId) {
        let mut entry = self
            .sessions
            .entry(device_id.clone())
            .or_insert_with(|| DeviceSession::new(device_id.clone()));
        entry.last_seen_at = Utc::now();
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceSession> {
        self.sessions.get(device_id).map(|s| s.clone())
    }

    /// Assign the status; returns `true` iff the stored value changed.
    pub fn set_status(&self, device_id: &DeviceId, status: DeviceStatus) -> bool {
        let mut entry = self
            .sessions
            .entry(device_id.clone())
            .or_insert_with(|| DeviceSession::new(device_id.clone()));
        if entry.status == status {
            return false;
        }
        entry.status = status;
        true
    }

    pub fn set_registration(&self, device_id: &DeviceId, state: RegistrationState) {
        let mut entry = self
            .sessions
            .entry(device_id.clone())
            .or_insert_with(|| DeviceSession::new(device_id.clone()));
        entry.registration = state;
    }

    pub fn is_registered(&self, device_id: &DeviceId) -> bool {
        self.sessions
            .get(device_id)
            .map(|s| s.is_registered())
            .unwrap_or(false)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_contact_creates_unregistered_unknown_session() {
        let table = SessionTable::new();
        let dev = DeviceId::new("dev-1");

        table.touch(&dev);

        let session = table.get(&dev).unwrap();
        assert_eq!(session.status, DeviceStatus::Unknown);
        assert_eq!(session.registration, RegistrationState::Unregistered);
        assert!(!session.is_registered());
    }

    #[test]
    fn set_status_is_idempotent() {
        let table = SessionTable::new();
        let dev = DeviceId::new("dev-1");
        table.ensure(&dev);

        assert!(table.set_status(&dev, DeviceStatus::Online));
        assert!(!table.set_status(&dev, DeviceStatus::Online));
        assert!(table.set_status(&dev, DeviceStatus::Offline));
        assert!(!table.set_status(&dev, DeviceStatus::Offline));
    }

    #[test]
    fn sessions_persist_across_status_flips() {
        let table = SessionTable::new();
        let dev = DeviceId::new("dev-1");
        table.touch(&dev);
        table.set_registration(&dev, RegistrationState::Registered);

        table.set_status(&dev, DeviceStatus::Offline);
        table.set_status(&dev, DeviceStatus::Online);

        assert_eq!(table.len(), 1);
        assert!(table.is_registered(&dev));
    }
}
