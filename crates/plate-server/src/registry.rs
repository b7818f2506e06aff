use std::collections::{BTreeMap, HashMap};

use plate_core::{ConnectionId, PairingCode, Role};
use rand::Rng;

/// Draws `fresh_code` makes before settling for an occupied code.
pub const FRESH_CODE_ATTEMPTS: usize = 32;

/// A connection's current room binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub code: PairingCode,
    pub role: Role,
}

/// Room membership, keyed by pairing code.
///
/// Rooms have no lifecycle of their own: a code is a room while at least one
/// connection is bound to it, and the entry is dropped with its last member.
/// Codes are opaque keys; validation belongs to the caller.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    // BTreeMap keeps members in connection order (ids are time-ordered).
    rooms: HashMap<PairingCode, BTreeMap<ConnectionId, Role>>,
    bindings: HashMap<ConnectionId, PairingCode>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `code` with `role`.
    ///
    /// A connection holds at most one binding. Joining a different room moves
    /// it out of the old one; rejoining the same room overwrites the role.
    /// Returns the binding that was replaced, if any.
    pub fn join(&mut self, id: ConnectionId, code: PairingCode, role: Role) -> Option<Membership> {
        let previous = match self.bindings.get(&id).cloned() {
            Some(old) if old != code => self.remove(&id),
            Some(_) => self.membership(&id),
            None => None,
        };

        self.rooms
            .entry(code.clone())
            .or_default()
            .insert(id.clone(), role);
        self.bindings.insert(id, code);
        previous
    }

    /// Unbind `id` from whatever room it was in. No-op for unbound ids.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Membership> {
        let code = self.bindings.remove(id)?;
        let members = self.rooms.get_mut(&code)?;
        let role = members.remove(id)?;
        if members.is_empty() {
            self.rooms.remove(&code);
        }
        Some(Membership { code, role })
    }

    /// Everyone currently in `code`.
    pub fn members_of(&self, code: &PairingCode) -> Vec<ConnectionId> {
        self.rooms
            .get(code)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Everyone in `code` except `sender`.
    pub fn peers_of(&self, code: &PairingCode, sender: &ConnectionId) -> Vec<ConnectionId> {
        self.rooms
            .get(code)
            .map(|members| members.keys().filter(|id| *id != sender).cloned().collect())
            .unwrap_or_default()
    }

    pub fn membership(&self, id: &ConnectionId) -> Option<Membership> {
        let code = self.bindings.get(id)?;
        let role = self.rooms.get(code)?.get(id)?;
        Some(Membership {
            code: code.clone(),
            role: role.clone(),
        })
    }

    pub fn is_joined(&self, id: &ConnectionId) -> bool {
        self.bindings.contains_key(id)
    }

    pub fn is_occupied(&self, code: &PairingCode) -> bool {
        self.rooms.contains_key(code)
    }

    pub fn hosts_in(&self, code: &PairingCode) -> usize {
        self.rooms
            .get(code)
            .map_or(0, |members| members.values().filter(|r| r.is_host()).count())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.bindings.len()
    }

    /// Generate a code that no live room is using.
    ///
    /// Gives up after `FRESH_CODE_ATTEMPTS` draws and returns the last one, so
    /// a saturated code space degrades to a shared room instead of failing.
    pub fn fresh_code<R: Rng + ?Sized>(&self, rng: &mut R) -> PairingCode {
        let mut code = PairingCode::generate(rng);
        for _ in 1..FRESH_CODE_ATTEMPTS {
            if !self.is_occupied(&code) {
                break;
            }
            code = PairingCode::generate(rng);
        }
        code
    }
}
