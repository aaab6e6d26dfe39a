//! Conversation directory: who the session user may message, presence, and
//! the active selection.

use std::collections::HashMap;

use carechat_shared::protocol::Counterparty;
use carechat_shared::types::{ConversationKey, PresenceStatus, Role, UserId};

/// Roles each session role may open conversations with.
pub fn eligible_roles(role: Role) -> &'static [Role] {
    match role {
        Role::Mom => &[Role::Doctor, Role::Midwife],
        Role::Doctor => &[Role::Mom, Role::Midwife, Role::Doctor],
        Role::Midwife => &[Role::Doctor, Role::Mom],
        Role::ServiceProvider => &[Role::Mom],
        Role::Admin => &[],
    }
}

pub fn may_message(from: Role, to: Role) -> bool {
    eligible_roles(from).contains(&to)
}

/// Optional narrowing of the eligible set to a single role (UI tabs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleFilter {
    #[default]
    All,
    Only(Role),
}

impl RoleFilter {
    fn admits(self, role: Role) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::Only(only) => only == role,
        }
    }
}

/// Filter and search the raw directory list.
///
/// Keeps active counterparties whose role is eligible for `current_role`,
/// admitted by `filter`, and whose display name or specialty contains
/// `search` case-insensitively. Input order is preserved.
pub fn list_counterparties<'a>(
    current_role: Role,
    filter: RoleFilter,
    search: &str,
    raw: &'a [Counterparty],
) -> Vec<&'a Counterparty> {
    let needle = search.trim().to_lowercase();
    raw.iter()
        .filter(|c| c.is_active)
        .filter(|c| may_message(current_role, c.role) && filter.admits(c.role))
        .filter(|c| {
            needle.is_empty()
                || c.display_name.to_lowercase().contains(&needle)
                || c.specialty.to_lowercase().contains(&needle)
        })
        .collect()
}

/// Session-scoped directory state. Owned by the client engine.
pub struct ConversationDirectory {
    local_user: UserId,
    role: Role,
    counterparties: Vec<Counterparty>,
    presence: HashMap<UserId, PresenceStatus>,
    active: Option<ConversationKey>,
}

impl ConversationDirectory {
    pub fn new(local_user: UserId, role: Role) -> Self {
        Self {
            local_user,
            role,
            counterparties: Vec::new(),
            presence: HashMap::new(),
            active: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Replace the raw list with a fresh fetch. The local user is dropped.
    pub fn replace_counterparties(&mut self, list: Vec<Counterparty>) {
        self.counterparties = list
            .into_iter()
            .filter(|c| c.id != self.local_user)
            .collect();
    }

    /// Add or refresh one counterparty learned from elsewhere (conversation
    /// summaries, inbound messages).
    pub fn learn(&mut self, counterparty: Counterparty) {
        if counterparty.id == self.local_user {
            return;
        }
        match self.counterparties.iter_mut().find(|c| c.id == counterparty.id) {
            Some(existing) => *existing = counterparty,
            None => self.counterparties.push(counterparty),
        }
    }

    pub fn counterparty(&self, id: &UserId) -> Option<&Counterparty> {
        self.counterparties.iter().find(|c| &c.id == id)
    }

    pub fn list(&self, filter: RoleFilter, search: &str) -> Vec<&Counterparty> {
        list_counterparties(self.role, filter, search, &self.counterparties)
    }

    pub fn set_active(&mut self, key: ConversationKey) {
        self.active = Some(key);
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    pub fn set_presence(&mut self, user: UserId, status: PresenceStatus) {
        self.presence.insert(user, status);
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        matches!(self.presence.get(user), Some(PresenceStatus::Online))
    }

    /// Presence is only meaningful while connected.
    pub fn clear_presence(&mut self) {
        self.presence.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(id: &str, name: &str, role: Role, specialty: &str) -> Counterparty {
        Counterparty {
            id: UserId::from(id),
            display_name: name.into(),
            role,
            specialty: specialty.into(),
            is_active: true,
        }
    }

    fn raw() -> Vec<Counterparty> {
        vec![
            cp("d1", "Dr. Perera", Role::Doctor, "Obstetrics"),
            cp("d2", "Dr. Fernando", Role::Doctor, "Paediatrics"),
            cp("m1", "Amaya", Role::Mom, "Due in June"),
            cp("w1", "Nimali", Role::Midwife, "Colombo MOH"),
            cp("s1", "Baby Shop", Role::ServiceProvider, ""),
        ]
    }

    #[test]
    fn midwife_sees_doctors_and_moms() {
        let raw = raw();
        let ids: Vec<_> = list_counterparties(Role::Midwife, RoleFilter::All, "", &raw)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["d1", "d2", "m1"]);
    }

    #[test]
    fn filter_and_search_are_case_insensitive() {
        let raw = raw();
        let hits = list_counterparties(Role::Midwife, RoleFilter::Only(Role::Doctor), "PAED", &raw);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, UserId::from("d2"));

        let by_name = list_counterparties(Role::Mom, RoleFilter::All, "nima", &raw);
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].role, Role::Midwife);

        // A filter outside the eligible set yields nothing.
        assert!(list_counterparties(Role::Mom, RoleFilter::Only(Role::Mom), "", &raw).is_empty());
    }

    #[test]
    fn admin_and_inactive_are_excluded() {
        let mut raw = raw();
        assert!(list_counterparties(Role::Admin, RoleFilter::All, "", &raw).is_empty());

        raw[0].is_active = false;
        let ids: Vec<_> = list_counterparties(Role::Mom, RoleFilter::All, "", &raw)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["d2", "w1"]);
    }

    #[test]
    fn eligibility_table() {
        assert!(may_message(Role::Doctor, Role::Doctor));
        assert!(may_message(Role::ServiceProvider, Role::Mom));
        assert!(!may_message(Role::ServiceProvider, Role::Doctor));
        assert!(!may_message(Role::Mom, Role::Mom));
    }

    #[test]
    fn directory_tracks_presence_and_selection() {
        let mut dir = ConversationDirectory::new(UserId::from("w1"), Role::Midwife);
        dir.replace_counterparties(raw());
        assert!(dir.counterparty(&UserId::from("w1")).is_none());

        dir.learn(cp("m2", "Dilini", Role::Mom, ""));
        assert_eq!(dir.list(RoleFilter::Only(Role::Mom), "").len(), 2);

        dir.set_presence(UserId::from("d1"), PresenceStatus::Online);
        assert!(dir.is_online(&UserId::from("d1")));
        dir.set_presence(UserId::from("d1"), PresenceStatus::Away);
        assert!(!dir.is_online(&UserId::from("d1")));

        let key = ConversationKey::between(&UserId::from("w1"), &UserId::from("d1"));
        dir.set_active(key.clone());
        assert_eq!(dir.active(), Some(&key));
    }
}
