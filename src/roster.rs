//! Roster model
//!
//! Buddies, groups and buddy categories as fetched from the info API.
//! Lookups are linear; rosters are small.

use std::sync::Arc;

/// A buddy (or the local user)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buddy {
    /// Session-scoped id used by every API call
    pub uin: String,
    /// Permanent numeric account, filled by the account lookup
    pub account: Option<String>,
    pub nick: Option<String>,
    pub markname: Option<String>,
    /// Category index
    pub category: Option<String>,
    /// online / offline / busy / away ...
    pub status: Option<String>,
    pub client_type: Option<String>,
    pub face: Option<String>,
    pub gender: Option<String>,
    /// Personal signature
    pub personal: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub homepage: Option<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub city: Option<String>,
    pub avatar: Option<Arc<[u8]>>,
}

impl Buddy {
    pub fn new(uin: impl Into<String>) -> Self {
        Self {
            uin: uin.into(),
            ..Self::default()
        }
    }

    /// Markname if set, else nick, else the uin
    pub fn display_name(&self) -> &str {
        self.markname
            .as_deref()
            .filter(|m| !m.is_empty())
            .or(self.nick.as_deref())
            .unwrap_or(&self.uin)
    }

    pub fn is_online(&self) -> bool {
        matches!(self.status.as_deref(), Some(s) if s != "offline")
    }
}

/// A group chat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub gid: String,
    /// Code used for account lookups and group pictures
    pub code: String,
    pub name: Option<String>,
    pub markname: Option<String>,
    pub account: Option<String>,
    pub flag: Option<String>,
    pub memo: Option<String>,
    /// uin of the group owner
    pub owner: Option<String>,
    /// Members, filled by the group detail fetch
    pub members: Vec<Buddy>,
    pub avatar: Option<Arc<[u8]>>,
}

impl Group {
    pub fn new(gid: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.markname
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.gid)
    }

    /// Member by uin, inserted if missing
    pub fn member_entry(&mut self, uin: &str) -> &mut Buddy {
        match self.members.iter().position(|m| m.uin == uin) {
            Some(pos) => &mut self.members[pos],
            None => {
                self.members.push(Buddy::new(uin));
                let last = self.members.len() - 1;
                &mut self.members[last]
            }
        }
    }
}

/// Buddy category (friend list folder)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub index: i64,
    pub sort: i64,
    pub name: String,
    pub count: usize,
}

/// Everything known about the account's contacts
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub myself: Buddy,
    pub buddies: Vec<Buddy>,
    pub groups: Vec<Group>,
    pub categories: Vec<Category>,
}

impl Roster {
    pub fn new(my_uin: impl Into<String>) -> Self {
        Self {
            myself: Buddy::new(my_uin),
            ..Self::default()
        }
    }

    pub fn find_buddy(&self, uin: &str) -> Option<&Buddy> {
        self.buddies.iter().find(|b| b.uin == uin)
    }

    pub fn find_buddy_mut(&mut self, uin: &str) -> Option<&mut Buddy> {
        self.buddies.iter_mut().find(|b| b.uin == uin)
    }

    /// Buddy by uin, or the local user when the uin is ours
    pub fn buddy_or_myself_mut(&mut self, uin: &str) -> Option<&mut Buddy> {
        if self.myself.uin == uin {
            return Some(&mut self.myself);
        }
        self.find_buddy_mut(uin)
    }

    pub fn find_group_by_code(&self, code: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.code == code)
    }

    pub fn find_group_by_code_mut(&mut self, code: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.code == code)
    }

    pub fn find_group_by_gid_mut(&mut self, gid: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.gid == gid)
    }

    /// Buddy by uin, inserted if missing
    pub fn buddy_entry(&mut self, uin: &str) -> &mut Buddy {
        match self.buddies.iter().position(|b| b.uin == uin) {
            Some(pos) => &mut self.buddies[pos],
            None => {
                self.buddies.push(Buddy::new(uin));
                let last = self.buddies.len() - 1;
                &mut self.buddies[last]
            }
        }
    }

    /// Group by gid, inserted if missing
    pub fn group_entry(&mut self, gid: &str) -> &mut Group {
        match self.groups.iter().position(|g| g.gid == gid) {
            Some(pos) => &mut self.groups[pos],
            None => {
                self.groups.push(Group::new(gid, ""));
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        }
    }

    /// Insert or replace a buddy keyed by uin
    pub fn upsert_buddy(&mut self, buddy: Buddy) {
        match self.find_buddy_mut(&buddy.uin) {
            Some(existing) => *existing = buddy,
            None => self.buddies.push(buddy),
        }
    }

    /// Remove a buddy. Returns the removed entry.
    pub fn remove_buddy(&mut self, uin: &str) -> Option<Buddy> {
        let pos = self.buddies.iter().position(|b| b.uin == uin)?;
        Some(self.buddies.remove(pos))
    }

    pub fn upsert_group(&mut self, group: Group) {
        match self.groups.iter_mut().find(|g| g.gid == group.gid) {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
    }

    /// Replace categories; the default "My Friends" folder is always index 0
    pub fn set_categories(&mut self, mut categories: Vec<Category>) {
        if !categories.iter().any(|c| c.index == 0) {
            categories.insert(
                0,
                Category {
                    index: 0,
                    sort: 0,
                    name: "My Friends".to_string(),
                    count: 0,
                },
            );
        }
        self.categories = categories;
    }

    /// Recount buddies per category
    pub fn recount_categories(&mut self) {
        for category in &mut self.categories {
            let index = category.index.to_string();
            category.count = self
                .buddies
                .iter()
                .filter(|b| b.category.as_deref() == Some(index.as_str()))
                .count();
        }
    }

    /// Update presence of a buddy; returns false for unknown uins
    pub fn set_status(&mut self, uin: &str, status: &str, client_type: Option<&str>) -> bool {
        let Some(buddy) = self.find_buddy_mut(uin) else {
            return false;
        };
        buddy.status = Some(status.to_string());
        if let Some(ct) = client_type {
            buddy.client_type = Some(ct.to_string());
        }
        true
    }
}
