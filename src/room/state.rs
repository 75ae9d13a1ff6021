use serde::{Deserialize, Serialize};

use crate::signaling::ParticipantInfo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    #[default]
    Participant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub audio_muted: bool,
    pub is_screen_sharing: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
            audio_muted: false,
            is_screen_sharing: false,
        }
    }
}

impl From<ParticipantInfo> for Participant {
    fn from(info: ParticipantInfo) -> Self {
        Self {
            id: info.user_id,
            display_name: info.display_name,
            role: info.role,
            audio_muted: info.muted,
            is_screen_sharing: info.screen_sharing,
        }
    }
}

/// Remote participants in join order. The local user is not listed.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a participant. Returns `true` if it was new.
    pub fn upsert(&mut self, participant: Participant) -> bool {
        match self.get_mut(&participant.id) {
            Some(existing) => {
                *existing = participant;
                false
            }
            None => {
                self.participants.push(participant);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn set_muted(&mut self, id: &str, muted: bool) -> Option<&Participant> {
        let participant = self.get_mut(id)?;
        participant.audio_muted = muted;
        Some(participant)
    }

    pub fn set_screen_sharing(&mut self, id: &str, sharing: bool) -> Option<&Participant> {
        let participant = self.get_mut(id)?;
        participant.is_screen_sharing = sharing;
        Some(participant)
    }

    pub fn ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_join_order_and_updates_in_place() {
        let mut roster = Roster::new();
        assert!(roster.upsert(Participant::new("a", "Ann", Role::Host)));
        assert!(roster.upsert(Participant::new("b", "Bo", Role::Participant)));
        assert!(!roster.upsert(Participant::new("a", "Ann B.", Role::Host)));

        assert_eq!(roster.ids(), vec!["a", "b"]);
        assert_eq!(roster.get("a").unwrap().display_name, "Ann B.");

        roster.set_muted("b", true);
        assert!(roster.get("b").unwrap().audio_muted);
        assert!(roster.set_muted("zed", true).is_none());

        assert_eq!(roster.remove("a").unwrap().id, "a");
        assert_eq!(roster.len(), 1);
    }
}
