use std::collections::{BTreeMap, HashMap};

use huddle_proto::{UserId, UserProfile};

use crate::transport::MediaTrack;

/// A participant is normally keyed by user id. A track whose stream id has no
/// known owner yet is held under its stream id until the mapping arrives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParticipantKey {
    User(UserId),
    Stream(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Participant {
    pub profile: Option<UserProfile>,
    pub stream: Option<MediaTrack>,
    pub is_muted: bool,
    pub is_speaking: bool,
}

/// Merged per-user view: profile, audio stream, mute and speaking state.
#[derive(Debug, Clone, Default)]
pub struct ParticipantView {
    entries: BTreeMap<ParticipantKey, Participant>,
}

impl ParticipantView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let mut view = Self::new();
        for profile in profiles {
            view.upsert_profile(profile);
        }
        view
    }

    pub fn upsert_profile(&mut self, profile: UserProfile) {
        let key = ParticipantKey::User(profile.id.clone());
        self.entries.entry(key).or_default().profile = Some(profile);
    }

    /// Ensures an entry exists for a user whose profile may be unknown.
    pub fn ensure_user(&mut self, user_id: &str) {
        self.entries
            .entry(ParticipantKey::User(user_id.to_string()))
            .or_default();
    }

    pub fn attach_stream(&mut self, user_id: &str, track: MediaTrack) {
        self.entries
            .entry(ParticipantKey::User(user_id.to_string()))
            .or_default()
            .stream = Some(track);
    }

    pub fn detach_stream(&mut self, user_id: &str) {
        if let Some(entry) = self.user_mut(user_id) {
            entry.stream = None;
        }
    }

    /// Holds a track whose owner is not known yet.
    pub fn attach_placeholder(&mut self, track: MediaTrack) {
        let key = ParticipantKey::Stream(track.stream_id().to_string());
        self.entries.entry(key).or_default().stream = Some(track);
    }

    /// Folds a stream-keyed placeholder into its owner's entry. Returns true
    /// if a placeholder was merged.
    pub fn reconcile(&mut self, stream_id: &str, user_id: &str) -> bool {
        let Some(placeholder) = self
            .entries
            .remove(&ParticipantKey::Stream(stream_id.to_string()))
        else {
            return false;
        };
        let entry = self
            .entries
            .entry(ParticipantKey::User(user_id.to_string()))
            .or_default();
        if placeholder.stream.is_some() {
            entry.stream = placeholder.stream;
        }
        entry.is_muted |= placeholder.is_muted;
        entry.is_speaking |= placeholder.is_speaking;
        true
    }

    /// Only existing entries are updated; status messages never create users.
    pub fn set_muted(&mut self, user_id: &str, muted: bool) -> bool {
        match self.user_mut(user_id) {
            Some(entry) => {
                entry.is_muted = muted;
                true
            }
            None => false,
        }
    }

    /// Returns true if the stored value changed.
    pub fn set_speaking(&mut self, user_id: &str, speaking: bool) -> bool {
        match self.user_mut(user_id) {
            Some(entry) if entry.is_speaking != speaking => {
                entry.is_speaking = speaking;
                true
            }
            _ => false,
        }
    }

    pub fn remove_user(&mut self, user_id: &str) -> Option<Participant> {
        self.entries
            .remove(&ParticipantKey::User(user_id.to_string()))
    }

    /// Drops every stream and placeholder, keeping profiles and status.
    pub fn clear_streams(&mut self) {
        self.entries
            .retain(|key, _| matches!(key, ParticipantKey::User(_)));
        for entry in self.entries.values_mut() {
            entry.stream = None;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.entries.get(&ParticipantKey::User(user_id.to_string()))
    }

    pub fn entry(&self, key: &ParticipantKey) -> Option<&Participant> {
        self.entries.get(key)
    }

    pub fn placeholder(&self, stream_id: &str) -> Option<&Participant> {
        self.entries
            .get(&ParticipantKey::Stream(stream_id.to_string()))
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.entries
            .keys()
            .filter_map(|key| match key {
                ParticipantKey::User(id) => Some(id.clone()),
                ParticipantKey::Stream(_) => None,
            })
            .collect()
    }

    pub fn muted_users(&self) -> Vec<UserId> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| match key {
                ParticipantKey::User(id) if entry.is_muted => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantKey, &Participant)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn user_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.entries
            .get_mut(&ParticipantKey::User(user_id.to_string()))
    }
}

/// Transport stream id to user id. Entries are added or overwritten, never
/// removed, so a late track can still be attributed after a topology change.
#[derive(Debug, Clone, Default)]
pub struct StreamIdentityMap {
    owners: HashMap<String, UserId>,
}

impl StreamIdentityMap {
    pub fn insert(&mut self, stream_id: impl Into<String>, user_id: impl Into<UserId>) {
        self.owners.insert(stream_id.into(), user_id.into());
    }

    pub fn resolve(&self, stream_id: &str) -> Option<&UserId> {
        self.owners.get(stream_id)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
