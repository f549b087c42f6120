//! Decrypted vault data model.
//!
//! `VaultData` is treated as an immutable snapshot. Every mutator borrows
//! the current snapshot and returns a new one, leaving the input
//! untouched, so the session can roll back by simply re-publishing the
//! previous value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use passvault_common::{Error, Result};

/// A stored credential.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub otp_secret: Option<String>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Entry {
    /// Create an entry with only an id and title set.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            username: None,
            password: None,
            url: None,
            notes: None,
            otp_secret: None,
            folder_id: None,
            favorite: false,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }
}

// Secret fields stay out of Debug output.
impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("folder_id", &self.folder_id)
            .field("favorite", &self.favorite)
            .field("created_at", &self.created_at)
            .field("modified_at", &self.modified_at)
            .finish_non_exhaustive()
    }
}

/// A folder grouping entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
            color: None,
            created_at: Utc::now(),
        }
    }
}

/// A label attached to entries through `EntryTagLink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: None,
            created_at: Utc::now(),
        }
    }
}

/// Password generation mode of a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetMode {
    Syllables,
    Passphrase,
    Leet,
}

/// Saved password generator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub mode: PresetMode,
    pub length: u32,
    #[serde(default)]
    pub include_digits: bool,
    #[serde(default)]
    pub include_symbols: bool,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Preset {
    pub fn new(id: impl Into<String>, name: impl Into<String>, mode: PresetMode, length: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mode,
            length,
            include_digits: true,
            include_symbols: true,
            is_default: false,
            created_at: Utc::now(),
        }
    }
}

/// Many-to-many link between an entry and a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryTagLink {
    pub entry_id: String,
    pub tag_id: String,
}

impl EntryTagLink {
    pub fn new(entry_id: impl Into<String>, tag_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            tag_id: tag_id.into(),
        }
    }
}

/// The decrypted vault payload.
///
/// # Invariants
/// - Ids are unique within each collection
/// - `Entry::folder_id`, when set, names an existing folder
/// - Every `EntryTagLink` names an existing entry and tag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultData {
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub entry_tags: Vec<EntryTagLink>,
}

trait Identified {
    fn id(&self) -> &str;
}

impl Identified for Entry {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for Folder {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for Tag {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Identified for Preset {
    fn id(&self) -> &str {
        &self.id
    }
}

fn contains<T: Identified>(items: &[T], id: &str) -> bool {
    items.iter().any(|item| item.id() == id)
}

fn insert_unique<T: Identified>(
    items: &mut Vec<T>,
    item: T,
    already_exists: fn(String) -> Error,
) -> Result<()> {
    if item.id().is_empty() {
        return Err(Error::InvalidInput("Id cannot be empty".to_string()));
    }
    if contains(items, item.id()) {
        return Err(already_exists(item.id().to_string()));
    }
    items.push(item);
    Ok(())
}

fn replace_existing<T: Identified>(
    items: &mut [T],
    item: T,
    not_found: fn(String) -> Error,
) -> Result<()> {
    let slot = items
        .iter_mut()
        .find(|existing| existing.id() == item.id())
        .ok_or_else(|| not_found(item.id().to_string()))?;
    *slot = item;
    Ok(())
}

fn remove_existing<T: Identified>(
    items: &mut Vec<T>,
    id: &str,
    not_found: fn(String) -> Error,
) -> Result<()> {
    let index = items
        .iter()
        .position(|existing| existing.id() == id)
        .ok_or_else(|| not_found(id.to_string()))?;
    items.remove(index);
    Ok(())
}

fn ensure_unique_ids<T: Identified>(items: &[T], kind: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item.id()) {
            return Err(Error::InvalidFileFormat(format!(
                "Duplicate {} id in vault payload",
                kind
            )));
        }
    }
    Ok(())
}

impl VaultData {
    /// An empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the referential invariants.
    ///
    /// # Errors
    /// - `InvalidFileFormat` describing the first violation found
    pub fn validate(&self) -> Result<()> {
        ensure_unique_ids(&self.entries, "entry")?;
        ensure_unique_ids(&self.folders, "folder")?;
        ensure_unique_ids(&self.tags, "tag")?;
        ensure_unique_ids(&self.presets, "preset")?;

        for entry in &self.entries {
            if let Some(folder_id) = &entry.folder_id {
                if !contains(&self.folders, folder_id) {
                    return Err(Error::InvalidFileFormat(
                        "Entry references a missing folder".to_string(),
                    ));
                }
            }
        }

        for link in &self.entry_tags {
            if !contains(&self.entries, &link.entry_id) || !contains(&self.tags, &link.tag_id) {
                return Err(Error::InvalidFileFormat(
                    "Tag link references a missing entry or tag".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    pub fn tag(&self, id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == id)
    }

    pub fn preset(&self, id: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }

    /// Entries whose folder is `folder_id`.
    pub fn entries_in_folder(&self, folder_id: &str) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.folder_id.as_deref() == Some(folder_id))
            .cloned()
            .collect()
    }

    /// Tags linked to `entry_id`, in tag order.
    pub fn tags_for_entry(&self, entry_id: &str) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|tag| {
                self.entry_tags
                    .iter()
                    .any(|l| l.entry_id == entry_id && l.tag_id == tag.id)
            })
            .cloned()
            .collect()
    }

    fn check_folder_ref(&self, entry: &Entry) -> Result<()> {
        match &entry.folder_id {
            Some(folder_id) if !contains(&self.folders, folder_id) => {
                Err(Error::FolderNotFound(folder_id.clone()))
            }
            _ => Ok(()),
        }
    }

    pub fn with_entry_added(&self, entry: Entry) -> Result<Self> {
        self.check_folder_ref(&entry)?;
        let mut next = self.clone();
        insert_unique(&mut next.entries, entry, Error::EntryAlreadyExists)?;
        Ok(next)
    }

    /// Replace an entry.
    ///
    /// `created_at` is preserved. `modified_at` is bumped only when some
    /// other field actually changed, so an identical update is a no-op.
    pub fn with_entry_updated(&self, mut entry: Entry) -> Result<Self> {
        let existing = self
            .entry(&entry.id)
            .ok_or_else(|| Error::EntryNotFound(entry.id.clone()))?;
        self.check_folder_ref(&entry)?;

        entry.created_at = existing.created_at;
        entry.modified_at = existing.modified_at;
        if &entry == existing {
            return Ok(self.clone());
        }
        entry.modified_at = Utc::now();

        let mut next = self.clone();
        replace_existing(&mut next.entries, entry, Error::EntryNotFound)?;
        Ok(next)
    }

    /// Remove an entry and its tag links.
    pub fn with_entry_deleted(&self, id: &str) -> Result<Self> {
        let mut next = self.clone();
        remove_existing(&mut next.entries, id, Error::EntryNotFound)?;
        next.entry_tags.retain(|l| l.entry_id != id);
        Ok(next)
    }

    pub fn with_folder_added(&self, folder: Folder) -> Result<Self> {
        let mut next = self.clone();
        insert_unique(&mut next.folders, folder, Error::FolderAlreadyExists)?;
        Ok(next)
    }

    /// Replace a folder, keeping its `created_at`.
    pub fn with_folder_updated(&self, mut folder: Folder) -> Result<Self> {
        let existing = self
            .folder(&folder.id)
            .ok_or_else(|| Error::FolderNotFound(folder.id.clone()))?;
        folder.created_at = existing.created_at;

        let mut next = self.clone();
        replace_existing(&mut next.folders, folder, Error::FolderNotFound)?;
        Ok(next)
    }

    /// Remove a folder. Entries in it are kept with their folder cleared.
    pub fn with_folder_deleted(&self, id: &str) -> Result<Self> {
        let mut next = self.clone();
        remove_existing(&mut next.folders, id, Error::FolderNotFound)?;
        for entry in next.entries.iter_mut() {
            if entry.folder_id.as_deref() == Some(id) {
                entry.folder_id = None;
            }
        }
        Ok(next)
    }

    pub fn with_tag_added(&self, tag: Tag) -> Result<Self> {
        let mut next = self.clone();
        insert_unique(&mut next.tags, tag, Error::TagAlreadyExists)?;
        Ok(next)
    }

    pub fn with_tag_updated(&self, mut tag: Tag) -> Result<Self> {
        let existing = self
            .tag(&tag.id)
            .ok_or_else(|| Error::TagNotFound(tag.id.clone()))?;
        tag.created_at = existing.created_at;

        let mut next = self.clone();
        replace_existing(&mut next.tags, tag, Error::TagNotFound)?;
        Ok(next)
    }

    /// Remove a tag and every link to it. Entries are kept.
    pub fn with_tag_deleted(&self, id: &str) -> Result<Self> {
        let mut next = self.clone();
        remove_existing(&mut next.tags, id, Error::TagNotFound)?;
        next.entry_tags.retain(|l| l.tag_id != id);
        Ok(next)
    }

    /// Link a tag to an entry. Linking twice is a no-op.
    pub fn with_tag_linked(&self, entry_id: &str, tag_id: &str) -> Result<Self> {
        if self.entry(entry_id).is_none() {
            return Err(Error::EntryNotFound(entry_id.to_string()));
        }
        if self.tag(tag_id).is_none() {
            return Err(Error::TagNotFound(tag_id.to_string()));
        }

        let link = EntryTagLink::new(entry_id, tag_id);
        let mut next = self.clone();
        if !next.entry_tags.contains(&link) {
            next.entry_tags.push(link);
        }
        Ok(next)
    }

    /// Unlink a tag from an entry. Removing an absent link is a no-op.
    pub fn with_tag_unlinked(&self, entry_id: &str, tag_id: &str) -> Result<Self> {
        if self.entry(entry_id).is_none() {
            return Err(Error::EntryNotFound(entry_id.to_string()));
        }
        if self.tag(tag_id).is_none() {
            return Err(Error::TagNotFound(tag_id.to_string()));
        }

        let mut next = self.clone();
        next.entry_tags
            .retain(|l| !(l.entry_id == entry_id && l.tag_id == tag_id));
        Ok(next)
    }

    pub fn with_preset_added(&self, preset: Preset) -> Result<Self> {
        let mut next = self.clone();
        insert_unique(&mut next.presets, preset, Error::PresetAlreadyExists)?;
        Ok(next)
    }

    pub fn with_preset_updated(&self, mut preset: Preset) -> Result<Self> {
        let existing = self
            .preset(&preset.id)
            .ok_or_else(|| Error::PresetNotFound(preset.id.clone()))?;
        preset.created_at = existing.created_at;

        let mut next = self.clone();
        replace_existing(&mut next.presets, preset, Error::PresetNotFound)?;
        Ok(next)
    }

    pub fn with_preset_deleted(&self, id: &str) -> Result<Self> {
        let mut next = self.clone();
        remove_existing(&mut next.presets, id, Error::PresetNotFound)?;
        Ok(next)
    }
}
