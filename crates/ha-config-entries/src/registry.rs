//! Indexed container of config entries
//!
//! Entries are kept in insertion order with two secondary indexes: domain to
//! entry ids, and (domain, unique_id) to entry id. Every mutation keeps the
//! indexes in step with the primary map.

use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::error;

use crate::entry::ConfigEntry;

#[derive(Debug, Default)]
pub struct ConfigEntryItems {
    entries: IndexMap<String, ConfigEntry>,
    domain_index: HashMap<String, Vec<String>>,
    unique_id_index: HashMap<String, HashMap<String, String>>,
}

impl ConfigEntryItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry with the same id
    pub fn insert(&mut self, entry: ConfigEntry) {
        if self.entries.contains_key(&entry.entry_id) {
            error!(
                entry_id = %entry.entry_id,
                domain = %entry.domain,
                "An entry with this id already exists, replacing it"
            );
            self.unindex(&entry.entry_id);
        }
        let entry_id = entry.entry_id.clone();
        self.entries.insert(entry_id.clone(), entry);
        self.index(&entry_id);
    }

    pub fn remove(&mut self, entry_id: &str) -> Option<ConfigEntry> {
        self.unindex(entry_id);
        self.entries.shift_remove(entry_id)
    }

    /// Change an entry's unique id, moving its index slot
    pub fn update_unique_id(&mut self, entry_id: &str, unique_id: Option<String>) -> bool {
        if !self.entries.contains_key(entry_id) {
            return false;
        }
        self.unindex(entry_id);
        let Some(entry) = self.entries.get_mut(entry_id) else {
            return false;
        };
        entry.unique_id = unique_id;
        self.index(entry_id);
        true
    }

    pub fn get(&self, entry_id: &str) -> Option<&ConfigEntry> {
        self.entries.get(entry_id)
    }

    /// Mutable access for fields no index depends on
    pub(crate) fn get_mut(&mut self, entry_id: &str) -> Option<&mut ConfigEntry> {
        self.entries.get_mut(entry_id)
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.entries.contains_key(entry_id)
    }

    pub fn entries_for_domain(&self, domain: &str) -> Vec<&ConfigEntry> {
        self.domain_index
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.entries.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn entry_for_domain_unique_id(&self, domain: &str, unique_id: &str) -> Option<&ConfigEntry> {
        let entry_id = self.unique_id_index.get(domain)?.get(unique_id)?;
        self.entries.get(entry_id)
    }

    pub fn values(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.entries.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index an entry already in the primary map. Its slot in the domain
    /// list follows its position in the primary map.
    fn index(&mut self, entry_id: &str) {
        let Some((position, _, entry)) = self.entries.get_full(entry_id) else {
            return;
        };
        let domain = entry.domain.clone();
        let unique_id = entry.unique_id.clone();

        let entries = &self.entries;
        let ids = self.domain_index.entry(domain.clone()).or_default();
        let at = ids
            .iter()
            .position(|id| entries.get_index_of(id).is_some_and(|index| index > position))
            .unwrap_or(ids.len());
        ids.insert(at, entry_id.to_string());

        if let Some(unique_id) = unique_id {
            self.unique_id_index
                .entry(domain)
                .or_default()
                .insert(unique_id, entry_id.to_string());
        }
    }

    fn unindex(&mut self, entry_id: &str) {
        let Some(entry) = self.entries.get(entry_id) else {
            return;
        };
        let domain = entry.domain.clone();
        let unique_id = entry.unique_id.clone();

        if let Some(ids) = self.domain_index.get_mut(&domain) {
            ids.retain(|id| id != entry_id);
            if ids.is_empty() {
                self.domain_index.remove(&domain);
            }
        }

        if let Some(unique_id) = unique_id {
            // Hand the slot to the newest remaining entry with the same unique id
            let successor = self.domain_index.get(&domain).and_then(|ids| {
                ids.iter()
                    .rev()
                    .find(|id| {
                        id.as_str() != entry_id
                            && self
                                .entries
                                .get(id.as_str())
                                .and_then(|other| other.unique_id.as_deref())
                                == Some(unique_id.as_str())
                    })
                    .cloned()
            });
            if let Some(by_unique_id) = self.unique_id_index.get_mut(&domain) {
                // Another entry may have claimed the slot since
                if by_unique_id.get(&unique_id).is_some_and(|id| id == entry_id) {
                    match successor {
                        Some(successor) => {
                            by_unique_id.insert(unique_id, successor);
                        }
                        None => {
                            by_unique_id.remove(&unique_id);
                        }
                    }
                }
                if by_unique_id.is_empty() {
                    self.unique_id_index.remove(&domain);
                }
            }
        }
    }
}
