//! Version-aware storage of every section seen in a session.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use crate::psi::section::Section;

/// Superseded versions remembered per slot; one full cycle of the 5-bit version field.
const RETIRED_HISTORY: usize = 32;

/// A table id as carried on one PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableIdentity {
    pub pid: u16,
    pub table_id: u8,
}

impl TableIdentity {
    pub fn of(section: &Section) -> Self {
        Self {
            pid: section.pid,
            table_id: section.table_id,
        }
    }
}

/// What [`VersionedTableStore::update`] did with a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First time this section (or this content, for short-form tables) was seen.
    New,
    /// Exact repeat; only occurrence count and last-seen packet changed.
    Repeated,
    /// A new version replaced the stored section.
    VersionChanged { previous: u8 },
    /// Same version as stored, different bytes. Bookkeeping updated, content kept.
    ContentConflict,
    /// A version this slot already replaced came back; ignored.
    Stale,
}

impl UpdateOutcome {
    /// True when the section should be reported as newly available.
    pub fn is_new(&self) -> bool {
        matches!(self, UpdateOutcome::New | UpdateOutcome::VersionChanged { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Retired {
    section_number: u8,
    version: u8,
    digest: u32,
}

/// Sections of one (table, instance key), indexed by section_number.
///
/// Invariant: `sections.len()` is at least one more than the highest
/// section_number or last_section_number ever stored here. The vector only
/// grows; a later section announcing a larger last_section_number than the
/// first one extends it.
#[derive(Debug, Default)]
pub struct TableSlot {
    sections: Vec<Option<Section>>,
    retired: VecDeque<Retired>,
}

impl TableSlot {
    fn with_len(len: usize) -> Self {
        Self {
            sections: vec![None; len],
            retired: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn get(&self, section_number: u8) -> Option<&Section> {
        self.sections.get(section_number as usize)?.as_ref()
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().flatten()
    }

    /// Every announced section present.
    pub fn is_complete(&self) -> bool {
        self.sections.iter().all(Option::is_some)
    }

    fn retire(&mut self, section: &Section) {
        if let Some(version) = section.version() {
            if self.retired.len() == RETIRED_HISTORY {
                self.retired.pop_front();
            }
            self.retired.push_back(Retired {
                section_number: section.section_number(),
                version,
                digest: section.digest(),
            });
        }
    }

    fn was_retired(&self, section: &Section) -> bool {
        let Some(version) = section.version() else { return false };
        let probe = Retired {
            section_number: section.section_number(),
            version,
            digest: section.digest(),
        };
        self.retired.contains(&probe)
    }
}

/// Diagnostic counters kept by the store.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub sections_stored: u64,
    pub version_changes: u64,
    /// Slots that had to grow after creation (non-conformant last_section_number)
    pub slot_growths: u64,
    /// Same version re-sent with different bytes
    pub content_conflicts: u64,
    pub stale_versions: u64,
}

/// Per-table summary for reports.
#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub pid: u16,
    pub table_id: u8,
    pub instance_key: Option<u64>,
    pub version: Option<u8>,
    pub sections: usize,
    pub expected_sections: usize,
    pub occurrences: u64,
}

/// All tables of a session.
///
/// Long-form tables live in [`TableSlot`]s keyed by (table, instance key).
/// Short-form tables have no version or numbering and are kept as a set of
/// distinct contents.
#[derive(Debug, Default)]
pub struct VersionedTableStore {
    long_tables: BTreeMap<TableIdentity, BTreeMap<u64, TableSlot>>,
    short_tables: BTreeMap<TableIdentity, Vec<Section>>,
    pub stats: StoreStats,
}

impl VersionedTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, section: Section) -> UpdateOutcome {
        if section.syntax_extended() {
            self.update_long(section)
        } else {
            self.update_short(section)
        }
    }

    fn update_short(&mut self, section: Section) -> UpdateOutcome {
        let set = self.short_tables.entry(TableIdentity::of(&section)).or_default();
        if let Some(stored) = set.iter_mut().find(|s| s.same_content(&section)) {
            stored.occurrences += 1;
            stored.last_packet = section.last_packet;
            return UpdateOutcome::Repeated;
        }
        set.push(section);
        self.stats.sections_stored += 1;
        UpdateOutcome::New
    }

    fn update_long(&mut self, section: Section) -> UpdateOutcome {
        let identity = TableIdentity::of(&section);
        let number = section.section_number() as usize;
        let needed = number.max(section.last_section_number() as usize) + 1;

        let slots = self.long_tables.entry(identity).or_default();
        let slot = slots
            .entry(section.instance_key)
            .or_insert_with(|| TableSlot::with_len(needed));
        if slot.sections.len() < needed {
            tracing::warn!(
                pid = identity.pid,
                table_id = identity.table_id,
                key = section.instance_key,
                from = slot.sections.len(),
                to = needed,
                "table slot grown by later section"
            );
            self.stats.slot_growths += 1;
            slot.sections.resize(needed, None);
        }

        let was_retired = slot.was_retired(&section);
        let entry = &mut slot.sections[number];
        let (outcome, retired) = match entry {
            None => {
                *entry = Some(section);
                (UpdateOutcome::New, None)
            }
            Some(stored) if stored.version() != section.version() => {
                if was_retired {
                    (UpdateOutcome::Stale, None)
                } else {
                    let previous = stored.version().unwrap_or_default();
                    let old = std::mem::replace(stored, section);
                    (UpdateOutcome::VersionChanged { previous }, Some(old))
                }
            }
            Some(stored) => {
                stored.occurrences += 1;
                stored.last_packet = section.last_packet;
                if stored.same_content(&section) {
                    (UpdateOutcome::Repeated, None)
                } else {
                    (UpdateOutcome::ContentConflict, None)
                }
            }
        };
        if let Some(old) = retired {
            slot.retire(&old);
        }

        match outcome {
            UpdateOutcome::New => self.stats.sections_stored += 1,
            UpdateOutcome::VersionChanged { previous } => {
                tracing::debug!(
                    pid = identity.pid,
                    table_id = identity.table_id,
                    section = number,
                    previous,
                    "table version changed"
                );
                self.stats.version_changes += 1;
            }
            UpdateOutcome::ContentConflict => self.stats.content_conflicts += 1,
            UpdateOutcome::Stale => self.stats.stale_versions += 1,
            UpdateOutcome::Repeated => {}
        }
        outcome
    }

    /// Look up one long-form section.
    pub fn get(&self, identity: TableIdentity, instance_key: u64, section_number: u8) -> Option<&Section> {
        self.long_tables
            .get(&identity)?
            .get(&instance_key)?
            .get(section_number)
    }

    pub fn slot(&self, identity: TableIdentity, instance_key: u64) -> Option<&TableSlot> {
        self.long_tables.get(&identity)?.get(&instance_key)
    }

    /// Instance keys present for a long-form table.
    pub fn instance_keys(&self, identity: TableIdentity) -> Vec<u64> {
        self.long_tables
            .get(&identity)
            .map(|slots| slots.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Distinct contents stored for a short-form table.
    pub fn short_sections(&self, identity: TableIdentity) -> &[Section] {
        self.short_tables.get(&identity).map_or(&[], Vec::as_slice)
    }

    pub fn summary(&self) -> Vec<TableSummary> {
        let mut out = Vec::new();
        for (identity, slots) in &self.long_tables {
            for (key, slot) in slots {
                out.push(TableSummary {
                    pid: identity.pid,
                    table_id: identity.table_id,
                    instance_key: Some(*key),
                    version: slot.sections().next().and_then(Section::version),
                    sections: slot.sections().count(),
                    expected_sections: slot.len(),
                    occurrences: slot.sections().map(|s| s.occurrences).sum(),
                });
            }
        }
        for (identity, set) in &self.short_tables {
            out.push(TableSummary {
                pid: identity.pid,
                table_id: identity.table_id,
                instance_key: None,
                version: None,
                sections: set.len(),
                expected_sections: set.len(),
                occurrences: set.iter().map(|s| s.occurrences).sum(),
            });
        }
        out
    }
}
