use super::{CodeOverride, EditNote, OverrideKey, OverrideRequest};
use crate::constants::MIN_NOTE_LENGTH;
use crate::error::{CoreError, CoreResult};
use crate::format::OutputFormat;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use ums_types::{NonEmptyText, TextError};
use uuid::Uuid;

/// In-memory store of code overrides.
///
/// The store is shared through an `Arc` and passed explicitly to whoever needs it. Records are
/// immutable once published: a save builds a new `Arc<CodeOverride>` and swaps it in under the
/// write lock, so readers never see a half-updated record. The store does no I/O;
/// [`OverrideStore::snapshot`] and [`OverrideStore::from_records`] let callers persist it.
#[derive(Debug, Default)]
pub struct OverrideStore {
    records: RwLock<HashMap<OverrideKey, Arc<CodeOverride>>>,
    sequence: AtomicU64,
}

impl OverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from previously snapshotted records.
    pub fn from_records(records: impl IntoIterator<Item = CodeOverride>) -> Self {
        let mut map = HashMap::new();
        let mut next_sequence = 0;
        for record in records {
            if let Some(max) = record.notes.iter().map(|n| n.sequence).max() {
                next_sequence = next_sequence.max(max + 1);
            }
            map.insert(record.key(), Arc::new(record));
        }
        Self {
            records: RwLock::new(map),
            sequence: AtomicU64::new(next_sequence),
        }
    }

    /// Saves manual code for a component and locks it.
    ///
    /// The first save captures `original_code`; later saves keep it. Every save appends one
    /// edit note.
    ///
    /// # Arguments
    ///
    /// * `request` - Compound key, replacement code, note and optional change type.
    ///
    /// # Returns
    ///
    /// The record as stored after this save.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the measure id, component id or code is blank or an
    /// id has leading or trailing whitespace, and `CoreError::NoteTooShort` if the trimmed note
    /// has fewer than 10 characters. Nothing is written in either case.
    pub fn save(&self, request: OverrideRequest) -> CoreResult<Arc<CodeOverride>> {
        let measure_id = NonEmptyText::new(&request.measure_id)
            .map_err(|_| CoreError::InvalidInput("measure id is required".into()))?;
        let component_id = NonEmptyText::new(&request.component_id)
            .map_err(|_| CoreError::InvalidInput("component id is required".into()))?;
        for (field, id) in [
            ("measure id", &request.measure_id),
            ("component id", &request.component_id),
        ] {
            if id.trim() != id.as_str() {
                return Err(CoreError::InvalidInput(format!(
                    "{field} {id:?} has surrounding whitespace"
                )));
            }
        }
        if request.code.trim().is_empty() {
            return Err(CoreError::InvalidInput("override code is required".into()));
        }
        let text = NonEmptyText::with_min_chars(&request.note, MIN_NOTE_LENGTH).map_err(
            |error| match error {
                TextError::Empty => CoreError::NoteTooShort {
                    min: MIN_NOTE_LENGTH,
                    actual: 0,
                },
                TextError::TooShort { min, actual } => CoreError::NoteTooShort { min, actual },
            },
        )?;

        let key = OverrideKey::new(measure_id.as_str(), component_id.as_str(), request.format);
        let now = Utc::now();
        let note = EditNote {
            id: Uuid::new_v4(),
            format: request.format,
            text,
            change_type: request.change_type,
            created_at: now,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let (original_code, mut notes) = match records.get(&key) {
            Some(existing) => (
                existing.original_code.clone().or(request.original_code),
                existing.notes.clone(),
            ),
            None => (request.original_code, Vec::new()),
        };
        notes.push(note);
        let record = Arc::new(CodeOverride {
            measure_id: key.measure_id.clone(),
            component_id: key.component_id.clone(),
            format: key.format,
            code: request.code,
            locked: true,
            original_code,
            notes,
            updated_at: now,
        });
        records.insert(key, Arc::clone(&record));
        drop(records);

        tracing::info!(
            measure_id = %record.measure_id,
            component_id = %record.component_id,
            format = %record.format,
            notes = record.notes.len(),
            "override saved"
        );
        Ok(record)
    }

    /// Unlocks an override so regeneration stops applying it. Notes are kept.
    ///
    /// # Returns
    ///
    /// `true` if a record existed for the key. Reverting an absent or already unlocked record
    /// changes nothing.
    pub fn revert(&self, measure_id: &str, component_id: &str, format: OutputFormat) -> bool {
        let key = OverrideKey::new(measure_id, component_id, format);
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = records.get(&key) else {
            return false;
        };
        if existing.locked {
            let mut unlocked = CodeOverride::clone(existing);
            unlocked.locked = false;
            unlocked.updated_at = Utc::now();
            records.insert(key, Arc::new(unlocked));
            tracing::info!(measure_id, component_id, %format, "override reverted");
        }
        true
    }

    pub fn get(
        &self,
        measure_id: &str,
        component_id: &str,
        format: OutputFormat,
    ) -> Option<Arc<CodeOverride>> {
        let key = OverrideKey::new(measure_id, component_id, format);
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Locked overrides of one measure, optionally restricted to one format, ordered by
    /// component id then format.
    pub fn overrides_for_measure(
        &self,
        measure_id: &str,
        format: Option<OutputFormat>,
    ) -> Vec<Arc<CodeOverride>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Arc<CodeOverride>> = records
            .values()
            .filter(|r| r.locked && r.measure_id == measure_id)
            .filter(|r| format.map_or(true, |f| r.format == f))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key().cmp(&b.key()));
        found
    }

    /// Every note on a component across formats, newest first.
    pub fn all_notes(&self, measure_id: &str, component_id: &str) -> Vec<EditNote> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut notes: Vec<EditNote> = records
            .values()
            .filter(|r| r.measure_id == measure_id && r.component_id == component_id)
            .flat_map(|r| r.notes.iter().cloned())
            .collect();
        notes.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        notes
    }

    /// Copies every record, locked or not, ordered by key.
    pub fn snapshot(&self) -> Vec<CodeOverride> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<CodeOverride> = records.values().map(|r| CodeOverride::clone(r)).collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::ChangeType;

    fn request(component: &str, format: OutputFormat, code: &str, note: &str) -> OverrideRequest {
        OverrideRequest {
            measure_id: "CMS130".into(),
            component_id: component.into(),
            format,
            code: code.into(),
            note: note.into(),
            change_type: None,
            original_code: Some("generated".into()),
        }
    }

    #[test]
    fn test_save_locks_and_records_note() {
        let store = OverrideStore::new();
        let saved = store
            .save(OverrideRequest {
                change_type: Some(ChangeType::LogicFix),
                ..request("num", OutputFormat::Cql, "define \"Numerator\":\n  true", "Simplified numerator")
            })
            .unwrap();
        assert!(saved.locked);
        assert_eq!(saved.original_code.as_deref(), Some("generated"));
        assert_eq!(saved.notes.len(), 1);
        assert_eq!(saved.notes[0].text.as_str(), "Simplified numerator");
        assert_eq!(saved.notes[0].change_type, Some(ChangeType::LogicFix));
    }

    #[test]
    fn test_short_note_is_rejected_without_writing() {
        let store = OverrideStore::new();
        let err = store
            .save(request("num", OutputFormat::Cql, "x", "  too short  "))
            .unwrap_err();
        assert!(matches!(err, CoreError::NoteTooShort { min: 10, actual: 9 }));
        assert!(store.get("CMS130", "num", OutputFormat::Cql).is_none());

        let err = store.save(request(" ", OutputFormat::Cql, "x", "long enough note")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        let err = store.save(request("num", OutputFormat::Cql, "  ", "long enough note")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_padded_ids_are_rejected_and_never_alias() {
        let store = OverrideStore::new();
        store.save(request("num", OutputFormat::Sql, "v1", "first version here")).unwrap();

        let err = store
            .save(OverrideRequest {
                measure_id: "CMS130 ".into(),
                ..request("num", OutputFormat::Sql, "v2", "padded measure id")
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        let err = store
            .save(request(" num", OutputFormat::Sql, "v2", "padded component id"))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));

        assert_eq!(store.get("CMS130", "num", OutputFormat::Sql).unwrap().code, "v1");
        assert!(store.get("CMS130 ", "num", OutputFormat::Sql).is_none());
        assert!(store.overrides_for_measure("CMS130 ", None).is_empty());
        assert!(!store.revert("CMS130 ", "num", OutputFormat::Sql));
    }

    #[test]
    fn test_second_save_keeps_original_and_appends_note() {
        let store = OverrideStore::new();
        store.save(request("num", OutputFormat::Sql, "v1", "first version here")).unwrap();
        let second = store
            .save(OverrideRequest {
                original_code: Some("other".into()),
                ..request("num", OutputFormat::Sql, "v2", "second version here")
            })
            .unwrap();
        assert_eq!(second.code, "v2");
        assert_eq!(second.original_code.as_deref(), Some("generated"));
        assert_eq!(second.notes.len(), 2);
    }

    #[test]
    fn test_revert_unlocks_and_keeps_history() {
        let store = OverrideStore::new();
        store.save(request("num", OutputFormat::Cql, "v1", "first version here")).unwrap();
        assert!(store.revert("CMS130", "num", OutputFormat::Cql));
        assert!(store.overrides_for_measure("CMS130", None).is_empty());
        let record = store.get("CMS130", "num", OutputFormat::Cql).unwrap();
        assert!(!record.locked);
        assert_eq!(record.notes.len(), 1);

        assert!(store.revert("CMS130", "num", OutputFormat::Cql));
        assert!(!store.revert("CMS130", "missing", OutputFormat::Cql));
    }

    #[test]
    fn test_overrides_are_isolated_by_measure_and_format() {
        let store = OverrideStore::new();
        store.save(request("num", OutputFormat::Cql, "cql", "cql override note")).unwrap();
        store.save(request("num", OutputFormat::Sql, "sql", "sql override note")).unwrap();
        store
            .save(OverrideRequest {
                measure_id: "CMS125".into(),
                ..request("num", OutputFormat::Cql, "other", "another measure note")
            })
            .unwrap();

        assert_eq!(store.overrides_for_measure("CMS130", None).len(), 2);
        let sql = store.overrides_for_measure("CMS130", Some(OutputFormat::Sql));
        assert_eq!(sql.len(), 1);
        assert_eq!(sql[0].code, "sql");
        assert_eq!(store.overrides_for_measure("CMS125", None)[0].code, "other");
    }

    #[test]
    fn test_all_notes_newest_first_across_formats() {
        let store = OverrideStore::new();
        store.save(request("num", OutputFormat::Cql, "a", "note number one")).unwrap();
        store.save(request("num", OutputFormat::Sql, "b", "note number two")).unwrap();
        store.save(request("num", OutputFormat::Cql, "c", "note number three")).unwrap();
        store.save(request("ip", OutputFormat::Cql, "d", "unrelated component")).unwrap();

        let notes: Vec<String> = store
            .all_notes("CMS130", "num")
            .into_iter()
            .map(|n| n.text.to_string())
            .collect();
        assert_eq!(
            notes,
            vec!["note number three", "note number two", "note number one"]
        );
        assert!(store.all_notes("CMS125", "num").is_empty());
    }

    #[test]
    fn test_snapshot_round_trip_continues_sequence() {
        let store = OverrideStore::new();
        store.save(request("num", OutputFormat::Cql, "a", "note number one")).unwrap();
        store.save(request("num", OutputFormat::Cql, "b", "note number two")).unwrap();
        store.revert("CMS130", "num", OutputFormat::Cql);

        let restored = OverrideStore::from_records(store.snapshot());
        assert_eq!(restored.snapshot(), store.snapshot());
        let next = restored
            .save(request("num", OutputFormat::Cql, "c", "note number three"))
            .unwrap();
        assert!(next.locked);
        assert_eq!(next.notes.last().unwrap().sequence, 2);
    }
}
