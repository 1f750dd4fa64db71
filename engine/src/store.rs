use crate::index;
use crate::intercept::CallerContext;
use crate::key::RegisterKey;
use crate::record::RegisterRecord;

/// Hard ceiling on distinct tracked registers. Once reached, new keys are
/// refused and only already-tracked registers keep updating.
pub const CAPACITY: usize = 4096;

/// Fixed-capacity arena of register records plus the balanced index over it.
/// Slots are never reused within a session; `reset` recycles everything at
/// once when a new session starts.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: Vec<RegisterRecord>,
    root: Option<usize>,
    rejected: bool,
}

impl RecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(CAPACITY),
            root: None,
            rejected: false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.records.len() == CAPACITY
    }

    /// Whether any key has been refused for lack of space this session.
    #[must_use]
    pub const fn rejected_any(&self) -> bool {
        self.rejected
    }

    #[must_use]
    pub fn find(&self, key: RegisterKey) -> Option<usize> {
        index::find(&self.records, self.root, key)
    }

    /// Returns the slot tracking `key`, creating the record on first
    /// observation. `None` means the store is full and this key is not
    /// tracked; the caller forwards the write unmodified.
    ///
    /// An existing record's NRZI flag is authoritative; the hint only seeds
    /// newly created records.
    pub fn find_or_create(
        &mut self,
        key: RegisterKey,
        initial_value: i32,
        nrzi_hint: bool,
    ) -> Option<usize> {
        if let Some(slot) = self.find(key) {
            return Some(slot);
        }
        if self.is_full() {
            if !self.rejected {
                self.rejected = true;
                tracing::warn!(
                    capacity = CAPACITY,
                    "record store full, further registers will not be tracked"
                );
            }
            return None;
        }
        let slot = self.records.len();
        self.records
            .push(RegisterRecord::new(key, initial_value, nrzi_hint));
        self.root = index::insert(&mut self.records, self.root, slot);
        Some(slot)
    }

    /// Folds one observed write into the record: the disabled-override shadow
    /// tracks the incoming value, a value transition bumps the change count,
    /// and the provenance fields always take the latest caller.
    pub fn update(
        &mut self,
        slot: usize,
        new_value: i32,
        address: usize,
        caller: CallerContext,
    ) {
        let record = &mut self.records[slot];
        if !record.override_enabled {
            record.override_value = new_value;
        }
        if new_value != record.value {
            record.change_count += 1;
            record.value = new_value;
        }
        record.last_write_address = address;
        record.last_caller_task = caller.task;
        record.last_caller_pc = caller.pc;
    }

    /// Latches every record's current value as its previous value; called
    /// once per readout cycle so "changed since last frame" stays meaningful.
    pub fn commit_snapshot(&mut self) {
        for record in &mut self.records {
            record.previous_value = record.value;
        }
    }

    /// Drains the index and recycles all record storage.
    pub fn reset(&mut self) {
        while self.root.is_some() {
            self.root = index::remove_root(&mut self.records, self.root);
        }
        self.records.clear();
        self.rejected = false;
    }

    #[must_use]
    pub fn record(&self, slot: usize) -> &RegisterRecord {
        &self.records[slot]
    }

    pub fn record_mut(&mut self, slot: usize) -> &mut RegisterRecord {
        &mut self.records[slot]
    }

    /// Dense record slice, in creation order.
    #[must_use]
    pub fn records(&self) -> &[RegisterRecord] {
        &self.records
    }

    /// Visits live slots in key order until the visitor returns `false`.
    pub fn visit_in_order<F>(&self, mut visit: F)
    where
        F: FnMut(usize) -> bool,
    {
        index::visit_in_order(&self.records, self.root, &mut visit);
    }
}
