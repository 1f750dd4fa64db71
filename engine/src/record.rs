use serde::Serialize;

use crate::key::RegisterKey;
use crate::nrzi;

/// Intrusive tree-node state embedded in every record. The store's arena owns
/// the storage; the index only threads slot indices through these fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexNode {
    pub(crate) left: Option<usize>,
    pub(crate) right: Option<usize>,
    pub(crate) balance: i8,
}

/// Tracked state for one distinct register key, created the first time the
/// key is observed and kept until the engine is re-enabled.
#[derive(Debug)]
pub struct RegisterRecord {
    pub(crate) node: IndexNode,
    pub(crate) key: RegisterKey,
    pub(crate) value: i32,
    pub(crate) previous_value: i32,
    pub(crate) override_value: i32,
    pub(crate) override_enabled: bool,
    pub(crate) change_count: u32,
    pub(crate) is_nrzi: bool,
    pub(crate) last_write_address: usize,
    pub(crate) last_caller_task: u32,
    pub(crate) last_caller_pc: u32,
}

impl RegisterRecord {
    /// The first observed value seeds `value`, `previous_value` and the
    /// disabled-override shadow alike, so the write that creates a record
    /// does not count as a change.
    pub(crate) fn new(key: RegisterKey, initial_value: i32, is_nrzi: bool) -> Self {
        Self {
            node: IndexNode::default(),
            key,
            value: initial_value,
            previous_value: initial_value,
            override_value: initial_value,
            override_enabled: false,
            change_count: 0,
            is_nrzi,
            last_write_address: 0,
            last_caller_task: 0,
            last_caller_pc: 0,
        }
    }

    #[must_use]
    pub const fn key(&self) -> RegisterKey {
        self.key
    }

    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    #[must_use]
    pub const fn previous_value(&self) -> i32 {
        self.previous_value
    }

    #[must_use]
    pub const fn override_enabled(&self) -> bool {
        self.override_enabled
    }

    #[must_use]
    pub const fn override_value(&self) -> i32 {
        self.override_value
    }

    #[must_use]
    pub const fn change_count(&self) -> u32 {
        self.change_count
    }

    #[must_use]
    pub const fn is_nrzi(&self) -> bool {
        self.is_nrzi
    }
}

/// Copy of one record shaped for the presentation layer: unpacked key fields,
/// provenance, and the description of the first catalog match, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordView {
    pub context: u32,
    pub reg: u16,
    pub dst: u16,
    pub value: i32,
    pub previous_value: i32,
    pub override_enabled: bool,
    pub override_value: i32,
    pub change_count: u32,
    pub is_nrzi: bool,
    pub last_write_address: usize,
    pub last_caller_task: u32,
    pub last_caller_pc: u32,
    pub description: Option<&'static str>,
}

impl RecordView {
    pub(crate) fn new(record: &RegisterRecord, description: Option<&'static str>) -> Self {
        Self {
            context: record.key.context(),
            reg: record.key.reg(),
            dst: record.key.dst(),
            value: record.value,
            previous_value: record.previous_value,
            override_enabled: record.override_enabled,
            override_value: record.override_value,
            change_count: record.change_count,
            is_nrzi: record.is_nrzi,
            last_write_address: record.last_write_address,
            last_caller_task: record.last_caller_task,
            last_caller_pc: record.last_caller_pc,
            description,
        }
    }

    #[must_use]
    pub const fn key(&self) -> RegisterKey {
        RegisterKey::pack(self.context, self.reg, self.dst)
    }

    /// Current value as the presentation layer shows it: NRZI registers are
    /// decoded, everything else is raw.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn display_value(&self) -> i32 {
        if self.is_nrzi {
            nrzi::decode(self.value as u32) as i32
        } else {
            self.value
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn display_previous(&self) -> i32 {
        if self.is_nrzi {
            nrzi::decode(self.previous_value as u32) as i32
        } else {
            self.previous_value
        }
    }
}
