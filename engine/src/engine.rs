use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use boundedvec::BoundedVec;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, DST_CMOS, DST_CMOS16};
use crate::error::EngineError;
use crate::hooks::{self, HookInstaller, InstalledHooks, WritePath, WritePathAddresses};
use crate::intercept::{
    CallerContext, SHADOW_CAPACITY, ShadowPayload, TERMINATOR_16, TERMINATOR_32, WritePayload,
};
use crate::key::{GroupingMode, RegisterKey};
use crate::nrzi;
use crate::policy::{self, OverrideMode};
use crate::record::RecordView;
use crate::store::RecordStore;

/// Session configuration, read when the feature enables and fixed while the
/// hooks are installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub grouping: GroupingMode,
    pub override_mode: OverrideMode,
    /// Also intercept the DIGIC engine paths (ENGIO and EngDrvOut writes).
    pub intercept_engio: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    store: RecordStore,
    settings: Settings,
    faulted: bool,
}

/// What one tracked write looks like before the override policy runs; copied
/// out of the record inside the critical section so resolution can happen
/// outside it.
struct Observed {
    mode: OverrideMode,
    key: RegisterKey,
    override_enabled: bool,
    override_value: i32,
}

/// One entry of an in-flight write burst, normalized across payload formats.
struct WriteEvent {
    dst: u16,
    reg: u16,
    raw: u32,
    mask: u32,
    nrzi_hint: bool,
    address: usize,
}

/// Live register interception engine: observes every write the firmware
/// makes through the hooked paths, indexes each distinct register, and
/// substitutes override values into a shadow copy of the in-flight buffer
/// while the write is still on its way to hardware.
#[derive(Debug)]
pub struct Engine {
    state: Mutex<EngineState>,
    catalog: Catalog,
    started: Instant,
}

impl Engine {
    #[must_use]
    pub fn new(catalog: Catalog) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            catalog,
            started: Instant::now(),
        }
    }

    /// The critical section around the store. Held only for find-or-create,
    /// update, and field copies; never across policy hashing or catalog
    /// scans. A poisoned lock means a panic escaped a hook mid-update, so
    /// the session is faulted rather than trusted.
    fn state(&self) -> MutexGuard<'_, EngineState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                guard.faulted = true;
                guard
            }
        }
    }

    /// Starts a session: clears anything tracked by the previous one, takes
    /// the session settings, and installs a hook on every configured write
    /// path. All or nothing — if one install fails, every hook is rolled
    /// back and the feature stays inactive.
    pub fn enable(
        self: &Arc<Self>,
        installer: &mut dyn HookInstaller,
        addresses: &WritePathAddresses,
        settings: Settings,
    ) -> Result<InstalledHooks, EngineError> {
        {
            let mut st = self.state();
            st.store.reset();
            st.settings = settings;
            st.faulted = false;
        }
        let installed = hooks::install_all(self, installer, addresses)?;
        tracing::info!(hooks = installed.len(), "register interception enabled");
        Ok(installed)
    }

    /// Removes the session's hooks. Records stay browsable until the next
    /// `enable` recycles them.
    pub fn disable(&self, installer: &mut dyn HookInstaller, installed: InstalledHooks) {
        hooks::uninstall_all(installer, installed);
        tracing::info!("register interception disabled");
    }

    /// Entry point for every hooked write routine. Returns the shadow copy
    /// to forward to hardware, or `None` when the original buffer should go
    /// through untouched (session faulted, or a DIGIC path with DIGIC
    /// interception off).
    pub fn on_write(
        &self,
        payload: &mut WritePayload<'_>,
        caller: CallerContext,
    ) -> Result<Option<ShadowPayload>, EngineError> {
        {
            let st = self.state();
            if st.faulted {
                return Ok(None);
            }
            if payload.is_digic() && !st.settings.intercept_engio {
                return Ok(None);
            }
        }
        match payload {
            WritePayload::Adtg { chip_select, words } => {
                logger::log("adtg burst intercepted");
                self.scan_adtg(*chip_select, *words, caller).map(Some)
            }
            WritePayload::Cmos { words } => {
                logger::log("cmos burst intercepted");
                self.scan_cmos(DST_CMOS, *words, caller, WritePath::Cmos)
                    .map(Some)
            }
            WritePayload::Cmos16 { words } => {
                logger::log("cmos16 burst intercepted");
                self.scan_cmos(DST_CMOS16, *words, caller, WritePath::Cmos16)
                    .map(Some)
            }
            WritePayload::Engio { words } => {
                logger::log("engio burst intercepted");
                self.scan_engio(*words, caller).map(Some)
            }
            WritePayload::EngDrvOut { address, value } => {
                logger::log("engine register write intercepted");
                let event = WriteEvent {
                    dst: (*address >> 16) as u16,
                    reg: *address as u16,
                    raw: **value,
                    mask: u32::MAX,
                    nrzi_hint: false,
                    address: std::ptr::from_ref::<u32>(&**value) as usize,
                };
                let out = self.track_write(&event, caller);
                // the one family that echoes into the caller's own slot: the
                // value travels in a register, and the caller re-reads it for
                // its status display
                **value = out;
                let mut shadow = BoundedVec::new();
                self.push32(&mut shadow, out, WritePath::EngDrvOut)?;
                Ok(Some(ShadowPayload::Words32(shadow)))
            }
            WritePayload::EngDrvOuts { address, values } => {
                logger::log("engine register block write intercepted");
                if values.len() > SHADOW_CAPACITY {
                    return Err(self.fault(EngineError::ShadowOverrun {
                        path: WritePath::EngDrvOuts,
                        capacity: SHADOW_CAPACITY,
                    }));
                }
                let dst = (*address >> 16) as u16;
                let base_reg = *address as u16;
                let values: &[u32] = *values;
                let mut shadow = BoundedVec::new();
                for (i, &value) in values.iter().enumerate() {
                    let event = WriteEvent {
                        dst,
                        // the block covers consecutive 4-byte registers
                        reg: base_reg.wrapping_add((i as u16) * 4),
                        raw: value,
                        mask: u32::MAX,
                        nrzi_hint: false,
                        address: element_address(values, i),
                    };
                    let out = self.track_write(&event, caller);
                    self.push32(&mut shadow, out, WritePath::EngDrvOuts)?;
                }
                Ok(Some(ShadowPayload::Words32(shadow)))
            }
        }
    }

    fn scan_adtg(
        &self,
        chip_select: u32,
        words: &[u32],
        caller: CallerContext,
    ) -> Result<ShadowPayload, EngineError> {
        let dst = (chip_select & 0xF) as u16;
        // ADTG4 registers are the NRZI-coded ones
        let nrzi_hint = dst == 4;
        let mut shadow = BoundedVec::new();
        for (i, &word) in words.iter().enumerate() {
            if word == TERMINATOR_32 {
                self.push32(&mut shadow, word, WritePath::Adtg)?;
                return Ok(ShadowPayload::Words32(shadow));
            }
            let reg = (word >> 16) as u16;
            let event = WriteEvent {
                dst,
                reg,
                raw: word,
                mask: 0xFFFF,
                nrzi_hint,
                address: element_address(words, i),
            };
            let out = self.track_write(&event, caller);
            self.push32(&mut shadow, (u32::from(reg) << 16) | out, WritePath::Adtg)?;
        }
        Err(self.fault(EngineError::UnterminatedPayload {
            path: WritePath::Adtg,
        }))
    }

    fn scan_cmos(
        &self,
        dst: u16,
        words: &[u16],
        caller: CallerContext,
        path: WritePath,
    ) -> Result<ShadowPayload, EngineError> {
        let mut shadow = BoundedVec::new();
        for (i, &word) in words.iter().enumerate() {
            if word == TERMINATOR_16 {
                self.push16(&mut shadow, word, path)?;
                return Ok(ShadowPayload::Words16(shadow));
            }
            let reg = word >> 12;
            let event = WriteEvent {
                dst,
                reg,
                raw: u32::from(word),
                mask: 0xFFF,
                nrzi_hint: false,
                address: element_address(words, i),
            };
            let out = self.track_write(&event, caller);
            self.push16(&mut shadow, (reg << 12) | out as u16, path)?;
        }
        Err(self.fault(EngineError::UnterminatedPayload { path }))
    }

    fn scan_engio(
        &self,
        words: &[u32],
        caller: CallerContext,
    ) -> Result<ShadowPayload, EngineError> {
        let mut shadow = BoundedVec::new();
        let mut i = 0;
        loop {
            let Some(&addr) = words.get(i) else {
                return Err(self.fault(EngineError::UnterminatedPayload {
                    path: WritePath::Engio,
                }));
            };
            if addr == TERMINATOR_32 {
                self.push32(&mut shadow, addr, WritePath::Engio)?;
                return Ok(ShadowPayload::Words32(shadow));
            }
            let Some(&value) = words.get(i + 1) else {
                return Err(self.fault(EngineError::UnterminatedPayload {
                    path: WritePath::Engio,
                }));
            };
            let event = WriteEvent {
                dst: (addr >> 16) as u16,
                reg: addr as u16,
                raw: value,
                mask: u32::MAX,
                nrzi_hint: false,
                address: element_address(words, i + 1),
            };
            let out = self.track_write(&event, caller);
            self.push32(&mut shadow, addr, WritePath::Engio)?;
            self.push32(&mut shadow, out, WritePath::Engio)?;
            i += 2;
        }
    }

    /// The shared core of every hook: find-or-create and update under the
    /// critical section, then override resolution outside it. Returns the
    /// (masked) value the shadow copy should carry.
    fn track_write(&self, event: &WriteEvent, caller: CallerContext) -> u32 {
        let value = (event.raw & event.mask) as i32;
        let observed = {
            let mut st = self.state();
            let key = RegisterKey::pack(
                st.settings.grouping.context_of(caller),
                event.reg,
                event.dst,
            );
            let mode = st.settings.override_mode;
            st.store
                .find_or_create(key, value, event.nrzi_hint)
                .map(|slot| {
                    st.store.update(slot, value, event.address, caller);
                    let record = st.store.record(slot);
                    Observed {
                        mode,
                        key,
                        override_enabled: record.override_enabled(),
                        override_value: record.override_value(),
                    }
                })
        };
        let passthrough = event.raw & event.mask;
        let Some(observed) = observed else {
            // store full: this key is untracked, the write goes through as-is
            return passthrough;
        };
        if !observed.override_enabled {
            return passthrough;
        }
        let second = self.started.elapsed().as_secs() as u32;
        match policy::resolve(
            observed.mode,
            observed.override_value,
            observed.key,
            second,
        ) {
            Some(replacement) => (replacement as u32) & event.mask,
            None => passthrough,
        }
    }

    /// Latches every record's current value as its previous value; the
    /// readout hook fires this once per frame.
    pub fn commit_readout(&self) {
        self.state().store.commit_snapshot();
    }

    /// Live records in key order, with catalog hints applied: a known
    /// register's NRZI flag replaces the write path's guess, and the first
    /// matching description is attached.
    #[must_use]
    pub fn records(&self) -> Vec<RecordView> {
        let mut st = self.state();
        let mut slots = Vec::with_capacity(st.store.len());
        st.store.visit_in_order(|slot| {
            slots.push(slot);
            true
        });

        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let (dst, reg) = {
                let record = st.store.record(slot);
                (record.key().dst(), record.key().reg())
            };
            let mut description = None;
            for known in self.catalog.matches(dst, reg) {
                st.store.record_mut(slot).is_nrzi = known.is_nrzi;
                if description.is_none() {
                    description = Some(known.description);
                }
            }
            views.push(RecordView::new(st.store.record(slot), description));
        }
        views
    }

    /// Snapshot of one record, if its key has been observed.
    #[must_use]
    pub fn record(&self, key: RegisterKey) -> Option<RecordView> {
        let st = self.state();
        st.store.find(key).map(|slot| {
            let record = st.store.record(slot);
            let description = self
                .catalog
                .matches(key.dst(), key.reg())
                .next()
                .map(|known| known.description);
            RecordView::new(record, description)
        })
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state().store.len()
    }

    /// Advisory: at least one register went untracked because the store
    /// filled up.
    #[must_use]
    pub fn capacity_exhausted(&self) -> bool {
        self.state().store.rejected_any()
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.state().faulted
    }

    #[must_use]
    pub fn settings(&self) -> Settings {
        self.state().settings
    }

    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Turns substitution for one record on or off. Enabling starts from the
    /// last observed value — the shadow tracked it while disabled — and
    /// disabling makes the very next write pass through again.
    pub fn set_override_enabled(
        &self,
        key: RegisterKey,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let mut st = self.state();
        let slot = st
            .store
            .find(key)
            .ok_or(EngineError::UnknownRegister { key })?;
        st.store.record_mut(slot).override_enabled = enabled;
        Ok(())
    }

    /// Sets the raw override value for one record.
    pub fn set_override_value(&self, key: RegisterKey, value: i32) -> Result<(), EngineError> {
        let mut st = self.state();
        let slot = st
            .store
            .find(key)
            .ok_or(EngineError::UnknownRegister { key })?;
        st.store.record_mut(slot).override_value = value;
        Ok(())
    }

    /// Sets an override in display units: values for NRZI registers are
    /// edited decoded and stored coded, everything else is raw either way.
    pub fn set_override_display(&self, key: RegisterKey, display: i32) -> Result<(), EngineError> {
        let mut st = self.state();
        let slot = st
            .store
            .find(key)
            .ok_or(EngineError::UnknownRegister { key })?;
        let record = st.store.record_mut(slot);
        record.override_value = if record.is_nrzi() {
            nrzi::encode(display as u32) as i32
        } else {
            display
        };
        Ok(())
    }

    /// Changes how caller identity is folded into keys. Refused once records
    /// exist: their keys were built under the old mode and the two key
    /// spaces must never mix.
    pub fn set_grouping(&self, grouping: GroupingMode) -> Result<(), EngineError> {
        let mut st = self.state();
        if !st.store.is_empty() {
            tracing::warn!(
                records = st.store.len(),
                "grouping mode change refused while records are live"
            );
            return Err(EngineError::GroupingLocked {
                records: st.store.len(),
            });
        }
        st.settings.grouping = grouping;
        Ok(())
    }

    /// Marks the session unusable; every later `on_write` forwards originals
    /// untouched until the next `enable`.
    fn fault(&self, err: EngineError) -> EngineError {
        self.state().faulted = true;
        tracing::error!(%err, "interception fault, session disabled");
        err
    }

    fn push16(
        &self,
        shadow: &mut BoundedVec<SHADOW_CAPACITY, u16>,
        word: u16,
        path: WritePath,
    ) -> Result<(), EngineError> {
        shadow.push(word).map_err(|_| {
            self.fault(EngineError::ShadowOverrun {
                path,
                capacity: SHADOW_CAPACITY,
            })
        })
    }

    fn push32(
        &self,
        shadow: &mut BoundedVec<SHADOW_CAPACITY, u32>,
        word: u32,
        path: WritePath,
    ) -> Result<(), EngineError> {
        shadow.push(word).map_err(|_| {
            self.fault(EngineError::ShadowOverrun {
                path,
                capacity: SHADOW_CAPACITY,
            })
        })
    }
}

fn element_address<T>(slice: &[T], index: usize) -> usize {
    slice.as_ptr() as usize + index * std::mem::size_of::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallError;
    use crate::hooks::{HookHandle, RegisterWriteInterceptor};
    use pretty_assertions::assert_eq;

    const CALLER: CallerContext = CallerContext {
        task: 0x40,
        pc: 0xFF01_0000,
    };

    /// Patch service stand-in: hands out handles, optionally refusing one
    /// path to exercise the rollback.
    #[derive(Default)]
    struct FakeInstaller {
        installed: Vec<(WritePath, HookHandle)>,
        uninstalled: Vec<HookHandle>,
        refuse: Option<WritePath>,
        next: u64,
    }

    impl HookInstaller for FakeInstaller {
        fn install(
            &mut self,
            path: WritePath,
            address: u32,
            _interceptor: Box<dyn RegisterWriteInterceptor>,
        ) -> Result<HookHandle, InstallError> {
            if self.refuse == Some(path) {
                return Err(InstallError {
                    path,
                    address,
                    reason: "address already patched".into(),
                });
            }
            self.next += 1;
            let handle = HookHandle(self.next);
            self.installed.push((path, handle));
            Ok(handle)
        }

        fn uninstall(&mut self, handle: HookHandle) {
            self.uninstalled.push(handle);
        }
    }

    fn enabled_engine(settings: Settings) -> Arc<Engine> {
        let engine = Arc::new(Engine::new(Catalog::empty()));
        let mut installer = FakeInstaller::default();
        engine
            .enable(&mut installer, &WritePathAddresses::default(), settings)
            .unwrap();
        engine
    }

    fn static_override_settings() -> Settings {
        Settings {
            override_mode: OverrideMode::Static,
            ..Settings::default()
        }
    }

    fn adtg_write(engine: &Engine, chip_select: u32, words: &[u32]) -> Option<ShadowPayload> {
        let mut payload = WritePayload::Adtg {
            chip_select,
            words,
        };
        engine.on_write(&mut payload, CALLER).unwrap()
    }

    #[test]
    fn first_observation_creates_an_untouched_record() {
        let engine = enabled_engine(Settings::default());

        let shadow =
            adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]).expect("shadow expected");

        assert_eq!(shadow.words32().unwrap(), &[0x8060_0005, TERMINATOR_32]);

        let records = engine.records();
        assert_eq!(records.len(), 1);
        let view = &records[0];
        assert_eq!(view.key(), RegisterKey::pack(0, 0x8060, 1));
        assert_eq!(view.value, 0x05);
        assert_eq!(view.change_count, 0);
        assert!(!view.override_enabled);
        assert_eq!(view.last_caller_task, CALLER.task);
        assert_eq!(view.last_caller_pc, CALLER.pc);
    }

    #[test]
    fn second_value_counts_one_change_and_keeps_the_snapshot() {
        let engine = enabled_engine(Settings::default());

        adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]);
        adtg_write(&engine, 1, &[0x8060_0009, TERMINATOR_32]);

        let view = engine.record(RegisterKey::pack(0, 0x8060, 1)).unwrap();
        assert_eq!(view.value, 0x09);
        assert_eq!(view.change_count, 1);
        // previous_value holds the state as of the last readout snapshot
        assert_eq!(view.previous_value, 0x05);

        engine.commit_readout();
        let view = engine.record(RegisterKey::pack(0, 0x8060, 1)).unwrap();
        assert_eq!(view.previous_value, 0x09);
    }

    #[test]
    fn static_override_patches_the_shadow_only() {
        let engine = enabled_engine(static_override_settings());
        let key = RegisterKey::pack(0, 0x8060, 1);

        adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]);
        engine.set_override_enabled(key, true).unwrap();
        engine.set_override_value(key, 0x0A).unwrap();

        let original = [0x8060_0009, TERMINATOR_32];
        let shadow = adtg_write(&engine, 1, &original).unwrap();

        assert_eq!(shadow.words32().unwrap(), &[0x8060_000A, TERMINATOR_32]);
        // the firmware's own buffer was never touched
        assert_eq!(original, [0x8060_0009, TERMINATOR_32]);
        // and the record still tracks what the firmware tried to write
        assert_eq!(engine.record(key).unwrap().value, 0x09);
    }

    #[test]
    fn disabling_an_override_restores_passthrough() {
        let engine = enabled_engine(static_override_settings());
        let key = RegisterKey::pack(0, 0x8060, 1);

        adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]);
        engine.set_override_enabled(key, true).unwrap();
        engine.set_override_value(key, 0x0A).unwrap();
        adtg_write(&engine, 1, &[0x8060_0009, TERMINATOR_32]);

        engine.set_override_enabled(key, false).unwrap();
        let shadow = adtg_write(&engine, 1, &[0x8060_0009, TERMINATOR_32]).unwrap();
        assert_eq!(shadow.words32().unwrap(), &[0x8060_0009, TERMINATOR_32]);
    }

    #[test]
    fn cmos_words_are_split_at_twelve_bits() {
        let engine = enabled_engine(Settings::default());

        let mut payload = WritePayload::Cmos {
            words: &[0x2123, 0x5FFF, TERMINATOR_16],
        };
        let shadow = engine.on_write(&mut payload, CALLER).unwrap().unwrap();
        assert_eq!(shadow.words16().unwrap(), &[0x2123, 0x5FFF, TERMINATOR_16]);

        let view = engine.record(RegisterKey::pack(0, 2, DST_CMOS)).unwrap();
        assert_eq!(view.value, 0x123);
        let view = engine.record(RegisterKey::pack(0, 5, DST_CMOS)).unwrap();
        assert_eq!(view.value, 0xFFF);
    }

    #[test]
    fn engio_pairs_are_tracked_by_class_and_offset() {
        let engine = enabled_engine(Settings {
            intercept_engio: true,
            ..Settings::default()
        });

        let mut payload = WritePayload::Engio {
            words: &[0xC0F0_6008, 0x0404_0565, TERMINATOR_32],
        };
        let shadow = engine.on_write(&mut payload, CALLER).unwrap().unwrap();
        assert_eq!(
            shadow.words32().unwrap(),
            &[0xC0F0_6008, 0x0404_0565, TERMINATOR_32]
        );

        let view = engine
            .record(RegisterKey::pack(0, 0x6008, 0xC0F0))
            .unwrap();
        assert_eq!(view.value, 0x0404_0565);
    }

    #[test]
    fn digic_paths_pass_through_until_requested() {
        let engine = enabled_engine(Settings::default());

        let mut payload = WritePayload::Engio {
            words: &[0xC0F0_6008, 0x1, TERMINATOR_32],
        };
        assert!(engine.on_write(&mut payload, CALLER).unwrap().is_none());
        assert_eq!(engine.record_count(), 0);

        // non-DIGIC paths are unaffected by the gate
        adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]);
        assert_eq!(engine.record_count(), 1);
    }

    #[test]
    fn eng_drv_out_echoes_the_substituted_value() {
        let engine = enabled_engine(Settings {
            intercept_engio: true,
            override_mode: OverrideMode::Static,
            ..Settings::default()
        });
        let key = RegisterKey::pack(0, 0x6014, 0xC0F0);

        let mut value = 0x180;
        let mut payload = WritePayload::EngDrvOut {
            address: 0xC0F0_6014,
            value: &mut value,
        };
        engine.on_write(&mut payload, CALLER).unwrap();
        assert_eq!(value, 0x180);

        engine.set_override_enabled(key, true).unwrap();
        engine.set_override_value(key, 0x1B0).unwrap();

        let mut value = 0x180;
        let mut payload = WritePayload::EngDrvOut {
            address: 0xC0F0_6014,
            value: &mut value,
        };
        let shadow = engine.on_write(&mut payload, CALLER).unwrap().unwrap();
        assert_eq!(shadow.words32().unwrap(), &[0x1B0]);
        // this family is the exception: the caller's slot sees the override
        assert_eq!(value, 0x1B0);
    }

    #[test]
    fn eng_drv_outs_tracks_consecutive_registers() {
        let engine = enabled_engine(Settings {
            intercept_engio: true,
            ..Settings::default()
        });

        let mut payload = WritePayload::EngDrvOuts {
            address: 0xC0F0_8D1C,
            values: &[1, 2, 3],
        };
        engine.on_write(&mut payload, CALLER).unwrap();

        for (i, expected) in [1, 2, 3].into_iter().enumerate() {
            let reg = 0x8D1C + (i as u16) * 4;
            let view = engine.record(RegisterKey::pack(0, reg, 0xC0F0)).unwrap();
            assert_eq!(view.value, expected);
        }
    }

    #[test]
    fn shadow_overrun_faults_the_session() {
        let engine = enabled_engine(Settings::default());

        // a burst with no terminator in sight, longer than any shadow buffer
        let words = vec![0x0001_0001u32; SHADOW_CAPACITY + 8];
        let mut payload = WritePayload::Adtg {
            chip_select: 2,
            words: &words,
        };
        let err = engine.on_write(&mut payload, CALLER).unwrap_err();
        assert!(matches!(err, EngineError::ShadowOverrun { .. }));
        assert!(engine.is_faulted());

        // faulted: later writes pass through untouched
        let mut payload = WritePayload::Adtg {
            chip_select: 2,
            words: &[0x0001_0001, TERMINATOR_32],
        };
        assert!(engine.on_write(&mut payload, CALLER).unwrap().is_none());
    }

    #[test]
    fn unterminated_payload_faults_the_session() {
        let engine = enabled_engine(Settings::default());

        let mut payload = WritePayload::Cmos {
            words: &[0x2123, 0x5FFF],
        };
        let err = engine.on_write(&mut payload, CALLER).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnterminatedPayload {
                path: WritePath::Cmos
            }
        ));
        assert!(engine.is_faulted());
    }

    #[test]
    fn reenabling_clears_the_fault_and_the_records() {
        let engine = enabled_engine(Settings::default());
        adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]);

        let mut payload = WritePayload::Cmos { words: &[0x2123] };
        engine.on_write(&mut payload, CALLER).unwrap_err();
        assert!(engine.is_faulted());

        let mut installer = FakeInstaller::default();
        engine
            .enable(
                &mut installer,
                &WritePathAddresses::default(),
                Settings::default(),
            )
            .unwrap();
        assert!(!engine.is_faulted());
        assert_eq!(engine.record_count(), 0);
    }

    #[test]
    fn per_task_grouping_tracks_callers_separately() {
        let engine = enabled_engine(Settings {
            grouping: GroupingMode::PerTask,
            ..Settings::default()
        });

        let words = [0x8060_0005, TERMINATOR_32];
        let mut payload = WritePayload::Adtg {
            chip_select: 1,
            words: &words,
        };
        engine
            .on_write(&mut payload, CallerContext { task: 1, pc: 0 })
            .unwrap();
        let mut payload = WritePayload::Adtg {
            chip_select: 1,
            words: &words,
        };
        engine
            .on_write(&mut payload, CallerContext { task: 2, pc: 0 })
            .unwrap();

        assert_eq!(engine.record_count(), 2);
    }

    #[test]
    fn grouping_change_is_refused_once_records_exist() {
        let engine = enabled_engine(Settings::default());
        assert!(engine.set_grouping(GroupingMode::PerTask).is_ok());

        adtg_write(&engine, 1, &[0x8060_0005, TERMINATOR_32]);
        let err = engine
            .set_grouping(GroupingMode::PerProgramCounter)
            .unwrap_err();
        assert!(matches!(err, EngineError::GroupingLocked { records: 1 }));
    }

    #[test]
    fn random_per_second_override_is_masked_to_the_path_width() {
        let engine = enabled_engine(Settings {
            override_mode: OverrideMode::RandomPerSecond,
            ..Settings::default()
        });
        let key = RegisterKey::pack(0, 2, DST_CMOS);

        let mut payload = WritePayload::Cmos {
            words: &[0x2123, TERMINATOR_16],
        };
        engine.on_write(&mut payload, CALLER).unwrap();
        engine.set_override_enabled(key, true).unwrap();

        let mut payload = WritePayload::Cmos {
            words: &[0x2123, TERMINATOR_16],
        };
        let shadow = engine.on_write(&mut payload, CALLER).unwrap().unwrap();
        let words = shadow.words16().unwrap();
        // register bits intact, value bits within the 12-bit field
        assert_eq!(words[0] >> 12, 2);
        assert_eq!(words[1], TERMINATOR_16);
    }

    #[test]
    fn failed_install_rolls_back_and_reports() {
        let engine = Arc::new(Engine::new(Catalog::empty()));
        let mut installer = FakeInstaller {
            refuse: Some(WritePath::Cmos16),
            ..FakeInstaller::default()
        };
        let addresses = WritePathAddresses::for_model("5D3", "1.1.3").unwrap();

        let err = engine
            .enable(&mut installer, &addresses, Settings::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Install(_)));
        // everything installed before the failure was rolled back
        assert_eq!(installer.installed.len(), installer.uninstalled.len());
        assert!(!installer.installed.is_empty());
    }

    #[test]
    fn enable_then_disable_uninstalls_every_hook() {
        let engine = Arc::new(Engine::new(Catalog::empty()));
        let mut installer = FakeInstaller::default();
        let addresses = WritePathAddresses::for_model("5D3", "1.1.3").unwrap();

        let installed = engine
            .enable(&mut installer, &addresses, Settings::default())
            .unwrap();
        assert_eq!(installed.len(), 6);

        engine.disable(&mut installer, installed);
        assert_eq!(installer.uninstalled.len(), 6);
    }

    #[test]
    fn catalog_hint_overrides_the_nrzi_guess() {
        let engine = {
            let engine = Arc::new(Engine::new(Catalog::builtin()));
            let mut installer = FakeInstaller::default();
            engine
                .enable(
                    &mut installer,
                    &WritePathAddresses::default(),
                    Settings::default(),
                )
                .unwrap();
            engine
        };

        // chip select 2 guesses non-NRZI, but 0x8060 is catalogued as NRZI
        adtg_write(&engine, 2, &[0x8060_0007, TERMINATOR_32]);
        let views = engine.records();
        assert!(views[0].is_nrzi);
        assert_eq!(views[0].description, Some("Shutter blanking for LiveView 1x"));
        assert_eq!(views[0].display_value(), nrzi::decode(0x7) as i32);
    }

    #[test]
    fn display_override_encodes_for_nrzi_registers() {
        let engine = enabled_engine(static_override_settings());
        let key = RegisterKey::pack(0, 0x8060, 4);

        // chip select 4: NRZI guessed at creation
        adtg_write(&engine, 4, &[0x8060_0005, TERMINATOR_32]);
        engine.set_override_display(key, 0x0A).unwrap();
        engine.set_override_enabled(key, true).unwrap();

        let shadow = adtg_write(&engine, 4, &[0x8060_0005, TERMINATOR_32]).unwrap();
        let expected = nrzi::encode(0x0A) & 0xFFFF;
        assert_eq!(shadow.words32().unwrap()[0], 0x8060_0000 | expected);
    }
}
