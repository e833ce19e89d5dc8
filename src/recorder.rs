//! In-process stand-ins for the engine: a draw object backed by owned memory and a
//! [`NativeVisorUpdater`] that records every call to the "original" routine.

use crate::hook::{NativeEntry, NativeVisorUpdater};
use crate::model::{CharacterArmor, EquipSlot, Model, ModelLayout, NativeAddress, StateFlags};
use anyhow::{bail, Result};
use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

const MONSTER_MODEL_TYPE: u8 = 3;

/// Zero-initialised memory shaped like an engine draw object.
pub struct SimulatedDrawObject {
    bytes: Box<[Cell<u8>]>,
    layout: ModelLayout,
}

impl SimulatedDrawObject {
    /// An object that is not a character base at all.
    pub fn unrelated(layout: &ModelLayout) -> Self {
        let bytes = (0..layout.span()).map(|_| Cell::new(0)).collect::<Vec<_>>().into_boxed_slice();
        Self { bytes, layout: layout.clone() }
    }

    /// A character base that is not a human (a monster model).
    pub fn character_base(layout: &ModelLayout) -> Self {
        let object = Self::unrelated(layout);
        object.make_character_base();
        object
    }

    pub fn human(layout: &ModelLayout) -> Self {
        let object = Self::unrelated(layout);
        object.make_human();
        object
    }

    pub fn make_character_base(&self) {
        self.bytes[self.layout.object_type_offset].set(self.layout.character_base_type);
        self.bytes[self.layout.model_type_offset].set(MONSTER_MODEL_TYPE);
    }

    pub fn make_human(&self) {
        self.bytes[self.layout.object_type_offset].set(self.layout.character_base_type);
        self.bytes[self.layout.model_type_offset].set(self.layout.human_model_type);
    }

    pub fn equip(&self, slot: EquipSlot, armor: CharacterArmor) {
        let base = self.layout.equipment_offset + slot.index() * mem::size_of::<CharacterArmor>();
        let [lo, hi] = armor.set.to_ne_bytes();
        self.bytes[base].set(lo);
        self.bytes[base + 1].set(hi);
        self.bytes[base + 2].set(armor.variant);
        self.bytes[base + 3].set(armor.stain);
    }

    pub fn state_byte(&self) -> u8 {
        self.bytes[self.layout.state_flags_offset].get()
    }

    pub fn set_state_byte(&self, value: u8) {
        self.bytes[self.layout.state_flags_offset].set(value);
    }

    /// Sets or clears only the visor bit, leaving the rest of the status byte alone.
    pub fn set_visor_bit(&self, on: bool) {
        let mut flags = StateFlags::from_bits_retain(self.state_byte());
        flags.set(self.layout.visor_bit(), on);
        self.set_state_byte(flags.bits());
    }

    pub fn address(&self) -> NativeAddress {
        NativeAddress::from_ptr(self.bytes.as_ptr())
    }

    pub fn model(&self) -> Model<'_> {
        // SAFETY: the buffer spans `layout.span()` bytes and lives as long as `self`.
        unsafe { Model::from_raw(self.address(), &self.layout) }
    }
}

/// One call that reached the original native routine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeCall {
    pub address: NativeAddress,
    pub model_id: u16,
    pub on: bool,
    /// Status byte observed when the call was made, `None` for non character bases.
    pub state_flags: Option<StateFlags>,
}

/// Plays the engine's part: owns the routed entry point and records calls to the original.
///
/// Like the real routine, the recorded original only clears the "changing" bit; it never touches
/// the visible visor bit. Every address handed to it must belong to a [`SimulatedDrawObject`]
/// that is still alive.
pub struct RecordingUpdater {
    layout: ModelLayout,
    entry: Mutex<Option<NativeEntry>>,
    enabled: AtomicBool,
    calls: Mutex<Vec<NativeCall>>,
    teardowns: AtomicUsize,
    install_failure: Option<String>,
}

impl RecordingUpdater {
    pub fn new(layout: &ModelLayout) -> Self {
        Self {
            layout: layout.clone(),
            entry: Mutex::new(None),
            enabled: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            teardowns: AtomicUsize::new(0),
            install_failure: None,
        }
    }

    /// An updater whose installation fails, like an unresolved native address.
    pub fn unresolved(layout: &ModelLayout, reason: impl Into<String>) -> Self {
        Self { install_failure: Some(reason.into()), ..Self::new(layout) }
    }

    /// The engine toggles a visor on its own. Goes through the routed entry point while the
    /// interception is installed and enabled, straight to the original otherwise.
    pub fn fire(&self, address: NativeAddress, model_id: u16, on: bool) {
        let entry = if self.enabled.load(Ordering::Acquire) {
            self.entry.lock().unwrap_or_else(PoisonError::into_inner).clone()
        } else {
            None
        };
        match entry {
            Some(entry) => entry(address, model_id, on),
            None => self.invoke_original(address, model_id, on),
        }
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn is_installed(&self) -> bool {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::Acquire)
    }
}

impl NativeVisorUpdater for RecordingUpdater {
    fn install(&self, entry: NativeEntry) -> Result<()> {
        if let Some(reason) = &self.install_failure {
            bail!("setup-visor routine could not be bound: {reason}");
        }
        let mut slot = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            bail!("setup-visor interception is already installed");
        }
        *slot = Some(entry);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn invoke_original(&self, address: NativeAddress, model_id: u16, on: bool) {
        // SAFETY: addresses reaching the recorder come from live simulated objects.
        let model = unsafe { Model::from_raw(address, &self.layout) };
        let state_flags = model.state_flags();
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(NativeCall {
            address,
            model_id,
            on,
            state_flags,
        });
        if let Some(flags) = state_flags {
            model.set_state_flags(flags.difference(self.layout.changing_bit()));
        }
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        if !self.is_installed() {
            bail!("setup-visor interception is not installed");
        }
        self.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn teardown(&self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::AcqRel);
        self.enabled.store(false, Ordering::Release);
        if self.entry.lock().unwrap_or_else(PoisonError::into_inner).take().is_none() {
            bail!("setup-visor interception was never installed");
        }
        Ok(())
    }
}
