use crate::events::VisorStateChanged;
use crate::hook::{NativeEntry, NativeVisorUpdater};
use crate::model::{Model, ModelLayout, NativeAddress};
use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Arbitrates the visor toggle of character draw objects.
///
/// Owns the interception of the native setup-visor routine for its whole lifetime: the binding
/// is installed by [`VisorService::new`] and torn down when the service is dropped.
pub struct VisorService<U: NativeVisorUpdater> {
    updater: Arc<U>,
    layout: ModelLayout,
    event: Arc<VisorStateChanged>,
    installed: AtomicBool,
}

impl<U: NativeVisorUpdater + 'static> VisorService<U> {
    /// Installs the interception. A binding failure is fatal: the service cannot exist without it.
    pub fn new(updater: U, layout: ModelLayout, event: Arc<VisorStateChanged>) -> Result<Arc<Self>> {
        layout.validate().context("invalid draw object layout")?;
        let updater = Arc::new(updater);
        let service = Arc::new(Self { updater, layout, event, installed: AtomicBool::new(false) });
        let weak = Arc::downgrade(&service);
        let original = Arc::downgrade(&service.updater);
        // Between the last strong reference going away and `teardown` the hook is still live;
        // engine calls in that window go straight to the original.
        let entry: NativeEntry = Arc::new(move |address: NativeAddress, model_id: u16, on: bool| {
            if let Some(service) = weak.upgrade() {
                return service.on_native_address(address, model_id, on);
            }
            debug!("[visor] native request on {address} while the service is shutting down");
            match original.upgrade() {
                Some(updater) => updater.invoke_original(address, model_id, on),
                None => warn!("[visor] native request on {address} after the binding was released"),
            }
        });
        service.updater.install(entry).context("binding the native setup-visor routine")?;
        service.installed.store(true, Ordering::Release);
        info!("[visor] setup-visor interception installed");
        Ok(service)
    }
}

impl<U: NativeVisorUpdater> VisorService<U> {
    pub fn event(&self) -> &Arc<VisorStateChanged> {
        &self.event
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    /// # Safety
    /// Same contract as [`Model::from_raw`].
    pub unsafe fn model(&self, address: NativeAddress) -> Model<'_> {
        Model::from_raw(address, &self.layout)
    }

    /// Current visor state of a draw object (true: toggled). False for anything but a character base.
    pub fn get_visor_state(&self, model: Model<'_>) -> bool {
        model.state_flags().is_some_and(|flags| flags.contains(self.layout.visor_bit()))
    }

    /// Manually sets the visor state of a human. Returns whether the state was changed.
    ///
    /// Does not raise [`VisorStateChanged`].
    pub fn set_visor_state(&self, model: Model<'_>, on: bool) -> bool {
        if !model.is_human() {
            return false;
        }
        let old_state = self.get_visor_state(model);
        debug!("[visor] set invoked manually on {} switching from {old_state} to {on}", model.address());
        if old_state == on {
            return false;
        }
        let Some(model_id) = model.head_model_id() else {
            return false;
        };
        self.apply(model, model_id, on);
        true
    }

    /// Enables or disables the interception without releasing it.
    pub fn set_interception(&self, enabled: bool) -> Result<()> {
        self.updater.set_enabled(enabled).with_context(|| {
            format!("{} setup-visor interception", if enabled { "enabling" } else { "disabling" })
        })
    }

    pub fn is_intercepting(&self) -> bool {
        self.installed.load(Ordering::Acquire) && self.updater.is_enabled()
    }

    fn on_native_address(&self, address: NativeAddress, model_id: u16, on: bool) {
        // SAFETY: the engine only calls the setup-visor routine with live human draw objects.
        let model = unsafe { self.model(address) };
        self.on_native_request(model, model_id, on);
    }

    /// Entry point of the detour: lets subscribers rewrite the request, then always applies it.
    pub(crate) fn on_native_request(&self, model: Model<'_>, model_id: u16, on: bool) {
        let requested = self.event.dispatch(model, on);
        trace!("[visor] set invoked from game on {} switching to {requested} (original {on})", model.address());
        self.apply(model, model_id, requested);
    }

    /// The native routine only clears the "visor is changing" bit and never sets the visible
    /// toggle, so every change writes the toggle bit first and then calls the original.
    fn apply(&self, model: Model<'_>, model_id: u16, on: bool) {
        if let Some(mut flags) = model.state_flags() {
            flags.set(self.layout.visor_bit(), on);
            model.set_state_flags(flags);
        }
        self.updater.invoke_original(model.address(), model_id, on);
    }
}

impl<U: NativeVisorUpdater> Drop for VisorService<U> {
    fn drop(&mut self) {
        if !self.installed.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.updater.teardown() {
            Ok(()) => info!("[visor] setup-visor interception removed"),
            Err(err) => warn!("[visor] failed to remove setup-visor interception: {err:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CharacterArmor, EquipSlot, StateFlags};
    use crate::recorder::{RecordingUpdater, SimulatedDrawObject};

    const HEAD_SET: u16 = 6016;

    fn service(layout: &ModelLayout) -> Arc<VisorService<RecordingUpdater>> {
        VisorService::new(RecordingUpdater::new(layout), layout.clone(), Arc::new(VisorStateChanged::new()))
            .expect("install service")
    }

    fn helmeted_human(layout: &ModelLayout) -> SimulatedDrawObject {
        let object = SimulatedDrawObject::human(layout);
        object.equip(EquipSlot::Head, CharacterArmor { set: HEAD_SET, variant: 1, stain: 0 });
        object
    }

    #[test]
    fn native_request_applies_even_when_the_state_already_matches() {
        let layout = ModelLayout::default();
        let service = service(&layout);
        let object = helmeted_human(&layout);
        object.set_visor_bit(true);

        service.on_native_request(object.model(), 42, true);
        service.on_native_request(object.model(), 42, true);

        let calls = service.updater().calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.on && call.model_id == 42));
        assert!(service.get_visor_state(object.model()));
    }

    #[test]
    fn apply_writes_only_the_visor_bit() {
        let layout = ModelLayout::default();
        let service = service(&layout);
        let object = helmeted_human(&layout);
        object.set_state_byte(0x05);

        service.apply(object.model(), HEAD_SET, true);

        let seen = service.updater().calls()[0].state_flags.expect("character base");
        assert_eq!(seen.bits(), 0x45, "bit set before the native call, other bits untouched");
        assert_eq!(object.state_byte(), 0x45);
    }

    #[test]
    fn apply_on_a_non_character_base_only_forwards_the_call() {
        let layout = ModelLayout::default();
        let service = service(&layout);
        let object = SimulatedDrawObject::unrelated(&layout);
        object.set_state_byte(0x00);

        service.apply(object.model(), 7, true);

        assert_eq!(object.state_byte(), 0x00);
        assert_eq!(service.updater().calls()[0].state_flags, None);
    }

    #[test]
    fn subscriber_reentering_the_service_does_not_deadlock() {
        let layout = ModelLayout::default();
        let event = Arc::new(VisorStateChanged::new());
        let service = VisorService::new(RecordingUpdater::new(&layout), layout.clone(), event.clone())
            .expect("install service");
        let object = helmeted_human(&layout);

        let weak = Arc::downgrade(&service);
        event.subscribe("reentrant", move |model, proposed| {
            if let Some(service) = weak.upgrade() {
                service.set_visor_state(model, !proposed);
            }
            proposed
        });

        service.on_native_request(object.model(), HEAD_SET, true);

        let calls = service.updater().calls();
        assert_eq!(calls.len(), 1, "manual set to the current state (off) is a no-op");
        assert!(calls[0].on);
        assert!(service.get_visor_state(object.model()));
    }

    #[test]
    fn visor_bit_follows_the_configured_mask() {
        let layout = ModelLayout { visor_flag: 0x02, ..ModelLayout::default() };
        let service = service(&layout);
        let object = helmeted_human(&layout);

        assert!(service.set_visor_state(object.model(), true));
        assert_eq!(object.state_byte(), 0x02);
        assert_eq!(object.model().state_flags(), Some(StateFlags::from_bits_retain(0x02)));
    }

    #[test]
    fn invalid_layout_is_rejected_before_installing() {
        let layout = ModelLayout { visor_flag: 0x03, ..ModelLayout::default() };
        let result = VisorService::new(RecordingUpdater::new(&layout), layout, Arc::new(VisorStateChanged::new()));
        assert!(result.is_err());
    }

    #[test]
    fn interception_toggle_is_forwarded_to_the_binding() {
        let layout = ModelLayout::default();
        let service = service(&layout);
        assert!(service.is_intercepting());
        service.set_interception(false).expect("disable");
        assert!(!service.is_intercepting());
        service.set_interception(true).expect("enable");
        assert!(service.is_intercepting());
    }
}
