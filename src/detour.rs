//! Production binding: a `retour` trampoline over the engine's setup-visor routine.

use crate::hook::{NativeEntry, NativeVisorUpdater, SetupVisorFn};
use crate::model::NativeAddress;
use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use retour::GenericDetour;
use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// The engine can only be detoured once per process; the trampoline has no captures, so the
/// installed route lives here.
static ACTIVE: RwLock<Option<ActiveRoute>> = RwLock::new(None);

/// Address of the most recently detoured routine. Only called while no route is active, at which
/// point the detour is disabled and the target holds its original code again.
static LAST_TARGET: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
struct ActiveRoute {
    detour: Arc<GenericDetour<SetupVisorFn>>,
    entry: NativeEntry,
}

unsafe extern "C" fn setup_visor_detour(human: *mut c_void, model_id: u16, on: bool) {
    let route = ACTIVE.read().unwrap_or_else(PoisonError::into_inner).clone();
    match route {
        Some(route) => (route.entry)(NativeAddress::from_ptr(human), model_id, on),
        None => {
            warn!("[visor] setup-visor detour hit without an installed route, passing through");
            let target = LAST_TARGET.load(Ordering::Acquire);
            if target != 0 {
                let original = mem::transmute::<usize, SetupVisorFn>(target);
                original(human, model_id, on);
            }
        }
    }
}

/// Detours the native setup-visor routine at a resolved address.
pub struct DetourBinding {
    target: NativeAddress,
    detour: Mutex<Option<Arc<GenericDetour<SetupVisorFn>>>>,
    installed_once: AtomicBool,
}

impl DetourBinding {
    /// `target` is the resolved address of the setup-visor routine, or null if resolution failed.
    pub fn new(target: NativeAddress) -> Self {
        Self { target, detour: Mutex::new(None), installed_once: AtomicBool::new(false) }
    }

    pub fn target(&self) -> NativeAddress {
        self.target
    }

    fn original(&self) -> Option<SetupVisorFn> {
        if self.target.is_null() {
            return None;
        }
        // SAFETY: a non-null target is the address of a function with the `SetupVisorFn` signature.
        Some(unsafe { mem::transmute::<usize, SetupVisorFn>(self.target.get()) })
    }

    fn current(&self) -> Option<Arc<GenericDetour<SetupVisorFn>>> {
        self.detour.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn installed(&self) -> Result<Arc<GenericDetour<SetupVisorFn>>> {
        self.current().ok_or_else(|| anyhow!("setup-visor detour at {} is not installed", self.target))
    }
}

impl NativeVisorUpdater for DetourBinding {
    fn install(&self, entry: NativeEntry) -> Result<()> {
        let Some(original) = self.original() else {
            bail!("setup-visor routine address is unresolved");
        };
        if self.installed_once.load(Ordering::Acquire) {
            bail!("setup-visor detour at {} was already installed once", self.target);
        }
        let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            bail!("another setup-visor detour is already active in this process");
        }
        let detour = unsafe {
            GenericDetour::<SetupVisorFn>::new(original, setup_visor_detour as SetupVisorFn)
                .with_context(|| format!("creating setup-visor detour at {}", self.target))?
        };
        unsafe { detour.enable() }.with_context(|| format!("enabling setup-visor detour at {}", self.target))?;
        let detour = Arc::new(detour);
        LAST_TARGET.store(self.target.get(), Ordering::Release);
        *active = Some(ActiveRoute { detour: detour.clone(), entry });
        *self.detour.lock().unwrap_or_else(PoisonError::into_inner) = Some(detour);
        self.installed_once.store(true, Ordering::Release);
        info!("[visor] detoured setup-visor routine at {}", self.target);
        Ok(())
    }

    fn invoke_original(&self, address: NativeAddress, model_id: u16, on: bool) {
        let human = address.as_mut_ptr::<c_void>();
        match self.current() {
            Some(detour) => unsafe { detour.call(human, model_id, on) },
            None => {
                if let Some(original) = self.original() {
                    unsafe { original(human, model_id, on) }
                }
            }
        }
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        let detour = self.installed()?;
        if enabled {
            unsafe { detour.enable() }.context("enabling setup-visor detour")?;
        } else {
            unsafe { detour.disable() }.context("disabling setup-visor detour")?;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.current().is_some_and(|detour| detour.is_enabled())
    }

    /// Disables the detour, clears the process-wide route and drops the trampoline. Calls still
    /// in flight keep their own handle to it until they return.
    fn teardown(&self) -> Result<()> {
        let detour = self.installed()?;
        unsafe { detour.disable() }.context("disabling setup-visor detour")?;
        let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|route| Arc::ptr_eq(&route.detour, &detour)) {
            *active = None;
        }
        drop(active);
        self.detour.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hint::black_box;
    use std::ptr;
    use std::sync::atomic::AtomicU16;

    static NATIVE_CALLS: AtomicUsize = AtomicUsize::new(0);
    static NATIVE_MODEL_ID: AtomicU16 = AtomicU16::new(0);
    static OTHER_CALLS: AtomicUsize = AtomicUsize::new(0);

    #[inline(never)]
    unsafe extern "C" fn native_setup_visor(_human: *mut c_void, model_id: u16, on: bool) {
        NATIVE_CALLS.fetch_add(1, Ordering::SeqCst);
        NATIVE_MODEL_ID.store(model_id, Ordering::SeqCst);
        black_box(on);
    }

    #[inline(never)]
    unsafe extern "C" fn other_setup_visor(_human: *mut c_void, model_id: u16, on: bool) {
        OTHER_CALLS.fetch_add(1, Ordering::SeqCst);
        black_box((model_id, on));
    }

    /// Calls through a pointer the optimiser cannot see through, like the engine would.
    fn engine_call(target: SetupVisorFn, model_id: u16, on: bool) {
        let target = black_box(target);
        unsafe { target(ptr::null_mut(), model_id, on) }
    }

    fn native_calls() -> usize {
        NATIVE_CALLS.load(Ordering::SeqCst)
    }

    #[test]
    fn null_target_fails_to_install() {
        let binding = DetourBinding::new(NativeAddress::NULL);
        let err = binding.install(Arc::new(|_: NativeAddress, _: u16, _: bool| {})).expect_err("unresolved address");
        assert!(err.to_string().contains("unresolved"));
        assert!(!binding.is_enabled());
        assert!(binding.teardown().is_err());
    }

    // One test owns the process-wide route so nothing else races on it.
    #[test]
    fn detour_routes_toggles_and_releases_a_live_function() {
        let target = native_setup_visor as SetupVisorFn;
        let other = other_setup_visor as SetupVisorFn;
        let binding = Arc::new(DetourBinding::new(NativeAddress::new(target as usize)));
        let routed = Arc::new(AtomicUsize::new(0));

        binding.invoke_original(NativeAddress::NULL, 1, true);
        assert_eq!(native_calls(), 1, "not installed: the raw target runs");

        let counter = routed.clone();
        let forward = Arc::downgrade(&binding);
        binding
            .install(Arc::new(move |address: NativeAddress, model_id: u16, on: bool| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(binding) = forward.upgrade() {
                    binding.invoke_original(address, model_id, on);
                }
            }))
            .expect("install detour");
        assert!(binding.is_enabled());

        engine_call(target, 42, true);
        assert_eq!(routed.load(Ordering::SeqCst), 1, "engine call is routed to the entry");
        assert_eq!(native_calls(), 2, "entry reached the pre-hook body through the trampoline");
        assert_eq!(NATIVE_MODEL_ID.load(Ordering::SeqCst), 42);

        binding.invoke_original(NativeAddress::NULL, 7, false);
        assert_eq!(routed.load(Ordering::SeqCst), 1, "the trampoline does not re-enter the entry");
        assert_eq!(native_calls(), 3);

        let second = DetourBinding::new(NativeAddress::new(other as usize));
        let err = second.install(Arc::new(|_: NativeAddress, _: u16, _: bool| {})).expect_err("route is taken");
        assert!(err.to_string().contains("already active"));
        let err = binding.install(Arc::new(|_: NativeAddress, _: u16, _: bool| {})).expect_err("installed");
        assert!(err.to_string().contains("already installed once"));

        binding.set_enabled(false).expect("disable detour");
        assert!(!binding.is_enabled());
        engine_call(target, 3, true);
        assert_eq!(routed.load(Ordering::SeqCst), 1, "disabled: the entry is bypassed");
        assert_eq!(native_calls(), 4);

        binding.set_enabled(true).expect("enable detour");
        engine_call(target, 3, true);
        assert_eq!(routed.load(Ordering::SeqCst), 2);
        assert_eq!(native_calls(), 5);

        binding.teardown().expect("teardown");
        assert!(!binding.is_enabled());
        assert!(ACTIVE.read().unwrap_or_else(PoisonError::into_inner).is_none(), "route cleared");
        engine_call(target, 9, false);
        assert_eq!(routed.load(Ordering::SeqCst), 2, "torn down: the entry is never reached again");
        assert_eq!(native_calls(), 6);
        binding.invoke_original(NativeAddress::NULL, 9, false);
        assert_eq!(native_calls(), 7, "released: invoke_original falls back to the raw target");

        assert!(binding.teardown().is_err(), "the trampoline is already released");
        let err = binding.install(Arc::new(|_: NativeAddress, _: u16, _: bool| {})).expect_err("never re-created");
        assert!(err.to_string().contains("already installed once"));

        second.install(Arc::new(|_: NativeAddress, _: u16, _: bool| {})).expect("route is free again");
        engine_call(other, 1, true);
        assert_eq!(OTHER_CALLS.load(Ordering::SeqCst), 0, "second detour swallows the call");
        second.teardown().expect("teardown second");
        engine_call(other, 1, true);
        assert_eq!(OTHER_CALLS.load(Ordering::SeqCst), 1);
    }
}
