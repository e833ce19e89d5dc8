use crate::model::NativeAddress;
use anyhow::Result;
use std::ffi::c_void;
use std::sync::Arc;

/// Signature of the engine's native setup-visor routine.
pub type SetupVisorFn = unsafe extern "C" fn(human: *mut c_void, model_id: u16, on: bool);

/// Callback every intercepted native call is routed to.
pub type NativeEntry = Arc<dyn Fn(NativeAddress, u16, bool) + Send + Sync>;

/// Capability to intercept the native setup-visor routine and call through to the original.
///
/// The production implementation is [`crate::detour::DetourBinding`] (feature `native-detour`);
/// [`crate::recorder::RecordingUpdater`] stands in for the engine in tests and diagnostics.
pub trait NativeVisorUpdater: Send + Sync {
    /// Routes every native call to `entry` and enables interception.
    fn install(&self, entry: NativeEntry) -> Result<()>;

    /// Calls the pre-hook implementation. Must not re-enter `entry`.
    fn invoke_original(&self, address: NativeAddress, model_id: u16, on: bool);

    fn set_enabled(&self, enabled: bool) -> Result<()>;

    fn is_enabled(&self) -> bool;

    /// Disables and releases the interception. Called exactly once, by the owning service.
    fn teardown(&self) -> Result<()>;
}

impl<T: NativeVisorUpdater + ?Sized> NativeVisorUpdater for Arc<T> {
    fn install(&self, entry: NativeEntry) -> Result<()> {
        (**self).install(entry)
    }

    fn invoke_original(&self, address: NativeAddress, model_id: u16, on: bool) {
        (**self).invoke_original(address, model_id, on)
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        (**self).set_enabled(enabled)
    }

    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn teardown(&self) -> Result<()> {
        (**self).teardown()
    }
}
