pub mod cli;
pub mod config;
#[cfg(feature = "native-detour")]
pub mod detour;
pub mod events;
pub mod hook;
pub mod model;
pub mod recorder;
pub mod replay;
pub mod visor;

pub use events::{SubscriptionId, VisorStateChanged};
pub use hook::{NativeEntry, NativeVisorUpdater, SetupVisorFn};
pub use model::{CharacterArmor, EquipSlot, Model, ModelLayout, NativeAddress, StateFlags};
pub use visor::VisorService;
