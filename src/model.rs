use anyhow::{bail, Result};
use bitflags::bitflags;
use serde::Deserialize;
use std::fmt;
use std::mem;
use std::ptr;

/// Address of an engine-owned object. Never owned, freed or retained by this crate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeAddress(usize);

impl NativeAddress {
    pub const NULL: Self = Self(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    fn offset(self, offset: usize) -> usize {
        self.0.wrapping_add(offset)
    }
}

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

bitflags! {
    /// Status byte of a character base draw object.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StateFlags: u8 {
        /// Visible visor toggle. The native setup routine never writes this bit.
        const VISOR_TOGGLED = 0x40;
        /// Set by the engine while a visor change is pending, cleared by the native setup routine.
        const VISOR_CHANGING = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EquipSlot {
    Head,
    Body,
    Hands,
    Legs,
    Feet,
    Ears,
    Neck,
    Wrists,
    RFinger,
    LFinger,
}

impl EquipSlot {
    pub const ALL: [EquipSlot; 10] = [
        EquipSlot::Head,
        EquipSlot::Body,
        EquipSlot::Hands,
        EquipSlot::Legs,
        EquipSlot::Feet,
        EquipSlot::Ears,
        EquipSlot::Neck,
        EquipSlot::Wrists,
        EquipSlot::RFinger,
        EquipSlot::LFinger,
    ];

    /// Position of the slot inside the human's armour array.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            EquipSlot::Head => "Head",
            EquipSlot::Body => "Body",
            EquipSlot::Hands => "Hands",
            EquipSlot::Legs => "Legs",
            EquipSlot::Feet => "Feet",
            EquipSlot::Ears => "Ears",
            EquipSlot::Neck => "Neck",
            EquipSlot::Wrists => "Wrists",
            EquipSlot::RFinger => "Right Finger",
            EquipSlot::LFinger => "Left Finger",
        }
    }
}

/// One entry of the human's armour array, as the engine lays it out.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CharacterArmor {
    pub set: u16,
    pub variant: u8,
    pub stain: u8,
}

/// Where the type tags, status byte and equipment live inside a draw object.
///
/// The values depend on the engine build and are loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelLayout {
    #[serde(default = "ModelLayout::default_object_type_offset")]
    pub object_type_offset: usize,
    #[serde(default = "ModelLayout::default_character_base_type")]
    pub character_base_type: u8,
    #[serde(default = "ModelLayout::default_model_type_offset")]
    pub model_type_offset: usize,
    #[serde(default = "ModelLayout::default_human_model_type")]
    pub human_model_type: u8,
    #[serde(default = "ModelLayout::default_state_flags_offset")]
    pub state_flags_offset: usize,
    #[serde(default = "ModelLayout::default_visor_flag")]
    pub visor_flag: u8,
    #[serde(default = "ModelLayout::default_visor_changing_flag")]
    pub visor_changing_flag: u8,
    #[serde(default = "ModelLayout::default_equipment_offset")]
    pub equipment_offset: usize,
}

impl ModelLayout {
    const fn default_object_type_offset() -> usize {
        0x40
    }

    const fn default_character_base_type() -> u8 {
        3
    }

    const fn default_model_type_offset() -> usize {
        0x88
    }

    const fn default_human_model_type() -> u8 {
        1
    }

    const fn default_state_flags_offset() -> usize {
        0x8A
    }

    const fn default_visor_flag() -> u8 {
        StateFlags::VISOR_TOGGLED.bits()
    }

    const fn default_visor_changing_flag() -> u8 {
        StateFlags::VISOR_CHANGING.bits()
    }

    const fn default_equipment_offset() -> usize {
        0x910
    }

    pub fn visor_bit(&self) -> StateFlags {
        StateFlags::from_bits_retain(self.visor_flag)
    }

    pub fn changing_bit(&self) -> StateFlags {
        StateFlags::from_bits_retain(self.visor_changing_flag)
    }

    /// Smallest object size that covers every field this layout touches.
    pub fn span(&self) -> usize {
        let armor_end = self.equipment_offset + EquipSlot::ALL.len() * mem::size_of::<CharacterArmor>();
        [self.object_type_offset + 1, self.model_type_offset + 1, self.state_flags_offset + 1, armor_end]
            .into_iter()
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        if self.visor_flag.count_ones() != 1 {
            bail!("visor_flag must be a single bit, got 0x{:02X}", self.visor_flag);
        }
        if self.visor_flag & self.visor_changing_flag != 0 {
            bail!(
                "visor_flag 0x{:02X} overlaps visor_changing_flag 0x{:02X}",
                self.visor_flag,
                self.visor_changing_flag
            );
        }
        Ok(())
    }
}

impl Default for ModelLayout {
    fn default() -> Self {
        Self {
            object_type_offset: Self::default_object_type_offset(),
            character_base_type: Self::default_character_base_type(),
            model_type_offset: Self::default_model_type_offset(),
            human_model_type: Self::default_human_model_type(),
            state_flags_offset: Self::default_state_flags_offset(),
            visor_flag: Self::default_visor_flag(),
            visor_changing_flag: Self::default_visor_changing_flag(),
            equipment_offset: Self::default_equipment_offset(),
        }
    }
}

/// Handle to an engine draw object.
///
/// All memory access to engine objects goes through `read` and `write` below, and only after
/// a capability predicate has confirmed the kind of object behind the address.
#[derive(Clone, Copy)]
pub struct Model<'l> {
    address: NativeAddress,
    layout: &'l ModelLayout,
}

impl<'l> Model<'l> {
    /// # Safety
    /// `address` must be null or point at a live engine draw object whose memory covers
    /// `layout.span()` bytes, for as long as the returned handle is used.
    pub unsafe fn from_raw(address: NativeAddress, layout: &'l ModelLayout) -> Self {
        Self { address, layout }
    }

    pub fn address(&self) -> NativeAddress {
        self.address
    }

    pub fn layout(&self) -> &'l ModelLayout {
        self.layout
    }

    pub fn is_character_base(&self) -> bool {
        !self.address.is_null() && self.read::<u8>(self.layout.object_type_offset) == self.layout.character_base_type
    }

    pub fn is_human(&self) -> bool {
        self.is_character_base() && self.read::<u8>(self.layout.model_type_offset) == self.layout.human_model_type
    }

    /// Raw status byte, `None` unless the object is a character base.
    pub fn state_flags(&self) -> Option<StateFlags> {
        self.is_character_base().then(|| StateFlags::from_bits_retain(self.read(self.layout.state_flags_offset)))
    }

    /// Overwrites the status byte. Returns false, without writing, unless the object is a character base.
    pub(crate) fn set_state_flags(&self, flags: StateFlags) -> bool {
        if !self.is_character_base() {
            return false;
        }
        self.write(self.layout.state_flags_offset, flags.bits());
        true
    }

    pub fn armor(&self, slot: EquipSlot) -> Option<CharacterArmor> {
        if !self.is_human() {
            return None;
        }
        let offset = self.layout.equipment_offset + slot.index() * mem::size_of::<CharacterArmor>();
        Some(self.read(offset))
    }

    /// Model id of the equipped head piece.
    pub fn head_model_id(&self) -> Option<u16> {
        self.armor(EquipSlot::Head).map(|armor| armor.set)
    }

    fn read<T: Copy>(&self, offset: usize) -> T {
        // SAFETY: `from_raw` guarantees a live object covering `layout.span()`; callers only
        // pass offsets taken from the layout.
        unsafe { ptr::read_unaligned(self.address.offset(offset) as *const T) }
    }

    fn write<T: Copy>(&self, offset: usize, value: T) {
        // SAFETY: see `read`. The engine gives each object a single writer thread.
        unsafe { ptr::write_unaligned(self.address.offset(offset) as *mut T, value) }
    }
}

impl fmt::Debug for Model<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model").field("address", &self.address).finish()
    }
}
