//! Scripted replay of visor requests against a simulated draw object.
//!
//! A fixture describes the initial object, a chain of override subscribers and a list of steps;
//! the output records what every step returned and which native calls it produced.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::VisorStateChanged;
use crate::model::{CharacterArmor, EquipSlot, ModelLayout};
use crate::recorder::{NativeCall, RecordingUpdater, SimulatedDrawObject};
use crate::visor::VisorService;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Unrelated,
    CharacterBase,
    Human,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideRule {
    ForceOn,
    ForceOff,
    Invert,
    Identity,
}

impl OverrideRule {
    fn apply(self, proposed: bool) -> bool {
        match self {
            OverrideRule::ForceOn => true,
            OverrideRule::ForceOff => false,
            OverrideRule::Invert => !proposed,
            OverrideRule::Identity => proposed,
        }
    }

    fn label(self) -> &'static str {
        match self {
            OverrideRule::ForceOn => "force_on",
            OverrideRule::ForceOff => "force_off",
            OverrideRule::Invert => "invert",
            OverrideRule::Identity => "identity",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayStep {
    /// The engine toggles the visor on its own.
    Native {
        on: bool,
        #[serde(default)]
        model_id: Option<u16>,
    },
    /// Another subsystem sets the visor manually.
    Set { on: bool },
    Get,
    Intercept { enabled: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayFixture {
    #[serde(default = "default_object")]
    pub object: ObjectKind,
    #[serde(default)]
    pub visor: bool,
    #[serde(default = "default_head_set")]
    pub head_set: u16,
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
    pub steps: Vec<ReplayStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayOutput {
    pub overrides: Vec<String>,
    pub results: Vec<StepResult>,
    pub final_visor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned: Option<bool>,
    pub visor_after: bool,
    pub native_calls: Vec<CallSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallSummary {
    pub model_id: u16,
    pub on: bool,
    /// Status byte seen by the original routine, absent for non character bases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_byte: Option<u8>,
}

impl From<&NativeCall> for CallSummary {
    fn from(call: &NativeCall) -> Self {
        Self { model_id: call.model_id, on: call.on, state_byte: call.state_flags.map(|flags| flags.bits()) }
    }
}

fn default_object() -> ObjectKind {
    ObjectKind::Human
}

const fn default_head_set() -> u16 {
    1
}

pub fn load_fixture(path: &Path) -> Result<ReplayFixture> {
    let file = File::open(path).with_context(|| format!("opening replay fixture '{}'", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("parsing replay fixture '{}'", path.display()))
}

/// Runs every step against a fresh object and service. `intercept` is the initial interception state.
pub fn run_fixture(fixture: &ReplayFixture, layout: &ModelLayout, intercept: bool) -> Result<ReplayOutput> {
    let object = match fixture.object {
        ObjectKind::Unrelated => SimulatedDrawObject::unrelated(layout),
        ObjectKind::CharacterBase => SimulatedDrawObject::character_base(layout),
        ObjectKind::Human => SimulatedDrawObject::human(layout),
    };
    object.equip(EquipSlot::Head, CharacterArmor { set: fixture.head_set, variant: 1, stain: 0 });
    object.set_visor_bit(fixture.visor);

    let event = Arc::new(VisorStateChanged::new());
    for rule in &fixture.overrides {
        let rule = *rule;
        event.subscribe(rule.label(), move |_, proposed| rule.apply(proposed));
    }

    let service = VisorService::new(RecordingUpdater::new(layout), layout.clone(), event.clone())
        .context("installing replay service")?;
    service.set_interception(intercept)?;

    let mut results = Vec::with_capacity(fixture.steps.len());
    for (index, step) in fixture.steps.iter().enumerate() {
        let updater = service.updater();
        updater.clear_calls();
        let (kind, returned) = match *step {
            ReplayStep::Native { on, model_id } => {
                updater.fire(object.address(), model_id.unwrap_or(fixture.head_set), on);
                ("native", None)
            }
            ReplayStep::Set { on } => ("set", Some(service.set_visor_state(object.model(), on))),
            ReplayStep::Get => ("get", Some(service.get_visor_state(object.model()))),
            ReplayStep::Intercept { enabled } => {
                service.set_interception(enabled).with_context(|| format!("replay step {index}"))?;
                ("intercept", None)
            }
        };
        results.push(StepResult {
            step: index,
            kind: kind.to_string(),
            returned,
            visor_after: service.get_visor_state(object.model()),
            native_calls: updater.calls().iter().map(CallSummary::from).collect(),
        });
    }

    Ok(ReplayOutput {
        overrides: event.subscriber_names(),
        results,
        final_visor: service.get_visor_state(object.model()),
    })
}
