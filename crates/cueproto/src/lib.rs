//! Shared protocol and domain types for the cue fleet.
//!
//! Both processes speak the same JSON: the callboard (state server) and every
//! stagehand (deployable) exchange internally-tagged frames over one
//! websocket per device, and persist the same document types on both ends.
//! This crate holds those types plus the typed-signal coercion boundary and
//! show-logic validation. No I/O lives here.

pub mod capability;
pub mod frames;
pub mod record;
pub mod rule;
pub mod showlogic;
pub mod signal;
pub mod state;

pub use capability::{CapabilityReport, OutputCapability};
pub use frames::{AckStatus, DeviceFrame, Hello, SensorEvent, ServerFrame};
pub use record::{DeployableContext, DeployableRecord, DeployableStatus};
pub use rule::{Condition, ConditionGroup, Event, Rule, RuleAction, SourceSelector, Timing};
pub use showlogic::{
    ActionTemplate, ExecutionProfile, SensorHandler, ShowLogicDefinition, ShowLogicPackage,
    ShowState, TimerDeclaration, TimerHandler, ValidationError,
};
pub use signal::{CoerceError, SignalDefinition, SignalType, SignalValue};
pub use state::{EngineAction, GlobalState, GlobalStateUpdate, TimerEvent};
