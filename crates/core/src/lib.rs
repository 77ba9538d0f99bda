//! Core types for the OHLA run-time infrastructure.
//!
//! This crate provides the handle types, integer logical time, the FDD
//! catalog, configuration and logging setup shared by the federation
//! execution coordinator.

pub mod config;
pub mod fdd;
pub mod handles;
pub mod logging;
pub mod time;

pub use config::{ConfigError, LoggingConfig, RtiConfig, SaveBackend, SaveConfig, TimeConfig};
pub use fdd::{
    AttributeDefinition, Fdd, FddBuilder, FddError, InteractionClass, ObjectClass, OrderType,
    ParameterDefinition, PRIVILEGE_TO_DELETE, PRIVILEGE_TO_DELETE_OBJECT,
};
pub use handles::{
    AllocatedHandle, AttributeHandle, FederateHandle, HandleAllocator, InteractionClassHandle,
    MessageRetractionHandle, ObjectClassHandle, ObjectInstanceHandle, ParameterHandle,
    RegionHandle,
};
pub use time::{LogicalTime, LogicalTimeInterval};
