//! Unified capability descriptors, the indexed registry, and the persisted
//! catalog that classifies every capability by source, power level, and
//! cognitive pattern.

pub mod catalog;
pub mod descriptor;
pub mod registry;

pub use catalog::{
    CapabilityCatalog, CatalogEntry, CognitivePattern, PowerLevel, ReconcileReport, SourceTag,
};
pub use descriptor::{
    CapabilityDescriptor, CapabilityKind, DangerLevel, ExposureScope, InvocationMode, SchemaRef,
    Substrate,
};
pub use registry::{CapabilityFilter, CapabilityRegistry, DescriptorPatch};
