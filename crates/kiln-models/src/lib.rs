//! Checkpoint recognition, state-dict partitioning, component loading and
//! engine assembly.
//!
//! The entry point is [`EngineLoader::load_engine`]: it recognizes which
//! architecture a flat weight blob belongs to, splits it into per-component
//! state dicts, loads each pipeline component under the memory/dtype policy
//! and assembles the result into an [`Engine`].

pub mod arch;
pub mod clip;
pub mod component;
pub mod dispatcher;
pub mod engine;
pub mod factory;
pub mod formats;
pub mod partition;
pub mod repository;

pub use arch::{ArchitectureGuess, ArchitectureId, BackboneConfig, guess_architecture};
pub use component::{
    ComponentKind, ConfigComponent, KeyTolerance, LoadedComponent, Parameter,
};
pub use dispatcher::{BuiltComponent, load_component};
pub use engine::{ComponentOutcome, Engine, EngineKind, EngineLoader, LoadReport, select_engine};
pub use factory::{BuildRequest, ComponentFactory, ModuleSkeleton, ParameterRole, ParameterSpec, StaticFactory};
pub use formats::{read_weight_blob, write_weight_blob};
pub use partition::{PartitionedStateDicts, recognize, split_state_dict};
pub use repository::{ArchitectureRepository, ComponentSpec, DiskRepository, StaticRepository};
