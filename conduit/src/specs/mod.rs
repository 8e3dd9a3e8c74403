//! Pipeline discovery, executable resolution and hashing.
//!
//! Discovery walks the root directory for `pipeline-spec.yaml` and
//! `<kind>.source-spec.yaml` files, resolves every step to an executable,
//! hashes the result into a Merkle chain and reports one [`SpecOutcome`] per
//! pipeline.

pub mod discovery;
pub mod generator;
pub mod hasher;
pub mod model;
pub mod parser;
pub mod resolver;

pub use discovery::{Discovery, DiscoveryOptions};
pub use generator::{Generated, GeneratorError, GeneratorRegistry, SourceGenerator};
pub use hasher::{canonical_json, hash_step, ArtifactSource, LocalArtifacts};
pub use model::{
    DependencyDef, InvalidSpec, PipelineDetails, PipelineSpec, ScheduleDef, SpecOutcome, Step,
    StepDef,
};
pub use parser::{find_spec_files, pipeline_id, SpecFile, PIPELINE_SPEC_FILE, SOURCE_SPEC_SUFFIX};
pub use resolver::ExecutableResolver;
