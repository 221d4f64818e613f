//! Layer assembly: turns executor-produced diffs into canonical OCI layers
//! and accumulates them into an image config and manifest.

pub mod assembler;
pub mod oci;

pub use assembler::{assemble, LayerDescriptor};
pub use oci::{build_config, build_manifest, ImageConfigFile, ImageManifest};
