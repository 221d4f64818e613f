//! The `Executor` contract: the abstract capability for running a single
//! process step over a mounted rootfs. The concrete rootless backend
//! (user-namespaced process runner + overlay snapshotter) is deliberately
//! out of scope for this crate — callers supply an implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::dockerfile::Mount;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Step {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub user: Option<String>,
    pub mounts: Vec<Mount>,
    pub platform: Option<String>,
    pub network_mode: Option<String>,
    pub security_mode: Option<String>,
}

/// A content-addressable filesystem diff produced by one `Step`. The
/// executor hands back an opaque byte stream; the layer assembler turns
/// it into a canonical tar.
#[derive(Debug, Clone)]
pub struct ProducedDiff {
    pub tar_bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub produced_diff: ProducedDiff,
}

/// Runs process steps in a user-namespaced, unprivileged environment.
/// Implementations must never run as root, must honor the declared
/// platform or refuse, must stage `mounts` in the requested order, and
/// must never let secret/ssh mount contents leak into the produced diff.
/// Stateless between calls: the Solver owns the lifecycle.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, step: Step, cancel: CancelToken) -> Result<StepResult>;
}
