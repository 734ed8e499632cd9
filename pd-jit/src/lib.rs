pub mod buffer;
pub mod code;
pub mod encoder;
pub mod error;
pub mod gate;
pub mod memory;
pub mod repatch;
pub mod site;

mod logging;

pub use buffer::{
    BranchTarget, CodeBuffer, FinalizedCode, MAX_POOL_ENTRIES, PoolValue, Relocation,
    RelocationKind,
};
pub use code::{CodeSummary, JitCode};
pub use encoder::{Arch, InstructionEncoder};
pub use error::{JitError, JitResult};
pub use gate::{
    BACKEDGES_BEFORE_COMPILE, CALLS_BEFORE_COMPILE, CallingConvention, CompilationGate,
    CompileFailure, GateConfig, GateDecision, GateStats, JitStatus, MethodCompiler, Script,
    ScriptJitInfo,
};
pub use logging::init as init_logging;
pub use memory::{
    AllocatorConfig, AllocatorStats, ExecutableAllocator, ExecutableRegion, PendingRegion,
    Protection, ProtectionTransitions, WriteGuard, page_size, round_up_allocation_size,
};
pub use repatch::RepatchBuffer;
pub use site::{EncodingForm, Label, PatchSite, ReturnAddress, SiteGeometry, SiteKind};
