use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::code::JitCode;
use crate::encoder::Arch;
use crate::error::{JitError, JitResult};
use crate::logging::{Category, decision_label};

pub const CALLS_BEFORE_COMPILE: u32 = 16;
pub const BACKEDGES_BEFORE_COMPILE: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    Normal,
    Constructing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JitStatus {
    None,
    Invalid,
    Compiled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Never ask again for this script and convention.
    Abort,
    /// Keep interpreting; the counter has not crossed its threshold.
    Skip,
    /// Code was compiled and installed by this evaluation.
    Compile,
    /// Code was already installed.
    Okay,
}

impl GateDecision {
    pub fn name(self) -> &'static str {
        match self {
            GateDecision::Abort => "abort",
            GateDecision::Skip => "skip",
            GateDecision::Compile => "compile",
            GateDecision::Okay => "okay",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileFailure {
    /// The script uses something the backend refuses; never retried.
    Uncompileable(String),
    /// Emission or publication failed; a later trigger may retry.
    Resource(JitError),
}

impl From<JitError> for CompileFailure {
    fn from(err: JitError) -> Self {
        match err {
            JitError::Uncompileable(reason) => CompileFailure::Uncompileable(reason),
            other => CompileFailure::Resource(other),
        }
    }
}

impl std::fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileFailure::Uncompileable(reason) => write!(f, "uncompileable: {reason}"),
            CompileFailure::Resource(err) => write!(f, "{err}"),
        }
    }
}

/// The code generator, as seen by the gate.
pub trait MethodCompiler {
    fn compile(
        &self,
        script: &Script,
        convention: CallingConvention,
    ) -> Result<JitCode, CompileFailure>;
}

impl<F> MethodCompiler for F
where
    F: Fn(&Script, CallingConvention) -> Result<JitCode, CompileFailure>,
{
    fn compile(
        &self,
        script: &Script,
        convention: CallingConvention,
    ) -> Result<JitCode, CompileFailure> {
        self(script, convention)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateConfig {
    pub enabled: bool,
    /// Compile on the first evaluation instead of waiting for a threshold.
    pub always_compile: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: method_jit_supported(),
            always_compile: false,
        }
    }
}

impl GateConfig {
    /// Defaults overridden by `PD_JIT_DISABLE` and `PD_JIT_ALWAYS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env_flag("PD_JIT_DISABLE") {
            config.enabled = false;
        }
        if env_flag("PD_JIT_ALWAYS") {
            config.always_compile = true;
        }
        config
    }
}

fn env_flag(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => !matches!(value.trim(), "" | "0" | "false" | "no" | "off"),
        Err(_) => false,
    }
}

fn method_jit_supported() -> bool {
    Arch::host().is_some() && (cfg!(unix) || cfg!(target_os = "windows"))
}

enum CompiledSlot {
    Empty,
    Invalid(String),
    Compiled(Arc<JitCode>),
}

impl CompiledSlot {
    fn status(&self) -> JitStatus {
        match self {
            CompiledSlot::Empty => JitStatus::None,
            CompiledSlot::Invalid(_) => JitStatus::Invalid,
            CompiledSlot::Compiled(_) => JitStatus::Compiled,
        }
    }
}

/// Per-script compilation state: call and back-edge counters plus one
/// compiled-code record per calling convention.
///
/// Counter increments from concurrent threads are not coordinated beyond
/// atomicity; an occasional duplicate compile trigger is tolerated.
pub struct Script {
    name: String,
    call_count: AtomicU32,
    back_edges: Mutex<HashMap<usize, u32>>,
    normal: RwLock<CompiledSlot>,
    constructing: RwLock<CompiledSlot>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("call_count", &self.call_count())
            .field("normal", &self.jit_status(CallingConvention::Normal))
            .field(
                "constructing",
                &self.jit_status(CallingConvention::Constructing),
            )
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScriptJitInfo {
    pub name: String,
    pub call_count: u32,
    pub back_edges: BTreeMap<usize, u32>,
    pub normal: JitStatus,
    pub constructing: JitStatus,
}

impl Script {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            call_count: AtomicU32::new(0),
            back_edges: Mutex::new(HashMap::new()),
            normal: RwLock::new(CompiledSlot::Empty),
            constructing: RwLock::new(CompiledSlot::Empty),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn slot(&self, convention: CallingConvention) -> &RwLock<CompiledSlot> {
        match convention {
            CallingConvention::Normal => &self.normal,
            CallingConvention::Constructing => &self.constructing,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn back_edge_count(&self, pc: usize) -> u32 {
        self.back_edges
            .lock()
            .expect("back-edge counter lock poisoned")
            .get(&pc)
            .copied()
            .unwrap_or(0)
    }

    /// Bumps the call counter, saturating at `u32::MAX`. Returns the new value.
    pub fn inc_call_count(&self) -> u32 {
        let previous = self
            .call_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        previous.saturating_add(1)
    }

    /// Bumps the counter of the loop entered at `pc`, saturating at `u32::MAX`.
    pub fn inc_back_edge_count(&self, pc: usize) -> u32 {
        let mut counters = self
            .back_edges
            .lock()
            .expect("back-edge counter lock poisoned");
        let count = counters.entry(pc).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset_counters(&self) {
        self.call_count.store(0, Ordering::Relaxed);
        self.back_edges
            .lock()
            .expect("back-edge counter lock poisoned")
            .clear();
    }

    pub fn jit_status(&self, convention: CallingConvention) -> JitStatus {
        self.slot(convention)
            .read()
            .expect("compiled slot lock poisoned")
            .status()
    }

    pub fn compiled(&self, convention: CallingConvention) -> Option<Arc<JitCode>> {
        match &*self.slot(convention).read().expect("compiled slot lock poisoned") {
            CompiledSlot::Compiled(code) => Some(Arc::clone(code)),
            _ => None,
        }
    }

    pub fn uncompileable_reason(&self, convention: CallingConvention) -> Option<String> {
        match &*self.slot(convention).read().expect("compiled slot lock poisoned") {
            CompiledSlot::Invalid(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Links published code as the active record. When another thread got
    /// there first, its record is kept and returned.
    pub fn install(&self, convention: CallingConvention, code: JitCode) -> Arc<JitCode> {
        let mut slot = self
            .slot(convention)
            .write()
            .expect("compiled slot lock poisoned");
        if let CompiledSlot::Compiled(existing) = &*slot {
            return Arc::clone(existing);
        }
        let code = Arc::new(code);
        *slot = CompiledSlot::Compiled(Arc::clone(&code));
        code
    }

    pub fn mark_uncompileable(&self, convention: CallingConvention, reason: impl Into<String>) {
        *self
            .slot(convention)
            .write()
            .expect("compiled slot lock poisoned") = CompiledSlot::Invalid(reason.into());
    }

    /// Drops both compiled records. Their regions are released once the last
    /// outstanding holder lets go. Uncompileable marks are kept.
    pub fn invalidate(&self) -> usize {
        let mut dropped = 0;
        for convention in [CallingConvention::Normal, CallingConvention::Constructing] {
            let mut slot = self
                .slot(convention)
                .write()
                .expect("compiled slot lock poisoned");
            if let CompiledSlot::Compiled(_) = &*slot {
                *slot = CompiledSlot::Empty;
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(
                "{} invalidated {dropped} compiled record(s) of {}",
                Category::Gate,
                self.name
            );
        }
        dropped
    }

    pub fn info(&self) -> ScriptJitInfo {
        let back_edges = self
            .back_edges
            .lock()
            .expect("back-edge counter lock poisoned")
            .iter()
            .map(|(pc, count)| (*pc, *count))
            .collect();
        ScriptJitInfo {
            name: self.name.clone(),
            call_count: self.call_count(),
            back_edges,
            normal: self.jit_status(CallingConvention::Normal),
            constructing: self.jit_status(CallingConvention::Constructing),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_call_count(&self, count: u32) {
        self.call_count.store(count, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub evaluations: u64,
    pub skipped: u64,
    pub compiled: u64,
    pub aborted: u64,
    pub failed: u64,
}

#[derive(Default)]
struct GateCounters {
    evaluations: AtomicU64,
    skipped: AtomicU64,
    compiled: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
}

/// Decides at calls and loop back-edges whether a script should be compiled.
pub struct CompilationGate<C> {
    config: GateConfig,
    compiler: C,
    counters: GateCounters,
}

impl<C: MethodCompiler> CompilationGate<C> {
    pub fn new(config: GateConfig, compiler: C) -> Self {
        Self {
            config,
            compiler,
            counters: GateCounters::default(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn evaluate_at_call(
        &self,
        script: &Script,
        convention: CallingConvention,
    ) -> JitResult<GateDecision> {
        self.evaluate(script, convention, || {
            let count = script.inc_call_count();
            (count <= CALLS_BEFORE_COMPILE, count)
        })
    }

    /// Same contract as [`Self::evaluate_at_call`], counted per loop entry `pc`.
    pub fn evaluate_at_back_edge(
        &self,
        script: &Script,
        convention: CallingConvention,
        pc: usize,
    ) -> JitResult<GateDecision> {
        self.evaluate(script, convention, || {
            let count = script.inc_back_edge_count(pc);
            (count <= BACKEDGES_BEFORE_COMPILE, count)
        })
    }

    fn evaluate(
        &self,
        script: &Script,
        convention: CallingConvention,
        below_threshold: impl FnOnce() -> (bool, u32),
    ) -> JitResult<GateDecision> {
        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return Ok(self.abort());
        }
        match script.jit_status(convention) {
            JitStatus::Invalid => return Ok(self.abort()),
            JitStatus::Compiled => return Ok(GateDecision::Okay),
            JitStatus::None => {}
        }
        if !self.config.always_compile {
            let (skip, count) = below_threshold();
            if skip {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(GateDecision::Skip);
            }
            debug!(
                "{} {} crossed its threshold at count {count}",
                Category::Gate,
                script.name()
            );
        }
        self.try_compile(script, convention)
    }

    fn abort(&self) -> GateDecision {
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        GateDecision::Abort
    }

    fn try_compile(
        &self,
        script: &Script,
        convention: CallingConvention,
    ) -> JitResult<GateDecision> {
        match self.compiler.compile(script, convention) {
            Ok(code) => {
                let code = script.install(convention, code);
                self.counters.compiled.fetch_add(1, Ordering::Relaxed);
                info!(
                    "{} {} {} ({:?}) at 0x{:x}, {} bytes",
                    Category::Gate,
                    decision_label(GateDecision::Compile),
                    script.name(),
                    convention,
                    code.entry_address(),
                    code.region().code_len()
                );
                Ok(GateDecision::Compile)
            }
            Err(CompileFailure::Uncompileable(reason)) => {
                warn!(
                    "{} {} {} ({:?}): {reason}",
                    Category::Gate,
                    decision_label(GateDecision::Abort),
                    script.name(),
                    convention
                );
                script.mark_uncompileable(convention, reason);
                Ok(self.abort())
            }
            Err(CompileFailure::Resource(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} compiling {} ({:?}) failed: {err}",
                    Category::Gate,
                    script.name(),
                    convention
                );
                Err(err)
            }
        }
    }

    /// Compiles regardless of counters, e.g. for a debugger or test harness.
    pub fn force_compile(
        &self,
        script: &Script,
        convention: CallingConvention,
    ) -> JitResult<Arc<JitCode>> {
        if !self.config.enabled {
            return Err(JitError::Disabled);
        }
        if let Some(reason) = script.uncompileable_reason(convention) {
            return Err(JitError::Uncompileable(reason));
        }
        if let Some(code) = script.compiled(convention) {
            return Ok(code);
        }
        match self.try_compile(script, convention)? {
            GateDecision::Compile => script.compiled(convention).ok_or(JitError::OutOfMemory),
            _ => Err(JitError::Uncompileable(
                script.uncompileable_reason(convention).unwrap_or_default(),
            )),
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            evaluations: self.counters.evaluations.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            compiled: self.counters.compiled.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
