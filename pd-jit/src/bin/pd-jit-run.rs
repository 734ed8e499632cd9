use std::io;

use jit::{
    Arch, BranchTarget, CallingConvention, CodeBuffer, CodeSummary, CompilationGate,
    CompileFailure, ExecutableAllocator, GateConfig, GateDecision, GateStats, JitCode, Script,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    enabled: Option<bool>,
    always_compile: bool,
    calls: u32,
    loop_iterations: u32,
    json: bool,
    help: bool,
    version: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            always_compile: false,
            calls: 20,
            loop_iterations: 0,
            json: false,
            help: false,
            version: false,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct DecisionCounts {
    abort: u32,
    skip: u32,
    compile: u32,
    okay: u32,
}

impl DecisionCounts {
    fn record(&mut self, decision: GateDecision) {
        match decision {
            GateDecision::Abort => self.abort += 1,
            GateDecision::Skip => self.skip += 1,
            GateDecision::Compile => self.compile += 1,
            GateDecision::Okay => self.okay += 1,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    script: String,
    calls: DecisionCounts,
    back_edges: DecisionCounts,
    code: Option<CodeSummary>,
    results: Vec<i32>,
    gate: GateStats,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    if cli.version {
        println!("pd-jit-run {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    jit::init_logging()?;

    let mut config = GateConfig::from_env();
    if let Some(enabled) = cli.enabled {
        config.enabled = enabled;
    }
    config.always_compile |= cli.always_compile;

    let allocator = ExecutableAllocator::default();
    let gate = CompilationGate::new(
        config,
        |script: &Script, convention: CallingConvention| -> Result<JitCode, CompileFailure> {
            compile_answer(&allocator, script, convention)
        },
    );
    let script = Script::new("answer");

    let mut calls = DecisionCounts::default();
    for _ in 0..cli.calls {
        calls.record(gate.evaluate_at_call(&script, CallingConvention::Normal)?);
    }
    let mut back_edges = DecisionCounts::default();
    for _ in 0..cli.loop_iterations {
        back_edges.record(gate.evaluate_at_back_edge(&script, CallingConvention::Normal, 0)?);
    }

    let compiled = script.compiled(CallingConvention::Normal);
    let mut results = Vec::new();
    if let Some(code) = compiled.as_deref() {
        results = exercise(code)?;
    }

    let report = RunReport {
        script: script.name().to_string(),
        calls,
        back_edges,
        code: compiled.as_deref().map(JitCode::summary),
        results,
        gate: gate.stats(),
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            "{}: calls {:?}, back-edges {:?}, results {:?}",
            report.script, report.calls, report.back_edges, report.results
        );
    }
    Ok(())
}

/// Emits a small function returning 42 through a near call, with a spare
/// block that adds 1000 for the exit jump to be relinked to.
fn compile_answer(
    allocator: &ExecutableAllocator,
    _script: &Script,
    _convention: CallingConvention,
) -> Result<JitCode, CompileFailure> {
    use jit::encoder::x86_64::{
        Reg, emit_add_eax_imm32, emit_jmp_rel32, emit_mov_imm32, emit_near_call, emit_ret,
        link_jump,
    };

    if Arch::host() != Some(Arch::X86_64) {
        return Err(CompileFailure::Uncompileable(
            "the demo generator only emits x86_64".to_string(),
        ));
    }
    let mut buf = CodeBuffer::new(Arch::X86_64.encoder());
    let body = buf.label();
    let answer = emit_mov_imm32(&mut buf, Reg::Rax, 42);
    let exit = emit_jmp_rel32(&mut buf);
    let bonus = buf.label();
    emit_add_eax_imm32(&mut buf, 1000);
    let done = buf.label();
    emit_ret(&mut buf);
    link_jump(&mut buf, exit, done)?;

    let entry = buf.label();
    let call = emit_near_call(&mut buf, BranchTarget::Label(body));
    emit_ret(&mut buf);

    let region = allocator.publish(&mut buf)?;
    Ok(JitCode::new(region, entry)
        .with_site("answer", answer)
        .with_site("exit", exit)
        .with_site("body", call)
        .with_label("bonus", bonus))
}

/// Runs the code, repatches it, and runs it again.
fn exercise(code: &JitCode) -> Result<Vec<i32>, Box<dyn std::error::Error>> {
    let mut results = vec![call_entry(code)];
    let answer = *code
        .site("answer")
        .ok_or_else(|| io::Error::other("missing answer site"))?;
    let exit = *code
        .site("exit")
        .ok_or_else(|| io::Error::other("missing exit site"))?;
    let bonus = code
        .label_address("bonus")
        .ok_or_else(|| io::Error::other("missing bonus block"))?;

    let mut patch = code.repatch()?;
    patch.repatch_int32(&answer, 7)?;
    patch.relink_jump(&exit, bonus)?;
    patch.finish()?;

    results.push(call_entry(code));
    Ok(results)
}

#[cfg(target_arch = "x86_64")]
fn call_entry(code: &JitCode) -> i32 {
    type Entry = extern "C" fn() -> i32;
    let entry = unsafe { std::mem::transmute::<usize, Entry>(code.entry_address()) };
    entry()
}

#[cfg(not(target_arch = "x86_64"))]
fn call_entry(_code: &JitCode) -> i32 {
    0
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "-V" | "--version" => {
                cfg.version = true;
                index += 1;
            }
            "-m" | "--methodjit" => {
                cfg.enabled = Some(true);
                index += 1;
            }
            "--no-methodjit" => {
                cfg.enabled = Some(false);
                index += 1;
            }
            "-a" | "--always" => {
                cfg.always_compile = true;
                index += 1;
            }
            "--json" => {
                cfg.json = true;
                index += 1;
            }
            "--calls" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --calls".to_string())?;
                cfg.calls = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --calls value '{raw}'"))?;
                index += 2;
            }
            "--loop-iterations" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --loop-iterations".to_string())?;
                cfg.loop_iterations = raw
                    .parse::<u32>()
                    .map_err(|_| format!("invalid --loop-iterations value '{raw}'"))?;
                index += 2;
            }
            value => {
                return Err(format!("unknown flag '{value}'"));
            }
        }
    }
    if cfg.enabled == Some(false) && cfg.always_compile {
        return Err("--always cannot be combined with --no-methodjit".to_string());
    }
    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  pd-jit-run [--methodjit|--no-methodjit] [--always] [--json]");
    println!("  pd-jit-run --calls <n> [--loop-iterations <n>]");
    println!("  pd-jit-run --version");
    println!();
    println!("Environment:");
    println!("  PD_JIT_DISABLE=1   disable method compilation");
    println!("  PD_JIT_ALWAYS=1    compile on the first evaluation");
    println!("  RUST_LOG=debug     show fix-up, patch and memory logs");
}
