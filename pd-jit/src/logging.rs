use std::fmt;
use std::sync::OnceLock;

use owo_colors::OwoColorize;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

use crate::gate::GateDecision;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the stderr subscriber. `RUST_LOG` overrides the `info` default.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = detect_ansi();
    let _ = ANSI_ENABLED.set(ansi);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

/// Leading label of a log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Category {
    Gate,
    Patch,
    Memory,
}

impl Category {
    fn name(self) -> &'static str {
        match self {
            Category::Gate => "GATE",
            Category::Patch => "PATCH",
            Category::Memory => "MEMORY",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if !ansi_enabled() {
            return f.write_str(name);
        }
        match self {
            Category::Gate => write!(f, "{}", name.bright_green().bold()),
            Category::Patch => write!(f, "{}", name.bright_magenta().bold()),
            Category::Memory => write!(f, "{}", name.bright_cyan().bold()),
        }
    }
}

pub(crate) fn decision_label(decision: GateDecision) -> String {
    let name = decision.name();
    if !ansi_enabled() {
        return name.to_string();
    }

    match decision {
        GateDecision::Compile => format!("{}", name.bright_green()),
        GateDecision::Okay => format!("{}", name.bright_blue()),
        GateDecision::Skip => format!("{}", name.bright_white()),
        GateDecision::Abort => format!("{}", name.bright_red()),
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        let _ = enable_ansi_support();
        return true;
    }
    enable_ansi_support().is_ok() || supports_color::on_cached(Stream::Stderr).is_some()
}

#[cfg(windows)]
fn enable_ansi_support() -> windows::core::Result<()> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        CONSOLE_MODE, ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle,
        STD_ERROR_HANDLE, SetConsoleMode,
    };

    unsafe {
        let stderr = GetStdHandle(STD_ERROR_HANDLE)?;
        if stderr == HANDLE::default() {
            return Ok(());
        }
        let mut mode = CONSOLE_MODE::default();
        GetConsoleMode(stderr, &mut mode)?;
        SetConsoleMode(stderr, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING)
    }
}

#[cfg(not(windows))]
fn enable_ansi_support() -> Result<(), ()> {
    Err(())
}
