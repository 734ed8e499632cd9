use crate::site::SiteKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    Disabled,
    Uncompileable(String),
    OutOfMemory,
    OversizeAllocation(usize),
    DisplacementOutOfRange {
        at: usize,
        target: usize,
        form: &'static str,
    },
    NotRelinkable {
        kind: SiteKind,
        site: usize,
        target: usize,
    },
    WrongSiteKind {
        expected: SiteKind,
        found: SiteKind,
    },
    AlreadyFinalized,
    UnresolvedRelocation(usize),
    InvalidSite {
        offset: usize,
        len: usize,
        region_size: usize,
    },
    UnexpectedInstruction {
        at: usize,
        expected: &'static str,
        found: u32,
    },
    Unsupported(&'static str),
    Os(String),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::Disabled => write!(f, "method jit is disabled"),
            JitError::Uncompileable(reason) => write!(f, "script is uncompileable: {reason}"),
            JitError::OutOfMemory => write!(f, "out of executable memory"),
            JitError::OversizeAllocation(size) => {
                write!(f, "allocation of {size} bytes overflows page rounding")
            }
            JitError::DisplacementOutOfRange { at, target, form } => write!(
                f,
                "{form} displacement from 0x{at:x} to 0x{target:x} is out of range"
            ),
            JitError::NotRelinkable { kind, site, target } => write!(
                f,
                "{kind:?} site at 0x{site:x} cannot be relinked to 0x{target:x}"
            ),
            JitError::WrongSiteKind { expected, found } => {
                write!(f, "expected a {expected:?} site, got {found:?}")
            }
            JitError::AlreadyFinalized => write!(f, "code buffer was already finalized"),
            JitError::UnresolvedRelocation(offset) => {
                write!(f, "relocation at offset {offset} was left unresolved")
            }
            JitError::InvalidSite {
                offset,
                len,
                region_size,
            } => write!(
                f,
                "patch site {offset}..{} lies outside region of {region_size} bytes",
                offset + len
            ),
            JitError::UnexpectedInstruction {
                at,
                expected,
                found,
            } => write!(
                f,
                "expected {expected} at offset {at}, found 0x{found:08x}"
            ),
            JitError::Unsupported(what) => write!(f, "unsupported: {what}"),
            JitError::Os(message) => write!(f, "os error: {message}"),
        }
    }
}

impl std::error::Error for JitError {}

pub type JitResult<T> = Result<T, JitError>;

pub(crate) fn last_os_error(call: &str) -> JitError {
    JitError::Os(format!("{call} failed: {}", std::io::Error::last_os_error()))
}
