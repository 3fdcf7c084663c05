//! Error types for the guest runtime
//!
//! Three kinds of failure leave the bridge, and they never mix:
//! guest-visible [`Errno`](super::Errno) codes are returned to the guest,
//! [`GuestFault`]s are bridge bugs or unsupported calls that trap the
//! instance, and [`GuestExit`] carries `proc_exit` out of the guest.

/// Result type for host-side runtime operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur while loading or starting guest modules
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Module binary is malformed or invalid
    #[error("invalid guest module: {reason}")]
    InvalidModule { reason: String },

    /// Required export is missing
    #[error("missing required export: '{name}'")]
    MissingExport { name: &'static str },

    /// Module instantiation failed
    #[error("module instantiation failed: {reason}")]
    InstantiationFailed { reason: String },

    /// Engine configuration or linking failed
    #[error("engine error: {reason}")]
    Engine { reason: String },

    /// I/O error reading a module or preparing a preopen
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Root archive could not be unpacked
    #[error(transparent)]
    Archive(#[from] crate::vfs::ArchiveError),
}

/// Host-side faults raised while servicing a syscall
///
/// These trap the guest instance. They indicate a bridge bug or a call the
/// host refuses to emulate, never an ordinary guest error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuestFault {
    /// Memory access out of bounds
    #[error("memory access out of bounds: address {address} + size {size} > memory size {memory_size}")]
    OutOfBounds {
        address: u32,
        size: u64,
        memory_size: u64,
    },

    /// The calling module has no exported memory
    #[error("guest module does not export its memory")]
    MissingMemory,

    /// Syscall deliberately left unimplemented
    #[error("unsupported syscall: {name}")]
    Unsupported { name: &'static str },
}

/// Raised by `proc_exit`, distinguishable from a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guest exited with code {0}")]
pub struct GuestExit(pub i32);

/// How a guest instance stopped running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// `_start` returned or the guest called `proc_exit`
    Exited(i32),
    /// The host tore the instance down
    Disposed,
    /// Any other trap or host fault
    Trapped(String),
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == Some(0)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Disposed => write!(f, "disposed by host"),
            ExitStatus::Trapped(reason) => write!(f, "trapped: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let err = GuestFault::OutOfBounds {
            address: 1000,
            size: 100,
            memory_size: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("1000"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_exit_is_recoverable_from_anyhow() {
        let err = anyhow::Error::new(GuestExit(3));
        assert_eq!(err.downcast_ref::<GuestExit>(), Some(&GuestExit(3)));
    }

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::Exited(0).is_success());
        assert_eq!(ExitStatus::Exited(2).code(), Some(2));
        assert_eq!(ExitStatus::Disposed.code(), None);
        assert_eq!(ExitStatus::Trapped("boom".into()).to_string(), "trapped: boom");
    }
}
