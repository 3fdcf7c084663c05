//! WASI preview1 ABI types and constants
//!
//! Everything the bridge writes into guest memory is encoded here, so the
//! little-endian layouts live in one place.

use std::fmt;

/// Import module namespace
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Required export names
pub mod exports {
    /// The linear memory export name
    pub const MEMORY: &str = "memory";
    /// The command entry point
    pub const START: &str = "_start";
}

/// Standard file descriptors
pub mod fd {
    pub const STDIN: u32 = 0;
    pub const STDOUT: u32 = 1;
    pub const STDERR: u32 = 2;
    /// The single preopened root directory
    pub const PREOPEN: u32 = 3;
}

/// Clock ids accepted by `clock_time_get`
pub mod clock {
    pub const REALTIME: u32 = 0;
    pub const MONOTONIC: u32 = 1;
    pub const PROCESS_CPUTIME: u32 = 2;
    pub const THREAD_CPUTIME: u32 = 3;
}

/// Rights bits (only the ones the bridge inspects)
pub mod rights {
    pub const FD_READ: u64 = 1 << 1;
    pub const FD_SEEK: u64 = 1 << 2;
    pub const FD_WRITE: u64 = 1 << 6;
    pub const ALL: u64 = (1 << 30) - 1;
}

/// Error codes returned by syscalls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Errno {
    Success = 0,
    Acces = 2,
    Badf = 8,
    Exist = 20,
    Inval = 28,
    Io = 29,
    Isdir = 31,
    Noent = 44,
    Nosys = 52,
    Notdir = 54,
    Notempty = 55,
    Notsup = 58,
    Overflow = 61,
    Perm = 63,
    Rofs = 69,
    Spipe = 70,
    Notcapable = 76,
}

impl Errno {
    /// Value handed back to the guest
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            2 => Some(Self::Acces),
            8 => Some(Self::Badf),
            20 => Some(Self::Exist),
            28 => Some(Self::Inval),
            29 => Some(Self::Io),
            31 => Some(Self::Isdir),
            44 => Some(Self::Noent),
            52 => Some(Self::Nosys),
            54 => Some(Self::Notdir),
            55 => Some(Self::Notempty),
            58 => Some(Self::Notsup),
            61 => Some(Self::Overflow),
            63 => Some(Self::Perm),
            69 => Some(Self::Rofs),
            70 => Some(Self::Spipe),
            76 => Some(Self::Notcapable),
            _ => None,
        }
    }

    /// Map a host I/O failure onto the closest guest-visible code.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::Noent,
            ErrorKind::PermissionDenied => Self::Acces,
            ErrorKind::AlreadyExists => Self::Exist,
            ErrorKind::InvalidInput => Self::Inval,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.raw())
    }
}

/// File type byte used in filestat, fdstat and dirent records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Filetype {
    #[default]
    Unknown = 0,
    BlockDevice = 1,
    CharacterDevice = 2,
    Directory = 3,
    RegularFile = 4,
    SocketDgram = 5,
    SocketStream = 6,
    SymbolicLink = 7,
}

impl Filetype {
    pub fn is_dir(self) -> bool {
        self == Filetype::Directory
    }
}

/// `path_open` oflags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OFlags(pub u16);

impl OFlags {
    pub const CREAT: OFlags = OFlags(1 << 0);
    pub const DIRECTORY: OFlags = OFlags(1 << 1);
    pub const EXCL: OFlags = OFlags(1 << 2);
    pub const TRUNC: OFlags = OFlags(1 << 3);

    pub fn contains(self, other: OFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Descriptor flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdFlags(pub u16);

impl FdFlags {
    pub const APPEND: FdFlags = FdFlags(1 << 0);
    pub const DSYNC: FdFlags = FdFlags(1 << 1);
    pub const NONBLOCK: FdFlags = FdFlags(1 << 2);
    pub const RSYNC: FdFlags = FdFlags(1 << 3);
    pub const SYNC: FdFlags = FdFlags(1 << 4);

    pub fn contains(self, other: FdFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// Access pattern hint passed to `fd_advise`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Sequential,
    Random,
    WillNeed,
    DontNeed,
    NoReuse,
}

impl Advice {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Advice::Normal),
            1 => Some(Advice::Sequential),
            2 => Some(Advice::Random),
            3 => Some(Advice::WillNeed),
            4 => Some(Advice::DontNeed),
            5 => Some(Advice::NoReuse),
            _ => None,
        }
    }
}

/// File attributes (64 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: Filetype,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Filestat {
    pub const SIZE: usize = 64;

    pub fn new(filetype: Filetype, ino: u64, size: u64) -> Self {
        Self {
            filetype,
            ino,
            size,
            nlink: 1,
            ..Self::default()
        }
    }

    /// Serialize to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.dev.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ino.to_le_bytes());
        buf[16] = self.filetype as u8;
        buf[24..32].copy_from_slice(&self.nlink.to_le_bytes());
        buf[32..40].copy_from_slice(&self.size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.atim.to_le_bytes());
        buf[48..56].copy_from_slice(&self.mtim.to_le_bytes());
        buf[56..64].copy_from_slice(&self.ctim.to_le_bytes());
        buf
    }
}

/// Descriptor attributes (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fdstat {
    pub filetype: Filetype,
    pub flags: FdFlags,
    pub rights_base: u64,
    pub rights_inheriting: u64,
}

impl Fdstat {
    pub const SIZE: usize = 24;

    pub fn new(filetype: Filetype) -> Self {
        Self {
            filetype,
            flags: FdFlags::default(),
            rights_base: rights::ALL,
            rights_inheriting: rights::ALL,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.filetype as u8;
        buf[2..4].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.rights_base.to_le_bytes());
        buf[16..24].copy_from_slice(&self.rights_inheriting.to_le_bytes());
        buf
    }
}

/// Preopened directory description (8 bytes, tag 0 = directory)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prestat {
    pub name_len: u32,
}

impl Prestat {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[4..8].copy_from_slice(&self.name_len.to_le_bytes());
        buf
    }
}

/// One directory entry: a 24-byte header followed by the name bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Cookie of the entry after this one
    pub next: u64,
    pub ino: u64,
    pub filetype: Filetype,
    pub name: String,
}

impl Dirent {
    pub const HEADER_SIZE: usize = 24;

    pub fn header_bytes(&self) -> [u8; Self::HEADER_SIZE] {
        let mut buf = [0u8; Self::HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.next.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ino.to_le_bytes());
        buf[16..20].copy_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf[20] = self.filetype as u8;
        buf
    }
}

/// A guest (pointer, length) pair (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub ptr: u32,
    pub len: u32,
}

impl IoVec {
    pub const SIZE: usize = 8;

    pub fn from_bytes(buf: [u8; Self::SIZE]) -> Self {
        Self {
            ptr: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes() {
        assert_eq!(Errno::Success.raw(), 0);
        assert_eq!(Errno::Badf.raw(), 8);
        assert_eq!(Errno::Noent.raw(), 44);
        assert_eq!(Errno::Perm.raw(), 63);
        assert_eq!(Errno::from_raw(31), Some(Errno::Isdir));
        assert_eq!(Errno::from_raw(1000), None);
    }

    #[test]
    fn test_filestat_layout() {
        let stat = Filestat::new(Filetype::RegularFile, 9, 1234);
        let bytes = stat.to_bytes();
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 9);
        assert_eq!(bytes[16], 4);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 1234);
    }

    #[test]
    fn test_dirent_header_layout() {
        let dirent = Dirent {
            next: 2,
            ino: 77,
            filetype: Filetype::Directory,
            name: "sub".to_string(),
        };
        let header = dirent.header_bytes();
        assert_eq!(u64::from_le_bytes(header[0..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(header[16..20].try_into().unwrap()), 3);
        assert_eq!(header[20], Filetype::Directory as u8);
    }

    #[test]
    fn test_prestat_layout() {
        let bytes = Prestat { name_len: 5 }.to_bytes();
        assert_eq!(bytes[0], 0);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 5);
    }

    #[test]
    fn test_oflags() {
        let flags = OFlags(OFlags::CREAT.0 | OFlags::TRUNC.0);
        assert!(flags.contains(OFlags::CREAT));
        assert!(flags.contains(OFlags::TRUNC));
        assert!(!flags.contains(OFlags::EXCL));
    }
}
