//! Guest runtime state and syscall implementations
//!
//! [`GuestState`] is everything one guest instance owns on the host side:
//! its fd table, argument and environment vectors, and clock origin. The
//! `wasi_snapshot_preview1` imports are methods on it that take a
//! [`GuestMemory`] view; the linker only unpacks wasm values and calls them.
//!
//! Syscalls return [`SysResult`]. A guest-visible failure is an [`Errno`]
//! the guest gets back as a return code. A [`GuestFault`] traps the guest.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use slab::Slab;

use super::abi::{clock, fd, Advice, Errno, FdFlags, OFlags, Prestat, Whence};
use super::error::GuestFault;
use super::memory::GuestMemory;
use crate::kernel::pipe::{BytePipe, LineSink};
use crate::vfs::{Descriptor, OpenOptions, Preopen};

/// Why a syscall did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysError {
    /// Returned to the guest
    Errno(Errno),
    /// Traps the guest
    Fault(GuestFault),
}

impl From<Errno> for SysError {
    fn from(errno: Errno) -> Self {
        SysError::Errno(errno)
    }
}

impl From<GuestFault> for SysError {
    fn from(fault: GuestFault) -> Self {
        SysError::Fault(fault)
    }
}

/// Result type for syscall implementations
pub type SysResult<T = ()> = Result<T, SysError>;

/// Collapse a syscall result into the code handed back to the guest
pub fn errno(result: SysResult) -> Result<Errno, GuestFault> {
    match result {
        Ok(()) => Ok(Errno::Success),
        Err(SysError::Errno(errno)) => Ok(errno),
        Err(SysError::Fault(fault)) => Err(fault),
    }
}

/// Host-side state of one guest instance
pub struct GuestState {
    /// File descriptor table
    fds: Slab<Box<dyn Descriptor>>,
    /// Argument vector, program name first
    args: Vec<String>,
    /// Environment as `KEY=value` strings
    env: Vec<String>,
    /// Origin of the monotonic clock
    started: Instant,
    /// Log every syscall at trace level
    trace: bool,
}

impl GuestState {
    pub fn builder() -> GuestStateBuilder {
        GuestStateBuilder::new()
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Install a descriptor in the lowest free slot
    pub fn insert_fd(&mut self, descriptor: Box<dyn Descriptor>) -> u32 {
        self.fds.insert(descriptor) as u32
    }

    pub fn contains_fd(&self, fd: u32) -> bool {
        self.fds.contains(fd as usize)
    }

    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    fn descriptor(&mut self, fd: u32) -> Result<&mut Box<dyn Descriptor>, Errno> {
        self.fds.get_mut(fd as usize).ok_or(Errno::Badf)
    }

    fn read_path(mem: &GuestMemory<'_>, ptr: u32, len: u32) -> SysResult<String> {
        match mem.read_str(ptr, len)? {
            Some(path) => Ok(path.to_string()),
            None => Err(Errno::Inval.into()),
        }
    }

    // =========================================================================
    // Arguments and environment
    // =========================================================================

    fn write_strings(
        mem: &mut GuestMemory<'_>,
        strings: &[String],
        list_ptr: u32,
        buf_ptr: u32,
    ) -> SysResult {
        let mut cursor = buf_ptr;
        for (i, value) in strings.iter().enumerate() {
            let slot = mem.offset(list_ptr, 4 * i as u64)?;
            mem.write_u32(slot, cursor)?;
            mem.write(cursor, value.as_bytes())?;
            let nul = mem.offset(cursor, value.len() as u64)?;
            mem.write(nul, &[0])?;
            cursor = mem.offset(nul, 1)?;
        }
        Ok(())
    }

    fn write_sizes(
        mem: &mut GuestMemory<'_>,
        strings: &[String],
        count_ptr: u32,
        size_ptr: u32,
    ) -> SysResult {
        let size: usize = strings.iter().map(|s| s.len() + 1).sum();
        mem.write_u32(count_ptr, strings.len() as u32)?;
        mem.write_u32(size_ptr, size as u32)?;
        Ok(())
    }

    pub fn args_sizes_get(&self, mem: &mut GuestMemory<'_>, argc_ptr: u32, size_ptr: u32) -> SysResult {
        Self::write_sizes(mem, &self.args, argc_ptr, size_ptr)
    }

    pub fn args_get(&self, mem: &mut GuestMemory<'_>, argv_ptr: u32, buf_ptr: u32) -> SysResult {
        Self::write_strings(mem, &self.args, argv_ptr, buf_ptr)
    }

    pub fn environ_sizes_get(&self, mem: &mut GuestMemory<'_>, count_ptr: u32, size_ptr: u32) -> SysResult {
        Self::write_sizes(mem, &self.env, count_ptr, size_ptr)
    }

    pub fn environ_get(&self, mem: &mut GuestMemory<'_>, env_ptr: u32, buf_ptr: u32) -> SysResult {
        Self::write_strings(mem, &self.env, env_ptr, buf_ptr)
    }

    // =========================================================================
    // Clocks and randomness
    // =========================================================================

    pub fn clock_res_get(&self, mem: &mut GuestMemory<'_>, id: u32, res_ptr: u32) -> SysResult {
        if id > clock::THREAD_CPUTIME {
            return Err(Errno::Inval.into());
        }
        mem.write_u64(res_ptr, 1_000)?;
        Ok(())
    }

    pub fn clock_time_get(&self, mem: &mut GuestMemory<'_>, id: u32, _precision: u64, time_ptr: u32) -> SysResult {
        let nanos = match id {
            clock::REALTIME => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|_| Errno::Io)?
                .as_nanos(),
            clock::MONOTONIC | clock::PROCESS_CPUTIME | clock::THREAD_CPUTIME => {
                self.started.elapsed().as_nanos()
            }
            _ => return Err(Errno::Inval.into()),
        };
        mem.write_u64(time_ptr, nanos as u64)?;
        Ok(())
    }

    pub fn random_get(&self, mem: &mut GuestMemory<'_>, buf_ptr: u32, len: u32) -> SysResult {
        let buf = mem.slice_mut(buf_ptr, len)?;
        getrandom::fill(buf).map_err(|_| Errno::Io)?;
        Ok(())
    }

    // =========================================================================
    // Descriptor operations
    // =========================================================================

    pub fn fd_close(&mut self, fd: u32) -> SysResult {
        if !self.contains_fd(fd) {
            return Err(Errno::Badf.into());
        }
        if fd <= fd::STDERR {
            // stdio slots stay occupied for the instance's lifetime
            return Err(Errno::Notsup.into());
        }
        self.fds.remove(fd as usize);
        Ok(())
    }

    pub fn fd_advise(&mut self, fd: u32, offset: u64, len: u64, advice: u8) -> SysResult {
        let advice = Advice::from_raw(advice).ok_or(Errno::Inval)?;
        self.descriptor(fd)?.advise(offset, len, advice)?;
        Ok(())
    }

    pub fn fd_fdstat_get(&mut self, mem: &mut GuestMemory<'_>, fd: u32, stat_ptr: u32) -> SysResult {
        let stat = self.descriptor(fd)?.fdstat();
        mem.write(stat_ptr, &stat.to_bytes())?;
        Ok(())
    }

    pub fn fd_fdstat_set_flags(&mut self, fd: u32, flags: u16) -> SysResult {
        self.descriptor(fd)?;
        if flags & !FdFlags::APPEND.0 & !FdFlags::NONBLOCK.0 != 0 {
            return Err(Errno::Notsup.into());
        }
        Ok(())
    }

    pub fn fd_filestat_get(&mut self, mem: &mut GuestMemory<'_>, fd: u32, stat_ptr: u32) -> SysResult {
        let stat = self.descriptor(fd)?.filestat()?;
        mem.write(stat_ptr, &stat.to_bytes())?;
        Ok(())
    }

    pub fn fd_prestat_get(&mut self, mem: &mut GuestMemory<'_>, fd: u32, prestat_ptr: u32) -> SysResult {
        let name_len = match self.descriptor(fd)?.preopen_name() {
            Some(name) => name.len() as u32,
            None => return Err(Errno::Badf.into()),
        };
        mem.write(prestat_ptr, &Prestat { name_len }.to_bytes())?;
        Ok(())
    }

    pub fn fd_prestat_dir_name(&mut self, mem: &mut GuestMemory<'_>, fd: u32, path_ptr: u32, path_len: u32) -> SysResult {
        let descriptor = self.descriptor(fd)?;
        let name = descriptor.preopen_name().ok_or(Errno::Badf)?;
        if (path_len as usize) < name.len() {
            return Err(Errno::Inval.into());
        }
        mem.write(path_ptr, name.as_bytes())?;
        Ok(())
    }

    pub async fn fd_read(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        nread_ptr: u32,
    ) -> SysResult {
        let iovs = mem.iovecs(iovs_ptr, iovs_len)?;
        let total = mem.total_len(&iovs)?;
        let data = self.descriptor(fd)?.read(total).await?;
        let placed = mem.scatter(&iovs, &data)?;
        mem.write_u32(nread_ptr, placed as u32)?;
        Ok(())
    }

    pub async fn fd_pread(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        offset: u64,
        nread_ptr: u32,
    ) -> SysResult {
        let iovs = mem.iovecs(iovs_ptr, iovs_len)?;
        let total = mem.total_len(&iovs)?;
        let data = self.descriptor(fd)?.pread(total, offset).await?;
        let placed = mem.scatter(&iovs, &data)?;
        mem.write_u32(nread_ptr, placed as u32)?;
        Ok(())
    }

    pub fn fd_write(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        nwritten_ptr: u32,
    ) -> SysResult {
        let iovs = mem.iovecs(iovs_ptr, iovs_len)?;
        let data = mem.gather(&iovs)?;
        let written = self.descriptor(fd)?.write(&data)?;
        mem.write_u32(nwritten_ptr, written as u32)?;
        Ok(())
    }

    pub fn fd_pwrite(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        iovs_ptr: u32,
        iovs_len: u32,
        offset: u64,
        nwritten_ptr: u32,
    ) -> SysResult {
        let iovs = mem.iovecs(iovs_ptr, iovs_len)?;
        let data = mem.gather(&iovs)?;
        let written = self.descriptor(fd)?.pwrite(&data, offset)?;
        mem.write_u32(nwritten_ptr, written as u32)?;
        Ok(())
    }

    pub fn fd_seek(&mut self, mem: &mut GuestMemory<'_>, fd: u32, offset: i64, whence: u8, newoffset_ptr: u32) -> SysResult {
        let whence = Whence::from_raw(whence).ok_or(Errno::Inval)?;
        let position = self.descriptor(fd)?.seek(offset, whence)?;
        mem.write_u64(newoffset_ptr, position)?;
        Ok(())
    }

    pub fn fd_tell(&mut self, mem: &mut GuestMemory<'_>, fd: u32, offset_ptr: u32) -> SysResult {
        let position = self.descriptor(fd)?.seek(0, Whence::Cur)?;
        mem.write_u64(offset_ptr, position)?;
        Ok(())
    }

    /// `fd_sync` and `fd_datasync`: everything is already where it lives
    pub fn fd_sync(&mut self, fd: u32) -> SysResult {
        self.descriptor(fd)?;
        Ok(())
    }

    /// Pack directory entries starting at `cookie` into the guest buffer.
    ///
    /// Each entry is a 24-byte header followed by its name. When the buffer
    /// runs out mid-entry the tail is written partially and `bufused` equals
    /// `buf_len`, which tells the guest to call again with a larger buffer.
    pub async fn fd_readdir(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        buf_ptr: u32,
        buf_len: u32,
        cookie: u64,
        bufused_ptr: u32,
    ) -> SysResult {
        mem.read(buf_ptr, buf_len)?;
        let dir = self.descriptor(fd)?;

        let mut used: u32 = 0;
        let mut cookie = cookie;
        while used < buf_len {
            let dirent = match dir.readdir_single(cookie).await {
                Ok(Some(dirent)) => dirent,
                Ok(None) => break,
                Err(errno) if used == 0 => return Err(errno.into()),
                Err(errno) => {
                    log::debug!("fd_readdir stopped early on fd {}: {}", fd, errno);
                    break;
                }
            };

            let header = dirent.header_bytes();
            let name = dirent.name.as_bytes();
            for chunk in [&header[..], name] {
                let room = (buf_len - used) as usize;
                let n = chunk.len().min(room);
                mem.write(buf_ptr + used, &chunk[..n])?;
                used += n as u32;
            }
            cookie = dirent.next;
        }

        mem.write_u32(bufused_ptr, used)?;
        Ok(())
    }

    // =========================================================================
    // Path operations
    // =========================================================================

    pub fn path_create_directory(&mut self, mem: &mut GuestMemory<'_>, fd: u32, path_ptr: u32, path_len: u32) -> SysResult {
        let path = Self::read_path(mem, path_ptr, path_len)?;
        self.descriptor(fd)?.create_directory(&path)?;
        Ok(())
    }

    pub async fn path_filestat_get(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        _flags: u32,
        path_ptr: u32,
        path_len: u32,
        stat_ptr: u32,
    ) -> SysResult {
        let path = Self::read_path(mem, path_ptr, path_len)?;
        let stat = self.descriptor(fd)?.path_filestat(&path).await?;
        mem.write(stat_ptr, &stat.to_bytes())?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn path_open(
        &mut self,
        mem: &mut GuestMemory<'_>,
        fd: u32,
        _dirflags: u32,
        path_ptr: u32,
        path_len: u32,
        oflags: u16,
        rights_base: u64,
        _rights_inheriting: u64,
        fdflags: u16,
        opened_fd_ptr: u32,
    ) -> SysResult {
        let path = Self::read_path(mem, path_ptr, path_len)?;
        let options = OpenOptions::from_wasi(OFlags(oflags), rights_base, FdFlags(fdflags));
        let opened = self.descriptor(fd)?.path_open(&path, options).await?;
        let new_fd = self.insert_fd(opened);
        mem.write_u32(opened_fd_ptr, new_fd)?;
        Ok(())
    }

    // =========================================================================
    // Process and scheduling
    // =========================================================================

    pub fn sched_yield(&self) -> SysResult {
        Ok(())
    }

    /// Calls the guest program is known never to make
    pub fn unsupported(&self, name: &'static str) -> SysResult {
        log::error!("guest called unsupported syscall {}", name);
        Err(GuestFault::Unsupported { name }.into())
    }
}

/// Builder for [`GuestState`]
///
/// Unset stdio defaults to a closed stdin and line sinks on stdout/stderr.
pub struct GuestStateBuilder {
    args: Vec<String>,
    env: Vec<String>,
    stdin: Option<Box<dyn Descriptor>>,
    stdout: Option<Box<dyn Descriptor>>,
    stderr: Option<Box<dyn Descriptor>>,
    preopen: Option<Preopen>,
    trace: bool,
}

impl GuestStateBuilder {
    pub fn new() -> Self {
        Self {
            args: vec![String::new()],
            env: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            preopen: None,
            trace: false,
        }
    }

    /// Name reported as `argv[0]`
    pub fn program_name(mut self, name: &str) -> Self {
        self.args[0] = name.to_string();
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", name, value));
        self
    }

    pub fn stdin(mut self, stdin: Box<dyn Descriptor>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn stdout(mut self, stdout: Box<dyn Descriptor>) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn stderr(mut self, stderr: Box<dyn Descriptor>) -> Self {
        self.stderr = Some(stderr);
        self
    }

    /// Grant `dir` to the guest as fd 3 under `name`
    pub fn preopen(mut self, name: &str, dir: Box<dyn Descriptor>) -> Self {
        self.preopen = Some(Preopen::new(name, dir));
        self
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn build(self) -> GuestState {
        let mut fds: Slab<Box<dyn Descriptor>> = Slab::new();
        fds.insert(self.stdin.unwrap_or_else(|| {
            let pipe = BytePipe::new();
            pipe.close();
            Box::new(pipe)
        }));
        fds.insert(self.stdout.unwrap_or_else(|| Box::new(LineSink::new("stdout"))));
        fds.insert(self.stderr.unwrap_or_else(|| Box::new(LineSink::new("stderr"))));
        if let Some(preopen) = self.preopen {
            fds.insert(Box::new(preopen));
        }
        GuestState {
            fds,
            args: self.args,
            env: self.env,
            started: Instant::now(),
            trace: self.trace,
        }
    }
}

impl Default for GuestStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::wasm::abi::{rights, Filetype};
    use crate::vfs::MemoryFs;
    use futures::executor::block_on;

    const MEM_SIZE: usize = 4096;

    fn state_with(fs: &MemoryFs) -> GuestState {
        GuestState::builder()
            .program_name("guest")
            .arg("--flag")
            .env("HOME", "/repo")
            .preopen("/repo", fs.descriptor())
            .build()
    }

    fn put_str(mem: &mut GuestMemory<'_>, at: u32, s: &str) -> (u32, u32) {
        mem.write(at, s.as_bytes()).unwrap();
        (at, s.len() as u32)
    }

    fn put_iovec(mem: &mut GuestMemory<'_>, at: u32, ptr: u32, len: u32) {
        mem.write_u32(at, ptr).unwrap();
        mem.write_u32(at + 4, len).unwrap();
    }

    #[test]
    fn test_args_and_environ() {
        let fs = MemoryFs::new();
        let state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        state.args_sizes_get(&mut mem, 0, 4).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 2);
        assert_eq!(mem.read_u32(4).unwrap(), ("guest".len() + 1 + "--flag".len() + 1) as u32);

        state.args_get(&mut mem, 100, 200).unwrap();
        let second = mem.read_u32(104).unwrap();
        assert_eq!(mem.read(second, 7).unwrap(), b"--flag\0");

        state.environ_sizes_get(&mut mem, 0, 4).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 1);
        state.environ_get(&mut mem, 300, 400).unwrap();
        assert_eq!(mem.read(400, 10).unwrap(), b"HOME=/repo");
    }

    #[test]
    fn test_random_get_checks_range_first() {
        let fs = MemoryFs::new();
        let state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        state.random_get(&mut mem, 64, 32).unwrap();
        assert!(mem.read(64, 32).unwrap().iter().any(|&b| b != 0));

        // A length far past the memory faults without touching the host heap
        assert!(matches!(
            state.random_get(&mut mem, 0, u32::MAX),
            Err(SysError::Fault(GuestFault::OutOfBounds { size, .. })) if size == u32::MAX as u64
        ));
        assert!(matches!(
            state.random_get(&mut mem, MEM_SIZE as u32 - 4, 8),
            Err(SysError::Fault(_))
        ));
    }

    #[test]
    fn test_strings_past_the_end_fault() {
        let fs = MemoryFs::new();
        let state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        assert!(matches!(
            state.args_get(&mut mem, u32::MAX - 2, 0),
            Err(SysError::Fault(_))
        ));
        assert!(matches!(
            state.environ_get(&mut mem, 0, MEM_SIZE as u32 - 3),
            Err(SysError::Fault(_))
        ));
    }

    #[test]
    fn test_prestat_exposes_root_name() {
        let fs = MemoryFs::new();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        state.fd_prestat_get(&mut mem, fd::PREOPEN, 0).unwrap();
        assert_eq!(mem.read_u32(4).unwrap(), 5);
        state.fd_prestat_dir_name(&mut mem, fd::PREOPEN, 16, 5).unwrap();
        assert_eq!(mem.read(16, 5).unwrap(), b"/repo");

        // Anything else ends the guest's preopen scan
        assert_eq!(state.fd_prestat_get(&mut mem, fd::STDOUT, 0), Err(Errno::Badf.into()));
        assert_eq!(state.fd_prestat_get(&mut mem, 4, 0), Err(Errno::Badf.into()));
    }

    #[test]
    fn test_unknown_fd_is_badf() {
        let fs = MemoryFs::new();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        assert_eq!(state.fd_write(&mut mem, 42, 0, 0, 8), Err(SysError::Errno(Errno::Badf)));
        assert_eq!(block_on(state.fd_read(&mut mem, 42, 0, 0, 8)), Err(SysError::Errno(Errno::Badf)));
        assert_eq!(state.fd_close(42), Err(SysError::Errno(Errno::Badf)));
        assert_eq!(errno(state.fd_sync(42)), Ok(Errno::Badf));
    }

    #[test]
    fn test_open_write_read_roundtrip() {
        let fs = MemoryFs::new();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        let (path, path_len) = put_str(&mut mem, 100, "notes/hello.txt");
        block_on(state.path_open(
            &mut mem,
            fd::PREOPEN,
            0,
            path,
            path_len,
            OFlags::CREAT.0,
            rights::FD_WRITE | rights::FD_READ,
            0,
            0,
            200,
        ))
        .unwrap();
        let file_fd = mem.read_u32(200).unwrap();
        assert_eq!(file_fd, 4);

        put_str(&mut mem, 300, "hello");
        put_iovec(&mut mem, 400, 300, 5);
        state.fd_write(&mut mem, file_fd, 400, 1, 408).unwrap();
        assert_eq!(mem.read_u32(408).unwrap(), 5);
        state.fd_close(file_fd).unwrap();
        assert_eq!(fs.read_file("notes/hello.txt").unwrap(), b"hello");

        block_on(state.path_open(&mut mem, fd::PREOPEN, 0, path, path_len, 0, rights::FD_READ, 0, 0, 200)).unwrap();
        let fresh = mem.read_u32(200).unwrap();
        // Freed slot is reused
        assert_eq!(fresh, 4);

        // Scatter across two iovecs of 2 and 8 bytes
        put_iovec(&mut mem, 500, 600, 2);
        put_iovec(&mut mem, 508, 700, 8);
        block_on(state.fd_read(&mut mem, fresh, 500, 2, 516)).unwrap();
        assert_eq!(mem.read_u32(516).unwrap(), 5);
        assert_eq!(mem.read(600, 2).unwrap(), b"he");
        assert_eq!(mem.read(700, 3).unwrap(), b"llo");

        state.fd_seek(&mut mem, fresh, 1, 0, 520).unwrap();
        state.fd_tell(&mut mem, fresh, 528).unwrap();
        assert_eq!(mem.read(528, 8).unwrap(), &1u64.to_le_bytes());
        assert_eq!(state.fd_seek(&mut mem, fresh, 0, 9, 520), Err(Errno::Inval.into()));
    }

    #[test]
    fn test_path_open_errors_are_returned_not_raised() {
        let fs = MemoryFs::new();
        fs.write_file("present", "x").unwrap();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        let (path, len) = put_str(&mut mem, 100, "absent");
        let result = block_on(state.path_open(&mut mem, fd::PREOPEN, 0, path, len, 0, 0, 0, 0, 200));
        assert_eq!(errno(result), Ok(Errno::Noent));

        let (path, len) = put_str(&mut mem, 100, "present");
        let flags = OFlags::CREAT.0 | OFlags::EXCL.0;
        let result = block_on(state.path_open(&mut mem, fd::PREOPEN, 0, path, len, flags, 0, 0, 0, 200));
        assert_eq!(errno(result), Ok(Errno::Exist));

        // Bad pointer is a fault, not an errno
        let result = block_on(state.path_open(&mut mem, fd::PREOPEN, 0, 4090, 100, 0, 0, 0, 0, 200));
        assert!(matches!(errno(result), Err(GuestFault::OutOfBounds { .. })));
    }

    #[test]
    fn test_readdir_packs_entries() {
        let fs = MemoryFs::new();
        fs.write_file("a.txt", "a").unwrap();
        fs.create_dir_all("sub").unwrap();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        block_on(state.fd_readdir(&mut mem, fd::PREOPEN, 1000, 256, 0, 8)).unwrap();
        let used = mem.read_u32(8).unwrap();
        assert_eq!(used, (24 + 3 + 24 + 5) as u32);

        // First record: "sub", a directory, next cookie 1
        assert_eq!(mem.read(1000, 8).unwrap(), &1u64.to_le_bytes());
        assert_eq!(mem.read_u32(1016).unwrap(), 3);
        assert_eq!(mem.read(1020, 1).unwrap(), &[Filetype::Directory as u8]);
        assert_eq!(mem.read(1024, 3).unwrap(), b"sub");
        // Second record follows immediately
        assert_eq!(mem.read_u32(1027 + 16).unwrap(), 5);
        assert_eq!(mem.read(1027 + 24, 5).unwrap(), b"a.txt");

        // Resuming from cookie 1 skips "sub"
        block_on(state.fd_readdir(&mut mem, fd::PREOPEN, 1000, 256, 1, 8)).unwrap();
        assert_eq!(mem.read_u32(8).unwrap(), 24 + 5);
    }

    #[test]
    fn test_readdir_fills_small_buffer() {
        let fs = MemoryFs::new();
        fs.write_file("a.txt", "a").unwrap();
        fs.create_dir_all("sub").unwrap();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        block_on(state.fd_readdir(&mut mem, fd::PREOPEN, 1000, 30, 0, 8)).unwrap();
        assert_eq!(mem.read_u32(8).unwrap(), 30);
    }

    #[test]
    fn test_readdir_on_file_fails() {
        let fs = MemoryFs::new();
        let mut state = state_with(&fs);
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);
        let result = block_on(state.fd_readdir(&mut mem, fd::STDOUT, 1000, 64, 0, 8));
        assert_eq!(result, Err(Errno::Notdir.into()));
    }

    #[test]
    fn test_stdin_pipe_read_suspends() {
        let stdin = BytePipe::new();
        let mut state = GuestState::builder().stdin(Box::new(stdin.clone())).build();
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);
        put_iovec(&mut mem, 0, 100, 64);

        let writer = stdin.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            writer.write(b"{\"id\":1}\n");
        });
        block_on(state.fd_read(&mut mem, fd::STDIN, 0, 1, 8)).unwrap();
        handle.join().unwrap();
        assert_eq!(mem.read_u32(8).unwrap(), 9);
        assert_eq!(mem.read(100, 9).unwrap(), b"{\"id\":1}\n");
    }

    #[test]
    fn test_stdio_cannot_be_closed() {
        let mut state = GuestState::builder().build();
        assert_eq!(state.fd_close(fd::STDOUT), Err(Errno::Notsup.into()));
        assert!(state.contains_fd(fd::STDOUT));
        assert_eq!(state.fd_count(), 3);
    }

    #[test]
    fn test_clock_and_random() {
        let state = GuestState::builder().build();
        let mut backing = vec![0u8; MEM_SIZE];
        let mut mem = GuestMemory::new(&mut backing);

        state.clock_time_get(&mut mem, clock::REALTIME, 0, 0).unwrap();
        let realtime = u64::from_le_bytes(mem.read(0, 8).unwrap().try_into().unwrap());
        assert!(realtime > 1_600_000_000_000_000_000);
        assert_eq!(state.clock_time_get(&mut mem, 99, 0, 0), Err(Errno::Inval.into()));

        state.random_get(&mut mem, 64, 32).unwrap();
        assert!(mem.read(64, 32).unwrap().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_unsupported_is_a_fault() {
        let state = GuestState::builder().build();
        assert_eq!(
            errno(state.unsupported("poll_oneoff")),
            Err(GuestFault::Unsupported { name: "poll_oneoff" })
        );
    }
}
