//! Bounds-checked view of guest linear memory
//!
//! Every syscall reads and writes guest memory through a [`GuestMemory`];
//! raw offsets never travel further than this type. An access that falls
//! outside the memory is a [`GuestFault`], not a guest-visible errno.

use std::ops::Range;

use super::abi::IoVec;
use super::error::GuestFault;

/// Borrowed guest memory for the duration of one syscall
pub struct GuestMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn range(&self, address: u32, size: u64) -> Result<Range<usize>, GuestFault> {
        let fault = GuestFault::OutOfBounds {
            address,
            size,
            memory_size: self.bytes.len() as u64,
        };
        let start = address as usize;
        let len = usize::try_from(size).map_err(|_| fault.clone())?;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(fault),
        }
    }

    pub fn read(&self, address: u32, len: u32) -> Result<&[u8], GuestFault> {
        let range = self.range(address, len as u64)?;
        Ok(&self.bytes[range])
    }

    /// Checked mutable window for a host to fill in place
    pub fn slice_mut(&mut self, address: u32, len: u32) -> Result<&mut [u8], GuestFault> {
        let range = self.range(address, len as u64)?;
        Ok(&mut self.bytes[range])
    }

    /// Advance a guest pointer, faulting instead of wrapping
    pub fn offset(&self, address: u32, by: u64) -> Result<u32, GuestFault> {
        u32::try_from(address as u64 + by).map_err(|_| GuestFault::OutOfBounds {
            address,
            size: by,
            memory_size: self.bytes.len() as u64,
        })
    }

    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), GuestFault> {
        let range = self.range(address, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, address: u32) -> Result<u32, GuestFault> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), GuestFault> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, address: u32, value: u64) -> Result<(), GuestFault> {
        self.write(address, &value.to_le_bytes())
    }

    /// Read a UTF-8 string; `Ok(None)` when the bytes are not valid UTF-8
    pub fn read_str(&self, address: u32, len: u32) -> Result<Option<&str>, GuestFault> {
        let bytes = self.read(address, len)?;
        Ok(std::str::from_utf8(bytes).ok())
    }

    /// Decode `count` iovec records starting at `address`
    pub fn iovecs(&self, address: u32, count: u32) -> Result<Vec<IoVec>, GuestFault> {
        let table = self.read_table(address, count)?;
        Ok(table
            .chunks_exact(IoVec::SIZE)
            .map(|chunk| {
                let mut raw = [0u8; IoVec::SIZE];
                raw.copy_from_slice(chunk);
                IoVec::from_bytes(raw)
            })
            .collect())
    }

    fn read_table(&self, address: u32, count: u32) -> Result<&[u8], GuestFault> {
        let range = self.range(address, count as u64 * IoVec::SIZE as u64)?;
        Ok(&self.bytes[range])
    }

    /// Validate every iovec and return the total length they describe
    pub fn total_len(&self, iovs: &[IoVec]) -> Result<usize, GuestFault> {
        let mut total = 0usize;
        for iov in iovs {
            self.range(iov.ptr, iov.len as u64)?;
            total = total.saturating_add(iov.len as usize);
        }
        Ok(total)
    }

    /// Concatenate the bytes the iovecs point at
    pub fn gather(&self, iovs: &[IoVec]) -> Result<Vec<u8>, GuestFault> {
        let mut out = Vec::with_capacity(self.total_len(iovs)?);
        for iov in iovs {
            out.extend_from_slice(self.read(iov.ptr, iov.len)?);
        }
        Ok(out)
    }

    /// Spread `data` across the iovecs in order; returns the bytes placed
    pub fn scatter(&mut self, iovs: &[IoVec], data: &[u8]) -> Result<usize, GuestFault> {
        let mut placed = 0;
        for iov in iovs {
            if placed == data.len() {
                break;
            }
            let n = (iov.len as usize).min(data.len() - placed);
            self.write(iov.ptr, &data[placed..placed + n])?;
            placed += n;
        }
        Ok(placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let mut backing = vec![0u8; 64];
        let mut mem = GuestMemory::new(&mut backing);
        mem.write_u32(8, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(8).unwrap(), 0xdead_beef);
        mem.write(20, b"wasi").unwrap();
        assert_eq!(mem.read_str(20, 4).unwrap(), Some("wasi"));
    }

    #[test]
    fn test_out_of_bounds_is_a_fault() {
        let mut backing = vec![0u8; 16];
        let mut mem = GuestMemory::new(&mut backing);
        assert!(matches!(
            mem.write(14, b"abc"),
            Err(GuestFault::OutOfBounds { address: 14, size: 3, memory_size: 16 })
        ));
        assert!(mem.read(u32::MAX, 2).is_err());
        assert!(mem.read(16, 0).is_ok());
    }

    #[test]
    fn test_slice_mut_is_checked() {
        let mut backing = vec![0u8; 16];
        let mut mem = GuestMemory::new(&mut backing);
        mem.slice_mut(12, 4).unwrap().copy_from_slice(b"tail");
        assert_eq!(mem.read(12, 4).unwrap(), b"tail");
        assert!(mem.slice_mut(12, 5).is_err());
        assert!(mem.slice_mut(0, u32::MAX).is_err());
    }

    #[test]
    fn test_offset_does_not_wrap() {
        let mut backing = vec![0u8; 16];
        let mem = GuestMemory::new(&mut backing);
        assert_eq!(mem.offset(8, 4).unwrap(), 12);
        assert!(matches!(
            mem.offset(u32::MAX - 1, 4),
            Err(GuestFault::OutOfBounds { address, size: 4, .. }) if address == u32::MAX - 1
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut backing = vec![0xffu8; 8];
        let mem = GuestMemory::new(&mut backing);
        assert_eq!(mem.read_str(0, 4).unwrap(), None);
    }

    #[test]
    fn test_scatter_and_gather() {
        let mut backing = vec![0u8; 64];
        let mut mem = GuestMemory::new(&mut backing);
        // two iovecs: [32..35) and [40..44)
        mem.write_u32(0, 32).unwrap();
        mem.write_u32(4, 3).unwrap();
        mem.write_u32(8, 40).unwrap();
        mem.write_u32(12, 4).unwrap();

        let iovs = mem.iovecs(0, 2).unwrap();
        assert_eq!(iovs, vec![IoVec { ptr: 32, len: 3 }, IoVec { ptr: 40, len: 4 }]);
        assert_eq!(mem.total_len(&iovs).unwrap(), 7);

        assert_eq!(mem.scatter(&iovs, b"hello").unwrap(), 5);
        assert_eq!(mem.read(32, 3).unwrap(), b"hel");
        assert_eq!(mem.read(40, 2).unwrap(), b"lo");
        assert_eq!(&mem.gather(&iovs).unwrap()[..5], b"hello");
    }
}
