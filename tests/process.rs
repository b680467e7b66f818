//! Integration tests for the process-facing surface.

mod common;

use std::{
    os::fd::AsFd,
    sync::{Arc, Mutex},
};

use common::{pattern, read_bytes, temp_file};
use ntvirt::{memory::host, prelude::*};

const OTHER: ProcessHandle = ProcessHandle::Other(i32::MAX);

/// Channel recording every call instead of touching any process.
#[derive(Default)]
struct RecordingChannel {
    calls: Arc<Mutex<Vec<(ProcessHandle, usize, usize)>>>,
}

impl ProcessMemoryChannel for RecordingChannel {
    fn read(&self, process: ProcessHandle, addr: usize, buf: &mut [u8]) -> Result<usize> {
        self.calls.lock().unwrap().push((process, addr, buf.len()));
        buf.fill(0x42);
        Ok(buf.len())
    }

    fn write(&self, process: ProcessHandle, addr: usize, buf: &[u8]) -> Result<usize> {
        self.calls.lock().unwrap().push((process, addr, buf.len()));
        Ok(buf.len())
    }
}

fn recording() -> (ProcessMemory, Arc<Mutex<Vec<(ProcessHandle, usize, usize)>>>) {
    let channel = RecordingChannel::default();
    let calls = Arc::clone(&channel.calls);
    (
        ProcessMemory::with_channel(AddressSpace::new(), Box::new(channel)),
        calls,
    )
}

#[test]
fn test_cross_process_operations_are_rejected() -> Result<()> {
    let (memory, _) = recording();
    let rw = Protection::READWRITE;
    let both = AllocationType::RESERVE | AllocationType::COMMIT;

    let denied = |result: Result<()>| {
        assert_eq!(result.unwrap_err().status(), Status::AccessDenied);
    };
    denied(memory.allocate(OTHER, None, 0x10000, both, rw).map(drop));
    denied(memory.query(OTHER, 0x10000).map(drop));
    denied(memory.lock(OTHER, 0x10000, 0x1000).map(drop));
    denied(memory.unlock(OTHER, 0x10000, 0x1000).map(drop));

    let (base, size) = memory.allocate(ProcessHandle::Current, None, 0x10000, both, rw)?;
    denied(memory.protect(OTHER, base, size, Protection::READONLY).map(drop));
    denied(memory.free(OTHER, base, 0, AllocationType::RELEASE).map(drop));
    denied(memory.unmap_view(OTHER, base));

    let file = temp_file(&pattern(0x1000));
    denied(
        memory
            .map_view_of_file(OTHER, file.as_file().as_fd(), None, 0, 0, rw, false)
            .map(drop),
    );

    // Nothing changed in the caller's address space
    assert_eq!(memory.space().views()?.len(), 1);
    assert_eq!(
        memory.query(ProcessHandle::Current, base)?.protect,
        Protection::READWRITE
    );
    memory.free(ProcessHandle::Current, base, 0, AllocationType::RELEASE)?;
    Ok(())
}

#[test]
fn test_read_write_go_through_channel() -> Result<()> {
    let (memory, calls) = recording();

    let mut buf = [0u8; 8];
    assert_eq!(memory.read(OTHER, 0x1234_0000, &mut buf)?, 8);
    assert_eq!(buf, [0x42; 8]);
    assert_eq!(memory.write(ProcessHandle::Current, 0x5678_0000, b"abc")?, 3);

    let calls = calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![(OTHER, 0x1234_0000, 8), (ProcessHandle::Current, 0x5678_0000, 3)]
    );
    assert!(memory.space().views()?.is_empty());
    Ok(())
}

#[test]
fn test_current_process_operations() -> Result<()> {
    let (memory, _) = recording();
    let current = ProcessHandle::Current;
    let (base, size) = memory.allocate(
        current,
        None,
        0x10000,
        AllocationType::RESERVE | AllocationType::COMMIT,
        Protection::READWRITE,
    )?;
    assert_eq!(
        memory.protect(current, base, size, Protection::READONLY)?,
        Protection::READWRITE
    );
    assert_eq!(memory.lock(current, base + 1, 1)?, (base, host::page_size()));

    let file = temp_file(&pattern(0x1000));
    let (view, _) = memory.map_view_of_file(
        current,
        file.as_file().as_fd(),
        None,
        0,
        0,
        Protection::READONLY,
        false,
    )?;
    assert_eq!(read_bytes(view, 0x1000), pattern(0x1000));
    assert_eq!(
        memory.query(current, view)?.kind,
        Some(MemoryType::Mapped)
    );
    memory.unmap_view(current, view)?;
    memory.free(current, base, 0, AllocationType::RELEASE)?;
    assert!(memory.space().views()?.is_empty());
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn test_host_channel_on_self() -> Result<()> {
    let memory = ProcessMemory::new();
    let (base, _) = memory.allocate(
        ProcessHandle::Current,
        None,
        0x10000,
        AllocationType::RESERVE | AllocationType::COMMIT,
        Protection::READWRITE,
    )?;

    match memory.write(ProcessHandle::Current, base, b"via channel") {
        Ok(written) => assert_eq!(written, 11),
        // Sandboxes may filter the copy syscalls
        Err(Error::AccessDenied) => return Ok(()),
        Err(Error::Host(err)) if err.raw_os_error() == Some(libc::ENOSYS) => return Ok(()),
        Err(err) => return Err(err),
    }
    let mut back = [0u8; 11];
    assert_eq!(memory.read(ProcessHandle::Current, base, &mut back)?, 11);
    assert_eq!(&back, b"via channel");
    assert_eq!(read_bytes(base, 11), b"via channel");
    Ok(())
}
