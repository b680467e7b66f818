//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io::Write;

#[path = "../../src/test/pe.rs"]
mod pe;

pub use pe::*;

/// Copies `len` bytes of mapped memory at `addr`.
pub fn read_bytes(addr: usize, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(addr as *const u8, len).to_vec() }
}

pub fn read_u32(addr: usize) -> u32 {
    unsafe { std::ptr::read_unaligned(addr as *const u32) }
}

pub fn read_u16(addr: usize) -> u16 {
    unsafe { std::ptr::read_unaligned(addr as *const u16) }
}

pub fn write_bytes(addr: usize, bytes: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) }
}

/// Creates a temporary file holding `bytes`.
pub fn temp_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Deterministic, non-repeating-per-page test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
