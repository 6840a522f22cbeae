// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Versioned binary state serialization.
//!
//! The same code path both saves and loads: every field is passed by
//! mutable reference to [`PointerWrap::sync`], which either appends it to
//! the buffer or overwrites it from the buffer depending on the mode.
//! Data is grouped into named, versioned sections so that newer builds can
//! read older states and apply fixups.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{error, warn};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Section titles are stored as fixed 16-byte markers.
const SECTION_MARKER_LEN: usize = 16;

/// Cookie written by [`PointerWrap::do_marker`].
const MARKER_COOKIE: u32 = 0x42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Error severity carried by the wrap; only `Failure` aborts a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    None,
    Warning,
    Failure,
}

#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("savestate is broken: {0}")]
    Broken(String),
    #[error("savestate has {0} bytes of trailing data")]
    TrailingData(usize),
}

/// Serialization context.
pub struct PointerWrap {
    mode: Mode,
    buf: Vec<u8>,
    pos: usize,
    error: ErrorLevel,
    first_failure: Option<String>,
}

/// Types that can be passed to [`PointerWrap::sync`].
pub trait Persist {
    fn persist(&mut self, p: &mut PointerWrap);
}

impl PointerWrap {
    /// Create a wrap that serializes into a fresh buffer.
    pub fn writer() -> Self {
        Self {
            mode: Mode::Write,
            buf: Vec::new(),
            pos: 0,
            error: ErrorLevel::None,
            first_failure: None,
        }
    }

    /// Create a wrap that deserializes from `data`.
    pub fn reader(data: &[u8]) -> Self {
        Self {
            mode: Mode::Read,
            buf: data.to_vec(),
            pos: 0,
            error: ErrorLevel::None,
            first_failure: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.mode == Mode::Read
    }

    pub fn error(&self) -> ErrorLevel {
        self.error
    }

    /// Bytes consumed (read mode) or produced (write mode).
    pub fn offset(&self) -> usize {
        match self.mode {
            Mode::Read => self.pos,
            Mode::Write => self.buf.len(),
        }
    }

    /// Raise the error level. Levels never go down.
    pub fn set_error(&mut self, level: ErrorLevel, message: &str) {
        if level > self.error {
            self.error = level;
        }
        if level == ErrorLevel::Failure && self.first_failure.is_none() {
            error!("Savestate failure: {}", message);
            self.first_failure = Some(message.to_string());
        }
    }

    /// Check that nothing failed so far.
    pub fn check(&self) -> Result<(), SaveStateError> {
        if self.error == ErrorLevel::Failure {
            let message = self
                .first_failure
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(SaveStateError::Broken(message));
        }
        Ok(())
    }

    /// Finish a load, requiring every byte to have been consumed.
    pub fn finish_read(&self) -> Result<(), SaveStateError> {
        self.check()?;
        let left = self.buf.len().saturating_sub(self.pos);
        if self.mode == Mode::Read && left != 0 {
            return Err(SaveStateError::TrailingData(left));
        }
        Ok(())
    }

    /// Finish a save and take the produced bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Serialize or deserialize one value.
    #[inline]
    pub fn sync<T: Persist + ?Sized>(&mut self, value: &mut T) {
        value.persist(self);
    }

    /// Raw bytes without a length prefix.
    pub fn do_bytes(&mut self, data: &mut [u8]) {
        match self.mode {
            Mode::Write => self.buf.extend_from_slice(data),
            Mode::Read => {
                let end = self.pos + data.len();
                if end > self.buf.len() {
                    self.fail_eof();
                    return;
                }
                data.copy_from_slice(&self.buf[self.pos..end]);
                self.pos = end;
            }
        }
    }

    /// Write or verify a fixed cookie after a block of data.
    pub fn do_marker(&mut self, name: &str) {
        let mut cookie = MARKER_COOKIE;
        self.sync(&mut cookie);
        if self.is_reading() && cookie != MARKER_COOKIE {
            self.set_error(
                ErrorLevel::Failure,
                &format!("marker mismatch after {} (0x{:X})", name, cookie),
            );
        }
    }

    /// Open a versioned section.
    ///
    /// Returns the version found, or 0 when the section is absent or could
    /// not be loaded. `body` only runs for a usable section, and a closing
    /// marker is written or checked after it.
    pub fn section<F>(&mut self, title: &str, min_ver: u32, ver: u32, body: F) -> u32
    where
        F: FnOnce(&mut Self, u32),
    {
        if self.error == ErrorLevel::Failure {
            return 0;
        }

        let marker = section_marker(title);
        let found = match self.mode {
            Mode::Write => {
                self.buf.extend_from_slice(&marker);
                let mut v = ver;
                self.sync(&mut v);
                ver
            }
            Mode::Read => {
                if !self.expect_bytes(&marker) {
                    return 0;
                }
                let mut v = 0u32;
                self.sync(&mut v);
                v
            }
        };

        if self.error == ErrorLevel::Failure || found < min_ver || found > ver {
            warn!("Savestate failure: wrong version {} found for {}", found, title);
            self.set_error(
                ErrorLevel::Failure,
                &format!("section {} has unsupported version {}", title, found),
            );
            return 0;
        }

        body(self, found);
        self.do_marker(title);
        found
    }

    fn expect_bytes(&mut self, expected: &[u8]) -> bool {
        let end = self.pos + expected.len();
        if end > self.buf.len() || &self.buf[self.pos..end] != expected {
            return false;
        }
        self.pos = end;
        true
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn fail_eof(&mut self) {
        let at = self.pos;
        self.set_error(ErrorLevel::Failure, &format!("unexpected end of data at {}", at));
        self.pos = self.buf.len();
    }

    /// Read a container length, rejecting counts larger than the data left.
    fn sync_len(&mut self, len: usize) -> usize {
        let mut n = len as u32;
        self.sync(&mut n);
        if self.is_reading() && n as usize > self.remaining().len() {
            self.set_error(ErrorLevel::Failure, &format!("bogus container length {}", n));
            return 0;
        }
        n as usize
    }
}

fn section_marker(title: &str) -> [u8; SECTION_MARKER_LEN] {
    let mut marker = [0u8; SECTION_MARKER_LEN];
    let bytes = title.as_bytes();
    let n = bytes.len().min(SECTION_MARKER_LEN);
    marker[..n].copy_from_slice(&bytes[..n]);
    marker
}

macro_rules! persist_le {
    ($ty:ty, $read:ident, $write:ident) => {
        impl Persist for $ty {
            fn persist(&mut self, p: &mut PointerWrap) {
                match p.mode {
                    Mode::Write => {
                        if p.buf.$write::<LittleEndian>(*self).is_err() {
                            p.set_error(ErrorLevel::Failure, "write failed");
                        }
                    }
                    Mode::Read => {
                        let result = p.remaining().$read::<LittleEndian>();
                        match result {
                            Ok(v) => {
                                *self = v;
                                p.pos += std::mem::size_of::<$ty>();
                            }
                            Err(_) => p.fail_eof(),
                        }
                    }
                }
            }
        }
    };
}

persist_le!(u16, read_u16, write_u16);
persist_le!(u32, read_u32, write_u32);
persist_le!(i32, read_i32, write_i32);
persist_le!(u64, read_u64, write_u64);
persist_le!(i64, read_i64, write_i64);

impl Persist for u8 {
    fn persist(&mut self, p: &mut PointerWrap) {
        match p.mode {
            Mode::Write => p.buf.push(*self),
            Mode::Read => {
                let result = p.remaining().read_u8();
                match result {
                    Ok(v) => {
                        *self = v;
                        p.pos += 1;
                    }
                    Err(_) => p.fail_eof(),
                }
            }
        }
    }
}

impl Persist for bool {
    fn persist(&mut self, p: &mut PointerWrap) {
        let mut v = u8::from(*self);
        p.sync(&mut v);
        *self = v != 0;
    }
}

impl Persist for String {
    fn persist(&mut self, p: &mut PointerWrap) {
        let len = p.sync_len(self.len());
        match p.mode {
            Mode::Write => p.buf.extend_from_slice(self.as_bytes()),
            Mode::Read => {
                let mut bytes = vec![0u8; len];
                p.do_bytes(&mut bytes);
                *self = String::from_utf8_lossy(&bytes).into_owned();
            }
        }
    }
}

impl<T: Persist, const N: usize> Persist for [T; N] {
    fn persist(&mut self, p: &mut PointerWrap) {
        for item in self.iter_mut() {
            p.sync(item);
        }
    }
}

impl<T: Persist + Default> Persist for Vec<T> {
    fn persist(&mut self, p: &mut PointerWrap) {
        let len = p.sync_len(self.len());
        if p.is_reading() {
            self.clear();
            self.resize_with(len, T::default);
        }
        for item in self.iter_mut() {
            p.sync(item);
        }
    }
}

impl<T: Persist + Default> Persist for VecDeque<T> {
    fn persist(&mut self, p: &mut PointerWrap) {
        let len = p.sync_len(self.len());
        if p.is_reading() {
            self.clear();
            self.resize_with(len, T::default);
        }
        for item in self.iter_mut() {
            p.sync(item);
        }
    }
}

impl<K, V> Persist for BTreeMap<K, V>
where
    K: Persist + Default + Ord + Clone,
    V: Persist + Default,
{
    fn persist(&mut self, p: &mut PointerWrap) {
        let len = p.sync_len(self.len());
        match p.mode {
            Mode::Write => {
                for (key, value) in self.iter_mut() {
                    let mut key = key.clone();
                    p.sync(&mut key);
                    p.sync(value);
                }
            }
            Mode::Read => {
                self.clear();
                for _ in 0..len {
                    let mut key = K::default();
                    let mut value = V::default();
                    p.sync(&mut key);
                    p.sync(&mut value);
                    self.insert(key, value);
                }
            }
        }
    }
}
