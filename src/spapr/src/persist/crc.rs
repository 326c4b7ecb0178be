// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Checksumming writer for the migration stream trailer.

use std::io::{self, Write};

/// Passes bytes through to `inner` and keeps the running CRC64 of what was accepted.
#[derive(Debug)]
pub struct Crc64Writer<W> {
    inner: W,
    crc: u64,
}

impl<W: Write> Crc64Writer<W> {
    pub fn new(inner: W) -> Self {
        Crc64Writer { inner, crc: 0 }
    }

    /// CRC64 of every byte the inner writer accepted so far.
    pub fn checksum(&self) -> u64 {
        self.crc
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Crc64Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let accepted = self.inner.write(buf)?;
        // Short writes are retried by the caller with the tail.
        self.crc = crc64::crc64(self.crc, &buf[..accepted]);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
