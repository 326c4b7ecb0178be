// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Migration stream format.
//!
//! The stream uses the following layout:
//!
//!  |-----------------------------|
//!  |       64 bit magic_id       |
//!  |-----------------------------|
//!  |       version string        |
//!  |-----------------------------|
//!  |        machine state        |
//!  |-----------------------------|
//!  |            CRC64            |
//!  |-----------------------------|
//!
//! The version selects the layout of the per-bridge state, see [`crate::phb::persist`].

pub mod crc;

use std::io::{Read, Write};

use bincode::config::{Configuration, Fixint, LittleEndian, Limit};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ddw::DdwError;
use crate::irq::IrqError;
use crate::persist::crc::Crc64Writer;
use crate::phb::PhbError;

/// Magic value opening every migration stream.
pub const MIGRATION_MAGIC_ID: u64 = 0x0710_1984_5050_4842;

/// Bridge state with per-slot MSI bitmaps. Load only.
pub const PHB_STATE_V1: Version = Version::new(1, 0, 0);
/// Bridge state with per-function MSI blocks.
pub const PHB_STATE_V2: Version = Version::new(2, 0, 0);
/// Adds the dynamic DMA windows.
pub const PHB_STATE_V3: Version = Version::new(3, 0, 0);

/// Bounds how much memory bincode may allocate while decoding a stream.
const STATE_DESERIALIZE_LIMIT: usize = 10_485_760; // 10MiB

type BincodeConfig = Configuration<LittleEndian, Fixint, Limit<STATE_DESERIALIZE_LIMIT>>;

fn bincode_config() -> BincodeConfig {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<STATE_DESERIALIZE_LIMIT>()
}

/// Save/restore of a component's state.
pub trait Persist<'a>
where
    Self: Sized,
{
    /// The type of the object representing the state of the component.
    type State;
    /// The type of the object holding the constructor arguments.
    type ConstructorArgs;
    /// The type of the error that can occur while constructing the object.
    type Error;

    /// Returns the current state of the component.
    fn save(&self) -> Self::State;
    /// Constructs a component from a specified state.
    fn restore(
        constructor_args: Self::ConstructorArgs,
        state: &Self::State,
    ) -> Result<Self, Self::Error>;
}

/// Migration errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PersistError {
    /// CRC64 validation failed: {0}
    Crc64(u64),
    /// Magic value does not match: {0:#x}
    InvalidMagic(u64),
    /// Migration stream is smaller than CRC length.
    InvalidSize,
    /// Unsupported state version {0}
    UnsupportedVersion(Version),
    /// An IO error occurred: {0}
    Io(i32),
    /// An error occured with serialization/deserialization: {0}
    Serde(String),
    /// PHB {0} mismatch: migrated {1:#x}, configured {2:#x}
    IdentityMismatch(&'static str, u64, u64),
    /// The stream announces {0} dynamic DMA windows but describes {1}
    WindowCount(u32, usize),
    /// The stream describes {0} PHBs, the machine is configured with {1}
    PhbCount(usize, usize),
    /// Legacy MSI bitmaps must be folded before saving
    PendingLegacyMsi,
    /// Cannot rebuild PHB: {0}
    Phb(#[from] PhbError),
    /// Cannot restore DMA window: {0}
    Ddw(#[from] DdwError),
    /// Cannot reclaim interrupt: {0}
    Irq(#[from] IrqError),
}

/// Platform level state carried next to the bridges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState<P> {
    /// Guest RTC offset from host UTC, in seconds.
    pub rtc_offset: i64,
    /// Platform indicator/sensor word.
    pub platform_state: u32,
    /// One entry per bridge, in configuration order.
    pub phbs: Vec<P>,
}

impl<P> MachineState<P> {
    /// Converts every bridge entry with `f`, stopping at the first failure.
    pub fn try_map<Q, E>(self, f: impl FnMut(P) -> Result<Q, E>) -> Result<MachineState<Q>, E> {
        Ok(MachineState {
            rtc_offset: self.rtc_offset,
            platform_state: self.platform_state,
            phbs: self.phbs.into_iter().map(f).collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MigrationHdr {
    magic: u64,
    version: Version,
}

/// A checked migration stream whose body has not been decoded yet.
#[derive(Debug)]
pub struct MigrationStream {
    version: Version,
    body: Vec<u8>,
}

impl MigrationStream {
    /// Writes `data` framed with a `version` header and a CRC64 trailer. Returns the number of
    /// bytes written.
    pub fn save<W, T>(writer: &mut W, version: &Version, data: &T) -> Result<usize, PersistError>
    where
        W: Write,
        T: Serialize,
    {
        let mut crc_writer = Crc64Writer::new(writer);
        let hdr = MigrationHdr {
            magic: MIGRATION_MAGIC_ID,
            version: version.clone(),
        };
        let mut len = serialize(&mut crc_writer, &hdr)?;
        len += serialize(&mut crc_writer, data)?;

        let checksum = crc_writer.checksum();
        len += serialize(&mut crc_writer, &checksum)?;
        crc_writer
            .flush()
            .map_err(|err| PersistError::Io(err.raw_os_error().unwrap_or(libc::EINVAL)))?;
        Ok(len)
    }

    /// Reads a `stream_len` byte stream and checks its integrity and header.
    pub fn load<R: Read>(reader: &mut R, stream_len: usize) -> Result<Self, PersistError> {
        // Fail-fast if the stream length is too small
        let raw_len = stream_len
            .checked_sub(std::mem::size_of::<u64>())
            .ok_or(PersistError::InvalidSize)?;

        let mut stream = vec![0u8; stream_len];
        reader
            .read_exact(&mut stream)
            .map_err(|err| PersistError::Io(err.raw_os_error().unwrap_or(libc::EINVAL)))?;
        let (raw, trailer) = stream.split_at(raw_len);

        let computed_checksum = crc64::crc64(0, raw);
        let (stored_checksum, _): (u64, usize) = deserialize(trailer)?;
        if computed_checksum != stored_checksum {
            return Err(PersistError::Crc64(computed_checksum));
        }

        let (hdr, hdr_len): (MigrationHdr, usize) = deserialize(raw)?;
        if hdr.magic != MIGRATION_MAGIC_ID {
            return Err(PersistError::InvalidMagic(hdr.magic));
        }
        Ok(MigrationStream {
            version: hdr.version,
            body: raw[hdr_len..].to_vec(),
        })
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Decodes the body as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PersistError> {
        deserialize(&self.body).map(|(data, _)| data)
    }
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), PersistError> {
    bincode::serde::decode_from_slice(bytes, bincode_config())
        .map_err(|err| PersistError::Serde(err.to_string()))
}

fn serialize<W: Write, T: Serialize>(writer: &mut W, data: &T) -> Result<usize, PersistError> {
    bincode::serde::encode_into_std_write(data, writer, bincode_config())
        .map_err(|err| PersistError::Serde(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MachineState<u32> {
        MachineState {
            rtc_offset: -3600,
            platform_state: 0x400,
            phbs: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_stream_save_load() {
        let mut buf = Vec::new();
        let len = MigrationStream::save(&mut buf, &PHB_STATE_V3, &sample()).unwrap();
        assert_eq!(len, buf.len());

        let stream = MigrationStream::load(&mut buf.as_slice(), buf.len()).unwrap();
        assert_eq!(stream.version(), &PHB_STATE_V3);
        assert_eq!(stream.decode::<MachineState<u32>>().unwrap(), sample());
    }

    #[test]
    fn test_stream_corruption() {
        let mut buf = Vec::new();
        MigrationStream::save(&mut buf, &PHB_STATE_V2, &sample()).unwrap();

        let mut corrupted = buf.clone();
        corrupted[20] ^= 0xff;
        assert!(matches!(
            MigrationStream::load(&mut corrupted.as_slice(), corrupted.len()),
            Err(PersistError::Crc64(_))
        ));

        assert!(matches!(
            MigrationStream::load(&mut buf.as_slice(), 4),
            Err(PersistError::InvalidSize)
        ));
        // Longer than what the reader holds.
        assert!(matches!(
            MigrationStream::load(&mut buf.as_slice(), buf.len() + 1),
            Err(PersistError::Io(_))
        ));
    }

    #[test]
    fn test_stream_bad_magic() {
        #[derive(Serialize)]
        struct ForeignHdr {
            magic: u64,
            version: Version,
        }

        let mut buf = Vec::new();
        let mut crc_writer = Crc64Writer::new(&mut buf);
        serialize(
            &mut crc_writer,
            &ForeignHdr {
                magic: 0x1234,
                version: PHB_STATE_V3,
            },
        )
        .unwrap();
        let checksum = crc_writer.checksum();
        serialize(&mut crc_writer, &checksum).unwrap();

        assert!(matches!(
            MigrationStream::load(&mut buf.as_slice(), buf.len()),
            Err(PersistError::InvalidMagic(0x1234))
        ));
    }
}
