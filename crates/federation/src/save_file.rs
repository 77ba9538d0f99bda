//! Save artifact layout and codec.
//!
//! ```text
//! "OHLA" | version: u16
//! header record
//! federate_count x { handle: u64 | name | type | state_len: u64 | proxy_len: u64 | state | proxy }
//! execution record
//! log_count: u32 x { sender: u64 | type: u8 | message record }
//! blake3(everything above): [u8; 32]
//! ```
//!
//! Integers are big-endian. A record is a `u32` length followed by that many
//! bytes of JSON; `name` and `type` are `u32`-length-prefixed UTF-8.

use crate::error::SaveFileError;
use crate::ownership::ObjectInstanceState;
use crate::proxy::Declarations;
use crate::save::{BufferedEntry, BufferedInteraction, BufferedMessage, BufferedUpdate};
use crate::store::SaveSink;
use crate::time_manager::TimeSnapshot;
use ohla_core::{Fdd, FederateHandle, LogicalTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const MAGIC: &[u8; 4] = b"OHLA";
pub const FORMAT_VERSION: u16 = 1;
const DIGEST_LEN: usize = 32;
/// Handle, two string lengths and two record lengths.
const FEDERATE_RECORD_MIN_LEN: usize = 8 + 4 + 4 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveHeader {
    pub label: String,
    pub federation_name: String,
    pub federate_count: u32,
    pub save_time: Option<LogicalTime>,
    pub fdd: Fdd,
    /// Milliseconds since the Unix epoch when the save was written.
    pub wall_clock_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederateRecord {
    pub handle: FederateHandle,
    pub name: String,
    pub federate_type: String,
    /// Opaque state the federate handed over with `federateSaveComplete`.
    pub state: Vec<u8>,
    pub declarations: Declarations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub name: String,
    pub producer: FederateHandle,
    pub state: ObjectInstanceState,
}

/// Federation-level state at the moment the save concluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub objects: Vec<ObjectSnapshot>,
    pub used_names: Vec<String>,
    pub reserved_names: Vec<(String, FederateHandle)>,
    pub next_object_handle: u64,
    pub next_federate_handle: u64,
    pub time: TimeSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveArtifact {
    pub header: SaveHeader,
    pub federates: Vec<FederateRecord>,
    pub execution: ExecutionSnapshot,
    pub log: Vec<BufferedEntry>,
}

/// Appends to a sink while hashing everything written.
struct HashingWriter<'a> {
    sink: &'a mut dyn SaveSink,
    hasher: blake3::Hasher,
}

impl HashingWriter<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), SaveFileError> {
        self.hasher.update(bytes);
        self.sink.append(bytes)?;
        Ok(())
    }

    fn put_u32_len(&mut self, len: usize) -> Result<(), SaveFileError> {
        let len = u32::try_from(len).map_err(|_| SaveFileError::RecordTooLarge(len))?;
        self.put(&len.to_be_bytes())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), SaveFileError> {
        self.put_u32_len(bytes.len())?;
        self.put(bytes)
    }

    fn put_record<T: Serialize>(&mut self, value: &T) -> Result<(), SaveFileError> {
        let json = serde_json::to_vec(value)?;
        self.put_bytes(&json)
    }
}

/// Stream `artifact` into `sink`, ending with the digest. The sink is not
/// finished.
pub fn write_artifact(artifact: &SaveArtifact, sink: &mut dyn SaveSink) -> Result<(), SaveFileError> {
    let mut writer = HashingWriter {
        sink,
        hasher: blake3::Hasher::new(),
    };
    writer.put(MAGIC)?;
    writer.put(&FORMAT_VERSION.to_be_bytes())?;

    let mut header = artifact.header.clone();
    header.federate_count = u32::try_from(artifact.federates.len())
        .map_err(|_| SaveFileError::RecordTooLarge(artifact.federates.len()))?;
    writer.put_record(&header)?;

    for record in &artifact.federates {
        let proxy = serde_json::to_vec(&record.declarations)?;
        writer.put(&record.handle.value().to_be_bytes())?;
        writer.put_bytes(record.name.as_bytes())?;
        writer.put_bytes(record.federate_type.as_bytes())?;
        writer.put(&(record.state.len() as u64).to_be_bytes())?;
        writer.put(&(proxy.len() as u64).to_be_bytes())?;
        writer.put(&record.state)?;
        writer.put(&proxy)?;
    }

    writer.put_record(&artifact.execution)?;

    writer.put_u32_len(artifact.log.len())?;
    for entry in &artifact.log {
        writer.put(&entry.sender.value().to_be_bytes())?;
        writer.put(&[entry.message.type_code()])?;
        match &entry.message {
            BufferedMessage::UpdateAttributeValues(update) => writer.put_record(update)?,
            BufferedMessage::SendInteraction(interaction) => writer.put_record(interaction)?,
        }
    }

    let digest = writer.hasher.finalize();
    writer.sink.append(digest.as_bytes())?;
    Ok(())
}

/// Encode into a fresh buffer.
pub fn encode_artifact(artifact: &SaveArtifact) -> Result<Vec<u8>, SaveFileError> {
    let mut buffer = Vec::new();
    write_artifact(artifact, &mut buffer)?;
    Ok(buffer)
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], SaveFileError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(SaveFileError::Truncated)?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SaveFileError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, SaveFileError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, SaveFileError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, SaveFileError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, SaveFileError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn length(&mut self) -> Result<usize, SaveFileError> {
        let raw = self.u64()?;
        usize::try_from(raw).map_err(|_| SaveFileError::RecordTooLarge(usize::MAX))
    }

    fn bytes(&mut self) -> Result<&'a [u8], SaveFileError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, SaveFileError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SaveFileError::Truncated)
    }

    fn record<T: DeserializeOwned>(&mut self) -> Result<T, SaveFileError> {
        Ok(serde_json::from_slice(self.bytes()?)?)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
}

/// Decode an artifact, verifying magic, version and digest.
pub fn read_artifact(bytes: &[u8]) -> Result<SaveArtifact, SaveFileError> {
    if bytes.len() < MAGIC.len() {
        return Err(SaveFileError::Truncated);
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(SaveFileError::BadMagic);
    }
    if bytes.len() < MAGIC.len() + 2 + DIGEST_LEN {
        return Err(SaveFileError::Truncated);
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if blake3::hash(body).as_bytes().as_slice() != digest {
        return Err(SaveFileError::ChecksumMismatch);
    }

    let mut reader = Reader {
        bytes: body,
        position: MAGIC.len(),
    };
    let version = reader.u16()?;
    if version != FORMAT_VERSION {
        return Err(SaveFileError::UnsupportedVersion(version));
    }

    let header: SaveHeader = reader.record()?;
    let plausible = reader.remaining() / FEDERATE_RECORD_MIN_LEN;
    let mut federates = Vec::with_capacity((header.federate_count as usize).min(plausible));
    for _ in 0..header.federate_count {
        let handle = FederateHandle(reader.u64()?);
        let name = reader.string()?;
        let federate_type = reader.string()?;
        let state_len = reader.length()?;
        let proxy_len = reader.length()?;
        let state = reader.take(state_len)?.to_vec();
        let declarations = serde_json::from_slice(reader.take(proxy_len)?)?;
        federates.push(FederateRecord {
            handle,
            name,
            federate_type,
            state,
            declarations,
        });
    }

    let execution: ExecutionSnapshot = reader.record()?;

    let count = reader.u32()?;
    let mut log = Vec::new();
    for _ in 0..count {
        let sender = FederateHandle(reader.u64()?);
        let message = match reader.u8()? {
            BufferedMessage::UPDATE_ATTRIBUTE_VALUES => {
                BufferedMessage::UpdateAttributeValues(reader.record::<BufferedUpdate>()?)
            }
            BufferedMessage::SEND_INTERACTION => {
                BufferedMessage::SendInteraction(reader.record::<BufferedInteraction>()?)
            }
            other => return Err(SaveFileError::UnknownMessageType(other)),
        };
        log.push(BufferedEntry { sender, message });
    }

    if reader.remaining() != 0 {
        return Err(SaveFileError::TrailingData(reader.remaining()));
    }

    Ok(SaveArtifact {
        header,
        federates,
        execution,
        log,
    })
}

#[cfg(test)]
impl SaveArtifact {
    pub(crate) fn empty_for_tests(federates: Vec<FederateRecord>) -> Self {
        SaveArtifact {
            header: SaveHeader {
                label: "test".into(),
                federation_name: "fed".into(),
                federate_count: federates.len() as u32,
                save_time: None,
                fdd: Fdd::default(),
                wall_clock_ms: 0,
            },
            federates,
            execution: ExecutionSnapshot {
                objects: vec![],
                used_names: vec![],
                reserved_names: vec![],
                next_object_handle: 1,
                next_federate_handle: 1,
                time: crate::time_manager::TimeCoordinator::new(LogicalTime::INITIAL).snapshot(),
            },
            log: vec![],
        }
    }
}
