//! Snapshot stream framing.
//!
//! ```text
//! len (u32 BE) | header
//! tag (u8) | len (u32 BE) | payload     (repeated)
//! ```
//!
//! Header and payloads are bincode encoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    pub last_index: u64,
}

/// Tags of the record kinds every build understands. Tags not listed here
/// belong to snapshot extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotType {
    Node = 0,
    Job = 1,
    Index = 2,
    Eval = 3,
    Alloc = 4,
    TimeTable = 5,
    JobSummary = 7,
    JobVersion = 9,
    Deployment = 10,
    AclToken = 12,
    AclRole = 25,
    AuthMethod = 26,
    Namespace = 64,
}

impl SnapshotType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            0 => SnapshotType::Node,
            1 => SnapshotType::Job,
            2 => SnapshotType::Index,
            3 => SnapshotType::Eval,
            4 => SnapshotType::Alloc,
            5 => SnapshotType::TimeTable,
            7 => SnapshotType::JobSummary,
            9 => SnapshotType::JobVersion,
            10 => SnapshotType::Deployment,
            12 => SnapshotType::AclToken,
            25 => SnapshotType::AclRole,
            26 => SnapshotType::AuthMethod,
            64 => SnapshotType::Namespace,
            _ => return None,
        };
        Some(kind)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Default)]
pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(header: SnapshotHeader) -> Result<Self> {
        let mut writer = Self::default();
        let encoded = bincode::serialize(&header)?;
        writer.frame(&encoded)?;
        Ok(writer)
    }

    fn frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| ControlError::Codec("snapshot record too large".to_string()))?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub fn record<T: Serialize>(&mut self, kind: SnapshotType, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        self.raw(kind.tag(), &encoded)
    }

    /// Write an already encoded payload, used for extension rows.
    pub fn raw(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        self.buf.push(tag);
        self.frame(payload)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct SnapshotReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ControlError::Codec("truncated snapshot".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn frame(&mut self) -> Result<&'a [u8]> {
        let len_bytes = self.take(4)?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        self.take(len as usize)
    }

    pub fn header(&mut self) -> Result<SnapshotHeader> {
        let header: SnapshotHeader = bincode::deserialize(self.frame()?)?;
        if header.version > SNAPSHOT_FORMAT_VERSION {
            return Err(ControlError::Codec(format!(
                "snapshot format version {} is newer than supported {}",
                header.version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(header)
    }

    /// Next `(tag, payload)` pair, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<(u8, &'a [u8])>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let tag = self.take(1)?[0];
        let payload = self.frame()?;
        Ok(Some((tag, payload)))
    }
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::Node;

    #[test]
    fn frames_records_after_header() {
        let mut writer = SnapshotWriter::new(SnapshotHeader {
            version: SNAPSHOT_FORMAT_VERSION,
            last_index: 42,
        })
        .unwrap();
        writer
            .record(SnapshotType::Node, &Node::new("n1", "client-1"))
            .unwrap();
        writer.raw(200, b"opaque").unwrap();
        let data = writer.finish();

        let mut reader = SnapshotReader::new(&data);
        assert_eq!(reader.header().unwrap().last_index, 42);

        let (tag, payload) = reader.next_record().unwrap().unwrap();
        assert_eq!(SnapshotType::from_tag(tag), Some(SnapshotType::Node));
        let node: Node = decode(payload).unwrap();
        assert_eq!(node.id, "n1");

        assert_eq!(reader.next_record().unwrap(), Some((200, &b"opaque"[..])));
        assert_eq!(reader.next_record().unwrap(), None);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut writer = SnapshotWriter::new(SnapshotHeader {
            version: SNAPSHOT_FORMAT_VERSION,
            last_index: 1,
        })
        .unwrap();
        writer.raw(0, &[1, 2, 3, 4]).unwrap();
        let mut data = writer.finish();
        data.truncate(data.len() - 2);

        let mut reader = SnapshotReader::new(&data);
        reader.header().unwrap();
        assert!(matches!(reader.next_record(), Err(ControlError::Codec(_))));
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(SnapshotType::AuthMethod.tag(), 26);
        assert_eq!(SnapshotType::Namespace.tag(), 64);
        assert_eq!(SnapshotType::from_tag(6), None);
    }
}
