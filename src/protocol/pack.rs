//! Pack files
//!
//! ## Format
//!
//! `PACK <version:u32> <count:u32>` followed by `count` entries and the
//! SHA-1 of everything before it. Each entry starts with a variable-length
//! header holding the type (3 bits) and the inflated size, then:
//!
//! - commit, tree, blob, tag: the zlib-compressed object content
//! - ofs-delta: a negative offset to the base entry, then the compressed delta
//! - ref-delta: the 20-byte id of the base object, then the compressed delta
//!
//! Deltas are resolved against entries of the same pack or, for ref-deltas,
//! against objects already in the database (thin packs). The writer only
//! emits undeltified entries.
//!
//! Sizes in a pack come from the client. No entry or delta result may exceed
//! the caller's object size limit, and nothing is allocated from a declared
//! size before the data backing it was read.

use crate::areas::database::Database;
use crate::artifacts::objects::object::{frame_object, hash_object};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use byteorder::{ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

const PACK_SIGNATURE: &[u8; 4] = b"PACK";
const PACK_HEADER_LEN: usize = 12;
const CHECKSUM_LEN: usize = 20;

/// Smallest possible entry: one header byte and an empty zlib stream.
const MIN_ENTRY_LEN: usize = 9;

const OFS_DELTA: u8 = 6;
const REF_DELTA: u8 = 7;

/// A fully resolved object of a pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedObject {
    pub oid: ObjectId,
    pub object_type: ObjectType,
    pub content: Bytes,
}

#[derive(Debug)]
enum EntryData {
    Full(ObjectType),
    OfsDelta { base_offset: usize },
    RefDelta { base: ObjectId },
}

#[derive(Debug)]
struct RawEntry {
    offset: usize,
    data: EntryData,
    inflated: Bytes,
}

/// Decode and resolve every object of `pack`.
///
/// Nothing is written: callers persist the result only once the whole pack
/// decoded cleanly. Entries and delta results larger than `max_object_size`
/// reject the pack.
pub fn read_pack(pack: &[u8], database: &Database, max_object_size: usize) -> ProtocolResult<Vec<PackedObject>> {
    if pack.len() < PACK_HEADER_LEN + CHECKSUM_LEN {
        return Err(ProtocolError::InvalidPack(format!("{} bytes is too short", pack.len())));
    }

    let (body, trailer) = pack.split_at(pack.len() - CHECKSUM_LEN);
    let computed = format!("{:x}", Sha1::digest(body));
    let expected = ObjectId::from_raw(trailer)?.to_string();
    if computed != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, computed });
    }

    let mut header = Cursor::new(body);
    let mut signature = [0u8; 4];
    header.read_exact(&mut signature)?;
    if &signature != PACK_SIGNATURE {
        return Err(ProtocolError::InvalidPack("missing PACK signature".to_string()));
    }
    let version = header.read_u32::<byteorder::NetworkEndian>()?;
    if version != 2 && version != 3 {
        return Err(ProtocolError::Unsupported(format!("pack version {version}")));
    }
    let count = header.read_u32::<byteorder::NetworkEndian>()? as usize;
    let room = (body.len() - PACK_HEADER_LEN) / MIN_ENTRY_LEN;
    if count > room {
        return Err(ProtocolError::InvalidPack(format!(
            "{count} entries cannot fit in {} bytes",
            body.len() - PACK_HEADER_LEN
        )));
    }

    let mut entries = Vec::with_capacity(count);
    let mut position = PACK_HEADER_LEN;
    for _ in 0..count {
        let (entry, next) = read_entry(body, position, max_object_size)?;
        entries.push(entry);
        position = next;
    }
    if position != body.len() {
        return Err(ProtocolError::InvalidPack(format!(
            "{} trailing bytes after the last entry",
            body.len() - position
        )));
    }

    let objects = resolve(entries, database, max_object_size)?;
    tracing::debug!(version, objects = objects.len(), bytes = pack.len(), "decoded pack");
    Ok(objects)
}

/// Decode `pack` and store every object, returning their ids in pack order.
pub fn unpack_into(pack: &[u8], database: &Database, max_object_size: usize) -> ProtocolResult<Vec<ObjectId>> {
    let objects = read_pack(pack, database, max_object_size)?;

    let mut oids = Vec::with_capacity(objects.len());
    for object in objects {
        oids.push(database.store_raw(object.object_type, &object.content)?);
    }
    Ok(oids)
}

fn read_entry(body: &[u8], offset: usize, max_object_size: usize) -> ProtocolResult<(RawEntry, usize)> {
    let truncated = || ProtocolError::InvalidPack(format!("truncated entry at offset {offset}"));
    let mut position = offset;
    let mut next_byte = || -> ProtocolResult<u8> {
        let byte = *body.get(position).ok_or_else(truncated)?;
        position += 1;
        Ok(byte)
    };

    let mut byte = next_byte()?;
    let type_code = (byte >> 4) & 0x07;
    let mut size = (byte & 0x0f) as usize;
    let mut shift = 4;
    while byte & 0x80 != 0 {
        byte = next_byte()?;
        size |= ((byte & 0x7f) as usize)
            .checked_shl(shift)
            .ok_or_else(|| ProtocolError::InvalidPack(format!("oversized entry at offset {offset}")))?;
        shift += 7;
    }
    if size > max_object_size {
        return Err(ProtocolError::InvalidPack(format!(
            "entry at offset {offset} declares {size} bytes, limit is {max_object_size}"
        )));
    }

    let data = match type_code {
        OFS_DELTA => {
            let mut byte = next_byte()?;
            let mut distance = (byte & 0x7f) as usize;
            while byte & 0x80 != 0 {
                if distance > offset {
                    break;
                }
                byte = next_byte()?;
                distance = ((distance + 1) << 7) | (byte & 0x7f) as usize;
            }
            let base_offset = offset.checked_sub(distance).filter(|_| distance > 0).ok_or_else(|| {
                ProtocolError::InvalidPack(format!("delta at offset {offset} points outside the pack"))
            })?;
            EntryData::OfsDelta { base_offset }
        }
        REF_DELTA => {
            let end = position + CHECKSUM_LEN;
            let raw = body.get(position..end).ok_or_else(truncated)?;
            position = end;
            EntryData::RefDelta {
                base: ObjectId::from_raw(raw)?,
            }
        }
        code => EntryData::Full(ObjectType::from_pack_code(code).ok_or_else(|| {
            ProtocolError::InvalidPack(format!("unknown object type {code} at offset {offset}"))
        })?),
    };

    let mut decoder = flate2::bufread::ZlibDecoder::new(&body[position..]);
    let mut inflated = Vec::new();
    (&mut decoder)
        .take(size as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|error| ProtocolError::InvalidPack(format!("corrupt entry at offset {offset}: {error}")))?;
    if inflated.len() != size {
        return Err(ProtocolError::InvalidPack(format!(
            "entry at offset {offset} inflates to {} bytes, header says {size}",
            inflated.len()
        )));
    }
    position += decoder.total_in() as usize;

    Ok((
        RawEntry {
            offset,
            data,
            inflated: inflated.into(),
        },
        position,
    ))
}

fn resolve(entries: Vec<RawEntry>, database: &Database, max_object_size: usize) -> ProtocolResult<Vec<PackedObject>> {
    let by_offset = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| (entry.offset, index))
        .collect::<HashMap<_, _>>();

    let mut resolved: Vec<Option<(ObjectType, Bytes)>> = vec![None; entries.len()];
    let mut by_oid: HashMap<ObjectId, usize> = HashMap::new();

    let mut remaining = entries.len();
    loop {
        let before = remaining;

        for (index, entry) in entries.iter().enumerate() {
            if resolved[index].is_some() {
                continue;
            }

            let object: Option<(ObjectType, Bytes)> = match &entry.data {
                EntryData::Full(object_type) => Some((*object_type, entry.inflated.clone())),
                EntryData::OfsDelta { base_offset } => {
                    let base_index = by_offset.get(base_offset).ok_or_else(|| {
                        ProtocolError::DeltaBaseNotFound(format!("offset {base_offset}"))
                    })?;
                    match &resolved[*base_index] {
                        Some((object_type, base)) => {
                            Some((*object_type, apply_delta(base, &entry.inflated, max_object_size)?))
                        }
                        None => None,
                    }
                }
                EntryData::RefDelta { base } => match by_oid.get(base).copied() {
                    Some(base_index) => match &resolved[base_index] {
                        Some((object_type, base)) => {
                            Some((*object_type, apply_delta(base, &entry.inflated, max_object_size)?))
                        }
                        None => None,
                    },
                    None if database.exists(base) => {
                        let (object_type, content) = database.load_raw(base)?;
                        Some((object_type, apply_delta(&content, &entry.inflated, max_object_size)?))
                    }
                    None => None,
                },
            };

            if let Some((object_type, content)) = object {
                let oid = hash_object(&frame_object(object_type, &content));
                by_oid.insert(oid, index);
                resolved[index] = Some((object_type, content));
                remaining -= 1;
            }
        }

        if remaining == 0 {
            break;
        }
        if remaining == before {
            let missing = entries
                .iter()
                .zip(&resolved)
                .find_map(|(entry, object)| match (&entry.data, object) {
                    (EntryData::RefDelta { base }, None) => Some(base.to_string()),
                    (EntryData::OfsDelta { base_offset }, None) => Some(format!("offset {base_offset}")),
                    _ => None,
                })
                .unwrap_or_default();
            return Err(ProtocolError::DeltaBaseNotFound(missing));
        }
    }

    Ok(resolved
        .into_iter()
        .flatten()
        .map(|(object_type, content)| PackedObject {
            oid: hash_object(&frame_object(object_type, &content)),
            object_type,
            content,
        })
        .collect())
}

fn read_delta_size(delta: &[u8], position: &mut usize) -> ProtocolResult<usize> {
    let mut size = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = *delta
            .get(*position)
            .ok_or_else(|| ProtocolError::InvalidPack("truncated delta header".to_string()))?;
        *position += 1;
        size |= ((byte & 0x7f) as usize)
            .checked_shl(shift)
            .ok_or_else(|| ProtocolError::InvalidPack("oversized delta header".to_string()))?;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

/// Rebuild an object from its base and a git delta.
pub fn apply_delta(base: &[u8], delta: &[u8], max_object_size: usize) -> ProtocolResult<Bytes> {
    let invalid = |reason: &str| ProtocolError::InvalidPack(format!("bad delta: {reason}"));

    let mut position = 0;
    let source_size = read_delta_size(delta, &mut position)?;
    if source_size != base.len() {
        return Err(invalid("base size mismatch"));
    }
    let target_size = read_delta_size(delta, &mut position)?;
    if target_size > max_object_size {
        return Err(invalid("result exceeds the object size limit"));
    }

    let mut target = Vec::with_capacity(target_size.min(base.len() + delta.len()));
    while position < delta.len() {
        let op = delta[position];
        position += 1;

        if op & 0x80 != 0 {
            let mut fields = [0u8; 7];
            for (bit, field) in fields.iter_mut().enumerate() {
                if op & (1 << bit) != 0 {
                    *field = *delta.get(position).ok_or_else(|| invalid("truncated copy"))?;
                    position += 1;
                }
            }
            let copy_offset = u32::from_le_bytes([fields[0], fields[1], fields[2], fields[3]]) as usize;
            let copy_size = match u32::from_le_bytes([fields[4], fields[5], fields[6], 0]) as usize {
                0 => 0x10000,
                size => size,
            };
            let chunk = copy_offset
                .checked_add(copy_size)
                .and_then(|end| base.get(copy_offset..end))
                .ok_or_else(|| invalid("copy outside the base"))?;
            target.extend_from_slice(chunk);
        } else if op != 0 {
            let end = position + op as usize;
            let chunk = delta.get(position..end).ok_or_else(|| invalid("truncated insert"))?;
            target.extend_from_slice(chunk);
            position = end;
        } else {
            return Err(invalid("reserved opcode 0"));
        }

        if target.len() > target_size {
            return Err(invalid("result size mismatch"));
        }
    }

    if target.len() != target_size {
        return Err(invalid("result size mismatch"));
    }
    Ok(target.into())
}

/// Writes version 2 packs of undeltified objects.
pub struct PackWriter<W> {
    inner: W,
    hasher: Sha1,
}

impl<W: Write> PackWriter<W> {
    pub fn new(inner: W, count: u32) -> ProtocolResult<Self> {
        let mut writer = PackWriter {
            inner,
            hasher: Sha1::new(),
        };

        let mut header = Vec::with_capacity(PACK_HEADER_LEN);
        header.extend_from_slice(PACK_SIGNATURE);
        header.write_u32::<byteorder::NetworkEndian>(2)?;
        header.write_u32::<byteorder::NetworkEndian>(count)?;
        writer.emit(&header)?;

        Ok(writer)
    }

    pub fn write_object(&mut self, object_type: ObjectType, content: &[u8]) -> ProtocolResult<()> {
        let mut size = content.len();
        let mut header = Vec::with_capacity(10);
        let mut byte = (object_type.pack_code() << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size != 0 {
            header.push(byte | 0x80);
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        header.push(byte);
        self.emit(&header)?;

        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(content)?;
        let compressed = encoder.finish()?;
        self.emit(&compressed)
    }

    /// Append the trailing checksum and hand back the sink.
    pub fn finish(self) -> ProtocolResult<W> {
        let PackWriter { mut inner, hasher } = self;
        inner.write_all(&hasher.finalize())?;
        Ok(inner)
    }

    fn emit(&mut self, data: &[u8]) -> ProtocolResult<()> {
        self.hasher.update(data);
        self.inner.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use pretty_assertions::assert_eq;

    const LIMIT: usize = 1024 * 1024;

    fn database() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let database = Database::new(dir.path().join("objects").into_boxed_path());
        (dir, database)
    }

    fn pack_of(objects: &[(ObjectType, &[u8])]) -> Vec<u8> {
        let mut writer = PackWriter::new(Vec::new(), objects.len() as u32).unwrap();
        for (object_type, content) in objects {
            writer.write_object(*object_type, content).unwrap();
        }
        writer.finish().unwrap()
    }

    /// Raw entry bytes: header, optional base, compressed payload.
    fn delta_entry(type_code: u8, base: &[u8], delta: &[u8]) -> Vec<u8> {
        let mut entry = Vec::new();
        let mut size = delta.len();
        let mut byte = (type_code << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size != 0 {
            entry.push(byte | 0x80);
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        entry.push(byte);
        entry.extend_from_slice(base);

        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(delta).unwrap();
        entry.extend(encoder.finish().unwrap());
        entry
    }

    fn seal(mut pack: Vec<u8>) -> Vec<u8> {
        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);
        pack
    }

    #[test]
    fn written_packs_decode_to_the_same_objects() {
        let (_dir, database) = database();
        let pack = pack_of(&[(ObjectType::Blob, b"hello\n"), (ObjectType::Blob, &[b'x'; 300])]);

        let objects = read_pack(&pack, &database, LIMIT).unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].content, Bytes::from_static(b"hello\n"));
        // id git computes for a blob holding "hello\n"
        assert_eq!(objects[0].oid.to_string(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(objects[1].content.len(), 300);
    }

    #[test]
    fn corrupted_packs_fail_the_checksum() {
        let (_dir, database) = database();
        let mut pack = pack_of(&[(ObjectType::Blob, b"hello\n")]);
        pack[PACK_HEADER_LEN + 2] ^= 0xff;

        assert!(matches!(
            read_pack(&pack, &database, LIMIT),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn offset_deltas_resolve_against_earlier_entries() {
        let (_dir, database) = database();
        let base = b"hello world";
        // source 11, target 16: copy 0..11, insert "!!!!!"
        let delta = [11, 16, 0x90, 11, 5, b'!', b'!', b'!', b'!', b'!'];

        let mut pack = pack_of(&[]);
        pack.truncate(PACK_HEADER_LEN);
        pack[11] = 2;
        let base_entry = delta_entry(ObjectType::Blob.pack_code(), &[], base);
        let distance = base_entry.len() as u8;
        pack.extend(&base_entry);
        pack.extend(delta_entry(OFS_DELTA, &[distance], &delta));

        let objects = read_pack(&seal(pack), &database, LIMIT).unwrap();

        assert_eq!(objects[1].content, Bytes::from_static(b"hello world!!!!!"));
        assert_eq!(objects[1].object_type, ObjectType::Blob);
    }

    #[test]
    fn ref_deltas_may_use_objects_already_stored() {
        let (_dir, database) = database();
        let base_oid = database.store_raw(ObjectType::Blob, b"hello world").unwrap();
        let delta = [11, 5, 0x91, 6, 5];

        let mut pack = pack_of(&[]);
        pack.truncate(PACK_HEADER_LEN);
        pack[11] = 1;
        pack.extend(delta_entry(REF_DELTA, &base_oid.to_raw().unwrap(), &delta));

        let objects = read_pack(&seal(pack), &database, LIMIT).unwrap();
        assert_eq!(objects[0].content, Bytes::from_static(b"world"));
    }

    #[test]
    fn missing_delta_bases_are_reported() {
        let (_dir, database) = database();
        let delta = [11, 5, 0x91, 6, 5];

        let mut pack = pack_of(&[]);
        pack.truncate(PACK_HEADER_LEN);
        pack[11] = 1;
        pack.extend(delta_entry(REF_DELTA, &[0xab; 20], &delta));

        assert!(matches!(
            read_pack(&seal(pack), &database, LIMIT),
            Err(ProtocolError::DeltaBaseNotFound(_))
        ));
    }

    #[test]
    fn unpacking_stores_every_object() {
        let (_dir, database) = database();
        let pack = pack_of(&[(ObjectType::Blob, b"one"), (ObjectType::Blob, b"two")]);

        let oids = unpack_into(&pack, &database, LIMIT).unwrap();

        assert_eq!(oids.len(), 2);
        assert!(oids.iter().all(|oid| database.exists(oid)));
    }

    #[test]
    fn forged_entry_sizes_are_rejected_before_allocating() {
        let (_dir, database) = database();
        let mut pack = pack_of(&[]);
        pack.truncate(PACK_HEADER_LEN);
        pack[11] = 1;
        // blob header claiming roughly 2^57 bytes, followed by a tiny stream
        pack.extend([0xbf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f]);
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"x").unwrap();
        pack.extend(encoder.finish().unwrap());

        let error = read_pack(&seal(pack), &database, LIMIT).unwrap_err();

        assert!(matches!(error, ProtocolError::InvalidPack(reason) if reason.contains("limit")));
    }

    #[test]
    fn entry_counts_beyond_the_pack_length_are_rejected() {
        let (_dir, database) = database();
        let mut pack = pack_of(&[(ObjectType::Blob, b"one")]);
        pack.truncate(pack.len() - CHECKSUM_LEN);
        pack[8..12].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            read_pack(&seal(pack), &database, LIMIT),
            Err(ProtocolError::InvalidPack(_))
        ));
    }

    #[test]
    fn entries_inflating_past_their_declared_size_are_rejected() {
        let (_dir, database) = database();
        let mut pack = pack_of(&[]);
        pack.truncate(PACK_HEADER_LEN);
        pack[11] = 1;
        // declares 3 bytes, inflates to 6
        pack.push((ObjectType::Blob.pack_code() << 4) | 3);
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello\n").unwrap();
        pack.extend(encoder.finish().unwrap());

        assert!(matches!(
            read_pack(&seal(pack), &database, LIMIT),
            Err(ProtocolError::InvalidPack(_))
        ));
    }

    #[test]
    fn oversized_delta_results_are_rejected() {
        // source 11, target 2^28
        let delta = [11, 0x80, 0x80, 0x80, 0x80, 0x01, 0x90, 11];

        assert!(matches!(
            apply_delta(b"hello world", &delta, LIMIT),
            Err(ProtocolError::InvalidPack(_))
        ));
    }
}
