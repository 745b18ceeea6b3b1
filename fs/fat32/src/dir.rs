// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::error;
use tapir_fs::{Entry, EntryKind, FsError, Result};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

pub(crate) const RECORD_SIZE: usize = 32;

/// First name byte marking the end of a directory; everything after it is
/// free and zeroed.
pub(crate) const END_OF_DIRECTORY: u8 = 0x00;
/// First name byte marking a deleted record whose slot may be reused.
pub(crate) const TOMBSTONE: u8 = 0xE5;

pub(crate) const ATTR_VOLUME_ID: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;
/// READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID; marks a long-name record.
pub(crate) const ATTR_LONG_NAME: u8 = 0x0F;

const LAST_LONG_RECORD: u8 = 0x40;
const LONG_NAME_UNITS_PER_RECORD: usize = 13;
const LONG_NAME_MAX_UNITS: usize = 255;

/// Short (8.3) directory record.
///
/// The attribute byte is a bitmask: READ_ONLY 0x01, HIDDEN 0x02, SYSTEM
/// 0x04, VOLUME_ID 0x08, DIRECTORY 0x10, ARCHIVE 0x20.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct ShortRecord {
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub attributes: u8,
    /// Windows NT case flags; zero in synthesised records.
    pub reserved: u8,
    pub creation_tenths: u8,
    pub creation_time: U16,
    pub creation_date: U16,
    pub last_access_date: U16,
    pub high_cluster: U16,
    pub modification_time: U16,
    pub modification_date: U16,
    pub low_cluster: U16,
    pub file_size: U32,
}

impl ShortRecord {
    pub fn first_cluster(&self) -> u32 {
        (self.high_cluster.get() as u32) << 16 | self.low_cluster.get() as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.high_cluster.set((cluster >> 16) as u16);
        self.low_cluster.set(cluster as u16);
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn name_bytes(&self) -> [u8; 11] {
        let mut name = [0; 11];
        name[..8].copy_from_slice(&self.name);
        name[8..].copy_from_slice(&self.ext);
        name
    }

    /// Trimmed `NAME.EXT` form; the dot is omitted when the extension is
    /// blank.
    pub fn short_name(&self) -> String {
        let mut name = String::with_capacity(12);
        for &byte in trim_padding(&self.name) {
            name.push(byte as char);
        }
        let ext = trim_padding(&self.ext);
        if !ext.is_empty() {
            name.push('.');
            for &byte in ext {
                name.push(byte as char);
            }
        }
        name
    }
}

/// Long-name record: 13 UTF-16 units of the name spread over three chunks,
/// bound to the closing 8.3 record by a checksum of its name bytes.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct LongRecord {
    /// Position of this piece within the name, one-based; the highest
    /// carries the 0x40 flag and sits at the lowest byte offset on disk.
    pub sequence: u8,
    pub name1: [U16; 5],
    pub attributes: u8,
    pub kind: u8,
    pub checksum: u8,
    pub name2: [U16; 6],
    pub cluster: U16,
    pub name3: [U16; 2],
}

impl LongRecord {
    fn units(&self) -> [u16; LONG_NAME_UNITS_PER_RECORD] {
        let mut units = [0; LONG_NAME_UNITS_PER_RECORD];
        for (unit, value) in units.iter_mut().zip(
            self.name1
                .iter()
                .chain(self.name2.iter())
                .chain(self.name3.iter()),
        ) {
            *unit = value.get();
        }
        units
    }
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == b' ' {
        end -= 1;
    }
    &bytes[..end]
}

/// Rotate right by one, then add, over the 11 name bytes.
pub(crate) fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &byte| (sum >> 1 | sum << 7).wrapping_add(byte))
}

/// Long-name pieces gathered while scanning towards their 8.3 record.
struct PendingLongName {
    checksum: u8,
    pieces: Vec<(u8, [u16; LONG_NAME_UNITS_PER_RECORD])>,
}

impl PendingLongName {
    /// Reassembles the name if the group belongs to the 8.3 record with
    /// checksum `expected`; `None` falls back to the short name.
    fn into_name(mut self, expected: u8) -> Option<String> {
        if self.checksum != expected || self.pieces.is_empty() {
            return None;
        }
        self.pieces.sort_by_key(|&(sequence, _)| sequence);
        let units: Vec<u16> = self
            .pieces
            .iter()
            .flat_map(|(_, units)| units.iter().copied())
            .take_while(|&unit| unit != 0x0000 && unit != 0xFFFF)
            .collect();
        String::from_utf16(&units).ok()
    }
}

/// Walks the raw records of a directory buffer in index order, gathering
/// long-name pieces until the 8.3 record that closes the group. Yields the
/// record index of each 8.3 record together with the decoded entry.
///
/// Tombstones abandon the gathered pieces, as does a piece carrying a
/// different checksum; a group whose checksum does not match its 8.3
/// record surfaces under the short name only.
pub(crate) struct DirectoryDecoder<'buffer> {
    records: std::slice::ChunksExact<'buffer, u8>,
    index: usize,
    pending: Option<PendingLongName>,
}

impl<'buffer> DirectoryDecoder<'buffer> {
    pub fn new(buffer: &'buffer [u8]) -> Self {
        Self {
            records: buffer.chunks_exact(RECORD_SIZE),
            index: 0,
            pending: None,
        }
    }
}

impl Iterator for DirectoryDecoder<'_> {
    type Item = (usize, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = self.records.next()?;
            let index = self.index;
            self.index += 1;

            match record[0] {
                END_OF_DIRECTORY => return None,
                TOMBSTONE => {
                    self.pending = None;
                    continue;
                }
                _ => {}
            }

            if record[11] & ATTR_LONG_NAME == ATTR_LONG_NAME {
                let Ok(long) = LongRecord::ref_from_bytes(record) else {
                    continue;
                };
                let piece = (long.sequence & 0x1F, long.units());
                match &mut self.pending {
                    Some(pending) if pending.checksum == long.checksum => {
                        pending.pieces.push(piece)
                    }
                    _ => {
                        self.pending = Some(PendingLongName {
                            checksum: long.checksum,
                            pieces: vec![piece],
                        })
                    }
                }
                continue;
            }

            let Ok(short) = ShortRecord::ref_from_bytes(record) else {
                continue;
            };
            if short.attributes & ATTR_VOLUME_ID != 0 {
                self.pending = None;
                continue;
            }

            let long_name = self
                .pending
                .take()
                .and_then(|pending| pending.into_name(short_name_checksum(&short.name_bytes())));
            let entry = Entry {
                name: long_name.unwrap_or_else(|| short.short_name()),
                kind: if short.is_directory() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: short.file_size.get(),
                first_cluster: short.first_cluster(),
            };
            return Some((index, entry));
        }
    }
}

/// Characters allowed in an 8.3 name besides uppercase letters and digits.
const SHORT_NAME_PUNCTUATION: &[u8] = b"$%'-_@~`!(){}^#&";

fn is_short_name_byte(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte.is_ascii_digit() || SHORT_NAME_PUNCTUATION.contains(&byte)
}

fn sanitized(part: &str) -> Vec<u8> {
    part.bytes()
        .map(|byte| byte.to_ascii_uppercase())
        .filter(|&byte| is_short_name_byte(byte))
        .collect()
}

/// Derives a numeric-tail 8.3 alias (`POKEMO~1` style) for a long name,
/// trying rising suffixes until nothing in `taken` collides.
pub(crate) fn derive_short_name(name: &str, taken: &[[u8; 11]]) -> Result<[u8; 11]> {
    let (base, ext) = match name.rfind('.') {
        Some(dot) if dot != 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };
    let base = sanitized(base);
    let ext = sanitized(ext);

    let mut candidate = [b' '; 11];
    candidate[8..8 + ext.len().min(3)].copy_from_slice(&ext[..ext.len().min(3)]);

    for suffix in 1u32.. {
        let tail = format!("~{suffix}");
        if tail.len() >= 8 {
            break;
        }
        let base_length = base.len().min(6).min(8 - tail.len());
        candidate[..8].fill(b' ');
        candidate[..base_length].copy_from_slice(&base[..base_length]);
        candidate[base_length..base_length + tail.len()].copy_from_slice(tail.as_bytes());
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
    error!("No unique 8.3 alias derivable for {name}");
    Err(FsError::NameTooLong.into())
}

/// 11-byte names already present in a directory buffer, for alias
/// collision checks.
pub(crate) fn collect_short_names(buffer: &[u8]) -> Vec<[u8; 11]> {
    let mut names = Vec::new();
    for record in buffer.chunks_exact(RECORD_SIZE) {
        match record[0] {
            END_OF_DIRECTORY => break,
            TOMBSTONE => continue,
            _ => {}
        }
        if record[11] & ATTR_LONG_NAME == ATTR_LONG_NAME {
            continue;
        }
        let mut name = [0; 11];
        name.copy_from_slice(&record[..11]);
        names.push(name);
    }
    names
}

/// Encodes the long-name records and the closing 8.3 record for one entry,
/// in on-disk order: highest sequence first, down to sequence 1, then the
/// short record.
pub(crate) fn encode_entry(
    name: &str,
    short_name: [u8; 11],
    attributes: u8,
    first_cluster: u32,
    file_size: u32,
) -> Result<Vec<u8>> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > LONG_NAME_MAX_UNITS {
        error!("Name shall fit {LONG_NAME_MAX_UNITS} UTF-16 units");
        return Err(FsError::NameTooLong.into());
    }

    let record_count = units.len().div_ceil(LONG_NAME_UNITS_PER_RECORD).max(1);
    if units.len() < record_count * LONG_NAME_UNITS_PER_RECORD {
        // Null terminator, then 0xFFFF fill to the record boundary.
        units.push(0x0000);
        units.resize(record_count * LONG_NAME_UNITS_PER_RECORD, 0xFFFF);
    }

    let checksum = short_name_checksum(&short_name);
    let mut bytes = Vec::with_capacity((record_count + 1) * RECORD_SIZE);
    for sequence in (1..=record_count as u8).rev() {
        let mut record = LongRecord::new_zeroed();
        record.sequence = if sequence as usize == record_count {
            sequence | LAST_LONG_RECORD
        } else {
            sequence
        };
        record.attributes = ATTR_LONG_NAME;
        record.checksum = checksum;
        let chunk = &units
            [(sequence as usize - 1) * LONG_NAME_UNITS_PER_RECORD..sequence as usize * LONG_NAME_UNITS_PER_RECORD];
        for (field, &unit) in record
            .name1
            .iter_mut()
            .chain(record.name2.iter_mut())
            .chain(record.name3.iter_mut())
            .zip(chunk)
        {
            field.set(unit);
        }
        bytes.extend_from_slice(record.as_bytes());
    }

    let mut short = ShortRecord::new_zeroed();
    short.name.copy_from_slice(&short_name[..8]);
    short.ext.copy_from_slice(&short_name[8..]);
    short.attributes = attributes;
    short.set_first_cluster(first_cluster);
    short.file_size.set(file_size);
    bytes.extend_from_slice(short.as_bytes());
    Ok(bytes)
}

/// `.` / `..` record seeded into a fresh directory cluster.
pub(crate) fn encode_dot_record(name: &[u8; 11], first_cluster: u32) -> [u8; RECORD_SIZE] {
    let mut record = ShortRecord::new_zeroed();
    record.name.copy_from_slice(&name[..8]);
    record.ext.copy_from_slice(&name[8..]);
    record.attributes = ATTR_DIRECTORY;
    record.set_first_cluster(first_cluster);

    let mut bytes = [0; RECORD_SIZE];
    bytes.copy_from_slice(record.as_bytes());
    bytes
}

pub(crate) struct FreeRun {
    pub index: usize,
    /// The run reaches the end-of-directory marker, so the terminator has
    /// to be re-established behind whatever is written into it.
    pub at_end: bool,
}

/// First run of `needed` contiguous free records: tombstones, or the
/// zeroed tail from the end-of-directory marker on.
pub(crate) fn find_free_run(buffer: &[u8], needed: usize) -> Option<FreeRun> {
    let record_count = buffer.len() / RECORD_SIZE;
    let mut run_start = 0;
    let mut run = 0;
    for index in 0..record_count {
        match buffer[index * RECORD_SIZE] {
            END_OF_DIRECTORY => {
                if run == 0 {
                    run_start = index;
                }
                return (record_count - run_start >= needed).then_some(FreeRun {
                    index: run_start,
                    at_end: true,
                });
            }
            TOMBSTONE => {
                if run == 0 {
                    run_start = index;
                }
                run += 1;
                if run == needed {
                    return Some(FreeRun {
                        index: run_start,
                        at_end: false,
                    });
                }
            }
            _ => run = 0,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(buffer: &[u8]) -> Vec<Entry> {
        DirectoryDecoder::new(buffer).map(|(_, entry)| entry).collect()
    }

    #[test]
    fn checksum_rotates_and_adds() {
        assert_eq!(short_name_checksum(b"HELLO   TXT"), 241);
    }

    #[test]
    fn short_name_trims_padding() {
        let mut record = ShortRecord::new_zeroed();
        record.name.copy_from_slice(b"HELLO   ");
        record.ext.copy_from_slice(b"TXT");
        assert_eq!(record.short_name(), "HELLO.TXT");

        record.ext.copy_from_slice(b"   ");
        assert_eq!(record.short_name(), "HELLO");
    }

    #[test]
    fn derive_short_name_appends_numeric_tail() {
        assert_eq!(
            derive_short_name("Pokemon.txt", &[]).unwrap(),
            *b"POKEMO~1TXT"
        );
        assert_eq!(
            derive_short_name("Pokemon.txt", &[*b"POKEMO~1TXT"]).unwrap(),
            *b"POKEMO~2TXT"
        );
        assert_eq!(derive_short_name("a", &[]).unwrap(), *b"A~1        ");
    }

    #[test]
    fn encoded_group_decodes_back() {
        let group = encode_entry("Pokemon.txt", *b"POKEMO~1TXT", ATTR_ARCHIVE, 5, 0).unwrap();
        assert_eq!(group.len(), 2 * RECORD_SIZE);
        assert_eq!(group[0], 1 | 0x40);

        let entries = decode(&group);
        assert_eq!(
            entries,
            [Entry {
                name: "Pokemon.txt".into(),
                kind: EntryKind::File,
                size: 0,
                first_cluster: 5,
            }]
        );
    }

    #[test]
    fn long_group_spans_records_and_surrogates() {
        // 12 ASCII units put the surrogate pair of U+1F600 astride the
        // record boundary.
        let name = "ABCDEFGHIJKL\u{1F600}.txt";
        let short_name = derive_short_name(name, &[]).unwrap();
        let group = encode_entry(name, short_name, ATTR_ARCHIVE, 7, 42).unwrap();
        assert_eq!(group.len(), 3 * RECORD_SIZE);
        assert_eq!(group[0], 2 | 0x40);

        let entries = decode(&group);
        assert_eq!(entries[0].name, name);
        assert_eq!(entries[0].size, 42);
    }

    #[test]
    fn mismatched_checksum_falls_back_to_short_name() {
        let mut group = encode_entry("Pokemon.txt", *b"POKEMO~1TXT", ATTR_ARCHIVE, 5, 0).unwrap();
        group[13] ^= 0xA5;

        let entries = decode(&group);
        assert_eq!(entries[0].name, "POKEMO~1.TXT");
    }

    #[test]
    fn tombstone_abandons_gathered_pieces() {
        let mut buffer = encode_entry("Pokemon.txt", *b"POKEMO~1TXT", ATTR_ARCHIVE, 5, 0).unwrap();
        // Tombstone the long-name record; its 8.3 record then stands alone.
        buffer[0] = TOMBSTONE;

        let entries = decode(&buffer);
        assert_eq!(entries[0].name, "POKEMO~1.TXT");
    }

    #[test]
    fn volume_label_is_skipped() {
        let mut label = ShortRecord::new_zeroed();
        label.name.copy_from_slice(b"TAPIR   ");
        label.ext.copy_from_slice(b"   ");
        label.attributes = ATTR_VOLUME_ID;

        let mut buffer = label.as_bytes().to_vec();
        buffer.extend_from_slice(&encode_dot_record(b"DIR        ", 3));
        let entries = decode(&buffer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "DIR");
        assert_eq!(entries[0].kind, EntryKind::Directory);
    }

    #[test]
    fn decode_stops_at_end_of_directory() {
        let mut buffer = vec![0; 3 * RECORD_SIZE];
        buffer[2 * RECORD_SIZE..].copy_from_slice(&encode_dot_record(b"DIR        ", 3));
        assert!(decode(&buffer).is_empty());
    }

    #[test]
    fn free_run_counts_tombstones() {
        // Occupied, tombstone, occupied, end-of-directory.
        let mut buffer = vec![0; 4 * RECORD_SIZE];
        buffer[..RECORD_SIZE].copy_from_slice(&encode_dot_record(b"A          ", 3));
        buffer[RECORD_SIZE] = TOMBSTONE;
        buffer[2 * RECORD_SIZE..3 * RECORD_SIZE]
            .copy_from_slice(&encode_dot_record(b"B          ", 4));

        let run = find_free_run(&buffer, 1).unwrap();
        assert_eq!(run.index, 1);
        assert!(!run.at_end);

        // The tail after the terminator is a single record, too short.
        assert!(find_free_run(&buffer, 2).is_none());
    }

    #[test]
    fn free_run_spans_tombstones_into_the_tail() {
        // Tombstone, tombstone, end-of-directory, zeroed tail.
        let mut buffer = vec![0; 4 * RECORD_SIZE];
        buffer[0] = TOMBSTONE;
        buffer[RECORD_SIZE] = TOMBSTONE;

        let run = find_free_run(&buffer, 3).unwrap();
        assert_eq!(run.index, 0);
        assert!(run.at_end);
    }
}
