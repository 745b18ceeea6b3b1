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
use tapir_fs::{Entry, EntryKind, Error, FileSystem, FsError, Result};
use tapir_media::Medium;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

mod dir;
mod fat;

use dir::{DirectoryDecoder, ShortRecord, ATTR_ARCHIVE, ATTR_DIRECTORY, RECORD_SIZE};
use fat::{FatTable, EOC};

/// A mounted FAT32 volume over a block image.
///
/// The FAT cache loaded at mount is the authoritative allocation state for
/// the life of the handle. `write` and `create` flush it back themselves;
/// `unmount` flushes once more so a handle dropped after plain reads costs
/// nothing.
#[derive(Debug)]
pub struct FatVolume<M: Medium> {
    medium: M,
    cluster_size: u32,
    fat_offset: u64,
    data_start: u64,
    root_cluster: u32,
    fat: FatTable,
}

/// BIOS parameter block, parsed once at mount.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BootSector {
    /// x86 jump to the boot code; not interpreted here.
    jump_boot: [u8; 3],
    oem_name: [u8; 8],
    /// 512, 1024, 2048 or 4096.
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved_sectors: U16,
    /// Number of FAT copies, usually 2.
    fat_copies: u8,
    /// Root directory slots; zero on FAT32, where the root lives in the
    /// data region like any other directory.
    root_entries: U16,
    total_sectors_16: U16,
    media_descriptor: u8,
    /// FAT12/16 FAT size; zero on FAT32.
    fat_size_16: U16,
    sectors_per_track: U16,
    head_count: U16,
    hidden_sectors: U32,
    total_sectors_32: U32,
    /// Sectors per FAT copy.
    fat_size_32: U32,
    extended_flags: U16,
    version: U16,
    /// First cluster of the root directory, usually 2.
    root_cluster: U32,
    fs_info_sector: U16,
    backup_boot_sector: U16,
    reserved: [u8; 12],
    drive_number: u8,
    nt_flags: u8,
    boot_signature: u8,
    volume_serial: U32,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

impl<M: Medium> FatVolume<M> {
    /// Parses the boot sector, derives the volume geometry and loads the
    /// FAT cache.
    pub fn mount(medium: M) -> Result<Self> {
        let mut boot_sector = BootSector::new_zeroed();
        if medium.read(0, boot_sector.as_mut_bytes()).is_err() {
            error!("Image shall hold a full boot sector");
            return Err(FsError::BadImage.into());
        }

        let bytes_per_sector = boot_sector.bytes_per_sector.get() as u32;
        let sectors_per_cluster = boot_sector.sectors_per_cluster as u32;
        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            error!("Bytes per sector and sectors per cluster shall be non-zero");
            return Err(FsError::BadImage.into());
        }
        let fat_copies = boot_sector.fat_copies;
        let fat_size = boot_sector.fat_size_32.get();
        if fat_copies == 0 || fat_size == 0 {
            error!("FAT count and FAT size shall be non-zero");
            return Err(FsError::BadImage.into());
        }

        let cluster_size = bytes_per_sector * sectors_per_cluster;
        let fat_offset =
            boot_sector.reserved_sectors.get() as u64 * bytes_per_sector as u64;
        let fat_byte_size = fat_size as u64 * bytes_per_sector as u64;
        let data_start = fat_offset + fat_copies as u64 * fat_byte_size;

        let mut fat_bytes = vec![0; fat_byte_size as usize];
        if medium.read(fat_offset, &mut fat_bytes).is_err() {
            error!("Image shall hold {fat_byte_size} FAT bytes at {fat_offset}");
            return Err(FsError::BadImage.into());
        }
        let fat = FatTable::new(&fat_bytes, fat_offset, fat_copies)?;

        Ok(Self {
            medium,
            cluster_size,
            fat_offset,
            data_start,
            root_cluster: boot_sector.root_cluster.get(),
            fat,
        })
    }

    /// Writes the FAT cache back to every copy on the medium.
    pub fn flush(&self) -> Result<()> {
        self.fat.flush(&self.medium)
    }

    /// Flushes and consumes the handle, handing the medium back.
    pub fn unmount(self) -> Result<M> {
        self.fat.flush(&self.medium)?;
        Ok(self.medium)
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn fat_byte_offset(&self) -> u64 {
        self.fat_offset
    }

    /// Byte offset such that cluster N's data begins at
    /// `data_region_base + N * cluster_size`; valid cluster numbers start
    /// at 2, which the base already accounts for.
    pub fn data_region_base(&self) -> u64 {
        self.data_start - 2 * self.cluster_size as u64
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start + (cluster as u64 - 2) * self.cluster_size as u64
    }

    /// Reads up to `buffer.len()` bytes starting `offset` bytes into the
    /// chain rooted at `start`. The count returned falls short when the
    /// chain ends first.
    fn read_chain(&self, start: u32, offset: u32, buffer: &mut [u8]) -> Result<usize> {
        if start < 2 {
            error!("Chain shall not start below cluster 2");
            return Err(FsError::BadImage.into());
        }

        let cluster_size = self.cluster_size;
        let mut chain = self.fat.chain(start);
        for _ in 0..offset / cluster_size {
            match chain.next() {
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error),
                None => return Ok(0),
            }
        }

        let mut intra = (offset % cluster_size) as usize;
        let mut read = 0;
        while read < buffer.len() {
            let cluster = match chain.next() {
                Some(cluster) => cluster?,
                None => break,
            };
            let take = (cluster_size as usize - intra).min(buffer.len() - read);
            self.medium.read(
                self.cluster_offset(cluster) + intra as u64,
                &mut buffer[read..read + take],
            )?;
            read += take;
            intra = 0;
        }
        Ok(read)
    }

    /// Writes `buffer` starting `offset` bytes into the chain rooted at
    /// `start`, linking fresh clusters past the end as needed. Returns the
    /// bytes written plus the resulting file size; the count is short when
    /// no free cluster remains.
    fn write_chain(
        &mut self,
        start: u32,
        file_size: u32,
        offset: u32,
        buffer: &[u8],
    ) -> Result<(usize, u32)> {
        if start < 2 {
            error!("Chain shall not start below cluster 2");
            return Err(FsError::BadImage.into());
        }
        if buffer.is_empty() {
            return Ok((0, file_size));
        }

        let cluster_size = self.cluster_size;
        let mut cluster = start;
        let mut steps = 0;
        for _ in 0..offset / cluster_size {
            cluster = match self.step_or_extend(cluster)? {
                Some(next) => next,
                None => return Ok((0, file_size)),
            };
            steps += 1;
            if steps > self.fat.entry_count() {
                error!("Chain revisits cluster {cluster}");
                return Err(FsError::CycleDetected.into());
            }
        }

        let mut intra = (offset % cluster_size) as usize;
        let mut written = 0;
        loop {
            let take = (cluster_size as usize - intra).min(buffer.len() - written);
            self.medium.write(
                self.cluster_offset(cluster) + intra as u64,
                &buffer[written..written + take],
            )?;
            written += take;
            intra = 0;
            if written == buffer.len() {
                break;
            }
            cluster = match self.step_or_extend(cluster)? {
                Some(next) => next,
                None => break,
            };
            steps += 1;
            if steps > self.fat.entry_count() {
                error!("Chain revisits cluster {cluster}");
                return Err(FsError::CycleDetected.into());
            }
        }

        let new_file_size = file_size.max(offset + written as u32);
        Ok((written, new_file_size))
    }

    /// Follows FAT[cluster]; on end-of-chain links a fresh zeroed cluster.
    /// `None` means the volume is out of clusters.
    fn step_or_extend(&mut self, cluster: u32) -> Result<Option<u32>> {
        let entry = self.fat.next(cluster)?;
        if self.fat.is_chained(entry) {
            return Ok(Some(entry));
        }
        match self.allocate_after(cluster) {
            Ok(fresh) => Ok(Some(fresh)),
            Err(Error::Fs(FsError::NoSpace)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Allocates the smallest free cluster as a fresh single-cluster chain
    /// and zeroes its data.
    fn allocate_cluster(&mut self) -> Result<u32> {
        let Some(fresh) = self.fat.find_free() else {
            error!("No free cluster remains");
            return Err(FsError::NoSpace.into());
        };
        self.fat.set(fresh, EOC);
        let zeroes = vec![0; self.cluster_size as usize];
        self.medium.write(self.cluster_offset(fresh), &zeroes)?;
        Ok(fresh)
    }

    fn allocate_after(&mut self, cluster: u32) -> Result<u32> {
        let fresh = self.allocate_cluster()?;
        self.fat.set(cluster, fresh);
        Ok(fresh)
    }

    fn extend_chain(&mut self, start: u32) -> Result<u32> {
        let last = self.fat.last_in_chain(start)?;
        self.allocate_after(last)
    }

    /// Materialises a directory chain into one contiguous buffer.
    fn read_directory(&self, start: u32) -> Result<Vec<u8>> {
        let length = self.fat.chain_length(start)?;
        let mut buffer = vec![0; length * self.cluster_size as usize];
        self.read_chain(start, 0, &mut buffer)?;
        Ok(buffer)
    }

    fn segments(path: &str) -> Vec<&str> {
        path.split('/').filter(|segment| !segment.is_empty()).collect()
    }

    /// Resolves a path to its entry; `None` is the root directory, which
    /// has no record of its own. Name comparison is ASCII
    /// case-insensitive.
    fn resolve(&self, path: &str) -> Result<Option<Entry>> {
        let segments = Self::segments(path);
        let mut cluster = self.root_cluster;
        for (position, segment) in segments.iter().enumerate() {
            let buffer = self.read_directory(cluster)?;
            let Some((_, entry)) = DirectoryDecoder::new(&buffer)
                .find(|(_, entry)| entry.name.eq_ignore_ascii_case(segment))
            else {
                return Err(FsError::NotFound.into());
            };
            if position + 1 == segments.len() {
                return Ok(Some(entry));
            }
            if !entry.is_directory() {
                return Err(FsError::NotADirectory.into());
            }
            // `..` stores cluster 0 when it points at the root.
            cluster = if entry.first_cluster < 2 {
                self.root_cluster
            } else {
                entry.first_cluster
            };
        }
        Ok(None)
    }

    /// Resolves a path that must name a directory, to its first cluster.
    fn resolve_directory(&self, path: &str) -> Result<u32> {
        match self.resolve(path)? {
            None => Ok(self.root_cluster),
            Some(entry) if entry.is_directory() => {
                Ok(if entry.first_cluster < 2 {
                    self.root_cluster
                } else {
                    entry.first_cluster
                })
            }
            Some(_) => Err(FsError::NotADirectory.into()),
        }
    }

    /// Adds a long-name group plus 8.3 record for `name` to the directory
    /// chain at `dir_cluster`, extending the chain when no free run of
    /// records is large enough.
    fn insert_entry(
        &mut self,
        dir_cluster: u32,
        name: &str,
        kind: EntryKind,
        first_cluster: u32,
        file_size: u32,
    ) -> Result<()> {
        let attributes = match kind {
            EntryKind::File => ATTR_ARCHIVE,
            EntryKind::Directory => ATTR_DIRECTORY,
        };

        loop {
            let mut buffer = self.read_directory(dir_cluster)?;
            let short_name = dir::derive_short_name(name, &dir::collect_short_names(&buffer))?;
            let group = dir::encode_entry(name, short_name, attributes, first_cluster, file_size)?;
            let needed = group.len() / RECORD_SIZE;

            if let Some(run) = dir::find_free_run(&buffer, needed) {
                let offset = run.index * RECORD_SIZE;
                buffer[offset..offset + group.len()].copy_from_slice(&group);
                let end = offset + group.len();
                if run.at_end && end < buffer.len() {
                    buffer[end..end + RECORD_SIZE].fill(0);
                }
                if run.at_end && end == buffer.len() {
                    // The group swallowed the terminator and filled the
                    // chain; a fresh zeroed cluster keeps one in place.
                    self.extend_chain(dir_cluster)?;
                }
                self.write_chain(dir_cluster, 0, 0, &buffer)?;
                return Ok(());
            }

            self.extend_chain(dir_cluster)?;
        }
    }

    /// Rewrites the 8.3 record at `record_index` within the directory
    /// chain rooted at `dir_cluster`. The index counts records from the
    /// start of the chain; the owning cluster is found by walking it.
    fn rewrite_record(
        &self,
        dir_cluster: u32,
        record_index: usize,
        record: &ShortRecord,
    ) -> Result<()> {
        let records_per_cluster = self.cluster_size as usize / RECORD_SIZE;
        let chain_position = record_index / records_per_cluster;
        let intra = (record_index % records_per_cluster) * RECORD_SIZE;

        let mut chain = self.fat.chain(dir_cluster);
        let mut cluster = None;
        for _ in 0..=chain_position {
            cluster = match chain.next() {
                Some(next) => Some(next?),
                None => None,
            };
        }
        let Some(cluster) = cluster else {
            error!("Record {record_index} shall lie within the directory chain");
            return Err(FsError::BadImage.into());
        };
        self.medium
            .write(self.cluster_offset(cluster) + intra as u64, record.as_bytes())
    }
}

impl<M: Medium> FileSystem for FatVolume<M> {
    fn list(&mut self, path: &str) -> Result<Vec<Entry>> {
        let cluster = self.resolve_directory(path)?;
        let buffer = self.read_directory(cluster)?;
        Ok(DirectoryDecoder::new(&buffer).map(|(_, entry)| entry).collect())
    }

    fn lookup(&mut self, path: &str) -> Result<Entry> {
        match self.resolve(path)? {
            Some(entry) => Ok(entry),
            None => Ok(Entry {
                name: String::new(),
                kind: EntryKind::Directory,
                size: 0,
                first_cluster: self.root_cluster,
            }),
        }
    }

    fn create(&mut self, dir_path: &str, name: &str, kind: EntryKind) -> Result<u32> {
        if name.is_empty() || name.contains('/') {
            error!("Entry name shall be a single non-empty path segment");
            return Err(FsError::NameTooLong.into());
        }
        let dir_cluster = self.resolve_directory(dir_path)?;

        let first_cluster = self.allocate_cluster()?;
        if kind == EntryKind::Directory {
            let parent = if dir_cluster == self.root_cluster {
                0
            } else {
                dir_cluster
            };
            let mut records = [0; 2 * RECORD_SIZE];
            records[..RECORD_SIZE]
                .copy_from_slice(&dir::encode_dot_record(b".          ", first_cluster));
            records[RECORD_SIZE..].copy_from_slice(&dir::encode_dot_record(b"..         ", parent));
            self.medium
                .write(self.cluster_offset(first_cluster), &records)?;
        }

        if let Err(error) = self.insert_entry(dir_cluster, name, kind, first_cluster, 0) {
            self.fat.set(first_cluster, 0);
            return Err(error);
        }
        self.fat.flush(&self.medium)?;
        Ok(first_cluster)
    }

    fn read(&mut self, path: &str, offset: u32, buffer: &mut [u8]) -> Result<usize> {
        let Some(entry) = self.resolve(path)? else {
            return Err(FsError::IsADirectory.into());
        };
        if entry.is_directory() {
            return Err(FsError::IsADirectory.into());
        }
        if buffer.is_empty() || offset >= entry.size || entry.first_cluster < 2 {
            return Ok(0);
        }
        let length = buffer.len().min((entry.size - offset) as usize);
        self.read_chain(entry.first_cluster, offset, &mut buffer[..length])
    }

    fn write(&mut self, path: &str, offset: u32, buffer: &[u8]) -> Result<usize> {
        let segments = Self::segments(path);
        let Some((name, parent)) = segments.split_last() else {
            return Err(FsError::IsADirectory.into());
        };
        let dir_cluster = self.resolve_directory(&parent.join("/"))?;

        let dir_buffer = self.read_directory(dir_cluster)?;
        let Some((record_index, entry)) = DirectoryDecoder::new(&dir_buffer)
            .find(|(_, entry)| entry.name.eq_ignore_ascii_case(name))
        else {
            return Err(FsError::NotFound.into());
        };
        if entry.is_directory() {
            return Err(FsError::IsADirectory.into());
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let first_cluster = if entry.first_cluster < 2 {
            match self.allocate_cluster() {
                Ok(fresh) => fresh,
                Err(Error::Fs(FsError::NoSpace)) => return Ok(0),
                Err(error) => return Err(error),
            }
        } else {
            entry.first_cluster
        };

        let (written, new_size) = self.write_chain(first_cluster, entry.size, offset, buffer)?;

        // Propagate the new size, and the first cluster when one was just
        // linked, into the directory record.
        let record_offset = record_index * RECORD_SIZE;
        let mut record =
            ShortRecord::read_from_bytes(&dir_buffer[record_offset..record_offset + RECORD_SIZE])
                .map_err(|_| FsError::BadImage)?;
        record.file_size.set(new_size);
        record.set_first_cluster(first_cluster);
        self.rewrite_record(dir_cluster, record_index, &record)?;

        self.fat.flush(&self.medium)?;
        Ok(written)
    }
}
