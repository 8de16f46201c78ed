//! FAT32 filesystem.
//!
//! The FAT is the single source of truth for cluster allocation; when the
//! volume carries multiple FAT copies, every FAT write goes to all of them.
//! Cluster `c` lives at sector `first_data_sector + (c - 2) * cluster_sectors`.
//! Directory streams are parsed into [`DirEntry`] values carrying their byte
//! offset so mutations can be flushed back by rewriting the owning records.
//!
//! FAT12 and FAT16 volumes are recognized but mounted read-only (the Open
//! Question on FAT12 writes is resolved as "refuse at mount"): every
//! mutating operation checks one `read_only` flag and answers
//! [`FsError::UnsupportedFatType`].
//!
//! Write ordering: cluster data is written first, FAT entries are already on
//! disk by then (they are written at allocation time), and the directory
//! entry is flushed last — a crash in between leaks free space but never
//! corrupts other files.

pub mod bpb;
pub mod dir;
pub mod name;

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use palmyra_core::kwarn;

use crate::drivers::block::{BlockDevice, SECTOR_SIZE};
use crate::fs::FsError;

pub use bpb::{BiosParameterBlock, FatType};
pub use dir::{Attributes, DirEntry, RawDirEntry};

/// FAT32 entry mask (top nibble is reserved).
const FAT_MASK: u32 = 0x0FFF_FFFF;
/// Smallest end-of-chain marker.
const FAT_EOC_MIN: u32 = 0x0FFF_FFF8;
/// Value written to terminate a chain.
const FAT_EOC: u32 = 0x0FFF_FFFF;
/// A free FAT entry.
const FAT_FREE: u32 = 0;

/// Sector I/O deadline used by the filesystem.
const FS_TIMEOUT_MS: u32 = 200;

/// Whether a FAT value marks end-of-chain.
#[must_use]
fn is_eoc(value: u32) -> bool {
    value >= FAT_EOC_MIN
}

/// A mounted FAT volume over any block device.
pub struct FatVolume<D: BlockDevice> {
    disk: D,
    bpb: BiosParameterBlock,
    read_only: bool,
}

impl<D: BlockDevice> FatVolume<D> {
    /// Mounts the volume: parses the BPB and derives the geometry.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidVolume`] when sector 0 is not a FAT BPB.
    pub fn open(mut disk: D) -> Result<Self, FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        disk.read_sector(0, &mut sector, FS_TIMEOUT_MS)?;
        let bpb = BiosParameterBlock::parse(&sector)?;

        let read_only = bpb.fat_type != FatType::Fat32;
        if read_only {
            kwarn!("fat: {:?} volume mounted read-only", bpb.fat_type);
        }

        Ok(Self {
            disk,
            bpb,
            read_only,
        })
    }

    /// The parsed volume geometry.
    #[must_use]
    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    /// Whether mutating operations are refused (FAT12/16 mount).
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Bytes per cluster.
    #[must_use]
    pub fn cluster_bytes(&self) -> u32 {
        self.bpb.cluster_bytes()
    }

    /// A pseudo-entry for the root directory (its parent pointer is 0).
    #[must_use]
    pub fn root_entry(&self) -> DirEntry {
        let mut raw = RawDirEntry::new(*b"/          ", Attributes::DIRECTORY);
        raw.first_cluster = self.bpb.root_cluster;
        DirEntry {
            offset_in_parent: 0,
            parent_first_cluster: 0,
            long_name: String::from("/"),
            short_name: String::from("/"),
            raw,
        }
    }

    // ---------------------------------------------------------------------
    // FAT access
    // ---------------------------------------------------------------------

    /// First sector of cluster `cluster`.
    ///
    /// # Panics
    ///
    /// An out-of-range cluster index here means a corrupt caller, which is a
    /// kernel bug: panic rather than scribble on the wrong sector.
    fn cluster_to_sector(&self, cluster: u32) -> u32 {
        assert!(
            (2..self.bpb.cluster_count + 2).contains(&cluster),
            "invalid cluster index {cluster}"
        );
        self.bpb.first_data_sector + (cluster - 2) * u32::from(self.bpb.cluster_sectors)
    }

    /// Reads the FAT entry for `cluster` (masked to 28 bits).
    fn fat_entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let offset = cluster * 4;
        let sector_lba = u32::from(self.bpb.reserved_sectors) + offset / SECTOR_SIZE as u32;
        let mut sector = [0u8; SECTOR_SIZE];
        self.disk.read_sector(sector_lba, &mut sector, FS_TIMEOUT_MS)?;
        let at = (offset % SECTOR_SIZE as u32) as usize;
        let value =
            u32::from_le_bytes([sector[at], sector[at + 1], sector[at + 2], sector[at + 3]]);
        Ok(value & FAT_MASK)
    }

    /// Writes the FAT entry for `cluster` into every FAT copy, preserving
    /// the reserved top nibble.
    fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        let offset = cluster * 4;
        let at = (offset % SECTOR_SIZE as u32) as usize;

        for copy in 0..u32::from(self.bpb.fat_count) {
            let sector_lba = u32::from(self.bpb.reserved_sectors)
                + copy * self.bpb.fat_size_sectors
                + offset / SECTOR_SIZE as u32;
            let mut sector = [0u8; SECTOR_SIZE];
            self.disk.read_sector(sector_lba, &mut sector, FS_TIMEOUT_MS)?;
            let old =
                u32::from_le_bytes([sector[at], sector[at + 1], sector[at + 2], sector[at + 3]]);
            let new = (old & !FAT_MASK) | (value & FAT_MASK);
            sector[at..at + 4].copy_from_slice(&new.to_le_bytes());
            self.disk.write_sector(sector_lba, &sector, FS_TIMEOUT_MS)?;
        }
        Ok(())
    }

    /// Whether `cluster` is a plausible chain member.
    fn cluster_in_range(&self, cluster: u32) -> bool {
        (2..self.bpb.cluster_count + 2).contains(&cluster)
    }

    /// Walks the chain from `start`, skipping `offset / cluster_bytes`
    /// clusters and collecting `ceil(size / cluster_bytes)` of them.
    ///
    /// Cycles and out-of-range links terminate the walk with a warning and
    /// return the clusters collected so far — corrupt media must not loop
    /// forever.
    pub fn read_cluster_chain(
        &mut self,
        start: u32,
        offset: u32,
        size: u32,
    ) -> Result<Vec<u32>, FsError> {
        let cb = self.cluster_bytes();
        let skip = offset / cb;
        let want = size.div_ceil(cb) as usize;

        let mut clusters = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = start;

        for step in 0.. {
            if step >= self.bpb.cluster_count as u64 + 2 {
                kwarn!("fat: chain from {} exceeds cluster count, truncating", start);
                break;
            }
            if !self.cluster_in_range(current) {
                kwarn!("fat: chain from {} reaches bogus cluster {}", start, current);
                break;
            }
            if !seen.insert(current) {
                kwarn!("fat: cycle in chain from {}, truncating", start);
                break;
            }

            if step >= u64::from(skip) {
                clusters.push(current);
                if clusters.len() == want {
                    break;
                }
            }

            let next = self.fat_entry(current)?;
            if is_eoc(next) {
                break;
            }
            if next == FAT_FREE {
                kwarn!("fat: chain from {} runs into a free cluster", start);
                break;
            }
            current = next;
        }

        Ok(clusters)
    }

    /// The full chain starting at `start`.
    fn chain(&mut self, start: u32) -> Result<Vec<u32>, FsError> {
        self.read_cluster_chain(start, 0, u32::MAX)
    }

    /// Allocates the first free cluster (linear scan from 2) and marks it
    /// end-of-chain.
    ///
    /// # Errors
    ///
    /// [`FsError::NoSpace`] when the FAT has no free entry.
    fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        for cluster in 2..self.bpb.cluster_count + 2 {
            if self.fat_entry(cluster)? == FAT_FREE {
                self.set_fat_entry(cluster, FAT_EOC)?;
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Allocates a cluster and links it after `prev`.
    fn allocate_cluster_after(&mut self, prev: u32) -> Result<u32, FsError> {
        let new = self.allocate_cluster()?;
        self.set_fat_entry(prev, new)?;
        Ok(new)
    }

    /// Frees the chain from `start`: read successor, write 0, step. Stops
    /// at end-of-chain, free entries, bogus links, or after `cluster_count`
    /// steps (cycles).
    fn free_cluster_chain(&mut self, start: u32) -> Result<(), FsError> {
        let mut current = start;
        for _ in 0..self.bpb.cluster_count + 2 {
            if !self.cluster_in_range(current) {
                kwarn!("fat: free-chain hit bogus cluster {}", current);
                return Ok(());
            }
            let next = self.fat_entry(current)?;
            self.set_fat_entry(current, FAT_FREE)?;
            if is_eoc(next) || next == FAT_FREE {
                return Ok(());
            }
            current = next;
        }
        kwarn!("fat: cycle while freeing chain from {}", start);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Cluster data I/O
    // ---------------------------------------------------------------------

    /// Reads one whole cluster.
    fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, FsError> {
        let first = self.cluster_to_sector(cluster);
        let mut data = vec![0u8; self.cluster_bytes() as usize];
        for (index, chunk) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let mut sector = [0u8; SECTOR_SIZE];
            self.disk
                .read_sector(first + index as u32, &mut sector, FS_TIMEOUT_MS)?;
            chunk.copy_from_slice(&sector);
        }
        Ok(data)
    }

    /// Writes one whole cluster.
    fn write_cluster(&mut self, cluster: u32, data: &[u8]) -> Result<(), FsError> {
        debug_assert_eq!(data.len(), self.cluster_bytes() as usize);
        let first = self.cluster_to_sector(cluster);
        for (index, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(chunk);
            self.disk
                .write_sector(first + index as u32, &sector, FS_TIMEOUT_MS)?;
        }
        Ok(())
    }

    /// Allocates a zeroed cluster (used when extending directories).
    fn allocate_zeroed_cluster(&mut self) -> Result<u32, FsError> {
        let cluster = self.allocate_cluster()?;
        let zeros = vec![0u8; self.cluster_bytes() as usize];
        self.write_cluster(cluster, &zeros)?;
        Ok(cluster)
    }

    // ---------------------------------------------------------------------
    // Directory reading
    // ---------------------------------------------------------------------

    /// Reads a directory's raw record stream (all clusters of its chain).
    fn read_directory_stream(&mut self, dir_cluster: u32) -> Result<Vec<u8>, FsError> {
        let clusters = self.chain(dir_cluster)?;
        let mut stream = Vec::with_capacity(clusters.len() * self.cluster_bytes() as usize);
        for cluster in clusters {
            stream.extend_from_slice(&self.read_cluster(cluster)?);
        }
        Ok(stream)
    }

    /// Parses the directory starting at `dir_cluster` into live entries.
    ///
    /// LFN slots accumulate until the real entry arrives; a checksum
    /// mismatch orphans the long name (logged) and the short name is used.
    /// Volume labels are skipped.
    pub fn get_directory_entries(&mut self, dir_cluster: u32) -> Result<Vec<DirEntry>, FsError> {
        let stream = self.read_directory_stream(dir_cluster)?;
        let mut entries = Vec::new();
        let mut assembler = name::LfnAssembler::new();

        for (index, record) in stream.chunks_exact(dir::DIR_ENTRY_SIZE).enumerate() {
            match record[0] {
                dir::ENTRY_END => break,
                dir::ENTRY_DELETED => {
                    assembler.reset();
                    continue;
                }
                _ => {}
            }

            if dir::is_lfn_record(record[11]) {
                assembler.push_slot(record);
                continue;
            }

            let raw = RawDirEntry::decode(record);
            let long_name = assembler.take(&raw.short_name).unwrap_or_default();
            if raw.is_volume_label() {
                continue;
            }

            entries.push(DirEntry {
                offset_in_parent: (index * dir::DIR_ENTRY_SIZE) as u32,
                parent_first_cluster: dir_cluster,
                long_name,
                short_name: raw.display_short_name(),
                raw,
            });
        }
        Ok(entries)
    }

    /// Resolves a `/`-separated absolute path to its entry.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] for missing components,
    /// [`FsError::NotADirectory`] when an intermediate component is a file.
    pub fn resolve_path(&mut self, path: &str) -> Result<DirEntry, FsError> {
        let mut current = self.root_entry();
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !current.is_directory() {
                return Err(FsError::NotADirectory);
            }
            let entries = self.get_directory_entries(current.first_cluster())?;
            current = entries
                .into_iter()
                .find(|e| e.matches(component))
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    // ---------------------------------------------------------------------
    // Directory mutation
    // ---------------------------------------------------------------------

    /// Rewrites one 32-byte record at `byte_offset` of the directory whose
    /// chain starts at `dir_cluster`, touching only its 512-byte sector.
    fn write_dir_record(
        &mut self,
        dir_cluster: u32,
        byte_offset: u32,
        record: &[u8; dir::DIR_ENTRY_SIZE],
    ) -> Result<(), FsError> {
        let cb = self.cluster_bytes();
        let cluster_index = (byte_offset / cb) as usize;
        let clusters = self.chain(dir_cluster)?;
        let cluster = *clusters.get(cluster_index).ok_or(FsError::Corrupted)?;

        let within = byte_offset % cb;
        let sector_lba = self.cluster_to_sector(cluster) + within / SECTOR_SIZE as u32;
        let at = (within % SECTOR_SIZE as u32) as usize;

        let mut sector = [0u8; SECTOR_SIZE];
        self.disk.read_sector(sector_lba, &mut sector, FS_TIMEOUT_MS)?;
        sector[at..at + dir::DIR_ENTRY_SIZE].copy_from_slice(record);
        self.disk.write_sector(sector_lba, &sector, FS_TIMEOUT_MS)?;
        Ok(())
    }

    /// Flushes a live entry's raw record back to its parent directory.
    pub fn flush_entry(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        if self.read_only {
            return Err(FsError::UnsupportedFatType);
        }
        self.write_dir_record(
            entry.parent_first_cluster,
            entry.offset_in_parent,
            &entry.raw.encode(),
        )
    }

    /// Finds `needed` consecutive free records in the directory, extending
    /// it by one zeroed cluster when no run exists. Returns the byte offset
    /// of the run's first record.
    fn find_free_run(&mut self, dir_cluster: u32, needed: usize) -> Result<u32, FsError> {
        for attempt in 0..2 {
            let stream = self.read_directory_stream(dir_cluster)?;
            let mut run_start = 0usize;
            let mut run_len = 0usize;

            for (index, record) in stream.chunks_exact(dir::DIR_ENTRY_SIZE).enumerate() {
                if record[0] == dir::ENTRY_END || record[0] == dir::ENTRY_DELETED {
                    if run_len == 0 {
                        run_start = index;
                    }
                    run_len += 1;
                    if run_len == needed {
                        return Ok((run_start * dir::DIR_ENTRY_SIZE) as u32);
                    }
                } else {
                    run_len = 0;
                }
            }

            if attempt == 0 {
                // No run: grow the directory by one zeroed cluster.
                let clusters = self.chain(dir_cluster)?;
                let last = *clusters.last().ok_or(FsError::Corrupted)?;
                let new = self.allocate_zeroed_cluster()?;
                self.set_fat_entry(last, new)?;
            }
        }
        Err(FsError::NoSpace)
    }

    /// Creates a file (or directory entry) named `long_name` in `parent`.
    ///
    /// Generates a unique short name, emits LFN slots when needed (written
    /// last-slot-first with the 0x40 flag on the first-written slot), finds
    /// a run of free records, and writes the run followed by the main
    /// record. The returned entry's offset is the main record's, not the
    /// first LFN's.
    ///
    /// # Errors
    ///
    /// [`FsError::AlreadyExists`], [`FsError::InvalidName`],
    /// [`FsError::NoSpace`], I/O errors.
    pub fn create_file(
        &mut self,
        parent: &DirEntry,
        long_name: &str,
        attributes: Attributes,
    ) -> Result<DirEntry, FsError> {
        if self.read_only {
            return Err(FsError::UnsupportedFatType);
        }
        if !parent.is_directory() {
            return Err(FsError::NotADirectory);
        }
        if long_name.is_empty()
            || long_name.encode_utf16().count() > name::MAX_LFN_UNITS
            || long_name.contains('/')
        {
            return Err(FsError::InvalidName);
        }

        let dir_cluster = parent.first_cluster();
        let existing = self.get_directory_entries(dir_cluster)?;
        if existing.iter().any(|e| e.matches(long_name)) {
            return Err(FsError::AlreadyExists);
        }

        let taken: Vec<[u8; 11]> = existing.iter().map(|e| e.raw.short_name).collect();
        let short_name = name::generate_short_name(long_name, |candidate| {
            taken.iter().any(|t| t == candidate)
        });
        let checksum = name::short_name_checksum(&short_name);

        let lfn_slots = if name::needs_lfn(long_name) {
            name::encode_lfn_slots(long_name, checksum)
        } else {
            Vec::new()
        };

        let run_offset = self.find_free_run(dir_cluster, lfn_slots.len() + 1)?;

        // LFN slots first (already in disk order), then the main record.
        for (index, slot) in lfn_slots.iter().enumerate() {
            self.write_dir_record(
                dir_cluster,
                run_offset + (index * dir::DIR_ENTRY_SIZE) as u32,
                slot,
            )?;
        }
        let raw = RawDirEntry::new(short_name, attributes);
        let main_offset = run_offset + (lfn_slots.len() * dir::DIR_ENTRY_SIZE) as u32;
        self.write_dir_record(dir_cluster, main_offset, &raw.encode())?;

        Ok(DirEntry {
            offset_in_parent: main_offset,
            parent_first_cluster: dir_cluster,
            long_name: if lfn_slots.is_empty() {
                String::new()
            } else {
                String::from(long_name)
            },
            short_name: raw.display_short_name(),
            raw,
        })
    }

    /// Creates a subdirectory: the entry, one cluster initialized with the
    /// `.` and `..` records, and the parent entry flushed with the new
    /// first cluster.
    ///
    /// # Errors
    ///
    /// As [`create_file`](Self::create_file), plus [`FsError::NoSpace`].
    pub fn create_directory(
        &mut self,
        parent: &DirEntry,
        dir_name: &str,
    ) -> Result<DirEntry, FsError> {
        let mut entry = self.create_file(parent, dir_name, Attributes::DIRECTORY)?;

        let cluster = self.allocate_zeroed_cluster()?;

        // "." points at the new directory itself, ".." at its parent (0 when
        // the parent is the root).
        let mut dot = RawDirEntry::new(*b".          ", Attributes::DIRECTORY);
        dot.first_cluster = cluster;
        let mut dotdot = RawDirEntry::new(*b"..         ", Attributes::DIRECTORY);
        dotdot.first_cluster = if parent.parent_first_cluster == 0
            && parent.first_cluster() == self.bpb.root_cluster
        {
            0
        } else {
            parent.first_cluster()
        };

        let mut data = vec![0u8; self.cluster_bytes() as usize];
        data[..dir::DIR_ENTRY_SIZE].copy_from_slice(&dot.encode());
        data[dir::DIR_ENTRY_SIZE..2 * dir::DIR_ENTRY_SIZE].copy_from_slice(&dotdot.encode());
        self.write_cluster(cluster, &data)?;

        entry.raw.first_cluster = cluster;
        self.flush_entry(&entry)?;
        Ok(entry)
    }

    /// Deletes a file: frees its chain, marks the main record deleted, and
    /// walks backwards marking the LFN run deleted too.
    ///
    /// # Errors
    ///
    /// [`FsError::IsADirectory`] for directories.
    pub fn delete_file(&mut self, entry: &DirEntry) -> Result<(), FsError> {
        if self.read_only {
            return Err(FsError::UnsupportedFatType);
        }
        if entry.is_directory() {
            return Err(FsError::IsADirectory);
        }

        if entry.first_cluster() >= 2 {
            self.free_cluster_chain(entry.first_cluster())?;
        }

        let dir_cluster = entry.parent_first_cluster;
        let stream = self.read_directory_stream(dir_cluster)?;

        // Mark the main record deleted.
        let mut offset = entry.offset_in_parent;
        self.mark_record_deleted(dir_cluster, &stream, offset)?;

        // Walk the preceding LFN run, newest to oldest, stopping at the
        // 0x40-flagged (first-written) slot.
        while offset >= dir::DIR_ENTRY_SIZE as u32 {
            offset -= dir::DIR_ENTRY_SIZE as u32;
            let record = &stream[offset as usize..offset as usize + dir::DIR_ENTRY_SIZE];
            if record[0] == dir::ENTRY_DELETED || !dir::is_lfn_record(record[11]) {
                break;
            }
            let sequence = record[0];
            self.mark_record_deleted(dir_cluster, &stream, offset)?;
            if sequence & name::LFN_LAST_FLAG != 0 {
                break;
            }
        }
        Ok(())
    }

    /// Rewrites one record with its first byte set to 0xE5.
    fn mark_record_deleted(
        &mut self,
        dir_cluster: u32,
        stream: &[u8],
        offset: u32,
    ) -> Result<(), FsError> {
        let mut record = [0u8; dir::DIR_ENTRY_SIZE];
        record.copy_from_slice(&stream[offset as usize..offset as usize + dir::DIR_ENTRY_SIZE]);
        record[0] = dir::ENTRY_DELETED;
        self.write_dir_record(dir_cluster, offset, &record)
    }

    // ---------------------------------------------------------------------
    // File data
    // ---------------------------------------------------------------------

    /// Reads `count` bytes of the file starting at byte `offset`, clamped to
    /// the file size.
    pub fn read(&mut self, entry: &DirEntry, offset: u32, count: u32) -> Result<Vec<u8>, FsError> {
        if entry.size() <= offset {
            return Ok(Vec::new());
        }
        let count = count.min(entry.size() - offset);
        if count == 0 || entry.first_cluster() < 2 {
            return Ok(Vec::new());
        }

        let cb = self.cluster_bytes();
        let clusters = self.read_cluster_chain(entry.first_cluster(), offset, count + offset % cb)?;

        let mut data = Vec::with_capacity(clusters.len() * cb as usize);
        for cluster in &clusters {
            data.extend_from_slice(&self.read_cluster(*cluster)?);
        }

        let head = (offset % cb) as usize;
        let end = (head + count as usize).min(data.len());
        Ok(data[head.min(data.len())..end].to_vec())
    }

    /// Convenience wrapper: the whole file.
    pub fn read_entire_file(&mut self, entry: &DirEntry) -> Result<Vec<u8>, FsError> {
        self.read(entry, 0, entry.size())
    }

    /// Replaces the file's content: frees the existing chain, resets the
    /// entry to empty, then appends. An empty `data` never allocates a
    /// cluster. When appending runs out of space, the file is left empty —
    /// never in a half-written state.
    pub fn write(&mut self, entry: &mut DirEntry, data: &[u8]) -> Result<(), FsError> {
        if self.read_only {
            return Err(FsError::UnsupportedFatType);
        }
        if entry.is_directory() {
            return Err(FsError::IsADirectory);
        }

        if entry.first_cluster() >= 2 {
            self.free_cluster_chain(entry.first_cluster())?;
        }
        entry.raw.first_cluster = 0;
        entry.raw.file_size = 0;
        self.flush_entry(entry)?;

        match self.append(entry, data) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Failed mid-append: release whatever was built and leave
                // the file empty.
                if entry.first_cluster() >= 2 {
                    let _ = self.free_cluster_chain(entry.first_cluster());
                }
                entry.raw.first_cluster = 0;
                entry.raw.file_size = 0;
                self.flush_entry(entry)?;
                Err(err)
            }
        }
    }

    /// Appends `data` to the file: fills the partially-used last cluster
    /// first, then allocates, links, and fills clusters one at a time. The
    /// directory entry (size, first cluster) is flushed after the data and
    /// FAT updates are on disk.
    pub fn append(&mut self, entry: &mut DirEntry, data: &[u8]) -> Result<(), FsError> {
        if self.read_only {
            return Err(FsError::UnsupportedFatType);
        }
        if entry.is_directory() {
            return Err(FsError::IsADirectory);
        }
        if data.is_empty() {
            return Ok(());
        }

        let cb = self.cluster_bytes() as usize;
        let mut remaining = data;
        let size = entry.size();

        // Tail of the existing chain, when there is one.
        let mut last_cluster = if entry.first_cluster() >= 2 {
            self.chain(entry.first_cluster())?.last().copied()
        } else {
            None
        };

        // Fill the partial last cluster first.
        let used = (size as usize) % cb;
        if size > 0 && used != 0 {
            let cluster = last_cluster.ok_or(FsError::Corrupted)?;
            let take = remaining.len().min(cb - used);
            let mut cluster_data = self.read_cluster(cluster)?;
            cluster_data[used..used + take].copy_from_slice(&remaining[..take]);
            self.write_cluster(cluster, &cluster_data)?;
            remaining = &remaining[take..];
        }

        // Allocate, link, and fill whole clusters for the rest.
        while !remaining.is_empty() {
            let cluster = match last_cluster {
                Some(prev) => self.allocate_cluster_after(prev)?,
                None => {
                    let first = self.allocate_cluster()?;
                    entry.raw.first_cluster = first;
                    first
                }
            };
            last_cluster = Some(cluster);

            let take = remaining.len().min(cb);
            let mut cluster_data = vec![0u8; cb];
            cluster_data[..take].copy_from_slice(&remaining[..take]);
            self.write_cluster(cluster, &cluster_data)?;
            remaining = &remaining[take..];
        }

        entry.raw.file_size = size + data.len() as u32;
        self.flush_entry(entry)
    }
}
