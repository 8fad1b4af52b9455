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
use salvage_ds::{DataStorage, Error, Result, VolumeError};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, IntoBytes, KnownLayout,
};

/// Size of a directory record in bytes.
pub const DIR_ENTRY_SIZE: usize = 32;

/// First byte of a directory record name marking a deleted entry. The
/// remaining 31 bytes of the record are left intact by deletion.
pub const DIR_ENTRY_DELETED: u8 = 0xE5;

pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
/// ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID, marking one
/// component of a long file name.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// A FAT32 FAT entry is a 28-bit value; the high 4 bits are reserved and
/// must be ignored when reading.
pub const ENTRY_MASK: u32 = 0x0FFF_FFFF;
pub const FREE_CLUSTER: u32 = 0x000_0000;
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
/// Canonical end-of-chain mark; any masked entry at or above it terminates
/// a chain.
pub const END_OF_CHAIN: u32 = 0x0FFF_FFF8;

/// Cluster 2 is the first cluster of the data region.
pub const FIRST_DATA_CLUSTER: u32 = 2;

pub fn is_free(entry: u32) -> bool {
    entry & ENTRY_MASK == FREE_CLUSTER
}

pub fn is_end_of_chain(entry: u32) -> bool {
    entry & ENTRY_MASK >= END_OF_CHAIN
}

/// Whether a masked entry names a followable cluster, so neither free,
/// reserved, bad nor end-of-chain.
pub fn is_chain_link(entry: u32) -> bool {
    (FIRST_DATA_CLUSTER..BAD_CLUSTER).contains(&(entry & ENTRY_MASK))
}

/// A FAT32 volume over a byte-addressed image. Geometry is parsed from the
/// boot sector once; every access afterwards goes through the typed
/// accessors, which treat the backing store as an unaligned little-endian
/// byte sequence regardless of the host architecture.
pub struct Volume<DS: DataStorage> {
    data_storage: DS,

    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    fat_count: u32,
    fat_sectors: u32,
    root_cluster: u32,

    bytes_per_cluster: u32,
    fat_offset: u64,
    fat_bytes: u64,
    data_offset: u64,
    image_length: u64,
}

impl<DS: DataStorage> Volume<DS> {
    pub fn new(data_storage: DS) -> Result<Self> {
        let mut boot_sector = BootSector::new_zeroed();
        data_storage.read(0, boot_sector.as_mut_bytes())?;

        let bytes_per_sector = boot_sector.bpb_bytspersec.get() as u32;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            error!("Bytes per sector ({bytes_per_sector}) shall be 512, 1024, 2048 or 4096");
            return Err(VolumeError::MalformedBootSector("bytes per sector").into());
        }
        let sectors_per_cluster = boot_sector.bpb_secperclus as u32;
        if !sectors_per_cluster.is_power_of_two() {
            error!("Sectors per cluster ({sectors_per_cluster}) shall be a power of 2");
            return Err(VolumeError::MalformedBootSector("sectors per cluster").into());
        }
        let bytes_per_cluster = bytes_per_sector * sectors_per_cluster;
        if bytes_per_cluster > 32 * 1024 {
            error!("Bytes per cluster ({bytes_per_cluster}) shall be at most 32 KiB");
            return Err(VolumeError::MalformedBootSector("bytes per cluster").into());
        }
        let reserved_sectors = boot_sector.bpb_rsvdseccnt.get() as u32;
        if reserved_sectors == 0 {
            error!("Reserved sector count shall not be 0");
            return Err(VolumeError::MalformedBootSector("reserved sectors").into());
        }
        let fat_count = boot_sector.bpb_numfats as u32;
        if fat_count != 1 && fat_count != 2 {
            error!("Number of FATs ({fat_count}) shall be 1 or 2");
            return Err(VolumeError::MalformedBootSector("number of FATs").into());
        }
        let fat_sectors = boot_sector.bpb_fatsz32.get();
        if fat_sectors == 0 {
            error!("FAT size shall not be 0");
            return Err(VolumeError::MalformedBootSector("FAT size").into());
        }
        let root_cluster = boot_sector.bpb_rootclus.get();
        if root_cluster < FIRST_DATA_CLUSTER {
            error!("Root directory cluster ({root_cluster}) shall be at least 2");
            return Err(VolumeError::MalformedBootSector("root cluster").into());
        }

        let image_length = data_storage.len()?;
        let fat_offset = reserved_sectors as u64 * bytes_per_sector as u64;
        let fat_bytes = fat_sectors as u64 * bytes_per_sector as u64;
        let data_offset = fat_offset + fat_count as u64 * fat_bytes;
        if data_offset > image_length {
            error!("FAT region ends at {data_offset} beyond the image ({image_length})");
            return Err(VolumeError::MalformedBootSector("FATs outside the image").into());
        }
        let root_end = data_offset
            + (root_cluster - FIRST_DATA_CLUSTER + 1) as u64 * bytes_per_cluster as u64;
        if root_end > image_length {
            error!("Root directory cluster ends at {root_end} beyond the image ({image_length})");
            return Err(VolumeError::MalformedBootSector("root cluster outside the image").into());
        }

        Ok(Self {
            data_storage,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            fat_sectors,
            root_cluster,
            bytes_per_cluster,
            fat_offset,
            fat_bytes,
            data_offset,
            image_length,
        })
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster
    }

    pub fn reserved_sectors(&self) -> u32 {
        self.reserved_sectors
    }

    pub fn fat_count(&self) -> u32 {
        self.fat_count
    }

    pub fn fat_sectors(&self) -> u32 {
        self.fat_sectors
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_cluster
    }

    fn fat_entry_offset(&self, copy: u32, cluster: u32) -> Result<u64> {
        if copy >= self.fat_count {
            return Err(VolumeError::FatCopyOutOfRange(copy).into());
        }
        let offset = cluster as u64 * 4;
        if offset + 4 > self.fat_bytes {
            return Err(VolumeError::ClusterOutOfRange(cluster).into());
        }
        Ok(self.fat_offset + copy as u64 * self.fat_bytes + offset)
    }

    /// Raw 32-bit FAT entry of a cluster; callers mask with [`ENTRY_MASK`]
    /// through the classification helpers.
    pub fn fat(&self, copy: u32, cluster: u32) -> Result<u32> {
        let offset = self.fat_entry_offset(copy, cluster)?;
        let mut entry = U32::new(0);
        self.data_storage.read(offset, entry.as_mut_bytes())?;
        Ok(entry.get())
    }

    pub fn set_fat(&self, copy: u32, cluster: u32, value: u32) -> Result<()> {
        let offset = self.fat_entry_offset(copy, cluster)?;
        self.data_storage.write(offset, U32::new(value).as_bytes())
    }

    /// Absolute byte offset of a data cluster, defined for clusters at or
    /// above 2 that lie entirely inside the image.
    pub fn cluster_offset(&self, cluster: u32) -> Result<u64> {
        if cluster < FIRST_DATA_CLUSTER {
            return Err(VolumeError::ClusterOutOfRange(cluster).into());
        }
        let offset = self.data_offset
            + (cluster - FIRST_DATA_CLUSTER) as u64 * self.bytes_per_cluster as u64;
        if offset + self.bytes_per_cluster as u64 > self.image_length {
            return Err(VolumeError::ClusterOutOfRange(cluster).into());
        }
        Ok(offset)
    }

    /// Reads `buffer.len()` bytes from the start of a cluster; the buffer
    /// shall not be larger than a cluster.
    pub fn read_cluster(&self, cluster: u32, buffer: &mut [u8]) -> Result<()> {
        let offset = self.cluster_offset(cluster)?;
        self.data_storage.read(offset, buffer)
    }

    /// Iterator over the cluster chain starting at `cluster`, following the
    /// first FAT until a non-link entry.
    pub fn chain_from(&self, cluster: u32) -> ClusterChain<'_, DS> {
        ClusterChain(self, cluster)
    }

    /// The root directory cluster chain.
    pub fn root_chain(&self) -> ClusterChain<'_, DS> {
        self.chain_from(self.root_cluster)
    }

    /// Lazy scan of the root directory records.
    pub fn root_entries(&self) -> DirEntries<'_, DS> {
        DirEntries {
            volume: self,
            chain: self.root_chain(),
            buffer: Vec::new(),
            cluster: 0,
            cluster_offset: 0,
            slot: 0,
            failed: false,
        }
    }

    /// Reads up to `length` logical file bytes starting at `start` by
    /// following FAT links. Stops early when the chain runs into a free,
    /// bad, end-of-chain or unaddressable entry; the caller sees the short
    /// read through the returned length.
    pub fn read_following_fat(&self, start: u32, length: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(length);
        let mut cluster = start;
        while bytes.len() < length && is_chain_link(cluster) {
            let cluster_index = cluster & ENTRY_MASK;
            if self.cluster_offset(cluster_index).is_err() {
                break;
            }
            let read = bytes.len();
            let chunk = (length - read).min(self.bytes_per_cluster as usize);
            bytes.resize(read + chunk, 0);
            self.read_cluster(cluster_index, &mut bytes[read..])?;
            cluster = match self.fat(0, cluster_index) {
                Ok(entry) => entry,
                Err(Error::Volume(VolumeError::ClusterOutOfRange(_))) => break,
                Err(error) => return Err(error),
            };
        }
        Ok(bytes)
    }

    /// Reads up to `length` bytes by concatenating the given clusters in
    /// order. The FAT is not consulted.
    pub fn read_sequence(&self, clusters: &[u32], length: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(length);
        for &cluster in clusters {
            if bytes.len() >= length {
                break;
            }
            let read = bytes.len();
            let chunk = (length - read).min(self.bytes_per_cluster as usize);
            bytes.resize(read + chunk, 0);
            self.read_cluster(cluster, &mut bytes[read..])?;
        }
        Ok(bytes)
    }

    /// Clusters a contiguous file of `size` bytes starting at `start` would
    /// occupy; empty for a zero-size file.
    pub fn contiguous_chain(&self, start: u32, size: u32) -> Vec<u32> {
        if size == 0 {
            return Vec::new();
        }
        let count = size.div_ceil(self.bytes_per_cluster);
        (start..start + count).collect()
    }

    /// Writes a cluster chain into every FAT copy: each cluster is linked to
    /// its successor and the last one is marked [`END_OF_CHAIN`]. No other
    /// FAT entry is touched.
    pub fn commit_chain(&self, chain: &[u32]) -> Result<()> {
        let Some((&last, links)) = chain.split_last() else {
            return Ok(());
        };
        for copy in 0..self.fat_count {
            for (&cluster, &next) in links.iter().zip(&chain[1..]) {
                self.set_fat(copy, cluster, next)?;
            }
            self.set_fat(copy, last, END_OF_CHAIN)?;
        }
        Ok(())
    }

    /// Rewrites the first name byte of a directory record in place, undoing
    /// the deletion mark.
    pub fn restore_slot_name(&self, slot: &Slot, first: u8) -> Result<()> {
        self.data_storage.write(slot.offset, &[first])
    }
}

pub struct ClusterChain<'vol, DS: DataStorage>(&'vol Volume<DS>, u32);

impl<DS: DataStorage> Iterator for ClusterChain<'_, DS> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if !is_chain_link(self.1) {
            return None;
        }
        let cluster = self.1 & ENTRY_MASK;
        match self.0.fat(0, cluster) {
            Ok(entry) => {
                self.1 = entry;
                Some(Ok(cluster))
            }
            Err(error) => {
                self.1 = FREE_CLUSTER;
                Some(Err(error))
            }
        }
    }
}

/// A directory record together with its location: the cluster and record
/// index it was read from and the absolute byte offset of the record, used
/// for writing the name byte back.
pub struct Slot {
    pub entry: DirEntry,
    pub cluster: u32,
    pub index: u32,
    pub offset: u64,
}

/// Walks the root directory chain and yields one [`Slot`] per record. A
/// record whose name starts with 0x00 ends the records of its cluster; the
/// chain walk continues with the next cluster. Classification beyond that
/// is left to the consumer.
pub struct DirEntries<'vol, DS: DataStorage> {
    volume: &'vol Volume<DS>,
    chain: ClusterChain<'vol, DS>,
    buffer: Vec<u8>,
    cluster: u32,
    cluster_offset: u64,
    slot: u32,
    failed: bool,
}

impl<DS: DataStorage> Iterator for DirEntries<'_, DS> {
    type Item = Result<Slot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let slots_per_cluster = (self.volume.bytes_per_cluster() as usize / DIR_ENTRY_SIZE) as u32;
        loop {
            if self.buffer.is_empty() || self.slot >= slots_per_cluster {
                let cluster = match self.chain.next()? {
                    Ok(cluster) => cluster,
                    Err(error) => {
                        self.failed = true;
                        return Some(Err(error));
                    }
                };
                let cluster_offset = match self.volume.cluster_offset(cluster) {
                    Ok(offset) => offset,
                    Err(error) => {
                        self.failed = true;
                        return Some(Err(error));
                    }
                };
                self.buffer.resize(self.volume.bytes_per_cluster() as usize, 0);
                if let Err(error) = self.volume.read_cluster(cluster, &mut self.buffer) {
                    self.failed = true;
                    return Some(Err(error));
                }
                self.cluster = cluster;
                self.cluster_offset = cluster_offset;
                self.slot = 0;
            }

            let index = self.slot;
            self.slot += 1;
            let mut entry = DirEntry::new_zeroed();
            entry
                .as_mut_bytes()
                .copy_from_slice(&self.buffer[index as usize * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]);
            if entry.is_end_of_directory() {
                self.slot = slots_per_cluster;
                continue;
            }
            return Some(Ok(Slot {
                entry,
                cluster: self.cluster,
                index,
                offset: self.cluster_offset + index as u64 * DIR_ENTRY_SIZE as u64,
            }));
        }
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout)]
struct BootSector {
    /// Jump instruction to boot code, either 0xEB 0x?? 0x90 or 0xE9 0x??
    /// 0x??.
    bs_jmpboot: [u8; 3],
    /// OEM name identifier, an indication of what system formatted the
    /// volume.
    bs_oemname: [u8; 8],

    /// Count of bytes per sector. This value may take on only the values
    /// 512, 1024, 2048 or 4096.
    bpb_bytspersec: U16,
    /// Number of sectors per allocation unit. A power of 2 greater than 0;
    /// the resulting bytes per cluster must not exceed 32K.
    bpb_secperclus: u8,
    /// Number of sectors in the reserved region of the volume starting at
    /// the first sector. Must not be 0.
    bpb_rsvdseccnt: U16,
    /// The count of file allocation tables on the volume. A value of 2 is
    /// recommended although a value of 1 is acceptable.
    bpb_numfats: u8,
    /// Count of 32-byte directory entries in the FAT12/FAT16 root
    /// directory; must be 0 for FAT32.
    bpb_rootentcnt: U16,
    /// Old 16-bit total sector count; must be 0 for FAT32.
    bpb_totsec16: U16,
    /// Media type, 0xF8 for fixed and 0xF0 for removable media.
    bpb_media: u8,
    /// FAT12/FAT16 16-bit count of sectors occupied by one FAT; must be 0
    /// for FAT32.
    bpb_fatsz16: U16,

    /// Sectors per track for interrupt 0x13, only relevant for media with a
    /// geometry.
    bpb_secpertrk: U16,
    /// Number of heads for interrupt 0x13.
    bpb_numheads: U16,
    /// Count of hidden sectors preceding the partition that contains this
    /// FAT volume; zero on unpartitioned media.
    bpb_hiddsec: U32,

    /// The 32-bit total count of sectors in all four regions of the volume.
    /// Must be non-zero for FAT32.
    bpb_totsec32: U32,

    /// The FAT32 32-bit count of sectors occupied by one FAT.
    bpb_fatsz32: U32,
    /// Bit 7 set means only the FAT referenced in bits 0-3 is active,
    /// otherwise the FAT is mirrored at runtime into all FATs.
    bpb_extflags: U16,
    /// Version number of the FAT32 volume, must be 0.
    bpb_fsver: U16,
    /// Cluster number of the first cluster of the root directory, usually 2
    /// but not required to be 2.
    bpb_rootclus: U32,
    /// Sector number of the FSINFO structure in the reserved area, usually
    /// 1.
    bpb_fsinfo: U16,
    /// Sector number of the backup boot record in the reserved area, 0 or
    /// 6.
    bpb_bkbootsec: U16,
    /// Reserved, must be 0.
    bpb_reserved: [u8; 12],

    /// Interrupt 0x13 drive number, 0x80 or 0x00.
    bs_drvnum: u8,
    /// Reserved, must be 0.
    bs_reserved1: u8,
    /// Extended boot signature, 0x29 when the following three fields are
    /// present.
    bs_bootsig: u8,
    /// Volume serial number, supports volume tracking on removable media.
    bs_volid: U32,
    /// Volume label, matches the 11-byte volume label recorded in the root
    /// directory.
    bs_vollab: [u8; 11],
    /// Informational file system type string; does not determine the FAT
    /// type.
    bs_filsystype: [u8; 8],

    bs_boot: [u8; 420],
    /// 0x55 at byte offset 510 and 0xAA at byte offset 511.
    signature_word: [u8; 2],
}

/// A 32-byte FAT directory record.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout)]
pub struct DirEntry {
    /// "Short" file name limited to 11 characters (8.3 format), space
    /// padded. The first byte doubles as the record state: 0x00 means no
    /// record here or after, 0xE5 means the record is free (deleted).
    dir_name: [u8; 11],
    /// ATTR_READ_ONLY 0x01, ATTR_HIDDEN 0x02, ATTR_SYSTEM 0x04,
    /// ATTR_VOLUME_ID 0x08, ATTR_DIRECTORY 0x10, ATTR_ARCHIVE 0x20;
    /// ATTR_LONG_NAME is the 0x0F composite.
    dir_attr: u8,
    /// Reserved, must be 0.
    dir_ntres: u8,
    /// Creation time, count of tenths of a second, 0..=199.
    dir_crttimetenth: u8,
    /// Creation time with a granularity of 2 seconds.
    dir_crttime: U16,
    /// Creation date.
    dir_crtdate: U16,
    /// Last access date.
    dir_lstaccdate: U16,
    /// High word of the first data cluster number; only valid on FAT32.
    dir_fstclushi: U16,
    /// Last modification time.
    dir_wrttime: U16,
    /// Last modification date.
    dir_wrtdate: U16,
    /// Low word of the first data cluster number.
    dir_fstcluslo: U16,
    /// Size of the file in bytes, 0 for directories.
    dir_filesize: U32,
}

impl DirEntry {
    pub fn raw_name(&self) -> &[u8; 11] {
        &self.dir_name
    }

    pub fn attr(&self) -> u8 {
        self.dir_attr
    }

    pub fn first_cluster(&self) -> u32 {
        (self.dir_fstclushi.get() as u32) << 16 | self.dir_fstcluslo.get() as u32
    }

    pub fn file_size(&self) -> u32 {
        self.dir_filesize.get()
    }

    pub fn is_end_of_directory(&self) -> bool {
        self.dir_name[0] == 0x00
    }

    pub fn is_deleted(&self) -> bool {
        self.dir_name[0] == DIR_ENTRY_DELETED
    }

    pub fn is_long_name(&self) -> bool {
        self.dir_attr == ATTR_LONG_NAME
    }

    pub fn is_volume_label(&self) -> bool {
        self.dir_attr == ATTR_VOLUME_ID
    }

    pub fn is_directory(&self) -> bool {
        self.dir_attr & ATTR_DIRECTORY != 0
    }

    /// Decodes the short name with `first` standing in for the first byte,
    /// which a deleted record no longer has: padding spaces are dropped and
    /// a dot is inserted before a non-empty extension. At most 12 bytes,
    /// byte-exact otherwise.
    pub fn name_bytes_with(&self, first: u8) -> Vec<u8> {
        let mut name = Vec::with_capacity(12);
        name.push(first);
        for (i, &c) in self.dir_name.iter().enumerate().skip(1) {
            if i == 8 && c != b' ' {
                name.push(b'.');
            }
            if c != b' ' {
                name.push(c);
            }
        }
        name
    }

    pub fn name_with(&self, first: u8) -> String {
        String::from_utf8_lossy(&self.name_bytes_with(first)).into_owned()
    }

    /// Printable form of the name as stored, with the first byte taken from
    /// the record and bytes below 0x20 dropped.
    pub fn display_name(&self) -> String {
        let mut name = Vec::with_capacity(12);
        for (i, &c) in self.dir_name.iter().enumerate() {
            if i == 8 && c != b' ' {
                name.push(b'.');
            }
            if c != b' ' && c >= 0x20 {
                name.push(c);
            }
        }
        String::from_utf8_lossy(&name).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use salvage_ds::MemStorage;

    const SECTOR: usize = 512;

    fn boot_sector(
        bytes_per_sector: u16,
        sectors_per_cluster: u8,
        reserved_sectors: u16,
        fat_count: u8,
        fat_sectors: u32,
        root_cluster: u32,
    ) -> [u8; SECTOR] {
        let mut sector = [0; SECTOR];
        sector[11..13].copy_from_slice(&bytes_per_sector.to_le_bytes());
        sector[13] = sectors_per_cluster;
        sector[14..16].copy_from_slice(&reserved_sectors.to_le_bytes());
        sector[16] = fat_count;
        sector[36..40].copy_from_slice(&fat_sectors.to_le_bytes());
        sector[44..48].copy_from_slice(&root_cluster.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    fn raw_entry(name: &[u8; 11], attr: u8, first_cluster: u32, file_size: u32) -> [u8; 32] {
        let mut record = [0; 32];
        record[..11].copy_from_slice(name);
        record[11] = attr;
        record[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        record[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        record[28..32].copy_from_slice(&file_size.to_le_bytes());
        record
    }

    /// 512-byte sectors, 1 sector per cluster, 1 reserved sector, 2 FATs of
    /// 1 sector each (128 entries), root at cluster 2 marked end-of-chain.
    fn image() -> Vec<u8> {
        let mut image = vec![0u8; 35 * SECTOR];
        image[..SECTOR].copy_from_slice(&boot_sector(512, 1, 1, 2, 1, 2));
        for fat in [1, 2] {
            image[fat * SECTOR..fat * SECTOR + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            image[fat * SECTOR + 4..fat * SECTOR + 8]
                .copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            image[fat * SECTOR + 8..fat * SECTOR + 12]
                .copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        }
        image
    }

    fn set_fat_raw(image: &mut [u8], cluster: u32, value: u32) {
        for fat in [1, 2] {
            let offset = fat * SECTOR + cluster as usize * 4;
            image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn cluster_range(cluster: u32) -> std::ops::Range<usize> {
        let offset = 3 * SECTOR + (cluster as usize - 2) * SECTOR;
        offset..offset + SECTOR
    }

    fn volume(image: Vec<u8>) -> Volume<MemStorage> {
        Volume::new(MemStorage::new(image)).unwrap()
    }

    #[test]
    fn parses_geometry() {
        let volume = volume(image());
        assert_eq!(volume.bytes_per_sector(), 512);
        assert_eq!(volume.sectors_per_cluster(), 1);
        assert_eq!(volume.reserved_sectors(), 1);
        assert_eq!(volume.fat_count(), 2);
        assert_eq!(volume.fat_sectors(), 1);
        assert_eq!(volume.root_cluster(), 2);
        assert_eq!(volume.bytes_per_cluster(), 512);
        assert_eq!(volume.cluster_offset(2).unwrap(), 3 * SECTOR as u64);
        assert_eq!(volume.fat(0, 2).unwrap(), 0x0FFF_FFF8);
        assert_eq!(volume.fat(1, 2).unwrap(), 0x0FFF_FFF8);
    }

    #[test]
    fn rejects_malformed_boot_sectors() {
        let cases: [(u16, u8, u16, u8, u32, u32); 6] = [
            (500, 1, 1, 2, 1, 2),     // bytes per sector not allowed
            (512, 3, 1, 2, 1, 2),     // sectors per cluster not a power of 2
            (4096, 16, 1, 2, 1, 2),   // 64 KiB clusters
            (512, 1, 1, 0, 1, 2),     // no FATs
            (512, 1, 1, 2, 0, 2),     // zero-size FAT
            (512, 1, 1, 2, 1, 1),     // root cluster below 2
        ];
        for (bps, spc, rsvd, fats, fatsz, root) in cases {
            let mut image = vec![0u8; 35 * SECTOR];
            image[..SECTOR].copy_from_slice(&boot_sector(bps, spc, rsvd, fats, fatsz, root));
            assert!(
                Volume::new(MemStorage::new(image)).is_err(),
                "accepted {bps}/{spc}/{rsvd}/{fats}/{fatsz}/{root}"
            );
        }
    }

    #[test]
    fn rejects_geometry_beyond_image() {
        // FAT region alone is larger than the whole image.
        let mut image = vec![0u8; 35 * SECTOR];
        image[..SECTOR].copy_from_slice(&boot_sector(512, 1, 1, 2, 64, 2));
        assert!(Volume::new(MemStorage::new(image)).is_err());

        // Root cluster starts past the end of the image.
        let mut image = vec![0u8; 35 * SECTOR];
        image[..SECTOR].copy_from_slice(&boot_sector(512, 1, 1, 2, 1, 40));
        assert!(Volume::new(MemStorage::new(image)).is_err());
    }

    #[test]
    fn entry_classification() {
        assert!(is_free(0));
        assert!(is_free(0xF000_0000));
        assert!(!is_free(2));
        assert!(is_end_of_chain(0x0FFF_FFF8));
        assert!(is_end_of_chain(0xFFFF_FFFF));
        assert!(!is_end_of_chain(0x0FFF_FFF7));
        assert!(is_chain_link(2));
        assert!(is_chain_link(0x0FFF_FFEF));
        assert!(!is_chain_link(1));
        assert!(!is_chain_link(0x0FFF_FFF7));
    }

    #[test]
    fn chain_follows_links_until_end() {
        let mut image = image();
        set_fat_raw(&mut image, 5, 6);
        set_fat_raw(&mut image, 6, 9);
        set_fat_raw(&mut image, 9, 0x0FFF_FFF8);
        let volume = volume(image);
        let chain: Vec<u32> = volume.chain_from(5).map(Result::unwrap).collect();
        assert_eq!(chain, [5, 6, 9]);
    }

    #[test]
    fn chain_stops_on_free_link() {
        let volume = volume(image());
        let chain: Vec<u32> = volume.chain_from(5).map(Result::unwrap).collect();
        assert_eq!(chain, [5]);
        assert_eq!(volume.chain_from(0).count(), 0);
    }

    #[test]
    fn commit_chain_links_every_copy() {
        let volume = volume(image());
        let before: Vec<u32> = (0..128).map(|i| volume.fat(0, i).unwrap()).collect();

        volume.commit_chain(&[5, 9, 6]).unwrap();
        for copy in 0..2 {
            assert_eq!(volume.fat(copy, 5).unwrap(), 9);
            assert_eq!(volume.fat(copy, 9).unwrap(), 6);
            assert_eq!(volume.fat(copy, 6).unwrap(), END_OF_CHAIN);
        }
        for (cluster, &entry) in before.iter().enumerate() {
            if ![5, 6, 9].contains(&cluster) {
                assert_eq!(volume.fat(0, cluster as u32).unwrap(), entry);
                assert_eq!(volume.fat(1, cluster as u32).unwrap(), entry);
            }
        }
    }

    #[test]
    fn commit_chain_single_and_empty() {
        let volume = volume(image());
        volume.commit_chain(&[4]).unwrap();
        assert_eq!(volume.fat(0, 4).unwrap(), END_OF_CHAIN);
        assert_eq!(volume.fat(1, 4).unwrap(), END_OF_CHAIN);
        volume.commit_chain(&[]).unwrap();
    }

    #[test]
    fn contiguous_chain_rounds_up() {
        let volume = volume(image());
        assert_eq!(volume.contiguous_chain(5, 0), Vec::<u32>::new());
        assert_eq!(volume.contiguous_chain(5, 1), [5]);
        assert_eq!(volume.contiguous_chain(5, 512), [5]);
        assert_eq!(volume.contiguous_chain(5, 513), [5, 6]);
        assert_eq!(volume.contiguous_chain(5, 1536), [5, 6, 7]);
    }

    #[test]
    fn read_following_fat_stops_at_cleared_link() {
        {
            let mut image = image();
            image[cluster_range(5)].fill(b'a');
            image[cluster_range(6)].fill(b'b');
            set_fat_raw(&mut image, 5, 6);
            set_fat_raw(&mut image, 6, 0x0FFF_FFF8);
            let volume = volume(image);

            let bytes = volume.read_following_fat(5, 600).unwrap();
            assert_eq!(bytes.len(), 600);
            assert!(bytes[..512].iter().all(|&c| c == b'a'));
            assert!(bytes[512..].iter().all(|&c| c == b'b'));
        }

        // A deleted file's links are zero, the read ends after one cluster.
        let mut image = image();
        image[cluster_range(5)].fill(b'a');
        let volume = volume(image);
        let bytes = volume.read_following_fat(5, 600).unwrap();
        assert_eq!(bytes.len(), 512);
    }

    #[test]
    fn read_sequence_ignores_fat() {
        let mut image = image();
        image[cluster_range(7)].fill(b'x');
        image[cluster_range(4)].fill(b'y');
        let volume = volume(image);

        let bytes = volume.read_sequence(&[7, 4], 700).unwrap();
        assert_eq!(bytes.len(), 700);
        assert!(bytes[..512].iter().all(|&c| c == b'x'));
        assert!(bytes[512..].iter().all(|&c| c == b'y'));
    }

    #[test]
    fn scans_root_records_across_clusters() {
        let mut image = image();
        // Root spans clusters 2 and 3; cluster 2 ends with a terminator
        // after two records, cluster 3 holds one more.
        set_fat_raw(&mut image, 2, 3);
        set_fat_raw(&mut image, 3, 0x0FFF_FFF8);
        let root = cluster_range(2).start;
        image[root..root + 32].copy_from_slice(&raw_entry(b"LIVE    TXT", 0x20, 5, 11));
        let mut deleted = raw_entry(b"XDEAD   TXT", 0x20, 6, 11);
        deleted[0] = DIR_ENTRY_DELETED;
        image[root + 32..root + 64].copy_from_slice(&deleted);
        let next = cluster_range(3).start;
        image[next..next + 32].copy_from_slice(&raw_entry(b"MORE    TXT", 0x20, 7, 11));
        let volume = volume(image);

        let slots: Vec<Slot> = volume.root_entries().map(Result::unwrap).collect();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].entry.display_name(), "LIVE.TXT");
        assert!(slots[1].entry.is_deleted());
        assert_eq!(slots[1].offset, root as u64 + 32);
        assert_eq!(slots[2].cluster, 3);
        assert_eq!(slots[2].entry.display_name(), "MORE.TXT");
    }

    #[test]
    fn restores_slot_name_in_place() {
        let mut image = image();
        let root = cluster_range(2).start;
        let mut deleted = raw_entry(b"XDEAD   TXT", 0x20, 6, 11);
        deleted[0] = DIR_ENTRY_DELETED;
        image[root..root + 32].copy_from_slice(&deleted);
        let volume = volume(image);

        let slot = volume.root_entries().next().unwrap().unwrap();
        volume.restore_slot_name(&slot, b'D').unwrap();
        let slot = volume.root_entries().next().unwrap().unwrap();
        assert!(!slot.entry.is_deleted());
        assert_eq!(slot.entry.display_name(), "DDEAD.TXT");
    }

    #[test]
    fn decodes_short_names() {
        let entry = |name: &[u8; 11]| {
            let mut record = DirEntry::new_zeroed();
            record.as_mut_bytes()[..11].copy_from_slice(name);
            record
        };

        assert_eq!(entry(b"HELLO   TXT").name_with(b'H'), "HELLO.TXT");
        assert_eq!(entry(b"README     ").name_with(b'R'), "README");
        assert_eq!(entry(b"A B     C D").name_with(b'A'), "AB.CD");
        assert_eq!(entry(b"XELLO   TXT").name_with(b'_'), "_ELLO.TXT");

        // The display form filters bytes below 0x20.
        let mut raw = *b"HELLO   TXT";
        raw[4] = 0x07;
        assert_eq!(entry(&raw).display_name(), "HELL.TXT");
    }

    #[test]
    fn name_decode_matches_display_for_printable_names() {
        for name in [b"HELLO   TXT", b"A          ", b"NOEXT      ", b"12345678ABC"] {
            let mut record = DirEntry::new_zeroed();
            record.as_mut_bytes()[..11].copy_from_slice(name);
            assert_eq!(record.name_with(name[0]), record.display_name());
        }
    }

    #[test]
    fn first_cluster_combines_both_words() {
        let mut record = DirEntry::new_zeroed();
        record
            .as_mut_bytes()
            .copy_from_slice(&raw_entry(b"BIG     BIN", 0x20, 0x0005_0007, 1));
        assert_eq!(record.first_cluster(), 0x0005_0007);
    }
}
