//! Partition-scoped virtual disk.
//!
//! A bounds-checked window `(start_lba, sector_count)` over an underlying
//! block device. LBA 0 of the window is `start_lba` of the parent; anything
//! outside the window is rejected before it reaches the hardware.

use crate::drivers::block::{BlockDevice, BlockError, SECTOR_SIZE};
use crate::fs::mbr::Partition;

/// A logical window into a block device.
pub struct VirtualDisk<D: BlockDevice> {
    device: D,
    start_lba: u32,
    sector_count: u32,
}

impl<D: BlockDevice> VirtualDisk<D> {
    /// Creates a window over `device`.
    pub fn new(device: D, start_lba: u32, sector_count: u32) -> Self {
        Self {
            device,
            start_lba,
            sector_count,
        }
    }

    /// Creates the window a partition entry describes.
    pub fn from_partition(device: D, partition: &Partition) -> Self {
        Self::new(device, partition.start_lba, partition.sector_count)
    }

    /// First sector of the window on the parent device.
    #[must_use]
    pub fn start_lba(&self) -> u32 {
        self.start_lba
    }

    /// Gives back the underlying device.
    pub fn into_inner(self) -> D {
        self.device
    }

    fn check(&self, lba: u32) -> Result<u32, BlockError> {
        if lba >= self.sector_count {
            return Err(BlockError::OutOfRange);
        }
        Ok(self.start_lba + lba)
    }
}

impl<D: BlockDevice> BlockDevice for VirtualDisk<D> {
    fn sector_count(&self) -> u32 {
        self.sector_count
    }

    fn read_sector(
        &mut self,
        lba: u32,
        buf: &mut [u8; SECTOR_SIZE],
        timeout_ms: u32,
    ) -> Result<(), BlockError> {
        let parent_lba = self.check(lba)?;
        self.device.read_sector(parent_lba, buf, timeout_ms)
    }

    fn write_sector(
        &mut self,
        lba: u32,
        buf: &[u8; SECTOR_SIZE],
        timeout_ms: u32,
    ) -> Result<(), BlockError> {
        let parent_lba = self.check(lba)?;
        self.device.write_sector(parent_lba, buf, timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ramdisk::RamDisk;

    #[test]
    fn window_translates_lba() {
        let mut parent = RamDisk::new(100);
        let mut marker = [0u8; SECTOR_SIZE];
        marker[0] = 0x42;
        parent.write_sector(10, &marker, 100).unwrap();

        let mut vdisk = VirtualDisk::new(parent, 10, 50);
        assert_eq!(vdisk.sector_count(), 50);

        let mut buf = [0u8; SECTOR_SIZE];
        vdisk.read_sector(0, &mut buf, 100).unwrap();
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn out_of_window_rejected() {
        let parent = RamDisk::new(100);
        let mut vdisk = VirtualDisk::new(parent, 10, 50);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            vdisk.read_sector(50, &mut buf, 100),
            Err(BlockError::OutOfRange)
        );
        assert_eq!(
            vdisk.write_sector(1000, &buf, 100),
            Err(BlockError::OutOfRange)
        );
    }

    #[test]
    fn writes_land_in_parent_window() {
        let parent = RamDisk::new(100);
        let mut vdisk = VirtualDisk::new(parent, 20, 10);
        let mut data = [0u8; SECTOR_SIZE];
        data[5] = 0x99;
        vdisk.write_sector(3, &data, 100).unwrap();

        let mut parent = vdisk.into_inner();
        let mut buf = [0u8; SECTOR_SIZE];
        parent.read_sector(23, &mut buf, 100).unwrap();
        assert_eq!(buf[5], 0x99);
    }
}
