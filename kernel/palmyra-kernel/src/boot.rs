//! Kernel initialization glue (target only).
//!
//! Brings the subsystems up leaves-first: early serial logging, the frame
//! allocator, paging, the heap, the full logger, ACPI discovery, the HPET
//! clock, power management, PCIe, the NIC and network stack, the ATA disk
//! and FAT volume, and finally the window manager. Hardware that fails to
//! probe degrades: the kernel continues without that subsystem.

use alloc::boxed::Box;

use palmyra_acpi::{AcpiHandler, AcpiTables};
use palmyra_core::sync::{Mutex, SpinLock};
use palmyra_core::{kerr, kinfo, kwarn, sched};

use crate::addr::{PAGE_SIZE, PhysAddr, VirtAddr, align_up};
use crate::arch::X86PortIo;
use crate::drivers::ata::{AtaDevice, AtaRole};
use crate::drivers::pcnet;
use crate::drivers::{BlockDevice, IdentityDma};
use crate::fs::fat::FatVolume;
use crate::fs::{mbr, vdisk::VirtualDisk};
use crate::mm::paging::{IdentityBacking, PageDirectory, PageFlags};
use crate::mm::pmm::FrameAllocator;
use crate::net::{Ipv4Address, NetStack};
use crate::power::PowerManager;
use crate::time::Hpet;
use crate::wm::WindowManager;

/// What the boot trampoline hands the kernel.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// Total usable RAM in bytes.
    pub total_ram: u32,
    /// First free physical address past the kernel image.
    pub kernel_end: u32,
    /// Physical address of the ACPI RSDP, or 0 when firmware gave none.
    pub rsdp_address: u32,
    /// Framebuffer width in pixels.
    pub screen_width: u32,
    /// Framebuffer height in pixels.
    pub screen_height: u32,
}

/// The ATA primary channel I/O base.
const ATA_PRIMARY_BASE: u16 = 0x1F0;

/// Static network configuration, until DHCP exists.
const LOCAL_IP: Ipv4Address = Ipv4Address([192, 168, 1, 101]);
const NETMASK: Ipv4Address = Ipv4Address([255, 255, 255, 0]);
const GATEWAY: Ipv4Address = Ipv4Address([192, 168, 1, 1]);

/// The mounted root volume.
type RootVolume = FatVolume<VirtualDisk<AtaDevice<X86PortIo>>>;

static ROOT_VOLUME: SpinLock<Option<RootVolume>> = SpinLock::new(None);

/// Serializes filesystem operations that may yield mid-transaction.
static FS_MUTEX: Mutex = Mutex::new();

/// Power management state, once ACPI is up.
static POWER: SpinLock<Option<PowerManager>> = SpinLock::new(None);

/// The window manager.
static WM: SpinLock<Option<WindowManager>> = SpinLock::new(None);

/// Identity-mapping ACPI handler: firmware tables are mapped
/// present/uncached at their physical addresses on first touch.
struct IdentityAcpiHandler;

impl AcpiHandler for IdentityAcpiHandler {
    unsafe fn map_physical_region(&self, phys: u64, len: usize) -> *const u8 {
        let start = phys as u32 & !(PAGE_SIZE - 1);
        let end = align_up((phys as u32).saturating_add(len as u32), PAGE_SIZE);

        let mut backing = IdentityBacking;
        crate::mm::paging::with_kernel_directory(|dir| {
            let mut page = start;
            while page < end {
                let _ = dir.map(
                    &mut backing,
                    VirtAddr::new(page),
                    PhysAddr::new(page),
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_CACHE,
                );
                page += PAGE_SIZE;
            }
        });

        phys as u32 as usize as *const u8
    }
}

/// Full kernel initialization. Returns once every subsystem that could be
/// brought up is running.
pub fn kernel_init(info: &BootInfo) {
    // Phase 1 logging: raw serial, no locks, no heap.
    // SAFETY: COM1 is the platform UART.
    unsafe { crate::drivers::uart::Uart16550::new(crate::drivers::uart::COM1).init() };
    crate::log::init_early_serial();
    kinfo!("palmyra: booting ({} MiB RAM)", info.total_ram >> 20);

    init_memory(info);
    crate::log::init_logger();

    let tables = init_acpi(info);
    init_pci_and_net(tables.as_ref());
    init_storage();

    let mut wm = WM.lock();
    *wm = Some(WindowManager::new(info.screen_width, info.screen_height));
    drop(wm);

    kinfo!("palmyra: kernel core up");
}

/// Frame allocator, kernel page directory, heap.
fn init_memory(info: &BootInfo) {
    // Carve the frame bitmap out of the first free memory past the image.
    let total_frames = (info.total_ram / PAGE_SIZE) as usize;
    let bitmap_words = total_frames.div_ceil(32);
    let bitmap_base = align_up(info.kernel_end, PAGE_SIZE);
    // SAFETY: the region past the kernel image is unused RAM, identity
    // mapped by the boot trampoline; it is claimed here exactly once.
    let bitmap = unsafe {
        core::slice::from_raw_parts_mut(bitmap_base as usize as *mut u32, bitmap_words)
    };
    let safe_end = align_up(bitmap_base + (bitmap_words as u32) * 4, PAGE_SIZE);

    crate::mm::pmm::init(FrameAllocator::new(
        bitmap,
        info.total_ram,
        PhysAddr::new(safe_end),
    ));
    kinfo!(
        "pmm: {} frames, safe end {:#010x}",
        total_frames,
        safe_end
    );

    // Fresh kernel directory, identity mapping all of RAM.
    let mut backing = IdentityBacking;
    let mut dir = PageDirectory::new(&mut backing).expect("no frames for page directory");
    let mut page = 0u32;
    while page < info.total_ram {
        if let Err(err) = dir.map(
            &mut backing,
            VirtAddr::new(page),
            PhysAddr::new(page),
            PageFlags::PRESENT | PageFlags::WRITABLE,
        ) {
            panic!("identity map failed at {page:#010x}: {err:?}");
        }
        page += PAGE_SIZE;
    }
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    // SAFETY: the directory identity-maps the executing kernel.
    unsafe {
        dir.activate();
    }
    crate::mm::paging::init_kernel_directory(dir);

    // The heap grows on demand from identity-mapped pages.
    crate::mm::heap::init();
}

/// ACPI discovery, HPET clock, power management.
fn init_acpi(info: &BootInfo) -> Option<AcpiTables> {
    if info.rsdp_address == 0 {
        kwarn!("acpi: no RSDP from firmware, continuing degraded");
        return None;
    }

    let handler = IdentityAcpiHandler;
    let (root, is_xsdt) = match palmyra_acpi::parse_rsdp(&handler, u64::from(info.rsdp_address)) {
        Ok(found) => found,
        Err(err) => {
            kerr!("acpi: bad RSDP ({:?}), continuing degraded", err);
            return None;
        }
    };

    let tables = match AcpiTables::parse(&handler, root, is_xsdt) {
        Ok(tables) => tables,
        Err(err) => {
            kerr!("acpi: table walk failed ({:?})", err);
            return None;
        }
    };
    if tables.discarded() > 0 {
        kwarn!("acpi: discarded {} corrupt tables", tables.discarded());
    }
    kinfo!(
        "acpi: {} tables indexed ({})",
        tables.len(),
        if is_xsdt { "XSDT" } else { "RSDT" }
    );

    // HPET: monotonic clock + TSC calibration.
    match tables.hpet(&handler) {
        // SAFETY: the handler identity-mapped the register block.
        Ok(table) => match unsafe { Hpet::new(&table) } {
            Some(hpet) => {
                crate::time::hpet::init(hpet);
                let mhz = crate::time::hpet::with_hpet(|h| h.measure_cpu_frequency(100))
                    .unwrap_or(0);
                kinfo!("cpu: {} ({} MHz)", crate::cpu::CpuInfo::identify().brand_str(), mhz);
            }
            None => kwarn!("hpet: register block rejected"),
        },
        Err(err) => kwarn!("hpet: table unavailable ({:?})", err),
    }

    if let Some(power) = PowerManager::new(&handler, &tables) {
        *POWER.lock() = Some(power);
    }

    Some(tables)
}

/// PCIe enumeration, NIC bring-up, network stack.
fn init_pci_and_net(tables: Option<&AcpiTables>) {
    let Some(tables) = tables else {
        kwarn!("pci: no ACPI tables, skipping PCIe");
        return;
    };
    let handler = IdentityAcpiHandler;
    let Ok(mcfg) = tables.mcfg(&handler) else {
        kwarn!("pci: no MCFG table");
        return;
    };
    let Some(entry) = mcfg.segment0_base() else {
        kwarn!("pci: MCFG has no segment 0");
        return;
    };

    // Map bus 0's ECAM window (32 devices x 8 functions x 4 KiB).
    // SAFETY: identity-maps device memory described by firmware.
    unsafe {
        let _ = handler.map_physical_region(entry.base_address, 32 * 8 * 4096);
    }
    // SAFETY: the MCFG entry describes this window.
    let mut access = unsafe { crate::pci::ecam::EcamAccess::new(&entry) };

    for device in crate::pci::enumerate(&mut access) {
        kinfo!(
            "pci: {} {:04x}:{:04x} class {:02x}.{:02x}",
            device.address,
            device.vendor_id,
            device.device_id,
            device.class,
            device.subclass
        );
    }

    let Some(nic_info) =
        crate::pci::find_device(&mut access, pcnet::PCNET_VENDOR_ID, pcnet::PCNET_DEVICE_ID)
    else {
        kwarn!("net: no PCnet NIC found");
        return;
    };
    let Some(mut nic) = pcnet::probe(&mut access, &nic_info) else {
        return;
    };
    if let Err(err) = nic.initialize(&mut IdentityDma) {
        kerr!("net: NIC init failed ({:?})", err);
        return;
    }
    if let Err(err) = nic.enable() {
        kerr!("net: NIC enable failed ({:?})", err);
        return;
    }

    let mut stack = NetStack::new(Box::new(nic), LOCAL_IP, NETMASK, GATEWAY);
    stack.dns.set_server(GATEWAY);
    crate::net::init(stack);
    kinfo!("net: stack up at {}", LOCAL_IP);
}

/// ATA identify, MBR scan, FAT32 mount.
fn init_storage() {
    // SAFETY: the primary ATA channel owns this port range.
    let io = unsafe { X86PortIo::new(ATA_PRIMARY_BASE) };
    let mut ata = AtaDevice::new(io, AtaRole::Master);
    if let Err(err) = ata.identify(5_000) {
        kwarn!("ata: no usable disk ({err})");
        return;
    }

    let partitions = match mbr::scan(&mut ata) {
        Ok(partitions) => partitions,
        Err(err) => {
            kwarn!("mbr: scan failed ({err})");
            return;
        }
    };
    let Some(partition) = partitions.iter().flatten().find(|p| p.is_recognized()) else {
        kwarn!("mbr: no FAT partition");
        return;
    };
    kinfo!(
        "mbr: partition {} at LBA {} ({} sectors)",
        partition.index,
        partition.start_lba,
        partition.sector_count
    );

    match FatVolume::open(VirtualDisk::from_partition(ata, partition)) {
        Ok(volume) => {
            kinfo!(
                "fat: mounted {:?} volume, {} clusters",
                volume.bpb().fat_type,
                volume.bpb().cluster_count
            );
            *ROOT_VOLUME.lock() = Some(volume);
        }
        Err(err) => kerr!("fat: mount failed ({err})"),
    }
}

/// Runs `f` against the root volume under the filesystem mutex.
///
/// Filesystem operations can yield mid-transaction (ATA polling), so they
/// are serialized by [`FS_MUTEX`] rather than the spin lock alone; the spin
/// lock is held only across the non-yielding closure body.
pub fn with_root_volume<R>(f: impl FnOnce(&mut RootVolume) -> R) -> Option<R> {
    let pid = sched::current_pid();
    while !FS_MUTEX.try_acquire(pid) {
        sched::yield_now();
    }
    let result = {
        let mut guard = ROOT_VOLUME.lock();
        guard.as_mut().map(f)
    };
    let _ = FS_MUTEX.release(pid);
    result
}

/// Runs `f` against the power manager, when ACPI power is up.
pub fn with_power<R>(f: impl FnOnce(&PowerManager) -> R) -> Option<R> {
    let guard = POWER.lock();
    guard.as_ref().map(f)
}

/// Runs `f` against the window manager.
pub fn with_window_manager<R>(f: impl FnOnce(&mut WindowManager) -> R) -> Option<R> {
    let mut guard = WM.lock();
    guard.as_mut().map(f)
}

/// The cooperative idle/compositor loop: drain the NIC, render a frame,
/// halt until the next interrupt.
pub fn kernel_main_loop() -> ! {
    loop {
        crate::net::with_stack(|stack| stack.poll());
        with_window_manager(|wm| wm.composite());
        crate::arch::instructions::halt();
        sched::yield_now();
    }
}
