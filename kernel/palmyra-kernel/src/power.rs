//! ACPI power management: reboot and shutdown.
//!
//! Built from the FADT (reset register, PM1a control block) and the DSDT's
//! `_S5_` package (sleep type values). `reboot` walks a ladder of
//! increasingly blunt instruments; `shutdown` writes the S5 sleep type and
//! falls back to halting forever.

use palmyra_acpi::aml::SleepTypes;
use palmyra_acpi::{AcpiHandler, AcpiTables, Fadt, GenericAddress};
use palmyra_core::{kinfo, kwarn};

use crate::arch::Port;
use crate::arch::instructions::{halt, triple_fault};

/// Keyboard controller command port.
const KBD_CONTROLLER_PORT: u16 = 0x64;
/// Keyboard controller "pulse reset line" command.
const KBD_RESET_CMD: u8 = 0xFE;

/// SLP_EN bit in the PM1 control register.
const PM1_SLP_EN: u16 = 1 << 13;
/// Shift of the SLP_TYP field in the PM1 control register.
const PM1_SLP_TYP_SHIFT: u16 = 10;

/// Power management state assembled at boot.
pub struct PowerManager {
    fadt: Fadt,
    s5: Option<SleepTypes>,
}

impl PowerManager {
    /// Builds the power manager from the ACPI table set.
    ///
    /// Missing pieces degrade: without a FADT there is no ACPI reset or S5
    /// shutdown, but the keyboard-controller and triple-fault reboot paths
    /// still work.
    pub fn new(handler: &impl AcpiHandler, tables: &AcpiTables) -> Option<Self> {
        let fadt = match tables.fadt(handler) {
            Ok(fadt) => fadt,
            Err(err) => {
                kwarn!("power: no usable FADT ({:?})", err);
                return None;
            }
        };

        let s5 = if fadt.dsdt_address != 0 {
            match palmyra_acpi::aml::find_s5(handler, fadt.dsdt_address) {
                Ok(types) => {
                    kinfo!(
                        "power: _S5_ package (SLP_TYPa={:#x}, SLP_TYPb={:#x})",
                        types.slp_typ_a,
                        types.slp_typ_b
                    );
                    Some(types)
                }
                Err(err) => {
                    kwarn!("power: no _S5_ package ({:?})", err);
                    None
                }
            }
        } else {
            None
        };

        Some(Self { fadt, s5 })
    }

    /// Whether ACPI soft-off is available.
    #[must_use]
    pub fn can_shutdown(&self) -> bool {
        self.s5.is_some() && self.fadt.pm1a_control_block != 0
    }

    /// The value written to PM1a control to enter S5.
    #[must_use]
    pub fn s5_control_value(&self) -> Option<u16> {
        self.s5
            .map(|s5| (u16::from(s5.slp_typ_a) << PM1_SLP_TYP_SHIFT) | PM1_SLP_EN)
    }

    /// Reboots the machine. Never returns.
    ///
    /// Ladder: ACPI reset register → keyboard controller pulse → triple
    /// fault.
    pub fn reboot(&self) -> ! {
        kinfo!("power: reboot requested");

        if self.fadt.has_reset_register() {
            let reg = self.fadt.reset_register;
            match reg.address_space_id {
                GenericAddress::SPACE_SYSTEM_IO => {
                    // SAFETY: the FADT designates this port as the reset
                    // register.
                    unsafe {
                        Port::<u8>::new(reg.address as u16).write(self.fadt.reset_value);
                    }
                }
                GenericAddress::SPACE_SYSTEM_MEMORY => {
                    // SAFETY: the FADT designates this address as the reset
                    // register; it is identity-mapped device memory.
                    unsafe {
                        (reg.address as usize as *mut u8).write_volatile(self.fadt.reset_value);
                    }
                }
                _ => {}
            }
            busy_wait();
        }

        // SAFETY: writing the reset command to the designated controller
        // command port.
        unsafe {
            Port::<u8>::new(KBD_CONTROLLER_PORT).write(KBD_RESET_CMD);
        }
        busy_wait();

        // SAFETY: last resort; never returns.
        unsafe { triple_fault() }
    }

    /// Shuts the machine down. Never returns.
    ///
    /// Writes `(SLP_TYPa << 10) | SLP_EN` to PM1a control; if the machine is
    /// still running afterwards, halts forever.
    pub fn shutdown(&self) -> ! {
        kinfo!("power: shutdown requested");

        if let Some(value) = self.s5_control_value() {
            if self.fadt.pm1a_control_block != 0 {
                // SAFETY: the FADT designates this port as PM1a control.
                unsafe {
                    Port::<u16>::new(self.fadt.pm1a_control_block as u16).write(value);
                }
                busy_wait();
            }
        }

        kwarn!("power: S5 ineffective, halting");
        loop {
            halt();
        }
    }
}

/// Short settle loop between reset attempts.
fn busy_wait() {
    for _ in 0..100_000 {
        core::hint::spin_loop();
    }
}
