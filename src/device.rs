//! Resident side of the bootloader: boot selection and the command loop.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::{InputPin, OutputPin, ToggleableOutputPin};

use crate::codec;
use crate::flash::{self, FlashController, ROW_WORDS};
use crate::info::{DeviceInfo, DEVICE_INFO, INFO_LEN};
use crate::protocol::{self, Command, STX};
use crate::{Channel, Error};

/// Settling time before the boot select input is sampled
pub const SETTLE_DELAY_MS: u32 = 1;

/// Staging buffer for a single `Write` payload, one row at most
pub type RowBuffer = heapless::Vec<u16, ROW_WORDS>;

/// Outcome of sampling the boot select input at reset
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BootDecision {
    Application,
    Bootloader,
}

/// Ways the command loop hands control away
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Transition {
    /// `Reboot` received, run the resident application
    Application,
    /// Unknown command, restart the bootloader from its entry
    Reentry,
}

/// Transfers of control out of the bootloader
pub trait EntryPoints {
    /// Jump to the application's relocated reset vector
    fn jump_to_application(&mut self) -> !;

    /// Restart the bootloader from its own entry point
    fn jump_to_bootloader_reentry(&mut self) -> !;
}

/// Wait for inputs to settle then sample the boot select line once.
///
/// The line is active low: low holds the device in the bootloader, high runs
/// the application. An unreadable line runs the application.
pub fn select<D, S>(delay: &mut D, boot_select: &S) -> BootDecision
where
    D: DelayMs<u32>,
    S: InputPin,
{
    delay.delay_ms(SETTLE_DELAY_MS);

    match boot_select.is_low() {
        Ok(true) => BootDecision::Bootloader,
        Ok(false) => BootDecision::Application,
        Err(_) => {
            warn!("Boot select unreadable, starting application");
            BootDecision::Application
        }
    }
}

/// Command loop over a serial channel and a flash controller.
///
/// `L` is the status indicator, toggled on every frame.
pub struct Bootloader<P, F, L, E> {
    port: P,
    flash: F,
    led: L,
    info: [u8; INFO_LEN],
    _err: PhantomData<E>,
}

impl<P, F, L, E> Bootloader<P, F, L, E>
where
    P: Channel<E>,
    F: FlashController,
    L: OutputPin + ToggleableOutputPin,
{
    /// Create a bootloader reporting the build's device info
    pub fn new(port: P, flash: F, led: L) -> Self {
        Self::with_info(port, flash, led, &DEVICE_INFO)
    }

    /// Create a bootloader reporting a custom device info record
    pub fn with_info(port: P, flash: F, led: L, info: &DeviceInfo) -> Self {
        Self {
            port,
            flash,
            led,
            info: info.to_bytes(),
            _err: PhantomData,
        }
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn led(&mut self) -> &mut L {
        &mut self.led
    }

    /// Release the collaborators
    pub fn free(self) -> (P, F, L) {
        (self.port, self.flash, self.led)
    }

    /// Run from reset, never returns.
    ///
    /// Samples the boot select line and either starts the application or
    /// serves commands until one hands control away. Channel errors restart
    /// the bootloader.
    pub fn start<D, S, J>(mut self, delay: &mut D, boot_select: &S, entry: &mut J) -> !
    where
        D: DelayMs<u32>,
        S: InputPin,
        J: EntryPoints,
        E: core::fmt::Debug,
    {
        if select(delay, boot_select) == BootDecision::Application {
            self.led.set_low().ok();
            entry.jump_to_application();
        }

        info!("Entering bootloader");

        match self.serve() {
            Ok(Transition::Application) => entry.jump_to_application(),
            Ok(Transition::Reentry) => entry.jump_to_bootloader_reentry(),
            Err(e) => {
                error!("Channel error: {:?}", e);
                entry.jump_to_bootloader_reentry()
            }
        }
    }

    /// Serve frames until one transfers control away
    pub fn serve(&mut self) -> Result<Transition, Error<E>> {
        loop {
            if let Some(t) = self.poll()? {
                return Ok(t);
            }
        }
    }

    /// Receive and execute a single frame
    pub fn poll(&mut self) -> Result<Option<Transition>, Error<E>> {
        self.resync()?;
        self.led.toggle().ok();

        let b = codec::get_byte(&mut self.port)?;
        let command = match Command::from_byte(b) {
            Some(c) => c,
            None => {
                warn!("Unknown command 0x{:02x}, restarting", b);
                return Ok(Some(Transition::Reentry));
            }
        };

        debug!("Received command: {:?}", command);

        match command {
            Command::Sync | Command::EnterBootloader => self.ack(command)?,
            Command::Info => codec::put_all(&mut self.port, &self.info)?,
            Command::Reboot => return Ok(Some(Transition::Application)),
            Command::Erase => self.erase()?,
            Command::Write => {
                let mut buffer = RowBuffer::new();
                self.write(&mut buffer)?;
            }
        }

        Ok(None)
    }

    /// Discard input up to and including the next delimiter
    fn resync(&mut self) -> Result<(), Error<E>> {
        let mut dropped = 0usize;
        while codec::get_byte(&mut self.port)? != STX {
            dropped += 1;
        }
        if dropped > 0 {
            trace!("Discarded {} bytes before delimiter", dropped);
        }
        Ok(())
    }

    fn ack(&mut self, command: Command) -> Result<(), Error<E>> {
        codec::put_all(&mut self.port, &protocol::ack(command))
    }

    fn erase(&mut self) -> Result<(), Error<E>> {
        let address = codec::get_address(&mut self.port)?;

        if !flash::in_bounds(address, 1) {
            warn!("Erase at 0x{:04x} outside flash, ignored", address);
            return Ok(());
        }

        debug!("Erasing row 0x{:04x}", flash::row_base(address));
        self.flash.erase_row(address);

        self.ack(Command::Erase)
    }

    /// Receive a write payload into `buffer` and program it.
    ///
    /// Oversized or out of range payloads are still drained from the channel
    /// so the stream stays aligned, but nothing is written and no
    /// acknowledge is sent.
    fn write(&mut self, buffer: &mut RowBuffer) -> Result<(), Error<E>> {
        let address = codec::get_address(&mut self.port)?;
        let count = codec::get_word(&mut self.port)?;

        let mut overflow = false;
        for _ in 0..count {
            let w = codec::get_word(&mut self.port)?;
            if buffer.push(w).is_err() {
                overflow = true;
            }
        }

        if overflow {
            warn!("Write of {} words exceeds a row, dropped", count);
            return Ok(());
        }

        if buffer.is_empty() {
            debug!("Empty write at 0x{:04x}", address);
            return self.ack(Command::Write);
        }

        if !flash::in_bounds(address, buffer.len()) {
            warn!("Write of {} words at 0x{:04x} outside flash, dropped", count, address);
            return Ok(());
        }

        debug!("Writing {} words at 0x{:04x}", count, address);
        flash::program(&mut self.flash, address, &buffer[..]);

        self.ack(Command::Write)
    }
}
