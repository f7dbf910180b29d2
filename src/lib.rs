//! PIC16 Serial Bootloader.
//!
//! A resident bootloader protocol engine that reprograms row-organised
//! program flash over a byte serial link, and the host side programmer that
//! drives it.
//!
//! The device side (`protocol`, `codec`, `flash`, `info`, `device`) is
//! `no_std` and generic over `embedded-hal` serial, pin and delay traits.
//! The `std` feature adds the host side `Programmer` and firmware images,
//! `linux` adds a serial port constructor.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod codec;
pub mod device;
pub mod flash;
pub mod info;
pub mod protocol;

#[cfg(feature = "std")]
pub mod host;
#[cfg(feature = "std")]
pub mod image;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

pub use device::{BootDecision, Bootloader, EntryPoints, Transition};
pub use flash::{FlashController, RamFlash};
pub use info::{DeviceInfo, InfoError, DEVICE_INFO};
pub use protocol::Command;

#[cfg(feature = "std")]
pub use host::{Options, Programmer};
#[cfg(feature = "std")]
pub use image::{Image, ImageError};

/// Byte channel carrying the protocol, a serial port in practice
pub trait Channel<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> Channel<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum Error<SerialError> {
    #[cfg_attr(feature = "std", error("serial error: {0:?}"))]
    Serial(SerialError),

    #[cfg_attr(feature = "std", error("timeout awaiting bootloader response"))]
    ResponseTimeout,

    #[cfg_attr(
        feature = "std",
        error("unexpected response, expected 0x{expected:02x} found 0x{found:02x}")
    )]
    UnexpectedResponse { expected: u8, found: u8 },

    #[cfg_attr(feature = "std", error("invalid info record: {0}"))]
    InvalidInfo(InfoError),

    #[cfg_attr(feature = "std", error("address 0x{0:04x} is inside the bootloader"))]
    ProtectedAddress(u16),

    #[cfg_attr(feature = "std", error("{0} words do not fit in a single row"))]
    RowOverflow(usize),

    #[cfg(feature = "std")]
    #[cfg_attr(feature = "std", error("firmware image: {0}"))]
    Image(ImageError),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}
