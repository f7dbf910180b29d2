//! Host side programmer for the serial bootloader.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::codec;
use crate::flash::ROW_WORDS;
use crate::image::Image;
use crate::info::{DeviceInfo, InfoError};
use crate::protocol::{Command, STX};
use crate::{Channel, Error};

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Sync attempts before giving up on the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub sync_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 500,
            poll_delay_ms: 1,
            sync_attempts: 20,
        }
    }
}

/// Progress through a programming run
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Erase(u16),
    Write(u16),
    /// Blank row left erased
    Skip(u16),
}

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    info: Option<DeviceInfo>,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: Channel<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            info: None,
            _err: PhantomData,
        }
    }

    /// Device info, once fetched with [`Programmer::info`]
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    /// Probe for the bootloader until it acknowledges a sync.
    ///
    /// Stale input is flushed before every attempt.
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        for attempt in 0..self.options.sync_attempts {
            self.flush_input()?;
            self.send(Command::Sync)?;

            match self.await_ack(Command::Sync) {
                Ok(()) => {
                    debug!("Bootloader synchronised after {} attempts", attempt + 1);
                    return Ok(());
                }
                Err(Error::ResponseTimeout) | Err(Error::UnexpectedResponse { .. }) => {
                    debug!("No sync response, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        error!("Bootloader did not respond to sync");
        Err(Error::ResponseTimeout)
    }

    /// Hold the device in the bootloader
    pub fn enter_bootloader(&mut self) -> Result<(), Error<E>> {
        self.send(Command::EnterBootloader)?;
        self.await_ack(Command::EnterBootloader)
    }

    /// Fetch and decode the device info record
    pub fn info(&mut self) -> Result<DeviceInfo, Error<E>> {
        self.send(Command::Info)?;

        let size = self.read_byte()?;
        let mut fields = vec![0u8; usize::from(size)];
        for b in fields.iter_mut() {
            *b = self.read_byte()?;
        }
        trace!("<= {:02x}{}", size, hex::encode(&fields));

        let info = DeviceInfo::from_fields(&fields).map_err(Error::InvalidInfo)?;
        debug!("Device info: {:?}", info);

        self.info = Some(info.clone());
        Ok(info)
    }

    /// Erase the row containing `address`
    pub fn erase(&mut self, address: u16) -> Result<(), Error<E>> {
        self.check_unprotected(address, 1)?;

        self.send(Command::Erase)?;
        codec::put_address(&mut self.port, address)?;

        self.await_ack(Command::Erase)
    }

    /// Write up to one row of words starting at `address`
    pub fn write(&mut self, address: u16, words: &[u16]) -> Result<(), Error<E>> {
        let row = self.info.as_ref().map(|i| usize::from(i.write_row)).unwrap_or(ROW_WORDS);
        if words.len() > row {
            return Err(Error::RowOverflow(words.len()));
        }
        self.check_unprotected(address, words.len())?;

        self.send(Command::Write)?;
        codec::put_address(&mut self.port, address)?;
        codec::put_word(&mut self.port, words.len() as u16)?;
        for w in words {
            codec::put_word(&mut self.port, *w)?;
        }

        self.await_ack(Command::Write)
    }

    /// Start the application. The device sends nothing back.
    pub fn reboot(&mut self) -> Result<(), Error<E>> {
        self.send(Command::Reboot)
    }

    /// Program an application image below the bootloader.
    ///
    /// The reset vector is relocated so the device always boots into the
    /// bootloader. Every row but the first erase block is erased, non-blank
    /// rows are written, and the first erase block goes last so that an
    /// interrupted run leaves the previous reset vector in place.
    pub fn program<F>(&mut self, image: &Image, mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(Step, usize, usize),
    {
        let info = match self.info.clone() {
            Some(i) => i,
            None => self.info()?,
        };

        let boot_start = info.boot_start.min(u32::from(u16::MAX)) as u16;
        let erase_row = info.erase_row;
        let write_row = info.write_row;
        if erase_row == 0 || write_row == 0 || erase_row % write_row != 0 || boot_start < erase_row {
            return Err(Error::InvalidInfo(InfoError::Geometry));
        }

        let mut image = image.clone();
        image.relocate_reset_vector(boot_start).map_err(Error::Image)?;

        let erase_rows = boot_start / erase_row;
        let write_rows = boot_start / write_row;
        let first_block = erase_row / write_row;

        let total = usize::from(erase_rows) + usize::from(write_rows);
        let mut done = 0;

        info!("Erasing {} rows", erase_rows - 1);
        for r in 1..erase_rows {
            let address = r * erase_row;
            self.erase(address)?;
            done += 1;
            progress(Step::Erase(address), done, total);
        }

        info!("Writing {} rows", write_rows - first_block);
        for r in first_block..write_rows {
            let address = r * write_row;
            let words = image.row(address, write_row);
            let step = if Image::is_blank(words) {
                Step::Skip(address)
            } else {
                self.write(address, words)?;
                Step::Write(address)
            };
            done += 1;
            progress(step, done, total);
        }

        info!("Rewriting reset vector");
        self.erase(0)?;
        done += 1;
        progress(Step::Erase(0), done, total);

        for r in 0..first_block {
            let address = r * write_row;
            self.write(address, image.row(address, write_row))?;
            done += 1;
            progress(Step::Write(address), done, total);
        }

        Ok(())
    }

    fn check_unprotected(&self, address: u16, count: usize) -> Result<(), Error<E>> {
        let boot_start = match &self.info {
            Some(i) => i.boot_start,
            None => return Ok(()),
        };
        if u32::from(address) + count.max(1) as u32 > boot_start {
            warn!("Refusing to touch bootloader at 0x{:04x}", address);
            return Err(Error::ProtectedAddress(address));
        }
        Ok(())
    }

    fn send(&mut self, command: Command) -> Result<(), Error<E>> {
        trace!("=> {:?}", command);
        codec::put_all(&mut self.port, &[STX, command.byte()])
    }

    fn await_ack(&mut self, command: Command) -> Result<(), Error<E>> {
        for expected in &[STX, command.byte()] {
            let found = self.read_byte()?;
            if found != *expected {
                debug!("Unexpected response: 0x{:02x}", found);
                return Err(Error::UnexpectedResponse {
                    expected: *expected,
                    found,
                });
            }
        }
        trace!("<= ack {:?}", command);
        Ok(())
    }

    /// Poll for a single byte within the response timeout
    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms;

            if t > self.options.response_timeout_ms {
                return Err(Error::ResponseTimeout);
            }
        }
    }

    /// Drop anything already waiting on the port
    fn flush_input(&mut self) -> Result<(), Error<E>> {
        let mut dropped = 0usize;
        loop {
            match self.port.read() {
                Ok(_) => dropped += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
        if dropped > 0 {
            debug!("Flushed {} stale bytes", dropped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
    use std::thread;
    use std::time::Duration;

    use embedded_hal::digital::v2::{OutputPin, ToggleableOutputPin};
    use embedded_hal::serial::{Read, Write};

    use crate::device::{Bootloader, Transition};
    use crate::flash::{DeviceFlash, BOOT_START, ERASED_WORD, FLASH_WORDS};
    use crate::image::BLANK_WORD;
    use crate::info::DEVICE_INFO;
    use crate::mock::MockSerial;

    struct NoDelay;

    impl DelayMs<u32> for NoDelay {
        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn programmer(rx: &[u8]) -> Programmer<MockSerial, NoDelay, crate::mock::Exhausted> {
        let options = Options {
            response_timeout_ms: 5,
            poll_delay_ms: 1,
            sync_attempts: 3,
        };
        Programmer::new(MockSerial::idle(rx), NoDelay, options)
    }

    #[test]
    fn sync_sends_probe_and_accepts_ack() {
        let mut p = programmer(b"[S");
        p.sync().unwrap();
        assert_eq!(p.port().sent(), b"[S");
    }

    #[test]
    fn sync_gives_up_after_attempts() {
        let mut p = programmer(&[]);
        assert_eq!(p.sync(), Err(Error::ResponseTimeout));
        assert_eq!(p.port().sent(), b"[S[S[S");
    }

    #[test]
    fn mismatched_ack_is_reported() {
        let mut p = programmer(b"[E");
        assert_eq!(
            p.enter_bootloader(),
            Err(Error::UnexpectedResponse {
                expected: b'B',
                found: b'E'
            })
        );
    }

    #[test]
    fn info_is_decoded_and_kept() {
        let mut p = programmer(&DEVICE_INFO.to_bytes());
        assert_eq!(p.info().unwrap(), DEVICE_INFO);
        assert_eq!(p.device(), Some(&DEVICE_INFO));
        assert_eq!(p.port().sent(), b"[I");
    }

    #[test]
    fn write_frame_layout() {
        let mut p = programmer(b"[W");
        p.write(0x0120, &[0x3001, 0x008A]).unwrap();
        assert_eq!(
            p.port().sent(),
            &[b'[', b'W', 0x20, 0x01, 0, 0, 2, 0, 0x01, 0x30, 0x8A, 0x00]
        );
    }

    #[test]
    fn bootloader_region_is_refused_once_known() {
        let mut info = DEVICE_INFO.to_bytes().to_vec();
        info.extend_from_slice(b"[E");
        let mut p = programmer(&info);
        p.info().unwrap();

        assert_eq!(p.erase(0x0E00), Err(Error::ProtectedAddress(0x0E00)));
        assert_eq!(
            p.write(0x0DF0, &[0u16; 32]),
            Err(Error::ProtectedAddress(0x0DF0))
        );
        p.erase(0x0DE0).unwrap();
    }

    #[test]
    fn oversized_write_is_refused() {
        let mut p = programmer(&[]);
        assert_eq!(p.write(0, &[0u16; 33]), Err(Error::RowOverflow(33)));
        assert!(p.port().sent().is_empty());
    }

    #[test]
    fn programming_needs_sane_geometry() {
        let mut info = DEVICE_INFO.clone();
        info.erase_row = 48;
        let mut p = programmer(&info.to_bytes());
        p.info().unwrap();

        assert_eq!(
            p.program(&Image::blank(0x1000), |_, _, _| ()),
            Err(Error::InvalidInfo(InfoError::Geometry))
        );
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Hangup;

    /// One end of an in-process serial link
    struct Link {
        tx: Sender<u8>,
        rx: Receiver<u8>,
        blocking: bool,
    }

    /// Host end polls, device end blocks
    fn link() -> (Link, Link) {
        let (host_tx, device_rx) = channel();
        let (device_tx, host_rx) = channel();
        (
            Link {
                tx: host_tx,
                rx: host_rx,
                blocking: false,
            },
            Link {
                tx: device_tx,
                rx: device_rx,
                blocking: true,
            },
        )
    }

    impl Read<u8> for Link {
        type Error = Hangup;

        fn read(&mut self) -> nb::Result<u8, Hangup> {
            if self.blocking {
                return self.rx.recv().map_err(|_| nb::Error::Other(Hangup));
            }
            match self.rx.try_recv() {
                Ok(b) => Ok(b),
                Err(TryRecvError::Empty) => Err(nb::Error::WouldBlock),
                Err(TryRecvError::Disconnected) => Err(nb::Error::Other(Hangup)),
            }
        }
    }

    impl Write<u8> for Link {
        type Error = Hangup;

        fn write(&mut self, b: u8) -> nb::Result<(), Hangup> {
            self.tx.send(b).map_err(|_| nb::Error::Other(Hangup))
        }

        fn flush(&mut self) -> nb::Result<(), Hangup> {
            Ok(())
        }
    }

    struct Sleep;

    impl DelayMs<u32> for Sleep {
        fn delay_ms(&mut self, ms: u32) {
            thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }

    struct NoLed;

    impl OutputPin for NoLed {
        type Error = Infallible;

        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    impl ToggleableOutputPin for NoLed {
        type Error = Infallible;

        fn toggle(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    #[test]
    fn program_over_link() {
        const BOOT_CODE: u16 = 0x0B00;

        let (host, dev) = link();

        let device = thread::spawn(move || {
            let mut flash = DeviceFlash::new();
            for w in &mut flash.words_mut()[usize::from(BOOT_START)..] {
                *w = BOOT_CODE;
            }

            let mut d: Bootloader<Link, DeviceFlash, NoLed, Hangup> =
                Bootloader::new(dev, flash, NoLed);
            let t = d.serve();
            let (_, flash, _) = d.free();
            (t, flash)
        });

        let mut words = vec![BLANK_WORD; usize::from(FLASH_WORDS)];
        words[0] = 0x3001;
        words[1] = 0x2812;
        for (i, w) in words[0x0040..0x0090].iter_mut().enumerate() {
            *w = i as u16;
        }
        let image = Image::from_words(words);

        let mut p = Programmer::new(host, Sleep, Options::default());
        p.sync().unwrap();
        p.info().unwrap();
        p.enter_bootloader().unwrap();

        let mut steps = Vec::new();
        p.program(&image, |s, _, _| steps.push(s)).unwrap();
        p.reboot().unwrap();

        let (t, flash) = device.join().unwrap();
        assert_eq!(t, Ok(Transition::Application));

        let mut expected = image.clone();
        expected.relocate_reset_vector(BOOT_START).unwrap();

        for a in (0..BOOT_START).step_by(ROW_WORDS) {
            let row = expected.row(a, ROW_WORDS as u16);
            let got = &flash.words()[usize::from(a)..usize::from(a) + ROW_WORDS];
            if Image::is_blank(row) {
                assert!(got.iter().all(|w| *w == ERASED_WORD), "row 0x{:04x}", a);
            } else {
                assert_eq!(got, row, "row 0x{:04x}", a);
            }
        }
        assert_eq!(flash.words()[0..2], [0x318E, 0x2E00]);
        assert!(flash.words()[usize::from(BOOT_START)..]
            .iter()
            .all(|w| *w == BOOT_CODE));

        let erases = steps.iter().filter(|s| matches!(s, Step::Erase(_))).count();
        assert_eq!(erases, usize::from(BOOT_START) / ROW_WORDS);
        assert_eq!(steps.last(), Some(&Step::Write(0)));
    }
}
