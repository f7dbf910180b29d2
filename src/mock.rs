//! Scripted serial channel for unit tests

use std::collections::VecDeque;
use std::vec::Vec;

use embedded_hal::serial::{Read, Write};

/// Returned once the scripted input has been consumed
#[derive(Clone, Debug, PartialEq)]
pub struct Exhausted;

pub struct MockSerial {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    idle: bool,
}

impl MockSerial {
    /// Device style channel, reads fail once `rx` runs dry
    pub fn new(rx: &[u8]) -> Self {
        Self {
            rx: rx.iter().cloned().collect(),
            tx: Vec::new(),
            idle: false,
        }
    }

    /// Host style channel, `rx` arrives only after something was sent and
    /// reads would block once it runs dry
    pub fn idle(rx: &[u8]) -> Self {
        Self {
            idle: true,
            ..Self::new(rx)
        }
    }

    pub fn sent(&self) -> &[u8] {
        &self.tx
    }
}

impl Read<u8> for MockSerial {
    type Error = Exhausted;

    fn read(&mut self) -> nb::Result<u8, Exhausted> {
        if self.idle && self.tx.is_empty() {
            return Err(nb::Error::WouldBlock);
        }
        match self.rx.pop_front() {
            Some(b) => Ok(b),
            None if self.idle => Err(nb::Error::WouldBlock),
            None => Err(nb::Error::Other(Exhausted)),
        }
    }
}

impl Write<u8> for MockSerial {
    type Error = Exhausted;

    fn write(&mut self, word: u8) -> nb::Result<(), Exhausted> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Exhausted> {
        Ok(())
    }
}
