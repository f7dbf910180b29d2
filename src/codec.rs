//! Byte and word codec over a blocking serial channel.
//!
//! Words travel as two bytes, low byte first. Addresses occupy four bytes on
//! the wire but only the low word selects a flash location.

use embedded_hal::serial::{Read, Write};

use crate::protocol::ADDRESS_LEN;
use crate::Error;

/// Block until a single byte has been sent
pub fn put_byte<P, E>(port: &mut P, b: u8) -> Result<(), Error<E>>
where
    P: Write<u8, Error = E>,
{
    block!(port.write(b))?;
    Ok(())
}

/// Block until a single byte has been received
pub fn get_byte<P, E>(port: &mut P) -> Result<u8, Error<E>>
where
    P: Read<u8, Error = E>,
{
    let b = block!(port.read())?;
    Ok(b)
}

/// Send a slice of bytes in order
pub fn put_all<P, E>(port: &mut P, data: &[u8]) -> Result<(), Error<E>>
where
    P: Write<u8, Error = E>,
{
    for b in data {
        put_byte(port, *b)?;
    }
    Ok(())
}

/// Send a word, lsb first
pub fn put_word<P, E>(port: &mut P, w: u16) -> Result<(), Error<E>>
where
    P: Write<u8, Error = E>,
{
    let [lo, hi] = w.to_le_bytes();
    put_byte(port, lo)?;
    put_byte(port, hi)
}

/// Receive a word, lsb first
pub fn get_word<P, E>(port: &mut P) -> Result<u16, Error<E>>
where
    P: Read<u8, Error = E>,
{
    let lo = get_byte(port)?;
    let hi = get_byte(port)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

/// Send a word address as the full four byte field with a zero high word
pub fn put_address<P, E>(port: &mut P, address: u16) -> Result<(), Error<E>>
where
    P: Write<u8, Error = E>,
{
    put_word(port, address)?;
    put_word(port, 0)
}

/// Receive a four byte address field, returning the low word
pub fn get_address<P, E>(port: &mut P) -> Result<u16, Error<E>>
where
    P: Read<u8, Error = E>,
{
    let address = get_word(port)?;

    // High word is reserved, read and dropped
    for _ in 2..ADDRESS_LEN {
        get_byte(port)?;
    }

    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Exhausted, MockSerial};

    #[test]
    fn words_are_sent_low_byte_first() {
        let mut port = MockSerial::new(&[]);
        put_word(&mut port, 0x1234).unwrap();
        put_word(&mut port, 0x00FF).unwrap();
        assert_eq!(port.sent(), &[0x34, 0x12, 0xFF, 0x00]);
    }

    #[test]
    fn words_are_received_low_byte_first() {
        let mut port = MockSerial::new(&[0xFE, 0x0D, 0x01]);
        assert_eq!(get_word(&mut port).unwrap(), 0x0DFE);

        // A half word leaves the channel dry
        assert_eq!(get_word(&mut port), Err(Error::Serial(Exhausted)));
    }

    #[test]
    fn address_high_word_is_ignored() {
        let mut port = MockSerial::new(&[0x20, 0x00, 0xAA, 0x55, b'[']);
        assert_eq!(get_address(&mut port).unwrap(), 0x0020);
        assert_eq!(get_byte(&mut port).unwrap(), b'[');
    }

    #[test]
    fn address_is_sent_as_four_bytes() {
        let mut port = MockSerial::new(&[]);
        put_address(&mut port, 0x0E00).unwrap();
        assert_eq!(port.sent(), &[0x00, 0x0E, 0x00, 0x00]);
    }
}
