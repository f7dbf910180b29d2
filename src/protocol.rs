//! Wire format of the serial bootloader protocol

/// Start of frame delimiter, also leads every acknowledge
pub const STX: u8 = b'[';

/// Length of the address field on the wire, only the low word is used
pub const ADDRESS_LEN: usize = 4;

/// Length of an acknowledge frame
pub const ACK_LEN: usize = 2;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Probe for the bootloader, acknowledged on reception
    Sync = b'S',

    /// Fetch the device info record, answered with the record itself
    Info = b'I',

    /// Confirm the device is held in the bootloader, acknowledged on reception
    EnterBootloader = b'B',

    /// Start the resident application, never acknowledged
    Reboot = b'R',

    /// Writes up to one row of words starting from a word address.
    Write = b'W',

    /// Erases the row containing a word address.
    Erase = b'E',
}

impl Command {
    /// Decode a command byte, `None` is the unknown command and leads to a
    /// bootloader restart
    pub fn from_byte(b: u8) -> Option<Self> {
        let c = match b {
            b'S' => Command::Sync,
            b'I' => Command::Info,
            b'B' => Command::EnterBootloader,
            b'R' => Command::Reboot,
            b'W' => Command::Write,
            b'E' => Command::Erase,
            _ => return None,
        };
        Some(c)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Whether the device answers this command with an acknowledge frame
    pub fn acknowledged(self) -> bool {
        match self {
            Command::Info | Command::Reboot => false,
            _ => true,
        }
    }
}

/// Build the acknowledge frame for a command
pub fn ack(command: Command) -> [u8; ACK_LEN] {
    [STX, command.byte()]
}
