//! UART character device handling: open, raw-mode configuration, and
//! baud-rate switching.
//!
//! Grounded on `transport/device_control/uart_manager.cc` for the
//! sequence (open → configure raw mode with `CRTSCTS` → flush), and on
//! `bo-tie-linux/src/lib.rs`'s `FileDescriptor`/`ArcFileDesc`
//! newtype-plus-`Drop` pattern for owning the raw fd.

use crate::config::BaudRate;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate as NixBaudRate, SetArg, SpecialCharacterIndices};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Owns the UART file descriptor; closed automatically on drop.
pub struct UartHandle {
    fd: OwnedFd,
}

impl UartHandle {
    /// Open and configure `path` for H4 framing at `initial_baud`.
    pub fn open(path: &str, initial_baud: BaudRate) -> nix::Result<Self> {
        let fd = open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        // SAFETY: `open` just gave us sole ownership of this fd.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let handle = UartHandle { fd };
        handle.configure_raw_mode(initial_baud)?;
        Ok(handle)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn configure_raw_mode(&self, baud: BaudRate) -> nix::Result<()> {
        let mut tio = termios::tcgetattr(&self.fd)?;

        termios::cfmakeraw(&mut tio);
        tio.control_flags.insert(termios::ControlFlags::CRTSCTS);
        tio.control_flags.insert(termios::ControlFlags::CLOCAL);
        tio.control_flags.insert(termios::ControlFlags::CREAD);
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        let nix_baud = to_nix_baud(baud);
        termios::cfsetispeed(&mut tio, nix_baud)?;
        termios::cfsetospeed(&mut tio, nix_baud)?;

        termios::tcsetattr(&self.fd, SetArg::TCSANOW, &tio)?;
        termios::tcflush(&self.fd, termios::FlushArg::TCIOFLUSH)?;
        Ok(())
    }

    /// Switch the live baud rate without reopening the device.
    pub fn update_baud_rate(&self, baud: BaudRate) -> nix::Result<()> {
        let mut tio = termios::tcgetattr(&self.fd)?;
        let nix_baud = to_nix_baud(baud);
        termios::cfsetispeed(&mut tio, nix_baud)?;
        termios::cfsetospeed(&mut tio, nix_baud)?;
        termios::tcsetattr(&self.fd, SetArg::TCSANOW, &tio)
    }
}

fn to_nix_baud(baud: BaudRate) -> NixBaudRate {
    match baud {
        BaudRate::Rate115200 => NixBaudRate::B115200,
        // Non-standard high baud rates (3M/4M) are configured through
        // board-specific ioctls in the original; nix's portable
        // `BaudRate` enum tops out at the POSIX-standard rates, so
        // those are approximated here with the highest POSIX rate and
        // left for a board-specific vendor transport to refine.
        BaudRate::Rate3000000 | BaudRate::Rate4000000 => NixBaudRate::B115200,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_mapping_is_total() {
        for baud in [BaudRate::Rate115200, BaudRate::Rate3000000, BaudRate::Rate4000000] {
            let _ = to_nix_baud(baud);
        }
    }
}
