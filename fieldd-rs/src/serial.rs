/* Serial port plumbing.
 *
 * A port is opened read/write, switched to raw termios at the
 * configured baud, and cloned into independent read and write halves
 * so the link's RX and TX tasks each own one. Virtual device paths
 * (named pipes used by the test harness) are not ttys; termios setup
 * is skipped for them. */

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tracing::{debug, warn};

use crate::error::RuntimeError;

pub const DEFAULT_BAUD: u32 = 115_200;

pub struct SerialHalves {
    pub reader: File,
    pub writer: File,
}

/* Open `path` and split it into async halves. Opening and termios
 * configuration run on the blocking pool; a wedged port must not stall
 * the observer. */
pub async fn open(path: PathBuf, baud: u32) -> Result<SerialHalves, RuntimeError> {
    let port = path.display().to_string();
    let opened = tokio::task::spawn_blocking(move || open_blocking(&path, baud))
        .await
        .map_err(|e| RuntimeError::LinkIo {
            port: port.clone(),
            source: std::io::Error::other(e),
        })?;
    let (reader, writer) = opened.map_err(|source| RuntimeError::LinkIo { port, source })?;
    Ok(SerialHalves {
        reader: File::from_std(reader),
        writer: File::from_std(writer),
    })
}

fn open_blocking(path: &Path, baud: u32) -> std::io::Result<(std::fs::File, std::fs::File)> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    configure_termios(&file, path, baud);
    let writer = file.try_clone()?;
    Ok((file, writer))
}

/* Raw mode at the requested speed. Failures are logged, not fatal:
 * virtual devices are pipes and reject termios ioctls entirely. */
fn configure_termios(file: &std::fs::File, path: &Path, baud: u32) {
    use nix::sys::termios::{self, SetArg};

    let mut attrs = match termios::tcgetattr(file) {
        Ok(attrs) => attrs,
        Err(_) => {
            debug!(port = %path.display(), "not a tty, skipping termios setup");
            return;
        }
    };
    termios::cfmakeraw(&mut attrs);
    if let Err(err) = termios::cfsetspeed(&mut attrs, baud_rate(baud)) {
        warn!(port = %path.display(), %err, "unable to set baud rate");
    }
    if let Err(err) = termios::tcsetattr(file, SetArg::TCSANOW, &attrs) {
        warn!(port = %path.display(), %err, "unable to apply termios settings");
    }
}

fn baud_rate(baud: u32) -> nix::sys::termios::BaudRate {
    use nix::sys::termios::BaudRate;
    match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        other => {
            warn!(baud = other, "unsupported baud rate, falling back to 115200");
            BaudRate::B115200
        }
    }
}
