//! GPIO line access for presence detection
//!
//! Presence GPIOs are read through the v1 character-device ABI: a line-event
//! request hands back a dedicated fd that delivers edge events and also
//! answers line-value reads. The event fd is opened non-blocking so it can
//! be driven by the runtime's I/O readiness machinery.

use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fg_error::{FanGuardError, Result};

const GPIO_IOC_MAGIC: u8 = 0xB4;

const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
const GPIOEVENT_REQUEST_RISING_EDGE: u32 = 1 << 0;
const GPIOEVENT_REQUEST_FALLING_EDGE: u32 = 1 << 1;

const CONSUMER_LABEL: &[u8] = b"fanguard";

#[repr(C)]
struct GpioEventRequest {
    lineoffset: u32,
    handleflags: u32,
    eventflags: u32,
    consumer_label: [u8; 32],
    fd: i32,
}

#[repr(C)]
struct GpioHandleData {
    values: [u8; 64],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpioEventData {
    pub timestamp: u64,
    pub id: u32,
}

nix::ioctl_readwrite!(gpio_get_lineevent, GPIO_IOC_MAGIC, 0x04, GpioEventRequest);
nix::ioctl_readwrite!(gpiohandle_get_line_values, GPIO_IOC_MAGIC, 0x08, GpioHandleData);

/// An acquired GPIO line delivering edge events.
#[derive(Debug)]
pub struct LineEventHandle {
    device: PathBuf,
    line: u32,
    fd: OwnedFd,
}

impl LineEventHandle {
    /// Open `device` and request `line` for input with both-edge events.
    pub fn open(device: &Path, line: u32) -> Result<Self> {
        let chip = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(device)
            .map_err(|source| FanGuardError::GpioOpen {
                device: device.to_path_buf(),
                source,
            })?;

        let mut request = GpioEventRequest {
            lineoffset: line,
            handleflags: GPIOHANDLE_REQUEST_INPUT,
            eventflags: GPIOEVENT_REQUEST_RISING_EDGE | GPIOEVENT_REQUEST_FALLING_EDGE,
            consumer_label: [0; 32],
            fd: -1,
        };
        request.consumer_label[..CONSUMER_LABEL.len()].copy_from_slice(CONSUMER_LABEL);

        // SAFETY: the request struct matches the kernel ABI and outlives the
        // call; the chip fd is valid for its duration.
        unsafe { gpio_get_lineevent(chip.as_raw_fd(), &mut request) }.map_err(|errno| {
            FanGuardError::GpioIoctl {
                device: device.to_path_buf(),
                line,
                reason: format!("GET_LINEEVENT: {}", errno),
            }
        })?;

        if request.fd < 0 {
            return Err(FanGuardError::GpioIoctl {
                device: device.to_path_buf(),
                line,
                reason: "GET_LINEEVENT returned an invalid fd".into(),
            });
        }

        // SAFETY: the kernel just handed us this fd; we are its sole owner.
        let fd = unsafe { OwnedFd::from_raw_fd(request.fd) };

        set_nonblocking(fd.as_raw_fd()).map_err(|e| FanGuardError::GpioIoctl {
            device: device.to_path_buf(),
            line,
            reason: format!("O_NONBLOCK: {}", e),
        })?;

        Ok(Self {
            device: device.to_path_buf(),
            line,
            fd,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Synchronous read of the current line level.
    pub fn level(&self) -> Result<u8> {
        let mut data = GpioHandleData { values: [0; 64] };

        // SAFETY: data matches the kernel ABI and the event fd answers
        // line-value reads for its single requested line.
        unsafe { gpiohandle_get_line_values(self.fd.as_raw_fd(), &mut data) }.map_err(
            |errno| FanGuardError::GpioIoctl {
                device: self.device.clone(),
                line: self.line,
                reason: format!("GET_LINE_VALUES: {}", errno),
            },
        )?;

        Ok(data.values[0])
    }

    /// Drain one pending edge event, if any.
    ///
    /// Returns `Ok(None)` when the fd has no event queued (EAGAIN).
    pub fn read_event(&self) -> std::io::Result<Option<GpioEventData>> {
        let mut buf = [0u8; std::mem::size_of::<GpioEventData>()];

        // SAFETY: buf is a valid writable buffer of the stated length.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            return if err.kind() == std::io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            };
        }

        if (n as usize) < std::mem::size_of::<GpioEventData>() {
            return Ok(None);
        }

        // SAFETY: the kernel wrote a complete gpioevent_data record.
        let event = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const GpioEventData) };
        Ok(Some(event))
    }
}

impl AsRawFd for LineEventHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for LineEventHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: plain fcntl flag manipulation on a valid fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_size() {
        // The kernel writes 16-byte gpioevent_data records; a size mismatch
        // here would corrupt every edge read.
        assert_eq!(std::mem::size_of::<GpioEventData>(), 16);
    }

    #[test]
    fn test_open_missing_device_fails() {
        let err = LineEventHandle::open(Path::new("/dev/gpiochip-does-not-exist"), 0).unwrap_err();
        assert!(matches!(err, FanGuardError::GpioOpen { .. }));
    }
}
