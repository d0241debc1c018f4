//! Linux hidraw HID devices as stream objects.
//!
//! Devices are enumerated from `/sys/class/hidraw`; vendor/product/serial
//! come from the underlying device's uevent and string attributes. Reports
//! move whole: a read yields one report, a write submits one. Caller
//! buffers always carry a leading report-ID byte; on devices that use no
//! report IDs the raw descriptor traffic has none, so the write path skips
//! the caller's leading byte and the read path synthesizes a zero into it.

#![cfg(any(target_os = "android", target_os = "linux"))]

use std::fs;
use std::os::fd::FromRawFd;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::trace;

use crate::error::IoError;
use crate::event::{CapsMask, EventType, WaitMask};
use crate::sys::syscall;

use super::{posix, Io, IoKind, IoState, Layer, LayerCtx};

const NAME: &str = "HID";
const SYS_HIDRAW: &str = "/sys/class/hidraw";

/// One enumerated HID device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HidDeviceInfo {
    /// The `/dev/hidrawN` node.
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    pub product: String,
}

fn read_sys_string(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Parse `HID_ID=0003:0000046D:0000C52B` style uevent ids.
fn parse_hid_id(uevent: &str) -> Option<(u16, u16)> {
    for line in uevent.lines() {
        if let Some(value) = line.strip_prefix("HID_ID=") {
            let mut parts = value.split(':');
            let _bus = parts.next()?;
            let vid = u32::from_str_radix(parts.next()?, 16).ok()?;
            let pid = u32::from_str_radix(parts.next()?, 16).ok()?;
            return Some((vid as u16, pid as u16));
        }
    }
    None
}

fn parse_hid_uniq(uevent: &str) -> String {
    for line in uevent.lines() {
        if let Some(value) = line.strip_prefix("HID_UNIQ=") {
            return value.trim().to_string();
        }
    }
    String::new()
}

fn parse_hid_name(uevent: &str) -> String {
    for line in uevent.lines() {
        if let Some(value) = line.strip_prefix("HID_NAME=") {
            return value.trim().to_string();
        }
    }
    String::new()
}

/// Enumerate hidraw devices, optionally filtered by vendor, products and
/// serial number. Zero / empty filters match everything.
pub fn enumerate(vendor_id: u16, product_ids: &[u16], serial: Option<&str>) -> Vec<HidDeviceInfo> {
    let mut out = Vec::new();

    let entries = match fs::read_dir(SYS_HIDRAW) {
        Ok(e) => e,
        Err(_) => return out,
    };

    for entry in entries.flatten() {
        let devname = entry.file_name();
        let devname = devname.to_string_lossy();
        if !devname.starts_with("hidraw") {
            continue;
        }

        // hidrawN/device is the HID interface carrying the identity.
        let device_dir = entry.path().join("device");
        let uevent = match fs::read_to_string(device_dir.join("uevent")) {
            Ok(u) => u,
            Err(_) => continue,
        };
        let (vid, pid) = match parse_hid_id(&uevent) {
            Some(ids) => ids,
            None => continue,
        };

        if vendor_id != 0 && vid != vendor_id {
            continue;
        }
        if !product_ids.is_empty() && !product_ids.contains(&pid) {
            continue;
        }

        let dev_serial = parse_hid_uniq(&uevent);
        if let Some(want) = serial {
            if !want.is_empty() && want != dev_serial {
                continue;
            }
        }

        let mut product = parse_hid_name(&uevent);
        if product.is_empty() {
            product = read_sys_string(&device_dir, "name");
        }

        out.push(HidDeviceInfo {
            path: format!("/dev/{}", devname),
            vendor_id: vid,
            product_id: pid,
            serial: dev_serial,
            product,
        });
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

/// Whether a device path from [`enumerate`] can actually be opened.
pub fn device_accessible(path: &str) -> bool {
    fs::metadata(path).is_ok()
}

struct HidLayer {
    info: HidDeviceInfo,
    fd: Option<OwnedFd>,
    state: IoState,
    last_error_sys: i32,
    /// Largest report this device can produce; reads are clamped to it.
    report_len: usize,
    /// Caller buffers always lead with a report-ID byte; ID-less devices
    /// drop it on write and gain a zero on read at the descriptor boundary.
    uses_report_ids: bool,
}

impl HidLayer {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }
}

impl Layer for HidLayer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        let fd = self.raw_fd();
        if fd == -1 {
            return false;
        }
        if !ctx.handle_add(fd, WaitMask::READ, CapsMask::READ | CapsMask::WRITE) {
            return false;
        }
        self.state = IoState::Connected;
        ctx.softevent_add(false, EventType::Connected, IoError::Success);
        true
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Option<Result<usize, IoError>> {
        if self.state != IoState::Connected {
            return Some(Err(IoError::NotConnected));
        }

        // Without report IDs the wire data carries no ID byte; read past
        // the caller's ID slot and fill it with zero afterwards.
        let offset = if self.uses_report_ids { 0 } else { 1 };
        if buf.len() <= offset {
            return Some(Err(IoError::Invalid));
        }

        let max = offset + self.report_len.min(buf.len() - offset).max(1);
        let res = posix::fd_read(ctx, self.raw_fd(), &mut buf[offset..max], &mut self.last_error_sys)
            .map(|n| {
                if offset == 1 {
                    buf[0] = 0;
                }
                n + offset
            });
        if let Err(err) = &res {
            if !err.is_transient() {
                self.state = if *err == IoError::Disconnect {
                    IoState::Disconnected
                } else {
                    IoState::Error
                };
            }
        }
        Some(res)
    }

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Option<Result<usize, IoError>> {
        if self.state != IoState::Connected {
            return Some(Err(IoError::NotConnected));
        }

        // Without report IDs the caller's leading ID byte is skipped on the
        // wire but still counts as consumed.
        let offset = if self.uses_report_ids { 0 } else { 1 };
        if buf.len() <= offset {
            return Some(Err(IoError::Invalid));
        }

        let res = posix::fd_write(ctx, self.raw_fd(), &buf[offset..], &mut self.last_error_sys)
            .map(|n| n + offset);

        if let Err(err) = &res {
            if !err.is_transient() {
                self.state = if *err == IoError::Disconnect {
                    IoState::Disconnected
                } else {
                    IoState::Error
                };
            }
        }
        Some(res)
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        match *ty {
            EventType::Read => {
                ctx.waittype_del_mask(self.raw_fd(), WaitMask::READ);
                false
            }
            EventType::Write => {
                ctx.waittype_del_mask(self.raw_fd(), WaitMask::WRITE);
                false
            }
            EventType::Disconnected => {
                // Device unplug arrives as a hangup.
                self.state = IoState::Disconnected;
                false
            }
            EventType::Error => {
                if self.state == IoState::Connected {
                    self.state = IoState::Error;
                }
                false
            }
            _ => false,
        }
    }

    fn unregister(&mut self, ctx: &mut LayerCtx<'_>) {
        let fd = self.raw_fd();
        if fd != -1 {
            ctx.handle_del(fd);
        }
    }

    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if let Some(fd) = self.fd.take() {
            ctx.handle_del(fd.as_raw_fd());
        }
        if self.state == IoState::Connected {
            self.state = IoState::Disconnected;
        }
        true
    }

    fn reset(&mut self) {
        self.fd = None;
        self.state = IoState::Init;
        self.last_error_sys = 0;
    }

    fn state(&self) -> IoState {
        self.state
    }

    fn error_msg(&self) -> Option<String> {
        posix::errormsg(self.last_error_sys)
    }
}

/// Open a hidraw device as a stream object.
pub fn create(path: &str) -> Result<Arc<Io>, IoError> {
    let cpath = std::ffi::CString::new(path).map_err(|_| IoError::Invalid)?;
    let fd = syscall!(open(
        cpath.as_ptr(),
        libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC
    ))
    .map_err(|e| IoError::from_io_error(&e))?;
    // SAFETY: open(2) returned a descriptor we own.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // Identify via sysfs so the info accessors work on opened devices too.
    let devname = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let device_dir = PathBuf::from(SYS_HIDRAW).join(&devname).join("device");
    let uevent = fs::read_to_string(device_dir.join("uevent")).unwrap_or_default();
    let (vendor_id, product_id) = parse_hid_id(&uevent).unwrap_or((0, 0));

    let uses_report_ids = report_descriptor_has_ids(&device_dir);

    trace!("opened hid device {} ({:04x}:{:04x})", path, vendor_id, product_id);

    let layer = HidLayer {
        info: HidDeviceInfo {
            path: path.to_string(),
            vendor_id,
            product_id,
            serial: parse_hid_uniq(&uevent),
            product: parse_hid_name(&uevent),
        },
        fd: Some(fd),
        state: IoState::Init,
        last_error_sys: 0,
        report_len: 4096,
        uses_report_ids,
    };

    let io = Io::new(IoKind::Stream);
    io.add_layer(Box::new(layer));
    Ok(io)
}

/// Scan the report descriptor for a Report ID item (0x85).
fn report_descriptor_has_ids(device_dir: &Path) -> bool {
    let desc = match fs::read(device_dir.join("report_descriptor")) {
        Ok(d) => d,
        Err(_) => return false,
    };

    let mut i = 0;
    while i < desc.len() {
        let prefix = desc[i];
        if prefix == 0xFE {
            // Long item: [0xFE, size, tag, data...]
            let size = desc.get(i + 1).copied().unwrap_or(0) as usize;
            i += 3 + size;
            continue;
        }
        let size = match prefix & 0x03 {
            3 => 4,
            s => s as usize,
        };
        if prefix & 0xFC == 0x84 {
            return true;
        }
        i += 1 + size;
    }
    false
}

/// Identity of an opened HID object.
pub fn get_info(io: &Arc<Io>) -> Option<HidDeviceInfo> {
    super::with_layer(io, 0, NAME, |layer, _ctx| {
        layer
            .as_any_mut()
            .downcast_mut::<HidLayer>()
            .map(|hid| hid.info.clone())
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uevent_parsing() {
        let uevent = "DRIVER=hid-generic\n\
            HID_ID=0003:0000046D:0000C52B\n\
            HID_NAME=Logitech USB Receiver\n\
            HID_UNIQ=abc123\n";
        assert_eq!(parse_hid_id(uevent), Some((0x046D, 0xC52B)));
        assert_eq!(parse_hid_uniq(uevent), "abc123");
        assert_eq!(parse_hid_name(uevent), "Logitech USB Receiver");
        assert_eq!(parse_hid_id("DRIVER=hid-generic\n"), None);
    }

    #[test]
    fn report_id_item_detection() {
        let dir = std::env::temp_dir().join("evio-hid-test");
        let _ = fs::create_dir_all(&dir);

        // Usage Page, Usage, Collection, Report ID 1, End Collection.
        fs::write(
            dir.join("report_descriptor"),
            [0x05u8, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x85, 0x01, 0xC0],
        )
        .unwrap();
        assert!(report_descriptor_has_ids(&dir));

        fs::write(
            dir.join("report_descriptor"),
            [0x05u8, 0x01, 0x09, 0x06, 0xA1, 0x01, 0xC0],
        )
        .unwrap();
        assert!(!report_descriptor_has_ids(&dir));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn enumerate_does_not_panic() {
        // May be empty on build machines; just exercise the walk.
        let _ = enumerate(0, &[], None);
    }
}
