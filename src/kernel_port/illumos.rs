//! Real `port(3)` backend for illumos, grounded on `fen-kernel.c`'s direct
//! use of `port_create`/`port_associate`/`port_getn`/`port_dissociate`.
//!
//! The `libc` crate does not expose the `PORT_SOURCE_FILE` family (it is
//! Solaris/illumos-specific and rarely needed outside exactly this kind of
//! code), so the handful of types and the four functions are declared here
//! directly against `libc`'s primitive types, the same way
//! platform-debugger crates bind narrow native APIs `libc` itself doesn't
//! cover.

use std::ffi::c_void;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libc::{c_int, c_uint, timespec};

use crate::error::{Error, Result};
use crate::event::KernelEventMask;

use super::{AssociationId, KernelPort, RawKernelEvent};

const PORT_SOURCE_FILE: c_int = 4;
const FILE_NAME_MAX: usize = 255;

const FILE_ACCESS: c_int = 0x00000001;
const FILE_MODIFIED: c_int = 0x00000002;
const FILE_ATTRIB: c_int = 0x00000004;
const FILE_DELETE: c_int = 0x00000010;
const FILE_RENAME_TO: c_int = 0x00000020;
const FILE_RENAME_FROM: c_int = 0x00000040;
const UNMOUNTED: c_int = 0x20000000;
const MOUNTEDOVER: c_int = 0x40000000;

#[repr(C)]
struct FileObj {
    fo_atime: timespec,
    fo_mtime: timespec,
    fo_ctime: timespec,
    fo_name: [u8; FILE_NAME_MAX + 1],
}

#[repr(C)]
struct PortEvent {
    portev_events: c_int,
    portev_source: u16,
    portev_pad: u16,
    portev_object: usize,
    portev_user: *mut c_void,
}

extern "C" {
    fn port_create() -> c_int;
    fn port_associate(port: c_int, source: c_int, object: usize, events: c_int, user: *mut c_void) -> c_int;
    fn port_dissociate(port: c_int, source: c_int, object: usize) -> c_int;
    fn port_getn(
        port: c_int,
        list: *mut PortEvent,
        max: c_uint,
        nget: *mut c_uint,
        timeout: *mut timespec,
    ) -> c_int;
}

fn stat_to_fileobj(path: &Path) -> io::Result<Box<FileObj>> {
    let meta = fs::symlink_metadata(path)?;
    let mut fo: Box<FileObj> = Box::new(unsafe { std::mem::zeroed() });
    fo.fo_mtime.tv_sec = meta_mtime_secs(&meta);
    let bytes = path.as_os_str().as_bytes();
    let len = bytes.len().min(FILE_NAME_MAX);
    fo.fo_name[..len].copy_from_slice(&bytes[..len]);
    Ok(fo)
}

#[cfg(unix)]
fn meta_mtime_secs(meta: &fs::Metadata) -> libc::time_t {
    use std::os::unix::fs::MetadataExt;
    meta.mtime() as libc::time_t
}

fn mask_from_native(events: c_int) -> KernelEventMask {
    let mut mask = KernelEventMask::empty();
    if events & FILE_ACCESS != 0 {
        mask |= KernelEventMask::ACCESS;
    }
    if events & FILE_MODIFIED != 0 {
        mask |= KernelEventMask::MODIFIED;
    }
    if events & FILE_ATTRIB != 0 {
        mask |= KernelEventMask::ATTRIB;
    }
    if events & FILE_DELETE != 0 {
        mask |= KernelEventMask::DELETE;
    }
    if events & FILE_RENAME_TO != 0 {
        mask |= KernelEventMask::RENAME_TO;
    }
    if events & FILE_RENAME_FROM != 0 {
        mask |= KernelEventMask::RENAME_FROM;
    }
    if events & UNMOUNTED != 0 {
        mask |= KernelEventMask::UNMOUNTED;
    }
    if events & MOUNTEDOVER != 0 {
        mask |= KernelEventMask::MOUNTEDOVER;
    }
    mask
}

const NATIVE_EVENT_MASK: c_int =
    FILE_MODIFIED | FILE_ATTRIB | FILE_DELETE | FILE_RENAME_TO | FILE_RENAME_FROM | UNMOUNTED | MOUNTEDOVER;

/// Tracks the boxed [`FileObj`] backing each live association so its memory
/// stays valid for the kernel to read until the matching event (or a
/// dissociate) retires it — `port_associate` only borrows the pointer, it
/// does not copy the struct.
pub struct IllumosPort {
    port: c_int,
    live: std::collections::HashMap<PathBuf, Box<FileObj>>,
}

impl IllumosPort {
    pub fn new() -> Result<Self> {
        let port = unsafe { port_create() };
        if port < 0 {
            return Err(Error::Associate {
                path: PathBuf::new(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            port,
            live: std::collections::HashMap::new(),
        })
    }
}

impl KernelPort for IllumosPort {
    fn associate(&mut self, path: &Path, _mask: KernelEventMask, cookie: AssociationId) -> Result<()> {
        let mut fo = stat_to_fileobj(path).map_err(|source| Error::Associate {
            path: path.to_path_buf(),
            source,
        })?;
        let object = fo.as_mut() as *mut FileObj as usize;
        let rc = unsafe {
            port_associate(self.port, PORT_SOURCE_FILE, object, NATIVE_EVENT_MASK, cookie as *mut c_void)
        };
        if rc != 0 {
            return Err(Error::Associate {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        self.live.insert(path.to_path_buf(), fo);
        Ok(())
    }

    fn reassociate(&mut self, path: &Path, cookie: AssociationId) -> Result<()> {
        let Some(fo) = self.live.get_mut(path) else {
            return self.associate(path, KernelEventMask::empty(), cookie);
        };
        let object = fo.as_mut() as *mut FileObj as usize;
        let rc = unsafe {
            port_associate(self.port, PORT_SOURCE_FILE, object, NATIVE_EVENT_MASK, cookie as *mut c_void)
        };
        if rc != 0 {
            return Err(Error::Associate {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn dissociate(&mut self, path: &Path) -> Result<()> {
        let Some(fo) = self.live.remove(path) else {
            return Ok(());
        };
        let object = fo.as_ref() as *const FileObj as usize;
        let rc = unsafe { port_dissociate(self.port, PORT_SOURCE_FILE, object) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Dissociate {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        }
        Ok(())
    }

    fn getn(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawKernelEvent>> {
        let mut list: Vec<PortEvent> = Vec::with_capacity(max);
        let mut nget: c_uint = 1;
        let mut ts = timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        list.resize_with(max, || PortEvent {
            portev_events: 0,
            portev_source: 0,
            portev_pad: 0,
            portev_object: 0,
            portev_user: std::ptr::null_mut(),
        });
        let rc = unsafe { port_getn(self.port, list.as_mut_ptr(), max as c_uint, &mut nget, &mut ts) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIME) {
                return Ok(Vec::new());
            }
            return Err(Error::Associate {
                path: PathBuf::new(),
                source: err,
            });
        }
        let mut out = Vec::with_capacity(nget as usize);
        for entry in list.into_iter().take(nget as usize) {
            out.push(RawKernelEvent {
                cookie: entry.portev_user as AssociationId,
                mask: mask_from_native(entry.portev_events),
            });
        }
        Ok(out)
    }
}

impl Drop for IllumosPort {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.port);
        }
    }
}
