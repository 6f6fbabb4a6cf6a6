//! SoapySDR backend for the [`Device`] and [`RxStream`] traits.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{WireBuffer, WireFormat};
use crate::hardware::{Device, ReadStatus, RxStream};
use crate::{Error, Result};

type SoapyDevice = c_void;
type SoapyStream = c_void;

const SOAPY_SDR_RX: c_int = 1;

#[repr(C)]
struct SoapyKwargs {
    size: usize,
    keys: *mut *mut c_char,
    vals: *mut *mut c_char,
}

unsafe extern "C" {
    fn SoapySDRDevice_makeStrArgs(args: *const c_char) -> *mut SoapyDevice;
    fn SoapySDRDevice_unmake(device: *mut SoapyDevice) -> c_int;
    fn SoapySDRDevice_getHardwareKey(device: *const SoapyDevice) -> *mut c_char;
    fn SoapySDRDevice_setSampleRate(
        dev: *mut SoapyDevice,
        direction: c_int,
        channel: usize,
        rate: c_double,
    ) -> c_int;
    fn SoapySDRDevice_getNativeStreamFormat(
        dev: *const SoapyDevice,
        direction: c_int,
        channel: usize,
        full_scale: *mut c_double,
    ) -> *mut c_char;
    fn SoapySDRDevice_setupStream(
        dev: *mut SoapyDevice,
        direction: c_int,
        format: *const c_char,
        channels: *const usize,
        num_chans: usize,
        args: *const SoapyKwargs,
    ) -> *mut SoapyStream;
    fn SoapySDRDevice_activateStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        flags: c_int,
        time_ns: i64,
        num_elems: usize,
    ) -> c_int;
    fn SoapySDRDevice_deactivateStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        flags: c_int,
        time_ns: i64,
    ) -> c_int;
    fn SoapySDRDevice_closeStream(dev: *mut SoapyDevice, stream: *mut SoapyStream) -> c_int;
    fn SoapySDRDevice_readStream(
        dev: *mut SoapyDevice,
        stream: *mut SoapyStream,
        buffs: *const *mut c_void,
        num_elems: usize,
        flags: *mut c_int,
        time_ns: *mut i64,
        timeout_us: i64,
    ) -> c_int;
    fn SoapySDRDevice_getStreamMTU(dev: *const SoapyDevice, stream: *mut SoapyStream) -> usize;
    fn SoapySDRDevice_lastError() -> *const c_char;
    fn SoapySDR_free(ptr: *mut c_void);
}

fn last_error() -> String {
    unsafe {
        let p = SoapySDRDevice_lastError();
        if p.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

/// Take ownership of a string allocated by SoapySDR.
fn take_string(p: *mut c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    unsafe {
        let s = CStr::from_ptr(p).to_string_lossy().to_string();
        SoapySDR_free(p as *mut c_void);
        s
    }
}

struct Handle(*mut SoapyDevice);

// SoapySDR devices may be called from any thread; the acquisition thread is
// the only caller of stream functions.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { SoapySDRDevice_unmake(self.0) };
    }
}

/// A device opened through SoapySDR, e.g. `SoapySdr::open("driver=rtlsdr")`.
pub struct SoapySdr {
    handle: Arc<Handle>,
    label: String,
}

impl SoapySdr {
    pub fn open(args: &str) -> Result<Self> {
        let args = CString::new(args).map_err(|e| Error::Hardware(e.to_string()))?;
        let dev = unsafe { SoapySDRDevice_makeStrArgs(args.as_ptr()) };
        if dev.is_null() {
            return Err(Error::Hardware(format!("SoapySDR make failed: {}", last_error())));
        }
        let label = take_string(unsafe { SoapySDRDevice_getHardwareKey(dev) });
        log::info!("SoapySDR device opened: {}", label);
        Ok(Self {
            handle: Arc::new(Handle(dev)),
            label,
        })
    }
}

impl Device for SoapySdr {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn set_sample_rate(&self, channel: usize, rate: u32) -> Result<()> {
        let r = unsafe {
            SoapySDRDevice_setSampleRate(self.handle.0, SOAPY_SDR_RX, channel, rate as f64)
        };
        if r != 0 {
            return Err(Error::Hardware(format!("setSampleRate failed: {}", last_error())));
        }
        Ok(())
    }

    fn native_format(&self, channel: usize) -> (String, f64) {
        let mut full_scale: c_double = 0.0;
        let format = take_string(unsafe {
            SoapySDRDevice_getNativeStreamFormat(
                self.handle.0,
                SOAPY_SDR_RX,
                channel,
                &mut full_scale,
            )
        });
        (format, full_scale)
    }

    fn open_stream(&self, format: WireFormat, channels: &[usize]) -> Result<Box<dyn RxStream>> {
        let fmt = CString::new(format.stream_format()).map_err(|e| Error::Hardware(e.to_string()))?;
        let stream = unsafe {
            SoapySDRDevice_setupStream(
                self.handle.0,
                SOAPY_SDR_RX,
                fmt.as_ptr(),
                channels.as_ptr(),
                channels.len(),
                ptr::null(),
            )
        };
        if stream.is_null() {
            return Err(Error::Hardware(format!("setupStream failed: {}", last_error())));
        }
        Ok(Box::new(SoapyRxStream {
            handle: self.handle.clone(),
            stream,
            pointers: Vec::with_capacity(channels.len()),
        }))
    }
}

struct SoapyRxStream {
    handle: Arc<Handle>,
    stream: *mut SoapyStream,
    pointers: Vec<*mut c_void>,
}

// owned and used by the acquisition thread only
unsafe impl Send for SoapyRxStream {}

impl RxStream for SoapyRxStream {
    fn mtu(&self) -> usize {
        unsafe { SoapySDRDevice_getStreamMTU(self.handle.0, self.stream) }
    }

    fn activate(&mut self) -> Result<()> {
        let r = unsafe { SoapySDRDevice_activateStream(self.handle.0, self.stream, 0, 0, 0) };
        if r != 0 {
            return Err(Error::Hardware(format!("activateStream failed: {}", last_error())));
        }
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        let r = unsafe { SoapySDRDevice_deactivateStream(self.handle.0, self.stream, 0, 0) };
        if r != 0 {
            return Err(Error::Hardware(format!("deactivateStream failed: {}", last_error())));
        }
        Ok(())
    }

    fn read(
        &mut self,
        buffers: &mut [WireBuffer],
        max_samples: usize,
        timeout: Duration,
    ) -> ReadStatus {
        let n = buffers
            .iter()
            .map(WireBuffer::capacity)
            .min()
            .unwrap_or(0)
            .min(max_samples);

        self.pointers.clear();
        self.pointers.extend(buffers.iter_mut().map(|b| match b {
            WireBuffer::I8(v) => v.as_mut_ptr() as *mut c_void,
            WireBuffer::I16(v) => v.as_mut_ptr() as *mut c_void,
            WireBuffer::F32(v) => v.as_mut_ptr() as *mut c_void,
        }));

        let mut flags: c_int = 0;
        let mut time_ns: i64 = 0;
        let ret = unsafe {
            SoapySDRDevice_readStream(
                self.handle.0,
                self.stream,
                self.pointers.as_ptr(),
                n,
                &mut flags,
                &mut time_ns,
                timeout.as_micros() as i64,
            )
        };
        ReadStatus::from_code(ret)
    }
}

impl Drop for SoapyRxStream {
    fn drop(&mut self) {
        unsafe { SoapySDRDevice_closeStream(self.handle.0, self.stream) };
    }
}
