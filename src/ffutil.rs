use std::ffi::CStr;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Error, Result};
use ffmpeg_sys_next::{
    av_frame_alloc, av_frame_free, av_make_error_string, av_packet_alloc, av_packet_free, AVFrame,
    AVPacket,
};

pub fn get_ffmpeg_error_msg(ret: libc::c_int) -> String {
    unsafe {
        const BUF_SIZE: usize = 512;
        let mut buf: [libc::c_char; BUF_SIZE] = [0; BUF_SIZE];
        av_make_error_string(buf.as_mut_ptr(), BUF_SIZE, ret);
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().to_string()
    }
}

#[macro_export]
macro_rules! bail_ffmpeg {
    ($ret:expr, $what:expr) => {
        if $ret < 0 {
            anyhow::bail!(
                "{}: {}",
                $what,
                $crate::ffutil::get_ffmpeg_error_msg($ret)
            );
        }
    };
}

/// Monotonic milliseconds since the first call in this process.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Owned AVPacket, freed on drop.
pub struct AvPacket(pub *mut AVPacket);

unsafe impl Send for AvPacket {}

impl AvPacket {
    pub fn new() -> Result<Self> {
        let ptr = unsafe { av_packet_alloc() };
        if ptr.is_null() {
            return Err(Error::msg("failed to allocate packet"));
        }
        Ok(Self(ptr))
    }
}

impl Drop for AvPacket {
    fn drop(&mut self) {
        unsafe {
            av_packet_free(&mut self.0);
        }
    }
}

/// Owned AVFrame, freed on drop.
pub struct AvFrame(pub *mut AVFrame);

unsafe impl Send for AvFrame {}

impl AvFrame {
    pub fn new() -> Result<Self> {
        let ptr = unsafe { av_frame_alloc() };
        if ptr.is_null() {
            return Err(Error::msg("failed to allocate frame"));
        }
        Ok(Self(ptr))
    }
}

impl Drop for AvFrame {
    fn drop(&mut self) {
        unsafe {
            av_frame_free(&mut self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
