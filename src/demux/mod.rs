use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ffmpeg_sys_next::AVMediaType::{AVMEDIA_TYPE_AUDIO, AVMEDIA_TYPE_VIDEO};
use ffmpeg_sys_next::{
    av_dict_free, av_dict_set, av_find_best_stream, av_read_frame, avformat_alloc_context,
    avformat_close_input, avformat_find_stream_info, avformat_open_input, AVDictionary,
    AVFormatContext, AVIOInterruptCB, AVPacket, AVRational, AVStream, AVERROR, AVERROR_EOF,
    AVERROR_EXIT,
};
use log::{debug, warn};

use crate::error::CreateError;
use crate::ffutil::get_ffmpeg_error_msg;

unsafe extern "C" fn interrupted(opaque: *mut libc::c_void) -> libc::c_int {
    let stop = &*(opaque as *const AtomicBool);
    stop.load(Ordering::Relaxed) as libc::c_int
}

/// One open upstream input.
///
/// Opened with auto-reconnect and a 15 s read timeout; the interrupt
/// callback polls the shared stop flag so a blocking read unwinds promptly
/// when the owning transcoder is torn down.
pub struct InputSession {
    ctx: *mut AVFormatContext,
    pub video_idx: libc::c_int,
    pub audio_idx: libc::c_int,
    // referenced by the interrupt callback for as long as the context lives
    stop: Arc<AtomicBool>,
}

unsafe impl Send for InputSession {}

impl InputSession {
    pub fn open(
        url: &str,
        user_agent: &str,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, CreateError> {
        let c_url = CString::new(url)
            .map_err(|_| CreateError::UpstreamOpen("url contains NUL".to_string()))?;
        let c_ua = CString::new(user_agent)
            .map_err(|_| CreateError::UpstreamOpen("user agent contains NUL".to_string()))?;

        unsafe {
            let mut opts: *mut AVDictionary = ptr::null_mut();
            av_dict_set(&mut opts, c"reconnect".as_ptr(), c"1".as_ptr(), 0);
            av_dict_set(&mut opts, c"reconnect_streamed".as_ptr(), c"1".as_ptr(), 0);
            av_dict_set(
                &mut opts,
                c"reconnect_on_network_error".as_ptr(),
                c"1".as_ptr(),
                0,
            );
            av_dict_set(&mut opts, c"rw_timeout".as_ptr(), c"15000000".as_ptr(), 0);
            av_dict_set(&mut opts, c"timeout".as_ptr(), c"15000000".as_ptr(), 0);
            av_dict_set(&mut opts, c"user_agent".as_ptr(), c_ua.as_ptr(), 0);

            let mut ctx = avformat_alloc_context();
            if ctx.is_null() {
                av_dict_free(&mut opts);
                return Err(CreateError::UpstreamOpen(
                    "failed to allocate input context".to_string(),
                ));
            }
            (*ctx).interrupt_callback = AVIOInterruptCB {
                callback: Some(interrupted),
                opaque: Arc::as_ptr(&stop) as *mut libc::c_void,
            };

            let ret = avformat_open_input(&mut ctx, c_url.as_ptr(), ptr::null(), &mut opts);
            av_dict_free(&mut opts);
            if ret < 0 {
                // avformat_open_input frees the context on failure
                return Err(CreateError::UpstreamOpen(get_ffmpeg_error_msg(ret)));
            }

            let ret = avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                avformat_close_input(&mut ctx);
                return Err(CreateError::UpstreamOpen(get_ffmpeg_error_msg(ret)));
            }

            let video_idx =
                av_find_best_stream(ctx, AVMEDIA_TYPE_VIDEO, -1, -1, ptr::null_mut(), 0);
            let audio_idx =
                av_find_best_stream(ctx, AVMEDIA_TYPE_AUDIO, -1, -1, ptr::null_mut(), 0);
            if video_idx < 0 || audio_idx < 0 {
                avformat_close_input(&mut ctx);
                return Err(CreateError::MissingStream);
            }
            debug!(
                "opened {}: video stream {}, audio stream {}",
                url, video_idx, audio_idx
            );

            Ok(Self {
                ctx,
                video_idx,
                audio_idx,
                stop,
            })
        }
    }

    /// Read the next packet into `pkt`. Returns false on end of stream or
    /// interrupt; read errors end the stream after the reconnect logic
    /// inside the protocol layer has given up.
    pub unsafe fn read(&mut self, pkt: *mut AVPacket) -> bool {
        let ret = av_read_frame(self.ctx, pkt);
        if ret >= 0 {
            return true;
        }
        if ret == AVERROR_EOF || ret == AVERROR_EXIT || ret == AVERROR(libc::EINTR) {
            debug!("upstream read ended: {}", get_ffmpeg_error_msg(ret));
        } else {
            warn!("upstream read failed: {}", get_ffmpeg_error_msg(ret));
        }
        false
    }

    pub unsafe fn stream(&self, idx: libc::c_int) -> *mut AVStream {
        *(*self.ctx).streams.add(idx as usize)
    }

    pub unsafe fn stream_time_base(&self, idx: libc::c_int) -> AVRational {
        (*self.stream(idx)).time_base
    }
}

impl Drop for InputSession {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                avformat_close_input(&mut self.ctx);
            }
        }
    }
}
