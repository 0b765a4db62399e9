use std::ptr;
use std::slice;

use anyhow::{ensure, Result};
use ffmpeg_sys_next::{
    av_free, av_freep, av_interleaved_write_frame, av_malloc, av_opt_set, av_write_trailer,
    avcodec_parameters_copy, avcodec_parameters_from_context, avformat_alloc_output_context2,
    avformat_free_context, avformat_new_stream, avformat_write_header, avio_alloc_context,
    avio_context_free, avio_flush, AVCodecContext, AVCodecParameters, AVFormatContext, AVPacket,
    AVRational, AVERROR, AVFMT_FLAG_CUSTOM_IO,
};

use crate::bail_ffmpeg;
use crate::segment::SegmentBuffer;

/// Size of the AVIO buffer sitting between the muxer and the segment sink.
pub const IO_BUF_SIZE: usize = 65536;

/// Output video time base, fixed at 90 kHz like any MPEG-TS PES clock.
pub const VIDEO_TIME_BASE: AVRational = AVRational { num: 1, den: 90000 };

unsafe extern "C" fn write_segment(
    opaque: *mut libc::c_void,
    buf: *const u8,
    buf_size: libc::c_int,
) -> libc::c_int {
    if buf_size <= 0 {
        return 0;
    }
    let seg = &mut *(opaque as *mut SegmentBuffer);
    match seg.append(slice::from_raw_parts(buf, buf_size as usize)) {
        Ok(()) => buf_size,
        Err(_) => AVERROR(libc::ENOMEM),
    }
}

/// MPEG-TS muxer bound to one in-memory segment buffer.
///
/// Stream 0 is the passthrough video, stream 1 the encoded AAC audio.
/// Every packet write is flushed straight through the AVIO layer so the
/// segment bytes are complete the moment the muxer returns.
pub struct MuxerSink {
    ctx: *mut AVFormatContext,
}

unsafe impl Send for MuxerSink {}

impl MuxerSink {
    /// Open a muxer writing into `buf`. The pointee must stay pinned for
    /// the lifetime of this sink; the segment ring guarantees that by
    /// boxing each buffer and never touching the active slot.
    pub unsafe fn open(
        buf: *mut SegmentBuffer,
        video_par: *const AVCodecParameters,
        audio_enc: *mut AVCodecContext,
    ) -> Result<Self> {
        let mut ctx = ptr::null_mut();
        let ret = avformat_alloc_output_context2(
            &mut ctx,
            ptr::null(),
            c"mpegts".as_ptr(),
            ptr::null(),
        );
        bail_ffmpeg!(ret, "avformat_alloc_output_context2");
        ensure!(!ctx.is_null(), "failed to allocate mpegts muxer");

        // drop guard for the error paths below
        let sink = Self { ctx };

        av_opt_set(
            (*ctx).priv_data,
            c"mpegts_flags".as_ptr(),
            c"resend_headers+initial_discontinuity".as_ptr(),
            0,
        );
        av_opt_set((*ctx).priv_data, c"flush_packets".as_ptr(), c"1".as_ptr(), 0);
        av_opt_set((*ctx).priv_data, c"mpegts_copyts".as_ptr(), c"1".as_ptr(), 0);

        let vst = avformat_new_stream(ctx, ptr::null());
        ensure!(!vst.is_null(), "failed to allocate video stream");
        let ret = avcodec_parameters_copy((*vst).codecpar, video_par);
        bail_ffmpeg!(ret, "copy video codecpar");
        (*(*vst).codecpar).codec_tag = 0;
        (*vst).time_base = VIDEO_TIME_BASE;

        let ast = avformat_new_stream(ctx, ptr::null());
        ensure!(!ast.is_null(), "failed to allocate audio stream");
        let ret = avcodec_parameters_from_context((*ast).codecpar, audio_enc);
        bail_ffmpeg!(ret, "copy audio codecpar");
        (*(*ast).codecpar).codec_tag = 0;
        (*ast).time_base = AVRational {
            num: 1,
            den: (*audio_enc).sample_rate,
        };

        let io_buf = av_malloc(IO_BUF_SIZE) as *mut u8;
        ensure!(!io_buf.is_null(), "failed to allocate avio buffer");
        let pb = avio_alloc_context(
            io_buf,
            IO_BUF_SIZE as libc::c_int,
            1,
            buf as *mut libc::c_void,
            None,
            Some(write_segment),
            None,
        );
        if pb.is_null() {
            av_free(io_buf as *mut libc::c_void);
            anyhow::bail!("failed to allocate avio context");
        }
        (*ctx).pb = pb;
        (*ctx).flags |= AVFMT_FLAG_CUSTOM_IO as libc::c_int;

        let ret = avformat_write_header(ctx, ptr::null_mut());
        bail_ffmpeg!(ret, "avformat_write_header");
        avio_flush((*ctx).pb);

        Ok(sink)
    }

    /// Interleaved write of one packet, flushed through to the segment.
    pub unsafe fn write(&mut self, pkt: *mut AVPacket) -> Result<()> {
        let ret = av_interleaved_write_frame(self.ctx, pkt);
        bail_ffmpeg!(ret, "av_interleaved_write_frame");
        avio_flush((*self.ctx).pb);
        Ok(())
    }

    /// Emit the trailer and flush, leaving the segment bytes complete.
    pub unsafe fn close(&mut self) -> Result<()> {
        let ret = av_write_trailer(self.ctx);
        avio_flush((*self.ctx).pb);
        bail_ffmpeg!(ret, "av_write_trailer");
        Ok(())
    }
}

impl Drop for MuxerSink {
    fn drop(&mut self) {
        unsafe {
            if self.ctx.is_null() {
                return;
            }
            let mut pb = (*self.ctx).pb;
            if !pb.is_null() {
                (*self.ctx).pb = ptr::null_mut();
                av_freep(ptr::addr_of_mut!((*pb).buffer) as *mut libc::c_void);
                avio_context_free(&mut pb);
            }
            avformat_free_context(self.ctx);
            self.ctx = ptr::null_mut();
        }
    }
}
