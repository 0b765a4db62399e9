use std::ffi::CStr;
use std::ptr;

use anyhow::{ensure, Error, Result};
use ffmpeg_sys_next::AVCodecID::AV_CODEC_ID_AAC;
use ffmpeg_sys_next::AVSampleFormat::{AV_SAMPLE_FMT_FLTP, AV_SAMPLE_FMT_S16};
use ffmpeg_sys_next::{
    av_audio_fifo_alloc, av_audio_fifo_free, av_audio_fifo_read, av_audio_fifo_realloc,
    av_audio_fifo_size, av_audio_fifo_write, av_channel_layout_compare, av_channel_layout_copy,
    av_channel_layout_default, av_frame_get_buffer, av_frame_unref, av_opt_set,
    av_packet_rescale_ts, avcodec_alloc_context3, avcodec_find_decoder, avcodec_find_encoder,
    avcodec_find_encoder_by_name, avcodec_free_context, avcodec_open2, avcodec_parameters_to_context,
    avcodec_receive_frame, avcodec_receive_packet, avcodec_send_frame, avcodec_send_packet,
    swr_alloc_set_opts2, swr_free, swr_get_out_samples, swr_init, swr_convert_frame,
    AVAudioFifo, AVChannelLayout, AVCodecContext, AVCodecParameters, AVFrame, AVPacket, AVRational,
    SwrContext, AVERROR, AVERROR_EOF, AV_CODEC_FLAG_GLOBAL_HEADER,
};
use libc::EAGAIN;
use log::{info, warn};

use crate::bail_ffmpeg;
use crate::ffutil::{get_ffmpeg_error_msg, AvFrame, AvPacket};

pub struct AudioConfig {
    pub bitrate: i64,
    pub sample_rate: i32,
    pub channels: i32,
}

/// Audio leg of a transcoder: upstream decoder, optional resampler, sample
/// FIFO and AAC encoder.
///
/// Frames are pulled out of the FIFO in exact encoder frame-size chunks and
/// stamped with a monotonic PTS counted in samples, so output audio time
/// is 1/sample_rate regardless of what the upstream used.
pub struct AudioPipeline {
    dec_ctx: *mut AVCodecContext,
    enc_ctx: *mut AVCodecContext,
    swr_ctx: *mut SwrContext,
    fifo: *mut AVAudioFifo,
    next_pts: i64,
}

unsafe impl Send for AudioPipeline {}

impl AudioPipeline {
    pub unsafe fn open(par: *const AVCodecParameters, cfg: &AudioConfig) -> Result<Self> {
        let dec = avcodec_find_decoder((*par).codec_id);
        ensure!(!dec.is_null(), "no decoder for upstream audio codec");
        let mut dec_ctx = avcodec_alloc_context3(dec);
        ensure!(!dec_ctx.is_null(), "failed to allocate audio decoder");
        let ret = avcodec_parameters_to_context(dec_ctx, par);
        if ret < 0 {
            avcodec_free_context(&mut dec_ctx);
            anyhow::bail!("audio decoder params: {}", get_ffmpeg_error_msg(ret));
        }
        let ret = avcodec_open2(dec_ctx, dec, ptr::null_mut());
        if ret < 0 {
            avcodec_free_context(&mut dec_ctx);
            anyhow::bail!("audio decoder open: {}", get_ffmpeg_error_msg(ret));
        }

        let mut pipeline = Self {
            dec_ctx,
            enc_ctx: ptr::null_mut(),
            swr_ctx: ptr::null_mut(),
            fifo: ptr::null_mut(),
            next_pts: 0,
        };
        pipeline.open_encoder(cfg)?;
        pipeline.setup_resampler()?;

        pipeline.fifo = av_audio_fifo_alloc(
            (*pipeline.enc_ctx).sample_fmt,
            (*pipeline.enc_ctx).ch_layout.nb_channels,
            1024,
        );
        ensure!(!pipeline.fifo.is_null(), "failed to allocate audio fifo");
        Ok(pipeline)
    }

    unsafe fn open_encoder(&mut self, cfg: &AudioConfig) -> Result<()> {
        let mut enc = avcodec_find_encoder_by_name(c"libfdk_aac".as_ptr());
        if enc.is_null() {
            enc = avcodec_find_encoder(AV_CODEC_ID_AAC);
        }
        ensure!(!enc.is_null(), "no AAC encoder available");

        let ctx = avcodec_alloc_context3(enc);
        ensure!(!ctx.is_null(), "failed to allocate AAC encoder");
        // owned from here on; Drop releases it if anything below fails
        self.enc_ctx = ctx;

        (*ctx).sample_rate = cfg.sample_rate;
        av_channel_layout_default(&mut (*ctx).ch_layout, cfg.channels);
        (*ctx).bit_rate = cfg.bitrate;
        (*ctx).time_base = AVRational {
            num: 1,
            den: cfg.sample_rate,
        };
        (*ctx).flags |= AV_CODEC_FLAG_GLOBAL_HEADER as libc::c_int;

        let name = CStr::from_ptr((*enc).name).to_string_lossy();
        if name == "libfdk_aac" {
            (*ctx).sample_fmt = AV_SAMPLE_FMT_S16;
            av_opt_set((*ctx).priv_data, c"profile".as_ptr(), c"aac_low".as_ptr(), 0);
            av_opt_set((*ctx).priv_data, c"afterburner".as_ptr(), c"0".as_ptr(), 0);
        } else {
            (*ctx).sample_fmt = AV_SAMPLE_FMT_FLTP;
            av_opt_set((*ctx).priv_data, c"profile".as_ptr(), c"aac_low".as_ptr(), 0);
            av_opt_set((*ctx).priv_data, c"cutoff".as_ptr(), c"18000".as_ptr(), 0);
        }

        let ret = avcodec_open2(ctx, enc, ptr::null_mut());
        bail_ffmpeg!(ret, "AAC encoder open");
        info!(
            "audio encoder {} ready: {}bps @{}Hz/{}ch, frame_size={}",
            name,
            cfg.bitrate,
            cfg.sample_rate,
            cfg.channels,
            (*ctx).frame_size
        );
        Ok(())
    }

    /// Allocate a resampler when decoder output and encoder input differ in
    /// rate, layout or sample format; bypass otherwise.
    unsafe fn setup_resampler(&mut self) -> Result<()> {
        let dec = self.dec_ctx;
        let enc = self.enc_ctx;

        let in_rate = if (*dec).sample_rate > 0 {
            (*dec).sample_rate
        } else {
            (*enc).sample_rate
        };
        let mut in_layout: AVChannelLayout = std::mem::zeroed();
        if (*dec).ch_layout.nb_channels > 0 {
            let ret = av_channel_layout_copy(&mut in_layout, &(*dec).ch_layout);
            bail_ffmpeg!(ret, "copy input channel layout");
        } else {
            av_channel_layout_default(&mut in_layout, 2);
        }

        let needs_resample = in_rate != (*enc).sample_rate
            || av_channel_layout_compare(&in_layout, &(*enc).ch_layout) != 0
            || (*dec).sample_fmt != (*enc).sample_fmt;
        if !needs_resample {
            return Ok(());
        }

        info!(
            "audio resampler: {}ch@{} -> {}ch@{}",
            in_layout.nb_channels,
            in_rate,
            (*enc).ch_layout.nb_channels,
            (*enc).sample_rate
        );
        let mut swr = ptr::null_mut();
        let ret = swr_alloc_set_opts2(
            &mut swr,
            &(*enc).ch_layout,
            (*enc).sample_fmt,
            (*enc).sample_rate,
            &in_layout,
            (*dec).sample_fmt,
            in_rate,
            0,
            ptr::null_mut(),
        );
        bail_ffmpeg!(ret, "swr_alloc_set_opts2");
        let ret = swr_init(swr);
        if ret < 0 {
            swr_free(&mut swr);
            anyhow::bail!("swr_init: {}", get_ffmpeg_error_msg(ret));
        }
        self.swr_ctx = swr;
        Ok(())
    }

    pub fn encoder_context(&self) -> *mut AVCodecContext {
        self.enc_ctx
    }

    /// Decode one upstream packet and run everything it yields through the
    /// resample/FIFO/encode chain. A decode error skips the packet.
    pub unsafe fn process_packet(&mut self, pkt: *mut AVPacket) -> Result<Vec<AvPacket>> {
        let mut out = Vec::new();
        let ret = avcodec_send_packet(self.dec_ctx, pkt);
        if ret < 0 {
            warn!("audio decode error: {}", get_ffmpeg_error_msg(ret));
            return Ok(out);
        }
        let frame = AvFrame::new()?;
        loop {
            let ret = avcodec_receive_frame(self.dec_ctx, frame.0);
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                break;
            }
            bail_ffmpeg!(ret, "avcodec_receive_frame");
            self.push_and_encode(frame.0, &mut out)?;
            av_frame_unref(frame.0);
        }
        Ok(out)
    }

    /// Drain decoder, FIFO tail and encoder at end of stream.
    pub unsafe fn flush(&mut self) -> Result<Vec<AvPacket>> {
        let mut out = Vec::new();

        let ret = avcodec_send_packet(self.dec_ctx, ptr::null());
        if ret >= 0 {
            let frame = AvFrame::new()?;
            loop {
                let ret = avcodec_receive_frame(self.dec_ctx, frame.0);
                if ret < 0 {
                    break;
                }
                self.push_and_encode(frame.0, &mut out)?;
                av_frame_unref(frame.0);
            }
        }

        // encode the partial frame left in the FIFO
        self.encode_from_fifo(true, &mut out)?;

        let ret = avcodec_send_frame(self.enc_ctx, ptr::null());
        if ret >= 0 {
            self.drain_encoder(&mut out)?;
        }
        Ok(out)
    }

    unsafe fn push_and_encode(
        &mut self,
        in_frame: *mut AVFrame,
        out: &mut Vec<AvPacket>,
    ) -> Result<()> {
        if self.swr_ctx.is_null() {
            self.fifo_write((*in_frame).extended_data, (*in_frame).nb_samples)?;
        } else {
            let conv = AvFrame::new()?;
            let ret = av_channel_layout_copy(&mut (*conv.0).ch_layout, &(*self.enc_ctx).ch_layout);
            bail_ffmpeg!(ret, "copy channel layout");
            (*conv.0).format = (*self.enc_ctx).sample_fmt as libc::c_int;
            (*conv.0).sample_rate = (*self.enc_ctx).sample_rate;
            (*conv.0).nb_samples =
                swr_get_out_samples(self.swr_ctx, (*in_frame).nb_samples).max(1);
            let ret = av_frame_get_buffer(conv.0, 0);
            bail_ffmpeg!(ret, "alloc resample buffer");
            let ret = swr_convert_frame(self.swr_ctx, conv.0, in_frame);
            bail_ffmpeg!(ret, "swr_convert_frame");
            if (*conv.0).nb_samples > 0 {
                self.fifo_write((*conv.0).extended_data, (*conv.0).nb_samples)?;
            }
        }
        self.encode_from_fifo(false, out)
    }

    unsafe fn fifo_write(&mut self, data: *mut *mut u8, nb_samples: libc::c_int) -> Result<()> {
        let ret = av_audio_fifo_realloc(self.fifo, av_audio_fifo_size(self.fifo) + nb_samples);
        bail_ffmpeg!(ret, "audio fifo realloc");
        let written =
            av_audio_fifo_write(self.fifo, data as *const *mut libc::c_void, nb_samples);
        ensure!(
            written == nb_samples,
            "audio fifo short write: {} != {}",
            written,
            nb_samples
        );
        Ok(())
    }

    unsafe fn encode_from_fifo(&mut self, flush: bool, out: &mut Vec<AvPacket>) -> Result<()> {
        let frame_size = (*self.enc_ctx).frame_size;
        loop {
            let avail = av_audio_fifo_size(self.fifo);
            let nb = if avail >= frame_size {
                frame_size
            } else if flush && avail > 0 {
                avail
            } else {
                break;
            };

            let frame = AvFrame::new()?;
            (*frame.0).nb_samples = nb;
            let ret = av_channel_layout_copy(&mut (*frame.0).ch_layout, &(*self.enc_ctx).ch_layout);
            bail_ffmpeg!(ret, "copy channel layout");
            (*frame.0).format = (*self.enc_ctx).sample_fmt as libc::c_int;
            (*frame.0).sample_rate = (*self.enc_ctx).sample_rate;
            let ret = av_frame_get_buffer(frame.0, 0);
            bail_ffmpeg!(ret, "alloc encode buffer");

            let read = av_audio_fifo_read(
                self.fifo,
                (*frame.0).extended_data as *const *mut libc::c_void,
                nb,
            );
            ensure!(read == nb, "audio fifo short read: {} != {}", read, nb);

            (*frame.0).pts = self.next_pts;
            self.next_pts += nb as i64;

            let ret = avcodec_send_frame(self.enc_ctx, frame.0);
            if ret < 0 && ret != AVERROR(EAGAIN) {
                return Err(Error::msg(format!(
                    "avcodec_send_frame: {}",
                    get_ffmpeg_error_msg(ret)
                )));
            }
            self.drain_encoder(out)?;
        }
        Ok(())
    }

    unsafe fn drain_encoder(&mut self, out: &mut Vec<AvPacket>) -> Result<()> {
        loop {
            let pkt = AvPacket::new()?;
            let ret = avcodec_receive_packet(self.enc_ctx, pkt.0);
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                break;
            }
            bail_ffmpeg!(ret, "avcodec_receive_packet");
            av_packet_rescale_ts(
                pkt.0,
                (*self.enc_ctx).time_base,
                AVRational {
                    num: 1,
                    den: (*self.enc_ctx).sample_rate,
                },
            );
            out.push(pkt);
        }
        Ok(())
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        unsafe {
            if !self.swr_ctx.is_null() {
                swr_free(&mut self.swr_ctx);
            }
            if !self.fifo.is_null() {
                av_audio_fifo_free(self.fifo);
                self.fifo = ptr::null_mut();
            }
            if !self.dec_ctx.is_null() {
                avcodec_free_context(&mut self.dec_ctx);
            }
            if !self.enc_ctx.is_null() {
                avcodec_free_context(&mut self.enc_ctx);
            }
        }
    }
}
