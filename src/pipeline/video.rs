use std::ptr;

use anyhow::Result;
use ffmpeg_sys_next::AVCodecID::{AV_CODEC_ID_H264, AV_CODEC_ID_HEVC};
use ffmpeg_sys_next::{
    av_bsf_alloc, av_bsf_free, av_bsf_get_by_name, av_bsf_init, av_bsf_receive_packet,
    av_bsf_send_packet, av_packet_clone, avcodec_parameters_copy, AVBSFContext, AVCodecParameters,
    AVPacket, AVStream, AVERROR, AVERROR_EOF, AV_PKT_FLAG_KEY,
};
use libc::EAGAIN;
use log::{info, warn};

use crate::ffutil::{get_ffmpeg_error_msg, AvPacket};

/// Video leg of a transcoder: pure passthrough, with an mp4-to-annex-b
/// bitstream filter in front when the upstream carries H.264/HEVC in the
/// MP4 NAL layout. The muxer's video stream is created from the filter's
/// output parameters so extradata matches what actually hits the wire.
pub struct VideoPipeline {
    bsf: *mut AVBSFContext,
    par: *const AVCodecParameters,
}

unsafe impl Send for VideoPipeline {}

impl VideoPipeline {
    pub unsafe fn new(stream: *mut AVStream) -> Self {
        let par = (*stream).codecpar as *const AVCodecParameters;
        let filter_name = match (*par).codec_id {
            AV_CODEC_ID_H264 => Some(c"h264_mp4toannexb"),
            AV_CODEC_ID_HEVC => Some(c"hevc_mp4toannexb"),
            _ => None,
        };

        let mut bsf: *mut AVBSFContext = ptr::null_mut();
        if let Some(name) = filter_name {
            let filter = av_bsf_get_by_name(name.as_ptr());
            if !filter.is_null() && av_bsf_alloc(filter, &mut bsf) == 0 {
                if avcodec_parameters_copy((*bsf).par_in, par) < 0 {
                    av_bsf_free(&mut bsf);
                } else {
                    (*bsf).time_base_in = (*stream).time_base;
                    if av_bsf_init(bsf) < 0 {
                        warn!("bitstream filter init failed, using raw packets");
                        av_bsf_free(&mut bsf);
                    } else {
                        info!("attached {}", name.to_string_lossy());
                    }
                }
            }
        }

        Self { bsf, par }
    }

    /// Codec parameters the output stream should be created from.
    pub unsafe fn output_params(&self) -> *const AVCodecParameters {
        if self.bsf.is_null() {
            self.par
        } else {
            (*self.bsf).par_out
        }
    }

    /// Run one input packet through the filter (or clone it when there is
    /// none). A filter error drops the packet and the pipeline moves on.
    pub unsafe fn process_packet(&mut self, pkt: *mut AVPacket) -> Result<Vec<AvPacket>> {
        let mut out = Vec::new();
        if self.bsf.is_null() {
            let cloned = av_packet_clone(pkt);
            anyhow::ensure!(!cloned.is_null(), "failed to clone video packet");
            out.push(AvPacket(cloned));
            return Ok(out);
        }

        let ret = av_bsf_send_packet(self.bsf, pkt);
        if ret < 0 {
            warn!("bsf send failed: {}", get_ffmpeg_error_msg(ret));
            return Ok(out);
        }
        loop {
            let filtered = AvPacket::new()?;
            let ret = av_bsf_receive_packet(self.bsf, filtered.0);
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                break;
            }
            if ret < 0 {
                warn!("bsf receive failed: {}", get_ffmpeg_error_msg(ret));
                break;
            }
            out.push(filtered);
        }
        Ok(out)
    }
}

pub unsafe fn is_keyframe(pkt: *const AVPacket) -> bool {
    (*pkt).flags & AV_PKT_FLAG_KEY as libc::c_int != 0
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        unsafe {
            if !self.bsf.is_null() {
                av_bsf_free(&mut self.bsf);
            }
        }
    }
}
