use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use ffmpeg_sys_next::{
    av_packet_rescale_ts, av_packet_unref, AVRational, AV_NOPTS_VALUE,
};
use log::{debug, error, info, warn};

use crate::ffutil::AvPacket;
use crate::mux::{MuxerSink, VIDEO_TIME_BASE};
use crate::demux::InputSession;
use crate::pipeline::audio::AudioPipeline;
use crate::pipeline::video::{is_keyframe, VideoPipeline};
use crate::pipeline::StreamShared;
use crate::segment::SegmentBuffer;

/// Worker entry point; runs on its own OS thread until stop or EOF.
pub(crate) fn run(
    shared: Arc<StreamShared>,
    input: InputSession,
    audio: AudioPipeline,
    video: VideoPipeline,
    seg_ms: u64,
) {
    let url = shared.url.clone();
    if let Err(e) = unsafe { run_inner(&shared, input, audio, video, seg_ms) } {
        error!("pipeline for {} ended with error: {}", url, e);
    }
    info!("pipeline for {} stopped", url);
}

unsafe fn run_inner(
    shared: &Arc<StreamShared>,
    mut input: InputSession,
    mut audio: AudioPipeline,
    mut video: VideoPipeline,
    seg_ms: u64,
) -> Result<()> {
    let mut waiting_for_keyframe = true;
    let mut pending_cut = false;
    let mut seg_start = Instant::now();

    let pkt = AvPacket::new()?;
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        if !input.read(pkt.0) {
            break;
        }
        shared.touch();

        if !waiting_for_keyframe
            && !pending_cut
            && seg_start.elapsed().as_millis() as u64 >= seg_ms
        {
            pending_cut = true;
        }

        let stream_index = (*pkt.0).stream_index;
        if stream_index == input.video_idx {
            let in_tb = input.stream_time_base(stream_index);
            let filtered = video.process_packet(pkt.0)?;
            for out in filtered {
                let key = is_keyframe(out.0);
                if waiting_for_keyframe {
                    if key && open_segment(shared, &video, &audio).is_ok() {
                        seg_start = Instant::now();
                        waiting_for_keyframe = false;
                    }
                } else if pending_cut && key {
                    match open_segment(shared, &video, &audio) {
                        Ok(()) => {
                            seg_start = Instant::now();
                            pending_cut = false;
                        }
                        Err(e) => {
                            // slot abandoned; retry on the next keyframe
                            warn!("segment rotation failed for {}: {}", shared.url, e);
                        }
                    }
                }
                if !waiting_for_keyframe {
                    write_video(shared, out, in_tb);
                }
            }
        } else if stream_index == input.audio_idx && !waiting_for_keyframe {
            match audio.process_packet(pkt.0) {
                Ok(packets) => write_audio(shared, packets),
                Err(e) => warn!("audio pipeline error for {}: {}", shared.url, e),
            }
        }
        av_packet_unref(pkt.0);
    }

    // drain whatever is buffered in the codec chain
    if !waiting_for_keyframe {
        match audio.flush() {
            Ok(packets) => write_audio(shared, packets),
            Err(e) => warn!("audio flush error for {}: {}", shared.url, e),
        }
    }

    let mut state = shared.state.lock().unwrap();
    if let Some(mut sink) = state.sink.take() {
        if let Err(e) = sink.close() {
            warn!("closing final segment of {}: {}", shared.url, e);
        }
        state.ring.finalize_active();
    }
    Ok(())
}

/// Finalize the active segment (if any) and open the next one. On muxer
/// failure the fresh slot is abandoned and the error bubbles up so the
/// caller can retry at the next keyframe.
unsafe fn open_segment(
    shared: &Arc<StreamShared>,
    video: &VideoPipeline,
    audio: &AudioPipeline,
) -> Result<()> {
    let mut state = shared.state.lock().unwrap();
    if let Some(mut sink) = state.sink.take() {
        if let Err(e) = sink.close() {
            warn!("segment close failed for {}: {}", shared.url, e);
            state.ring.abandon_active();
        } else {
            state.ring.finalize_active();
        }
    }

    let (number, buf) = {
        let seg = state.ring.open_next();
        (seg.number, &mut *seg.buf as *mut SegmentBuffer)
    };
    match MuxerSink::open(buf, video.output_params(), audio.encoder_context()) {
        Ok(sink) => {
            state.sink = Some(sink);
            state.video_base = None;
            state.audio_base = None;
            debug!("segment {} of {} started", number, shared.url);
            Ok(())
        }
        Err(e) => {
            state.ring.abandon_active();
            Err(e)
        }
    }
}

/// Rescale to the 90 kHz output clock, shift onto the per-segment base and
/// write. A rejected packet is logged and skipped.
unsafe fn write_video(shared: &Arc<StreamShared>, pkt: AvPacket, in_tb: AVRational) {
    let mut state = shared.state.lock().unwrap();
    if state.sink.is_none() {
        return;
    }

    av_packet_rescale_ts(pkt.0, in_tb, VIDEO_TIME_BASE);
    let first_ts = if (*pkt.0).dts != AV_NOPTS_VALUE {
        (*pkt.0).dts
    } else {
        (*pkt.0).pts
    };
    if state.video_base.is_none() && first_ts != AV_NOPTS_VALUE {
        state.video_base = Some(first_ts);
    }
    if let Some(base) = state.video_base {
        if (*pkt.0).pts != AV_NOPTS_VALUE {
            (*pkt.0).pts -= base;
        }
        if (*pkt.0).dts != AV_NOPTS_VALUE {
            (*pkt.0).dts -= base;
        }
    }
    (*pkt.0).stream_index = 0;

    if let Some(sink) = state.sink.as_mut() {
        if let Err(e) = sink.write(pkt.0) {
            warn!("write video packet: {}", e);
        }
    }
}

/// Audio packets arrive already in 1/sample_rate time with a monotonic
/// PTS; only the per-segment base shift is applied here.
unsafe fn write_audio(shared: &Arc<StreamShared>, packets: Vec<AvPacket>) {
    if packets.is_empty() {
        return;
    }
    let mut state = shared.state.lock().unwrap();
    if state.sink.is_none() {
        return;
    }
    for pkt in packets {
        if state.audio_base.is_none() && (*pkt.0).pts != AV_NOPTS_VALUE {
            state.audio_base = Some((*pkt.0).pts);
        }
        if let Some(base) = state.audio_base {
            if (*pkt.0).pts != AV_NOPTS_VALUE {
                (*pkt.0).pts -= base;
            }
            if (*pkt.0).dts != AV_NOPTS_VALUE {
                (*pkt.0).dts -= base;
            }
        }
        (*pkt.0).stream_index = 1;
        if let Some(sink) = state.sink.as_mut() {
            if let Err(e) = sink.write(pkt.0) {
                warn!("write audio packet: {}", e);
            }
        }
    }
}
