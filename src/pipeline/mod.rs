use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::warn;

use crate::demux::InputSession;
use crate::error::CreateError;
use crate::ffutil::now_ms;
use crate::mux::MuxerSink;
use crate::pipeline::audio::{AudioConfig, AudioPipeline};
use crate::pipeline::video::VideoPipeline;
use crate::registry::hash_url;
use crate::segment::SegmentRing;
use crate::settings::Settings;

pub mod audio;
pub mod runner;
pub mod video;

/// Everything behind the per-transcoder mutex: the ring, the muxer bound to
/// the active slot, and the per-segment timestamp bases.
///
/// The worker holds the lock across every muxer call; HTTP handlers take it
/// briefly to snapshot the window or copy a ready segment out.
pub struct RingState {
    pub ring: SegmentRing,
    pub sink: Option<MuxerSink>,
    pub video_base: Option<i64>,
    pub audio_base: Option<i64>,
}

/// Shared view of a running transcoder.
pub struct StreamShared {
    pub url: String,
    pub hash: u32,
    pub state: Mutex<RingState>,
    pub stop: Arc<AtomicBool>,
    pub(crate) last_access: AtomicU64,
}

impl StreamShared {
    pub fn touch(&self) {
        self.last_access.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// One per-input-URL pipeline: upstream session, codecs and ring, plus the
/// worker thread driving them. Owned exclusively by the registry.
pub struct Transcoder {
    pub shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
}

impl Transcoder {
    /// Open the upstream, bring the codec chain up and spawn the worker.
    /// Any failure here is eager so clients never subscribe to a broken
    /// pipeline.
    pub fn start(url: &str, settings: &Settings) -> Result<Self, CreateError> {
        let stop = Arc::new(AtomicBool::new(false));
        let input = InputSession::open(url, &settings.user_agent, stop.clone())?;

        let audio_cfg = AudioConfig {
            bitrate: settings.aac_br,
            sample_rate: settings.aac_sr,
            channels: settings.aac_ch,
        };
        let (audio, video) = unsafe {
            let audio_par = (*input.stream(input.audio_idx)).codecpar;
            let audio = AudioPipeline::open(audio_par, &audio_cfg)
                .map_err(|e| CreateError::CodecInit(e.to_string()))?;
            let video = VideoPipeline::new(input.stream(input.video_idx));
            (audio, video)
        };

        let shared = Arc::new(StreamShared {
            url: url.to_string(),
            hash: hash_url(url),
            state: Mutex::new(RingState {
                ring: SegmentRing::new(settings.segment_count, settings.segment_prealloc),
                sink: None,
                video_base: None,
                audio_base: None,
            }),
            stop,
            last_access: AtomicU64::new(now_ms()),
        });
        shared.touch();

        let worker_shared = shared.clone();
        let seg_ms = settings.seg_ms;
        let worker = std::thread::Builder::new()
            .name(format!("transcode-{:x}", shared.hash))
            .spawn(move || runner::run(worker_shared, input, audio, video, seg_ms))
            .map_err(|e| CreateError::CodecInit(format!("worker spawn: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Stop the worker and wait for it to drain. The input session's
    /// interrupt callback bounds how long a blocked read can hold this up.
    pub fn shutdown(mut self) {
        self.shared.request_stop();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("worker for {} panicked", self.shared.url);
            }
        }
    }

    #[cfg(test)]
    pub fn dummy(url: &str, settings: &Settings) -> Self {
        let shared = Arc::new(StreamShared {
            url: url.to_string(),
            hash: hash_url(url),
            state: Mutex::new(RingState {
                ring: SegmentRing::new(settings.segment_count, settings.segment_prealloc),
                sink: None,
                video_base: None,
                audio_base: None,
            }),
            stop: Arc::new(AtomicBool::new(false)),
            last_access: AtomicU64::new(now_ms()),
        });
        Self {
            shared,
            worker: None,
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        // normal teardown goes through shutdown(); this only covers being
        // dropped early on an error path
        self.shared.request_stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
