use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_listen_proxy() -> String {
    "0.0.0.0:5002".to_string()
}

fn default_seg_ms() -> u64 {
    1000
}

fn default_aac_br() -> i64 {
    96_000
}

fn default_aac_sr() -> i32 {
    48_000
}

fn default_aac_ch() -> i32 {
    2
}

fn default_max_streams() -> usize {
    256
}

fn default_segment_count() -> usize {
    24
}

fn default_segment_prealloc() -> usize {
    2 * 1024 * 1024
}

fn default_stream_timeout_sec() -> u64 {
    300
}

fn default_fetch_timeout_ms() -> u64 {
    8000
}

fn default_workers() -> u32 {
    1
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115 Safari/537.36".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Gateway listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// CORS proxy listen address
    #[serde(default = "default_listen_proxy")]
    pub listen_proxy: String,

    /// Target segment duration in milliseconds
    #[serde(default = "default_seg_ms")]
    pub seg_ms: u64,

    /// AAC encoder bitrate (bps)
    #[serde(default = "default_aac_br")]
    pub aac_br: i64,

    /// AAC encoder sample rate, 44100 or 48000
    #[serde(default = "default_aac_sr")]
    pub aac_sr: i32,

    /// AAC channel count, 1 or 2
    #[serde(default = "default_aac_ch")]
    pub aac_ch: i32,

    /// Maximum number of concurrent transcoder pipelines
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Number of in-memory segments kept per stream
    #[serde(default = "default_segment_count")]
    pub segment_count: usize,

    /// Initial capacity of a segment buffer
    #[serde(default = "default_segment_prealloc")]
    pub segment_prealloc: usize,

    /// Idle timeout after which a pipeline is reaped (seconds)
    #[serde(default = "default_stream_timeout_sec")]
    pub stream_timeout_sec: u64,

    /// Upstream fetch timeout for the CORS proxy (milliseconds)
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Worker process count; forking is delegated to the supervisor,
    /// the value is only logged for parity with the C deployment
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// TLS flag; termination is delegated to the fronting proxy
    #[serde(default)]
    pub use_tls: bool,

    /// User-Agent sent on upstream opens
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            listen_proxy: default_listen_proxy(),
            seg_ms: default_seg_ms(),
            aac_br: default_aac_br(),
            aac_sr: default_aac_sr(),
            aac_ch: default_aac_ch(),
            max_streams: default_max_streams(),
            segment_count: default_segment_count(),
            segment_prealloc: default_segment_prealloc(),
            stream_timeout_sec: default_stream_timeout_sec(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            workers: default_workers(),
            use_tls: false,
            user_agent: default_user_agent(),
        }
    }
}

impl Settings {
    /// Clamp every knob into its supported range, falling back to the
    /// default for values that make no sense (matches the env handling of
    /// the C gateway, with the wider segment bound).
    pub fn clamped(mut self) -> Self {
        self.seg_ms = self.seg_ms.clamp(200, 10_000);
        self.aac_br = self.aac_br.clamp(32_000, 320_000);
        if self.aac_sr != 44_100 && self.aac_sr != 48_000 {
            self.aac_sr = default_aac_sr();
        }
        if self.aac_ch != 1 && self.aac_ch != 2 {
            self.aac_ch = default_aac_ch();
        }
        self.max_streams = self.max_streams.max(1);
        self.segment_count = self.segment_count.max(4);
        self.segment_prealloc = self.segment_prealloc.max(64 * 1024);
        self.stream_timeout_sec = self.stream_timeout_sec.max(1);
        self.workers = self.workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_segment_duration() {
        let mut s = Settings::default();
        s.seg_ms = 50;
        assert_eq!(s.clamped().seg_ms, 200);

        let mut s = Settings::default();
        s.seg_ms = 60_000;
        assert_eq!(s.clamped().seg_ms, 10_000);
    }

    #[test]
    fn rejects_unsupported_audio_params() {
        let mut s = Settings::default();
        s.aac_sr = 22_050;
        s.aac_ch = 6;
        s.aac_br = 10_000;
        let s = s.clamped();
        assert_eq!(s.aac_sr, 48_000);
        assert_eq!(s.aac_ch, 2);
        assert_eq!(s.aac_br, 32_000);
    }

    #[test]
    fn keeps_valid_values() {
        let mut s = Settings::default();
        s.seg_ms = 2000;
        s.aac_sr = 44_100;
        s.aac_ch = 1;
        let s = s.clamped();
        assert_eq!(s.seg_ms, 2000);
        assert_eq!(s.aac_sr, 44_100);
        assert_eq!(s.aac_ch, 1);
    }

    #[test]
    fn ring_floor_is_enforced() {
        let mut s = Settings::default();
        s.segment_count = 1;
        assert_eq!(s.clamped().segment_count, 4);
    }
}
