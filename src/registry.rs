use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::error::CreateError;
use crate::ffutil::now_ms;
use crate::pipeline::{StreamShared, Transcoder};
use crate::settings::Settings;

/// DJB2, truncated to 32 bits. Segment requests carry this as the opaque
/// stream handle, so it must stay stable across restarts.
pub fn hash_url(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

struct StreamEntry {
    hash: u32,
    url: String,
    transcoder: Transcoder,
}

/// Process-wide map of live pipelines, keyed by input URL.
///
/// Bounded at `max_streams`; a full map evicts the least recently accessed
/// entry. A background task calls [`StreamRegistry::reap_expired`] to drop
/// idle pipelines. Worker joins always happen after the registry lock is
/// released so a slow teardown can not stall unrelated requests.
pub struct StreamRegistry {
    entries: Mutex<Vec<StreamEntry>>,
    settings: Settings,
}

impl StreamRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Return the pipeline for `url`, starting one if needed. Creation runs
    /// under the registry lock (callers use a blocking thread); the evicted
    /// LRU entry, if any, is joined after the lock is dropped.
    pub fn get_or_create(&self, url: &str) -> Result<Arc<StreamShared>, CreateError> {
        let hash = hash_url(url);
        let mut evicted: Option<Transcoder> = None;

        let result = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.iter().find(|e| e.hash == hash && e.url == url) {
                entry.transcoder.shared.touch();
                Ok(entry.transcoder.shared.clone())
            } else {
                if entries.len() >= self.settings.max_streams {
                    match entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.transcoder.shared.last_access_ms())
                        .map(|(i, _)| i)
                    {
                        Some(idx) => {
                            let old = entries.swap_remove(idx);
                            info!("evicting LRU stream {}", old.url);
                            old.transcoder.shared.request_stop();
                            evicted = Some(old.transcoder);
                        }
                        None => return Err(CreateError::CapacityExhausted),
                    }
                }
                match Transcoder::start(url, &self.settings) {
                    Ok(transcoder) => {
                        let shared = transcoder.shared.clone();
                        entries.push(StreamEntry {
                            hash,
                            url: url.to_string(),
                            transcoder,
                        });
                        info!("started stream {:x} for {}", hash, url);
                        Ok(shared)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        if let Some(t) = evicted {
            t.shutdown();
        }
        result
    }

    /// Resolve a stream by its url hash. First match wins on the (very
    /// unlikely) collision; the full URL is only known on the playlist path.
    pub fn find_by_hash(&self, hash: u32) -> Option<Arc<StreamShared>> {
        let entries = self.entries.lock().unwrap();
        entries.iter().find(|e| e.hash == hash).map(|e| {
            e.transcoder.shared.touch();
            e.transcoder.shared.clone()
        })
    }

    /// Drop every pipeline idle for longer than the stream timeout.
    pub fn reap_expired(&self) {
        let timeout_ms = self.settings.stream_timeout_sec * 1000;
        let now = now_ms();
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let mut i = 0;
            while i < entries.len() {
                if now.saturating_sub(entries[i].transcoder.shared.last_access_ms()) > timeout_ms {
                    let entry = entries.swap_remove(i);
                    entry.transcoder.shared.request_stop();
                    expired.push(entry);
                } else {
                    i += 1;
                }
            }
        }
        for entry in expired {
            warn!("stream {} timed out, stopping", entry.url);
            entry.transcoder.shutdown();
        }
    }

    #[cfg(test)]
    fn insert_dummy(&self, url: &str, last_access_ms: u64) {
        use std::sync::atomic::Ordering;
        let t = Transcoder::dummy(url, &self.settings);
        t.shared
            .last_access
            .store(last_access_ms, Ordering::Relaxed);
        self.entries.lock().unwrap().push(StreamEntry {
            hash: hash_url(url),
            url: url.to_string(),
            transcoder: t,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        let mut s = Settings::default();
        s.max_streams = 2;
        s.segment_count = 4;
        s.segment_prealloc = 1024;
        s
    }

    #[test]
    fn djb2_matches_reference_values() {
        // h = 5381, then h * 33 + byte
        assert_eq!(hash_url(""), 5381);
        assert_eq!(hash_url("a"), 5381u32.wrapping_mul(33) + 97);
        let manual = "ab"
            .bytes()
            .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32));
        assert_eq!(hash_url("ab"), manual);
    }

    #[test]
    fn find_by_hash_returns_first_match_and_touches() {
        let reg = StreamRegistry::new(test_settings());
        let sentinel = u64::MAX;
        reg.insert_dummy("http://a/1", sentinel);
        let h = hash_url("http://a/1");
        let found = reg.find_by_hash(h).expect("present");
        assert_eq!(found.url, "http://a/1");
        assert_ne!(found.last_access_ms(), sentinel);
        assert!(reg.find_by_hash(h ^ 1).is_none());
    }

    #[test]
    fn reap_removes_only_expired_entries() {
        let mut settings = test_settings();
        settings.stream_timeout_sec = 0;
        let reg = StreamRegistry::new(settings);
        now_ms(); // pin the clock epoch before sleeping
        std::thread::sleep(std::time::Duration::from_millis(5));
        reg.insert_dummy("http://a/old", 0);
        reg.insert_dummy("http://a/fresh", now_ms() + 1000);
        reg.reap_expired();
        assert_eq!(reg.active_count(), 1);
        assert!(reg.find_by_hash(hash_url("http://a/fresh")).is_some());
        assert!(reg.find_by_hash(hash_url("http://a/old")).is_none());
    }

    #[test]
    fn get_or_create_is_idempotent_for_known_urls() {
        let reg = StreamRegistry::new(test_settings());
        reg.insert_dummy("http://a/1", 1);
        let a = reg.get_or_create("http://a/1").unwrap();
        let b = reg.get_or_create("http://a/1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn lru_candidate_is_oldest_access() {
        let reg = StreamRegistry::new(test_settings());
        reg.insert_dummy("http://a/1", 100);
        reg.insert_dummy("http://a/2", 50);
        // at capacity now; the registry would evict /2 first
        let entries = reg.entries.lock().unwrap();
        let lru = entries
            .iter()
            .min_by_key(|e| e.transcoder.shared.last_access_ms())
            .unwrap();
        assert_eq!(lru.url, "http://a/2");
    }
}
