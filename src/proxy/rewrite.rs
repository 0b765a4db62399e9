use url::Url;

/// Resolve a playlist reference against the playlist's own URL. Handles
/// absolute http(s) URLs, scheme-relative, root-relative and
/// directory-relative forms.
pub fn resolve_url(base: &Url, reference: &str) -> Option<String> {
    if reference.is_empty() {
        return None;
    }
    base.join(reference).ok().map(|u| u.to_string())
}

fn proxied_segment(base: &Url, reference: &str) -> Option<String> {
    let abs = resolve_url(base, reference)?;
    Some(format!("/seg?u={}", urlencoding::encode(&abs)))
}

fn proxied_playlist(base: &Url, reference: &str) -> Option<String> {
    let abs = resolve_url(base, reference)?;
    Some(format!("/m3u8?q={}", urlencoding::encode(&abs)))
}

fn already_proxied(line: &str) -> bool {
    line.starts_with("/m3u8?q=") || line.starts_with("/seg?u=")
}

/// Rewrite every URI in a playlist so it points back through the proxy.
///
/// Tag lines keep everything around their `URI="..."` attribute; plain URI
/// lines become `/m3u8?q=` when they reference another playlist (`.m3u8`
/// or directly after `#EXT-X-STREAM-INF`) and `/seg?u=` otherwise.
/// Already-proxied lines pass through untouched, so rewriting is
/// idempotent.
pub fn rewrite_playlist(base: &Url, src: &str) -> String {
    let mut out = String::with_capacity(src.len() * 2);
    let mut pending_variant = false;

    for raw in src.lines() {
        let line = raw.trim_end_matches('\r');

        if let Some(rest) = line.strip_prefix('#') {
            if let Some((prefix, uri, suffix)) = split_uri_attribute(line) {
                if already_proxied(uri) {
                    out.push_str(line);
                } else if let Some(proxied) = proxied_segment(base, uri) {
                    out.push_str(prefix);
                    out.push_str(&proxied);
                    out.push('"');
                    out.push_str(suffix);
                } else {
                    out.push_str(line);
                }
            } else {
                if rest.starts_with("EXT-X-STREAM-INF") {
                    pending_variant = true;
                }
                out.push_str(line);
            }
            out.push('\n');
            continue;
        }

        if line.is_empty() {
            out.push('\n');
            continue;
        }

        if already_proxied(line) {
            pending_variant = false;
            out.push_str(line);
            out.push('\n');
            continue;
        }

        let rewritten = if pending_variant || line.contains(".m3u8") {
            pending_variant = false;
            proxied_playlist(base, line)
        } else {
            proxied_segment(base, line)
        };
        match rewritten {
            Some(r) => out.push_str(&r),
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

/// Split a tag line around its URI attribute: returns the part up to and
/// including `URI="`, the URI itself, and everything after the closing
/// quote.
fn split_uri_attribute(line: &str) -> Option<(&str, &str, &str)> {
    let start = line.find("URI=\"")?;
    let uri_start = start + 5;
    let uri_len = line[uri_start..].find('"')?;
    Some((
        &line[..uri_start],
        &line[uri_start..uri_start + uri_len],
        &line[uri_start + uri_len + 1..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://h/p.m3u8").unwrap()
    }

    #[test]
    fn rewrites_key_uri_and_segment_lines() {
        let src = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://h/k\"\nhttps://h/s1.ts\n";
        let out = rewrite_playlist(&base(), src);
        assert_eq!(
            out,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-KEY:METHOD=AES-128,URI=\"/seg?u=https%3A%2F%2Fh%2Fk\"\n/seg?u=https%3A%2F%2Fh%2Fs1.ts\n"
        );
    }

    #[test]
    fn keeps_attributes_after_uri() {
        let src = "#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n";
        let out = rewrite_playlist(&base(), src);
        assert_eq!(
            out,
            "#EXT-X-MAP:URI=\"/seg?u=https%3A%2F%2Fh%2Finit.mp4\",BYTERANGE=\"720@0\"\n"
        );
    }

    #[test]
    fn variant_playlists_go_through_m3u8_route() {
        let src = "#EXT-X-STREAM-INF:BANDWIDTH=800000\nchunklist\n";
        let out = rewrite_playlist(&base(), src);
        assert!(out.contains("/m3u8?q=https%3A%2F%2Fh%2Fchunklist\n"));

        let src = "low/index.m3u8\n";
        let out = rewrite_playlist(&base(), src);
        assert!(out.contains("/m3u8?q=https%3A%2F%2Fh%2Flow%2Findex.m3u8\n"));
    }

    #[test]
    fn resolves_relative_forms() {
        let base = Url::parse("https://h:8443/live/ch1/p.m3u8").unwrap();
        assert_eq!(
            resolve_url(&base, "https://other/x.ts").unwrap(),
            "https://other/x.ts"
        );
        assert_eq!(
            resolve_url(&base, "//cdn.example/x.ts").unwrap(),
            "https://cdn.example/x.ts"
        );
        assert_eq!(
            resolve_url(&base, "/root/x.ts").unwrap(),
            "https://h:8443/root/x.ts"
        );
        assert_eq!(
            resolve_url(&base, "./x.ts").unwrap(),
            "https://h:8443/live/ch1/x.ts"
        );
        assert_eq!(
            resolve_url(&base, "x.ts").unwrap(),
            "https://h:8443/live/ch1/x.ts"
        );
    }

    #[test]
    fn rewriting_is_idempotent() {
        let src = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://h/k\"\nhttps://h/s1.ts\nlow/index.m3u8\n";
        let once = rewrite_playlist(&base(), src);
        let twice = rewrite_playlist(&base(), &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unrelated_tags_pass_through() {
        let src = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.000,\nseg0.ts\n";
        let out = rewrite_playlist(&base(), src);
        assert!(out.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(out.contains("#EXTINF:2.000,\n"));
        assert!(out.contains("/seg?u=https%3A%2F%2Fh%2Fseg0.ts\n"));
    }
}
