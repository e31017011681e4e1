use std::cmp::Reverse;

use bytes::Bytes;
use m3u8_rs::{
    Key, KeyMethod, MasterPlaylist, MediaPlaylist, MediaSegment, Playlist, VariantStream,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    http::Fetch,
};

/// Key and IV a segment was encrypted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encryption {
    pub key_uri: Url,
    /// Hex IV as written in the playlist, if any
    pub iv: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position in the output
    pub index: usize,
    /// Position among the media segments, used to synthesize an IV
    pub sequence: u64,
    pub uri: Url,
    pub encryption: Option<Encryption>,
    /// Whether this is the initialization section (`EXT-X-MAP`)
    pub init: bool,
}

/// Every segment of the selected rendition in output order.
///
/// If the stream has an initialization section it occupies index 0 and the
/// media segments follow from index 1.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    segments: Vec<Segment>,
}

impl Manifest {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_init(&self) -> bool {
        self.segments.first().is_some_and(|s| s.init)
    }

    /// The first actual media segment, skipping the initialization section.
    pub fn first_media(&self) -> Option<&Segment> {
        self.segments.iter().find(|s| !s.init)
    }
}

/// Where the top-level playlist comes from.
#[derive(Debug, Clone)]
pub enum PlaylistSource {
    Remote(Url),
    /// Playlist read from disk. Relative URIs inside it need `base`.
    Local { contents: Bytes, base: Option<Url> },
}

impl PlaylistSource {
    /// Treats `input` as a URL when it is an http(s) one and as a file path
    /// otherwise.
    ///
    /// # Errors
    /// Errors when the local file cannot be read
    pub async fn from_input(input: &str, base: Option<Url>) -> Result<Self> {
        if let Ok(url) = Url::parse(input)
            && matches!(url.scheme(), "http" | "https")
        {
            return Ok(Self::Remote(url));
        }

        let contents = tokio::fs::read(input).await?;
        Ok(Self::Local {
            contents: Bytes::from(contents),
            base,
        })
    }
}

/// Turns a playlist into the manifest to download.
///
/// A master playlist is narrowed down to one variant (see [`select_variant`])
/// and that variant's media playlist is fetched. Only one such hop is made.
///
/// # Errors
/// Errors on fetch or decode failures, when the requested resolution is not
/// offered, or when a relative URI cannot be resolved
#[instrument(skip(fetcher, source))]
pub async fn resolve(
    fetcher: &dyn Fetch,
    source: PlaylistSource,
    resolution: Option<&str>,
) -> Result<Manifest> {
    let (contents, base) = match source {
        PlaylistSource::Remote(url) => (fetcher.fetch(url.as_str()).await?, Some(url)),
        PlaylistSource::Local { contents, base } => (contents, base),
    };

    match decode(&contents)? {
        Playlist::MediaPlaylist(media) => build_manifest(&media, base.as_ref()),
        Playlist::MasterPlaylist(master) => {
            let variant = select_variant(&master, resolution)?;
            let variant_url = resolve_uri(base.as_ref(), &variant.uri)?;
            info!(
                "Selected variant {} @ {} bps: {variant_url}",
                variant
                    .resolution
                    .map_or_else(|| "unknown resolution".to_string(), |r| r.to_string()),
                variant.bandwidth
            );

            let contents = fetcher.fetch(variant_url.as_str()).await?;
            match decode(&contents)? {
                Playlist::MediaPlaylist(media) => build_manifest(&media, Some(&variant_url)),
                Playlist::MasterPlaylist(_) => Err(Error::playlist(format!(
                    "variant {variant_url} is a master playlist itself"
                ))),
            }
        }
    }
}

fn decode(contents: &[u8]) -> Result<Playlist> {
    m3u8_rs::parse_playlist_res(contents)
        .map_err(|_| Error::playlist("contents are not a valid m3u8 playlist"))
}

/// Picks a variant from a master playlist.
///
/// I-frame variants are ignored. The rest are ranked by resolution area, then
/// bandwidth, both descending. A requested `WIDTHxHEIGHT` must be offered;
/// otherwise the best ranked variant wins.
///
/// # Errors
/// [`Error::VariantNotFound`] when `resolution` is not offered, or a playlist
/// error when there is nothing to choose from
pub fn select_variant<'a>(
    master: &'a MasterPlaylist,
    resolution: Option<&str>,
) -> Result<&'a VariantStream> {
    let mut variants: Vec<&VariantStream> =
        master.variants.iter().filter(|v| !v.is_i_frame).collect();
    variants.sort_by_key(|v| Reverse((area(v), v.bandwidth)));

    debug!(
        "Available variants: {}",
        variants
            .iter()
            .map(|v| format!("{} ({} bps)", label(v), v.bandwidth))
            .collect::<Vec<_>>()
            .join(", ")
    );

    if let Some(wanted) = resolution.map(str::trim) {
        return variants
            .iter()
            .copied()
            .find(|v| {
                v.resolution
                    .is_some_and(|r| r.to_string().eq_ignore_ascii_case(wanted))
            })
            .ok_or_else(|| Error::VariantNotFound {
                wanted: wanted.to_string(),
                available: variants
                    .iter()
                    .map(|v| label(v))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
    }

    variants
        .first()
        .copied()
        .ok_or_else(|| Error::playlist("master playlist offers no playable variant"))
}

fn area(variant: &VariantStream) -> u64 {
    variant
        .resolution
        .map_or(0, |r| r.width.saturating_mul(r.height))
}

fn label(variant: &VariantStream) -> String {
    variant
        .resolution
        .map_or_else(|| "unknown".to_string(), |r| r.to_string())
}

/// Resolves every URI of a media playlist and numbers its segments.
///
/// An `EXT-X-KEY` stays in effect for all following segments until another
/// one replaces it, so a key declared once at the top covers the whole
/// playlist. `METHOD=NONE` switches encryption off again.
///
/// # Errors
/// Errors on unresolvable URIs, unsupported encryption methods, byte-range
/// segments and empty playlists
pub fn build_manifest(media: &MediaPlaylist, base: Option<&Url>) -> Result<Manifest> {
    if media.segments.is_empty() {
        return Err(Error::playlist("media playlist contains no segments"));
    }
    if !media.end_list {
        warn!("Playlist has no EXT-X-ENDLIST, only the segments listed right now will be downloaded");
    }

    let init_uri = media
        .segments
        .iter()
        .find_map(|s| s.map.as_ref().map(|m| m.uri.clone()))
        .or_else(|| playlist_level_map_uri(media));
    let offset = usize::from(init_uri.is_some());

    let mut segments = Vec::with_capacity(media.segments.len() + offset);
    let mut encryption: Option<Encryption> = None;

    for (position, segment) in media.segments.iter().enumerate() {
        if segment.byte_range.is_some() {
            return Err(Error::playlist(format!(
                "byte-range segment {} is not supported",
                segment.uri
            )));
        }
        if let Some(key) = &segment.key {
            encryption = segment_encryption(key, base)?;
        } else if let Some(rest) = unparsed_key(segment) {
            encryption = match attribute(rest, "METHOD") {
                Some("NONE") => None,
                _ => {
                    return Err(Error::playlist(format!(
                        "cannot parse EXT-X-KEY `{rest}` before {}",
                        segment.uri
                    )));
                }
            };
        }

        segments.push(Segment {
            index: position + offset,
            sequence: position as u64,
            uri: resolve_uri(base, &segment.uri)?,
            encryption: encryption.clone(),
            init: false,
        });
    }

    if let Some(uri) = init_uri {
        // The initialization section is protected by whatever key covers the first segment.
        let init = Segment {
            index: 0,
            sequence: 0,
            uri: resolve_uri(base, &uri)?,
            encryption: segments[0].encryption.clone(),
            init: true,
        };
        segments.insert(0, init);
    }

    Ok(Manifest { segments })
}

fn segment_encryption(key: &Key, base: Option<&Url>) -> Result<Option<Encryption>> {
    match &key.method {
        KeyMethod::None => Ok(None),
        KeyMethod::AES128 => {
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| Error::playlist("AES-128 key has no URI"))?;
            Ok(Some(Encryption {
                key_uri: resolve_uri(base, uri)?,
                iv: key.iv.clone(),
            }))
        }
        other => Err(Error::playlist(format!(
            "unsupported encryption method {other:?}"
        ))),
    }
}

/// m3u8-rs leaves an `EXT-X-MAP` that precedes the first segment among the
/// playlist's unknown tags.
fn playlist_level_map_uri(media: &MediaPlaylist) -> Option<String> {
    let rest = media
        .unknown_tags
        .iter()
        .find(|t| t.tag == "X-MAP")?
        .rest
        .as_deref()?;
    attribute(rest, "URI").map(str::to_string)
}

/// An `EXT-X-KEY` m3u8-rs could not turn into a [`Key`], such as
/// `METHOD=NONE` which has no URI. The last one before the segment wins.
fn unparsed_key(segment: &MediaSegment) -> Option<&str> {
    segment
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-KEY")
        .map(|t| t.rest.as_deref().unwrap_or_default())
}

/// Value of `name` in a tag's attribute list, without surrounding quotes.
fn attribute<'a>(list: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = list.trim();
    while !rest.is_empty() {
        let (key, value) = rest.split_once('=')?;
        let (value, next) = if let Some(quoted) = value.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], quoted[end + 1..].trim_start_matches(','))
        } else {
            value.split_once(',').unwrap_or((value, ""))
        };

        if key.trim() == name {
            return Some(value.trim());
        }
        rest = next.trim_start();
    }
    None
}

/// Resolves `uri` against `base` unless it is already absolute.
///
/// # Errors
/// [`Error::BaseUrlRequired`] when `uri` is relative and there is no base
pub fn resolve_uri(base: Option<&Url>, uri: &str) -> Result<Url> {
    match Url::parse(uri) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or_else(|| Error::BaseUrlRequired {
                uri: uri.to_string(),
            })?;
            base.join(uri).map_err(|e| Error::invalid_url(uri, e))
        }
        Err(e) => Err(Error::invalid_url(uri, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::StaticFetcher;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720
720p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080
1080p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360p/index.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=9000000,RESOLUTION=3840x2160,URI=\"iframes.m3u8\"
";

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXTINF:10.0,
seg0.ts
#EXTINF:10.0,
seg1.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k2\",IV=0x000102030405060708090a0b0c0d0e0f
#EXTINF:10.0,
https://other.example.com/seg2.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:10.0,
seg3.ts
#EXT-X-ENDLIST
";

    const FMP4: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4.0,
seg0.m4s
#EXTINF:4.0,
seg1.m4s
#EXT-X-ENDLIST
";

    fn master() -> MasterPlaylist {
        match m3u8_rs::parse_playlist_res(MASTER.as_bytes()).unwrap() {
            Playlist::MasterPlaylist(pl) => pl,
            Playlist::MediaPlaylist(_) => panic!("expected master playlist"),
        }
    }

    fn media(input: &str) -> MediaPlaylist {
        match m3u8_rs::parse_playlist_res(input.as_bytes()).unwrap() {
            Playlist::MediaPlaylist(pl) => pl,
            Playlist::MasterPlaylist(_) => panic!("expected media playlist"),
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn picks_largest_resolution_by_default() {
        let master = master();
        let variant = select_variant(&master, None).unwrap();
        assert_eq!(variant.uri, "1080p/index.m3u8");
    }

    #[test]
    fn honors_requested_resolution_with_lower_bandwidth() {
        let master = master();
        let variant = select_variant(&master, Some("1280x720")).unwrap();
        assert_eq!(variant.uri, "720p/index.m3u8");
    }

    #[test]
    fn missing_resolution_is_an_error() {
        let master = master();
        let err = select_variant(&master, Some("3840x2160")).unwrap_err();
        match err {
            Error::VariantNotFound { wanted, available } => {
                assert_eq!(wanted, "3840x2160");
                assert_eq!(available, "1920x1080, 1280x720, 640x360");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bandwidth_breaks_resolution_ties() {
        let input = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=1280x720
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720
high.m3u8
";
        let Playlist::MasterPlaylist(master) = m3u8_rs::parse_playlist_res(input.as_bytes()).unwrap()
        else {
            panic!("expected master playlist");
        };
        assert_eq!(select_variant(&master, None).unwrap().uri, "high.m3u8");
        assert_eq!(
            select_variant(&master, Some("1280x720")).unwrap().uri,
            "high.m3u8"
        );
    }

    #[test]
    fn keys_carry_over_until_replaced() {
        let base = url("https://cdn.example.com/live/1080p/index.m3u8");
        let manifest = build_manifest(&media(MEDIA), Some(&base)).unwrap();
        let segments = manifest.segments();

        assert_eq!(segments.len(), 4);
        assert!(!manifest.has_init());
        assert_eq!(
            segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            [0, 1, 2, 3]
        );
        assert_eq!(
            segments[0].uri.as_str(),
            "https://cdn.example.com/live/1080p/seg0.ts"
        );
        assert_eq!(
            segments[2].uri.as_str(),
            "https://other.example.com/seg2.ts"
        );

        let first_key = Encryption {
            key_uri: url("https://cdn.example.com/live/1080p/key.bin"),
            iv: None,
        };
        assert_eq!(segments[0].encryption.as_ref(), Some(&first_key));
        assert_eq!(segments[1].encryption.as_ref(), Some(&first_key));

        let second = segments[2].encryption.as_ref().unwrap();
        assert_eq!(second.key_uri.as_str(), "https://keys.example.com/k2");
        assert_eq!(
            second.iv.as_deref(),
            Some("0x000102030405060708090a0b0c0d0e0f")
        );
        assert_eq!(segments[3].encryption, None);
    }

    #[test]
    fn method_none_clears_until_next_key() {
        let input = "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/a\"
#EXTINF:10.0,
https://cdn.example.com/a.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:10.0,
https://cdn.example.com/b.ts
#EXTINF:10.0,
https://cdn.example.com/c.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/d\"
#EXTINF:10.0,
https://cdn.example.com/d.ts
#EXT-X-ENDLIST
";
        let manifest = build_manifest(&media(input), None).unwrap();
        let keys: Vec<Option<&str>> = manifest
            .segments()
            .iter()
            .map(|s| s.encryption.as_ref().map(|e| e.key_uri.as_str()))
            .collect();

        assert_eq!(
            keys,
            [
                Some("https://keys.example.com/a"),
                None,
                None,
                Some("https://keys.example.com/d"),
            ]
        );
    }

    #[test]
    fn reads_quoted_and_bare_attributes() {
        let list = "METHOD=AES-128,URI=\"https://k.example.com/a,b\",IV=0x01";
        assert_eq!(attribute(list, "METHOD"), Some("AES-128"));
        assert_eq!(attribute(list, "URI"), Some("https://k.example.com/a,b"));
        assert_eq!(attribute(list, "IV"), Some("0x01"));
        assert_eq!(attribute(list, "KEYFORMAT"), None);
        assert_eq!(attribute("METHOD=NONE", "METHOD"), Some("NONE"));
    }

    #[test]
    fn absurd_resolutions_do_not_overflow() {
        let input = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=4294967296x4294967296
huge.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720
sane.m3u8
";
        let Playlist::MasterPlaylist(master) = m3u8_rs::parse_playlist_res(input.as_bytes()).unwrap()
        else {
            panic!("expected master playlist");
        };
        assert_eq!(select_variant(&master, None).unwrap().uri, "huge.m3u8");
    }

    #[test]
    fn init_section_takes_the_first_slot() {
        let base = url("https://cdn.example.com/vod/index.m3u8");
        let manifest = build_manifest(&media(FMP4), Some(&base)).unwrap();
        let segments = manifest.segments();

        assert!(manifest.has_init());
        assert_eq!(segments.len(), 3);
        assert!(segments[0].init);
        assert_eq!(segments[0].index, 0);
        assert_eq!(
            segments[0].uri.as_str(),
            "https://cdn.example.com/vod/init.mp4"
        );
        assert_eq!((segments[1].index, segments[1].sequence), (1, 0));
        assert_eq!((segments[2].index, segments[2].sequence), (2, 1));
        assert_eq!(
            manifest.first_media().unwrap().uri.as_str(),
            "https://cdn.example.com/vod/seg0.m4s"
        );
    }

    #[test]
    fn relative_uris_need_a_base() {
        let err = build_manifest(&media(MEDIA), None).unwrap_err();
        assert!(matches!(err, Error::BaseUrlRequired { uri } if uri == "key.bin"));
    }

    #[test]
    fn unsupported_methods_are_rejected() {
        let input = "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key\"
#EXTINF:10.0,
https://cdn.example.com/seg0.ts
#EXT-X-ENDLIST
";
        let err = build_manifest(&media(input), None).unwrap_err();
        assert!(matches!(err, Error::Playlist { .. }));
    }

    #[tokio::test]
    async fn resolves_master_into_media_manifest() {
        let fetcher = StaticFetcher::default()
            .with("https://cdn.example.com/live/master.m3u8", MASTER)
            .with("https://cdn.example.com/live/1080p/index.m3u8", MEDIA);

        let source = PlaylistSource::Remote(url("https://cdn.example.com/live/master.m3u8"));
        let manifest = resolve(&fetcher, source, None).await.unwrap();

        assert_eq!(manifest.len(), 4);
        assert_eq!(
            manifest.segments()[1].uri.as_str(),
            "https://cdn.example.com/live/1080p/seg1.ts"
        );
        assert_eq!(fetcher.count("https://cdn.example.com/live/720p/index.m3u8"), 0);
    }

    #[tokio::test]
    async fn local_playlist_resolves_against_given_base() {
        let fetcher = StaticFetcher::default();
        let source = PlaylistSource::Local {
            contents: Bytes::from_static(MEDIA.as_bytes()),
            base: Some(url("https://mirror.example.com/show/")),
        };

        let manifest = resolve(&fetcher, source, None).await.unwrap();
        assert_eq!(
            manifest.segments()[3].uri.as_str(),
            "https://mirror.example.com/show/seg3.ts"
        );
        assert!(fetcher.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn local_master_without_base_fails() {
        let fetcher = StaticFetcher::default();
        let source = PlaylistSource::Local {
            contents: Bytes::from_static(MASTER.as_bytes()),
            base: None,
        };

        let err = resolve(&fetcher, source, Some("1280x720")).await.unwrap_err();
        assert!(matches!(err, Error::BaseUrlRequired { uri } if uri == "720p/index.m3u8"));
    }

    #[tokio::test]
    async fn nested_master_playlists_are_rejected() {
        let fetcher = StaticFetcher::default()
            .with("https://cdn.example.com/master.m3u8", MASTER)
            .with("https://cdn.example.com/1080p/index.m3u8", MASTER);

        let source = PlaylistSource::Remote(url("https://cdn.example.com/master.m3u8"));
        let err = resolve(&fetcher, source, None).await.unwrap_err();
        assert!(matches!(err, Error::Playlist { .. }));
        assert_eq!(fetcher.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.m3u8");
        std::fs::write(&path, MEDIA).unwrap();

        let source = PlaylistSource::from_input(path.to_str().unwrap(), None)
            .await
            .unwrap();
        assert!(matches!(source, PlaylistSource::Local { base: None, .. }));

        let source = PlaylistSource::from_input("https://cdn.example.com/index.m3u8", None)
            .await
            .unwrap();
        assert!(matches!(source, PlaylistSource::Remote(_)));
    }
}
