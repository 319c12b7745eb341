//! Boundary parsing of upstream bodies.
//!
//! Mirrors return the same data in different shapes. Everything is normalized
//! here, right after receipt, into [`SearchPage`] / a stream URL; anything that
//! matches no known shape fails with [`ResolveError::UnrecognizedShape`].

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{AudioQuality, SearchPage, TrackRecord, TrackRef};
use crate::error::{ResolveError, Result};

const ARTWORK_SIZES: [u32; 4] = [160, 320, 640, 1280];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchPayload {
    Paged(PagedTracks),
    Nested { tracks: PagedTracks },
    Flat(Vec<Value>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagedTracks {
    items: Vec<Value>,
    #[serde(alias = "total")]
    total_number_of_items: Option<usize>,
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawAlbum {
    title: Option<String>,
    cover: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrack {
    id: RawId,
    title: String,
    version: Option<String>,
    artist: Option<RawArtist>,
    #[serde(default)]
    artists: Vec<RawArtist>,
    duration: Option<u64>,
    album: Option<RawAlbum>,
    #[serde(alias = "quality")]
    audio_quality: Option<String>,
    url: Option<String>,
}

impl RawTrack {
    /// Los items se decodifican uno a uno para que un track malformado no tumbe
    /// toda la página.
    fn decode(endpoint: &str, item: Value) -> Option<Self> {
        match serde_json::from_value(item) {
            Ok(track) => Some(track),
            Err(e) => {
                warn!("⚠️ Omitiendo track malformado de {}: {}", endpoint, e);
                None
            }
        }
    }

    fn normalize(self) -> Option<TrackRecord> {
        let quality = match self.audio_quality.as_deref().map(str::parse::<AudioQuality>) {
            Some(Ok(quality)) => quality,
            _ => {
                debug!("Descartando track sin calidad reconocida: {}", self.title);
                return None;
            }
        };

        let id = self.id.into_string();
        let mut artists: Vec<String> = self.artists.into_iter().map(|a| a.name).collect();
        if let Some(artist) = self.artist {
            if !artists.contains(&artist.name) {
                artists.insert(0, artist.name);
            }
        }

        let title = match self.version {
            Some(version) if !version.is_empty() => format!("{} ({})", self.title, version),
            _ => self.title,
        };

        let (album, artwork) = match self.album {
            Some(album) => (album.title, album.cover.map(artwork_urls).unwrap_or_default()),
            None => (None, Vec::new()),
        };

        let mut stream_ref = TrackRef::new(id.clone());
        if let Some(url) = self.url {
            stream_ref.url = url;
        }

        Some(TrackRecord {
            id,
            title,
            artists,
            duration_secs: self.duration,
            artwork,
            album,
            stream_ref,
            quality,
        })
    }
}

/// Expande un cover id de Tidal (o una URL ya lista) en URLs de carátula por
/// tamaño.
fn artwork_urls(cover: String) -> Vec<String> {
    if cover.starts_with("http://") || cover.starts_with("https://") {
        return vec![cover];
    }
    let path = cover.replace('-', "/");
    ARTWORK_SIZES
        .iter()
        .map(|size| {
            format!(
                "https://resources.tidal.com/images/{}/{}x{}.jpg",
                path, size, size
            )
        })
        .collect()
}

/// Parsea cualquier body de búsqueda conocido a una página, antes del filtro de
/// calidad.
pub fn parse_search(endpoint: &str, body: Value) -> Result<SearchPage> {
    let payload: SearchPayload =
        serde_json::from_value(body).map_err(|e| ResolveError::UnrecognizedShape {
            endpoint: endpoint.to_string(),
            detail: format!("search body: {}", e),
        })?;

    let (items, total, offset) = match payload {
        SearchPayload::Paged(page) | SearchPayload::Nested { tracks: page } => {
            let total = page.total_number_of_items.unwrap_or(page.items.len());
            (page.items, total, page.offset)
        }
        SearchPayload::Flat(items) => {
            let total = items.len();
            (items, total, 0)
        }
    };

    let received = items.len();
    let tracks = items
        .into_iter()
        .filter_map(|item| RawTrack::decode(endpoint, item))
        .filter_map(RawTrack::normalize)
        .collect();

    Ok(SearchPage {
        tracks,
        total,
        has_more: offset + received < total,
    })
}

#[derive(Debug, Deserialize)]
struct RawSource {
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamPayload {
    Direct { url: String },
    DirectUrl {
        #[serde(rename = "directUrl")]
        direct_url: String,
    },
    Sources { sources: Vec<RawSource> },
    Wrapped { data: Box<StreamPayload> },
}

impl StreamPayload {
    fn into_url(self) -> Option<String> {
        match self {
            StreamPayload::Direct { url } => Some(url),
            StreamPayload::DirectUrl { direct_url } => Some(direct_url),
            StreamPayload::Sources { sources } => sources.into_iter().next().map(|s| s.url),
            StreamPayload::Wrapped { data } => data.into_url(),
        }
    }
}

/// Extrae la URL reproducible de cualquier body de stream conocido.
pub fn parse_stream(endpoint: &str, body: Value) -> Result<String> {
    let unrecognized = |detail: String| ResolveError::UnrecognizedShape {
        endpoint: endpoint.to_string(),
        detail,
    };

    let payload: StreamPayload = serde_json::from_value(body)
        .map_err(|e| unrecognized(format!("stream body: {}", e)))?;

    match payload.into_url() {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(url),
        Some(url) => Err(unrecognized(format!("stream url is not absolute: {}", url))),
        None => Err(unrecognized("stream body has an empty sources list".to_string())),
    }
}
