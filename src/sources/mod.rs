pub mod endpoints;
pub mod response;
pub mod tidal;
pub mod transport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Result;

pub use endpoints::{EndpointConfig, EndpointSet, EndpointShape};
pub use tidal::TidalClient;
pub use transport::{HttpTransport, ReqwestTransport, UpstreamRequest};

/// Resuelve una referencia de track a una URL de stream reproducible.
///
/// Es la interfaz que usa el scheduler de precarga; [`TidalClient`] es la
/// implementación de producción.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_stream_url(&self, track: &TrackRef, quality: AudioQuality) -> Result<String>;
}

/// Niveles de calidad de audio, de peor a mejor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioQuality {
    Low,
    High,
    Lossless,
    #[serde(alias = "HI_RES")]
    HiResLossless,
}

impl AudioQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Low => "LOW",
            AudioQuality::High => "HIGH",
            AudioQuality::Lossless => "LOSSLESS",
            AudioQuality::HiResLossless => "HI_RES_LOSSLESS",
        }
    }

    /// Indica si esta calidad es aceptable cuando `required` es el mínimo.
    pub fn meets(&self, required: AudioQuality) -> bool {
        *self >= required
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioQuality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(AudioQuality::Low),
            "HIGH" => Ok(AudioQuality::High),
            "LOSSLESS" => Ok(AudioQuality::Lossless),
            "HI_RES" | "HI_RES_LOSSLESS" => Ok(AudioQuality::HiResLossless),
            other => Err(format!("unknown audio quality '{}'", other)),
        }
    }
}

/// Referencia mínima para pedir un stream a un mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub id: String,
    /// URL canónica del track, usada por los mirrors que reciben `?url=`
    pub url: String,
}

impl TrackRef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let url = format!("https://tidal.com/browse/track/{}", id);
        Self { id, url }
    }

    /// Clave de caché / deduplicación de este track en una calidad dada.
    pub fn source_key(&self, quality: AudioQuality) -> String {
        format!("{}:{}", self.id, quality)
    }
}

/// Track normalizado a partir de cualquier formato de respuesta del upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub duration_secs: Option<u64>,
    /// URLs de carátula de menor a mayor tamaño
    pub artwork: Vec<String>,
    pub album: Option<String>,
    pub stream_ref: TrackRef,
    pub quality: AudioQuality,
}

impl TrackRecord {
    pub fn track_ref(&self) -> &TrackRef {
        &self.stream_ref
    }

    /// Línea de artistas, unida como la muestran los reproductores.
    pub fn artist_line(&self) -> String {
        self.artists.join(", ")
    }
}

/// Página de resultados de búsqueda.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub tracks: Vec<TrackRecord>,
    /// Total del upstream antes del filtro de calidad
    pub total: usize,
    pub has_more: bool,
}

impl SearchPage {
    /// Conserva solo los tracks que cumplen la calidad requerida.
    pub fn filtered(mut self, required: AudioQuality) -> Self {
        self.tracks.retain(|track| track.quality.meets(required));
        self
    }
}

#[cfg(test)]
pub(crate) fn sample_track(id: &str, quality: AudioQuality) -> TrackRecord {
    TrackRecord {
        id: id.to_string(),
        title: format!("Track {}", id),
        artists: vec!["Artist".to_string()],
        duration_secs: Some(200),
        artwork: Vec::new(),
        album: None,
        stream_ref: TrackRef::new(id),
        quality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_ordering_and_parsing() {
        assert!(AudioQuality::HiResLossless.meets(AudioQuality::Lossless));
        assert!(AudioQuality::Lossless.meets(AudioQuality::Lossless));
        assert!(!AudioQuality::High.meets(AudioQuality::Lossless));

        assert_eq!("hi_res".parse::<AudioQuality>(), Ok(AudioQuality::HiResLossless));
        assert_eq!(" LOSSLESS ".parse::<AudioQuality>(), Ok(AudioQuality::Lossless));
        assert!("ultra".parse::<AudioQuality>().is_err());
    }

    #[test]
    fn test_source_key_includes_quality() {
        let track = TrackRef::new("42");
        assert_eq!(track.source_key(AudioQuality::Lossless), "42:LOSSLESS");
        assert_eq!(track.url, "https://tidal.com/browse/track/42");
    }

    #[test]
    fn test_page_filter_discards_lower_tiers() {
        let page = SearchPage {
            tracks: vec![
                sample_track("1", AudioQuality::Lossless),
                sample_track("2", AudioQuality::High),
                sample_track("3", AudioQuality::HiResLossless),
            ],
            total: 3,
            has_more: false,
        };

        let ids: Vec<_> = page
            .filtered(AudioQuality::Lossless)
            .tracks
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
