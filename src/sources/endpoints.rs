use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

use super::{AudioQuality, TrackRef};
use crate::error::{ResolveError, Result};

/// Formato de URL que espera un mirror.
///
/// Los mirrors de la API no oficial no coinciden en cómo pasar los parámetros,
/// así cada endpoint configurado lleva su propio formato.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointShape {
    /// `{base}/search?q=..` y `{base}/track?id=..&quality=..`
    QueryParam,
    /// `{base}/search/{query}` y `{base}/track/{id}?quality=..`
    PathSegment,
    /// `{base}/api/search?q=..&type=tracks` y
    /// `{base}/api/stream?url=..&quality=..`
    UrlParam,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base: String,
    pub shape: EndpointShape,
}

impl EndpointConfig {
    pub fn new(base: impl Into<String>, shape: EndpointShape) -> Self {
        Self {
            base: base.into(),
            shape,
        }
    }
}

/// Endpoint validado, listo para construir URLs de petición.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base: String,
    shape: EndpointShape,
}

impl Endpoint {
    pub fn parse(config: &EndpointConfig) -> Result<Self> {
        let trimmed = config.base.trim().trim_end_matches('/');
        let parsed = Url::parse(trimmed)
            .map_err(|_| ResolveError::InvalidEndpoint(config.base.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ResolveError::InvalidEndpoint(config.base.clone()));
        }

        Ok(Self {
            base: trimmed.to_string(),
            shape: config.shape,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn search_url(&self, query: &str) -> Result<Url> {
        let built = match self.shape {
            EndpointShape::QueryParam => {
                Url::parse_with_params(&format!("{}/search", self.base), &[("q", query)])
            }
            EndpointShape::PathSegment => Url::parse(&format!(
                "{}/search/{}",
                self.base,
                urlencoding::encode(query)
            )),
            EndpointShape::UrlParam => Url::parse_with_params(
                &format!("{}/api/search", self.base),
                &[("q", query), ("type", "tracks")],
            ),
        };
        built.map_err(|_| ResolveError::InvalidEndpoint(self.base.clone()))
    }

    pub fn stream_url(&self, track: &TrackRef, quality: AudioQuality) -> Result<Url> {
        let built = match self.shape {
            EndpointShape::QueryParam => Url::parse_with_params(
                &format!("{}/track", self.base),
                &[("id", track.id.as_str()), ("quality", quality.as_str())],
            ),
            EndpointShape::PathSegment => Url::parse_with_params(
                &format!("{}/track/{}", self.base, urlencoding::encode(&track.id)),
                &[("quality", quality.as_str())],
            ),
            EndpointShape::UrlParam => Url::parse_with_params(
                &format!("{}/api/stream", self.base),
                &[("url", track.url.as_str()), ("quality", quality.as_str())],
            ),
        };
        built.map_err(|_| ResolveError::InvalidEndpoint(self.base.clone()))
    }
}

/// Mirrors ordenados más el índice de rotación compartido.
///
/// El índice vive lo que el proceso y lo comparten todas las llamadas, así un
/// mirror que falló la última vez no se reintenta primero en la siguiente.
#[derive(Debug)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    current: AtomicUsize,
}

impl EndpointSet {
    pub fn new(configs: &[EndpointConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Err(ResolveError::NoEndpoints);
        }
        let endpoints = configs
            .iter()
            .map(Endpoint::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            endpoints,
            current: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Endpoint actualmente a la cabeza de la rotación.
    pub fn current(&self) -> (usize, &Endpoint) {
        let index = self.current_index() % self.endpoints.len();
        (index, &self.endpoints[index])
    }

    /// Cada endpoint exactamente una vez, empezando por la cabeza de la
    /// rotación.
    ///
    /// El inicio se lee una sola vez, así una rotación concurrente no puede
    /// hacer que un recorrido repita o salte un mirror.
    pub fn walk(&self) -> impl Iterator<Item = (usize, &Endpoint)> + '_ {
        let (start, _) = self.current();
        let len = self.endpoints.len();
        (0..len).map(move |offset| {
            let index = (start + offset) % len;
            (index, &self.endpoints[index])
        })
    }

    /// Avanza más allá de `failed_index`.
    ///
    /// Solo mueve el índice si ningún llamador concurrente ya rotó desde el
    /// mismo endpoint, así dos fallos en paralelo saltan un mirror y no dos.
    pub fn rotate_from(&self, failed_index: usize) -> usize {
        let next = (failed_index + 1) % self.endpoints.len();
        match self
            .current
            .compare_exchange(failed_index, next, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => next,
            Err(actual) => actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> EndpointSet {
        EndpointSet::new(&[
            EndpointConfig::new("https://a.example", EndpointShape::QueryParam),
            EndpointConfig::new("https://b.example/", EndpointShape::PathSegment),
            EndpointConfig::new("https://c.example", EndpointShape::UrlParam),
        ])
        .unwrap()
    }

    #[test]
    fn test_rotation_is_circular() {
        let endpoints = set();
        assert_eq!(endpoints.current().0, 0);
        assert_eq!(endpoints.rotate_from(0), 1);
        assert_eq!(endpoints.rotate_from(1), 2);
        assert_eq!(endpoints.rotate_from(2), 0);
        assert_eq!(endpoints.current().1.base(), "https://a.example");
    }

    #[test]
    fn test_stale_rotation_does_not_skip() {
        let endpoints = set();
        endpoints.rotate_from(0);
        // Un segundo llamador que también falló en el endpoint 0 no debe
        // saltarse B.
        assert_eq!(endpoints.rotate_from(0), 1);
        assert_eq!(endpoints.current_index(), 1);
    }

    #[test]
    fn test_walk_ignores_rotation_after_start() {
        let endpoints = set();
        endpoints.rotate_from(0);

        let mut walk = endpoints.walk();
        assert_eq!(walk.next().map(|(index, _)| index), Some(1));
        endpoints.rotate_from(1);
        endpoints.rotate_from(2);
        let rest: Vec<usize> = walk.map(|(index, _)| index).collect();

        assert_eq!(rest, vec![2, 0]);
        assert_eq!(endpoints.current_index(), 0);
    }

    #[test]
    fn test_url_shapes() {
        let endpoints = set();
        let track = TrackRef::new("42");

        let a = &endpoints.endpoints[0];
        assert_eq!(
            a.search_url("daft punk").unwrap().as_str(),
            "https://a.example/search?q=daft+punk"
        );
        assert_eq!(
            a.stream_url(&track, AudioQuality::Lossless).unwrap().as_str(),
            "https://a.example/track?id=42&quality=LOSSLESS"
        );

        let b = &endpoints.endpoints[1];
        assert_eq!(
            b.search_url("daft punk").unwrap().as_str(),
            "https://b.example/search/daft%20punk"
        );
        assert_eq!(
            b.stream_url(&track, AudioQuality::High).unwrap().as_str(),
            "https://b.example/track/42?quality=HIGH"
        );

        let c = &endpoints.endpoints[2];
        assert!(c
            .stream_url(&track, AudioQuality::Lossless)
            .unwrap()
            .as_str()
            .starts_with("https://c.example/api/stream?url=https%3A%2F%2Ftidal.com"));
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(matches!(EndpointSet::new(&[]), Err(ResolveError::NoEndpoints)));
        assert!(matches!(
            EndpointSet::new(&[EndpointConfig::new("ftp://x", EndpointShape::QueryParam)]),
            Err(ResolveError::InvalidEndpoint(_))
        ));
    }
}
