//! I/O transport registry
//!
//! Maps a transport-mode name to fetch and push behavior. Modes are
//! auto-detected from a binding's URL scheme when not set explicitly, so a
//! caller can hand over `{"url": "https://..."}` and get the right
//! transport. Streaming adapters are an optional capability a transport may
//! decline.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::SluiceError;
use crate::spec::{Binding, Port, Target};
use crate::stream::{StreamFetcher, StreamPusher};

mod database;
mod http;
mod local;

pub use database::MongoTransport;
pub use http::HttpTransport;
pub use local::LocalTransport;

/// One transport mode: how bytes get fetched from and pushed to a location
/// class. Streaming is an optional capability; the defaults decline it.
pub trait Transport: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Materialize a binding's data. With a `filepath` target the data lands
    /// in a file under `dir` and the returned value is the path.
    fn fetch(&self, binding: &Binding, port: &Port, dir: &Path) -> Result<Value, SluiceError>;

    /// Deliver produced data to the binding's destination.
    fn push(&self, data: &Value, binding: &mut Binding, port: &Port) -> Result<(), SluiceError>;

    fn stream_fetcher(&self, _binding: &Binding) -> Result<Box<dyn StreamFetcher>, SluiceError> {
        Err(SluiceError::StreamingUnsupported {
            mode: self.mode().to_string(),
        })
    }

    fn stream_pusher(&self, _binding: &Binding) -> Result<Box<dyn StreamPusher>, SluiceError> {
        Err(SluiceError::StreamingUnsupported {
            mode: self.mode().to_string(),
        })
    }
}

/// The binding's own target wins over the port declaration.
pub(crate) fn effective_target(binding: &Binding, port: &Port) -> Target {
    binding.target.unwrap_or(port.target)
}

/// Raw bytes for a value: strings pass through, everything else serializes
/// as JSON.
pub(crate) fn value_bytes(value: &Value) -> Result<Vec<u8>, SluiceError> {
    match value {
        Value::String(text) => Ok(text.clone().into_bytes()),
        other => Ok(serde_json::to_vec(other)?),
    }
}

/// File name for a filepath-target fetch: binding filename hint via port,
/// else the URL's last segment, else the port name.
pub(crate) fn fetch_file_name(binding: &Binding, port: &Port) -> String {
    if let Some(name) = &port.filename {
        return name.clone();
    }
    if let Some(url) = &binding.url {
        if let Ok(parsed) = Url::parse(url) {
            if let Some(segment) = parsed.path_segments().and_then(|mut s| s.next_back()) {
                if !segment.is_empty() {
                    return segment.to_string();
                }
            }
        }
    }
    port.name.clone()
}

/// In-memory pass-through mode: the data travels inside the binding itself.
pub struct InlineTransport;

impl Transport for InlineTransport {
    fn mode(&self) -> &'static str {
        "inline"
    }

    fn fetch(&self, binding: &Binding, port: &Port, dir: &Path) -> Result<Value, SluiceError> {
        let data = binding
            .data
            .clone()
            .ok_or_else(|| SluiceError::Transport("inline binding has no data".into()))?;
        match effective_target(binding, port) {
            Target::Memory => Ok(data),
            Target::Filepath => {
                let path = dir.join(fetch_file_name(binding, port));
                std::fs::write(&path, value_bytes(&data)?)?;
                Ok(Value::String(path.display().to_string()))
            }
        }
    }

    fn push(&self, data: &Value, binding: &mut Binding, _port: &Port) -> Result<(), SluiceError> {
        binding.data = Some(data.clone());
        Ok(())
    }
}

/// Mode-name keyed transport registry. Populated before execution begins
/// and read-only thereafter; concurrent readers are safe.
pub struct TransportRegistry {
    modes: DashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self {
            modes: DashMap::new(),
        }
    }

    /// Registry with the built-in `inline`, `local`, `http` and `mongodb`
    /// modes.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(InlineTransport));
        registry.register(Arc::new(LocalTransport));
        registry.register(Arc::new(HttpTransport::new()));
        registry.register(Arc::new(MongoTransport));
        registry
    }

    pub fn register(&self, transport: Arc<dyn Transport>) {
        self.modes.insert(transport.mode().to_string(), transport);
    }

    pub fn get(&self, mode: &str) -> Result<Arc<dyn Transport>, SluiceError> {
        self.modes
            .get(mode)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SluiceError::UnknownTransport {
                mode: mode.to_string(),
            })
    }

    /// Determine (and record on the binding) the transport mode. Without an
    /// explicit mode: no URL means `inline`; otherwise the URL scheme, with
    /// `https` folded into `http` and `file` mapped to `local` with the path
    /// extracted.
    pub fn resolve_mode(&self, binding: &mut Binding) -> Result<String, SluiceError> {
        if let Some(mode) = &binding.mode {
            return Ok(mode.clone());
        }
        let mode = match &binding.url {
            None => "inline".to_string(),
            Some(raw) => {
                let parsed = Url::parse(raw)
                    .map_err(|err| SluiceError::Transport(format!("bad url '{raw}': {err}")))?;
                match parsed.scheme() {
                    "http" | "https" => "http".to_string(),
                    "file" => {
                        binding.path = Some(parsed.path().to_string());
                        "local".to_string()
                    }
                    other => other.to_string(),
                }
            }
        };
        debug!(mode = %mode, "auto-detected transport mode");
        binding.mode = Some(mode.clone());
        Ok(mode)
    }

    pub fn fetch(
        &self,
        binding: &mut Binding,
        port: &Port,
        dir: &Path,
    ) -> Result<Value, SluiceError> {
        let mode = self.resolve_mode(binding)?;
        self.get(&mode)?.fetch(binding, port, dir)
    }

    pub fn push(
        &self,
        data: &Value,
        binding: &mut Binding,
        port: &Port,
    ) -> Result<(), SluiceError> {
        let mode = self.resolve_mode(binding)?;
        self.get(&mode)?.push(data, binding, port)
    }

    pub fn stream_fetcher(
        &self,
        binding: &mut Binding,
    ) -> Result<Box<dyn StreamFetcher>, SluiceError> {
        let mode = self.resolve_mode(binding)?;
        self.get(&mode)?.stream_fetcher(binding)
    }

    pub fn stream_pusher(
        &self,
        binding: &mut Binding,
    ) -> Result<Box<dyn StreamPusher>, SluiceError> {
        let mode = self.resolve_mode(binding)?;
        self.get(&mode)?.stream_pusher(binding)
    }

    /// Fetch a text document by URI, used for `script_uri` resolution.
    /// Relative URIs resolve against `base`.
    pub fn fetch_uri(&self, uri: &str, base: &Path) -> Result<String, SluiceError> {
        let mut binding = Binding {
            url: Some(uri.to_string()),
            ..Default::default()
        };
        if Url::parse(uri).is_err() {
            // Not an absolute URI: treat as a path relative to base.
            binding.url = None;
            binding.path = Some(base.join(uri).display().to_string());
            binding.mode = Some("local".to_string());
        }
        let port = Port::new("script", "string", "text");
        let value = self.fetch(&mut binding, &port, base)?;
        match value {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}
